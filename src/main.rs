//! tlsplice CLI - An intercepting TLS proxy

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use tlsplice::{Config, GeneratedCa, ProxyMode, ProxyServer};

#[derive(Parser)]
#[command(name = "tlsplice")]
#[command(about = "An intercepting TLS proxy that negotiates forward, HTTP/1.1 and HTTP/2 per connection")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start intercepting connections
    Run(RunArgs),

    /// Create the interception CA (certificate and private key)
    GenerateCa {
        /// Directory the files are written to
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        #[arg(long, default_value = "ca.crt")]
        cert_name: String,

        #[arg(long, default_value = "ca.key")]
        key_name: String,
    },

    /// Parse a config file and print the effective settings
    ValidateConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// TOML config file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CA certificate used to sign per-host certificates
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Private key of the CA certificate
    #[arg(long)]
    ca_key: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8080
    #[arg(short, long)]
    bind: Option<String>,

    /// explicit or transparent
    #[arg(short, long)]
    mode: Option<ProxyMode>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(short, long)]
    log_level: Option<String>,
}

impl RunArgs {
    /// Command-line values win over the file.
    fn apply(self, cfg: &mut Config) {
        if let Some(path) = self.ca_cert {
            cfg.proxy.ca_cert = Some(path.to_string_lossy().into_owned());
        }
        if let Some(path) = self.ca_key {
            cfg.proxy.ca_key = Some(path.to_string_lossy().into_owned());
        }
        if let Some(bind) = self.bind {
            cfg.proxy.bind_address = bind;
        }
        if let Some(mode) = self.mode {
            cfg.proxy.mode = mode;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    match Cli::parse().command {
        Commands::Run(args) => run(args).await,
        Commands::GenerateCa {
            out,
            cert_name,
            key_name,
        } => generate_ca(&out, &cert_name, &key_name),
        Commands::ValidateConfig { config } => validate_config(&config),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(mut args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = args.config.take();
    let mut cfg = match &config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::parse("")?,
    };

    let level = args
        .log_level
        .take()
        .unwrap_or_else(|| cfg.logging.level.clone());
    init_logging(&level);

    match &config_path {
        Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
        None => tracing::info!("No config file given, using defaults"),
    }

    args.apply(&mut cfg);
    cfg.validate()?;

    if cfg.proxy.ca_cert.is_none() || cfg.proxy.ca_key.is_none() {
        eprintln!("tlsplice: CA certificate and key are required to sign per-host certificates.");
        eprintln!("Set proxy.ca_cert and proxy.ca_key in the config, or pass --ca-cert/--ca-key.");
        eprintln!();
        eprintln!("Create a CA with:");
        eprintln!("  tlsplice generate-ca --out ./certs/");
        std::process::exit(1);
    }

    let server = ProxyServer::new(cfg)?;
    if server.mode() == ProxyMode::Explicit {
        let proxy_url = format!("http://{}", server.bind_address());
        tracing::info!(http_proxy = %proxy_url, https_proxy = %proxy_url, "Point clients at the proxy");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping");
        }
        let _ = shutdown_tx.send(());
    });

    server.run_until_shutdown(shutdown_rx).await?;
    Ok(())
}

fn generate_ca(out: &Path, cert_name: &str, key_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(out)?;
    let cert_path = out.join(cert_name);
    let key_path = out.join(key_name);

    GeneratedCa::generate()?.save(&cert_path, &key_path)?;

    println!("Wrote interception CA");
    println!("  certificate  {}", cert_path.display());
    println!("  private key  {}", key_path.display());
    println!();
    println!(
        "Start the proxy with:\n  tlsplice run --ca-cert {} --ca-key {}",
        cert_path.display(),
        key_path.display()
    );
    println!("Clients must trust {} before they accept intercepted connections.", cert_path.display());
    println!("The key file is readable by its owner only; do not share it.");
    Ok(())
}

fn validate_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::from_file(path)?;
    let unset = "(unset)";

    println!("{}: OK", path.display());
    println!();
    println!("  Bind address: {}", cfg.proxy.bind_address);
    println!("  Mode: {}", cfg.proxy.mode);
    println!("  CA cert: {}", cfg.proxy.ca_cert.as_deref().unwrap_or(unset));
    println!("  CA key: {}", cfg.proxy.ca_key.as_deref().unwrap_or(unset));
    println!(
        "  Upstream trust: {}",
        cfg.proxy.upstream_tls_ca.as_deref().unwrap_or("web roots")
    );
    println!("  Sniff timeout: {}ms", cfg.proxy.sniff_timeout_ms);
    println!(
        "  HTTP/2: window={} streams={} frame={}",
        cfg.http2.initial_window_size, cfg.http2.max_concurrent_streams, cfg.http2.max_frame_size
    );
    println!(
        "  Logging: level={} events={}",
        cfg.logging.level, cfg.logging.log_events
    );
    Ok(())
}
