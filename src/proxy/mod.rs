//! Listener, explicit-proxy front door and proxy-generated responses

mod handler;
pub mod response;
mod server;

pub use handler::ProxyHandler;
pub use server::ProxyServer;
