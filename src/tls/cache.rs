//! Expiring LRU cache of issued leaf certificates

use lru::LruCache;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_CAPACITY: usize = 1000;
/// Leaves are valid for a day; re-issue well before that.
const DEFAULT_TTL: Duration = Duration::from_secs(12 * 60 * 60);

struct Issued {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    issued_at: Instant,
}

pub struct CertificateCache {
    entries: Mutex<LruCache<String, Issued>>,
    ttl: Duration,
}

impl CertificateCache {
    /// A zero capacity falls back to the default.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Cached chain and key for `host`, unless missing or expired.
    pub fn get(&self, host: &str) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(host) {
            Some(issued) if issued.issued_at.elapsed() < self.ttl => {
                Some((issued.chain.clone(), issued.key.clone_key()))
            }
            Some(_) => {
                entries.pop(host);
                None
            }
            None => None,
        }
    }

    pub fn insert(
        &self,
        host: String,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) {
        self.entries.lock().unwrap().put(
            host,
            Issued {
                chain,
                key,
                issued_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CertificateCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::ca::{CertificateAuthority, GeneratedCa};
    use tlsplice_test_support::test_report;

    fn issue(host: &str) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let generated = GeneratedCa::generate().unwrap();
        let ca = CertificateAuthority::from_pem(&generated.cert_pem, &generated.key_pem).unwrap();
        let (leaf, key) = ca.issue(host).unwrap();
        (vec![leaf, ca.cert_der().clone()], key)
    }

    #[test]
    fn test_hit_returns_same_chain() {
        let t = test_report!("Cached chain is returned unchanged");
        let cache = CertificateCache::default();
        let (chain, key) = issue("example.com");
        cache.insert("example.com".to_string(), chain.clone(), key);

        let (cached, _) = cache.get("example.com").unwrap();
        t.assert_eq("chain length", &cached.len(), &2usize);
        t.assert_true("leaf matches", cached[0].as_ref() == chain[0].as_ref());
        t.assert_true("miss for other host", cache.get("other.com").is_none());
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let t = test_report!("Entries past their TTL are evicted on lookup");
        let cache = CertificateCache::new(10, Duration::from_millis(1));
        let (chain, key) = issue("example.com");
        cache.insert("example.com".to_string(), chain, key);

        std::thread::sleep(Duration::from_millis(10));
        t.assert_true("expired", cache.get("example.com").is_none());
        t.assert_true("evicted", cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let t = test_report!("Least recently used host is evicted at capacity");
        let cache = CertificateCache::new(2, Duration::from_secs(3600));
        for host in ["one.com", "two.com", "three.com"] {
            let (chain, key) = issue(host);
            cache.insert(host.to_string(), chain, key);
        }
        t.assert_true("one.com evicted", cache.get("one.com").is_none());
        t.assert_true("three.com present", cache.get("three.com").is_some());
        t.assert_eq("len", &cache.len(), &2usize);
    }
}
