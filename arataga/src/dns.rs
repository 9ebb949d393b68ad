//! DNS resolver core: a TTL-expiring cache with request coalescing in
//! front of the configured upstream nameservers.
//!
//! Cache hits are answered synchronously. A miss registers the caller on
//! the hostname's waiting list; only the first request for a hostname
//! triggers an upstream lookup, later ones attach to the same list and are
//! answered together when the lookup completes. Failures are never cached.
//!
//! The caller owns its own resolving deadline: on timeout it simply stops
//! waiting, and the core discards the dangling waiting-list entry when the
//! upstream reply arrives.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfigGroup, ResolverConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::stats::DnsStats;

/// Hard-coded lifetime of a cache entry.
const CACHE_ENTRY_TTL: Duration = Duration::from_secs(30);

/// Which address family the caller needs, dictated by the ACL's egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl std::fmt::Display for IpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            IpVersion::V4 => "IPv4",
            IpVersion::V6 => "IPv6",
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ResolveFailure(pub String);

struct CacheEntry {
    v4: Vec<Ipv4Addr>,
    v6: Vec<Ipv6Addr>,
    created_at: Instant,
    // round-robin cursor over the stored lists
    next_pick: usize,
}

impl CacheEntry {
    fn is_outdated(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > CACHE_ENTRY_TTL
    }

    fn pick(&mut self, version: IpVersion) -> Option<IpAddr> {
        let picked = match version {
            IpVersion::V4 => {
                if self.v4.is_empty() {
                    return None;
                }
                IpAddr::V4(self.v4[self.next_pick % self.v4.len()])
            }
            IpVersion::V6 => {
                if self.v6.is_empty() {
                    return None;
                }
                IpAddr::V6(self.v6[self.next_pick % self.v6.len()])
            }
        };
        self.next_pick = self.next_pick.wrapping_add(1);
        Some(picked)
    }
}

struct Waiter {
    version: IpVersion,
    tx: oneshot::Sender<Result<IpAddr, ResolveFailure>>,
}

/// One DNS resolver instance; one per I/O context.
pub struct DnsResolver {
    cache: Mutex<HashMap<String, CacheEntry>>,
    waiting: Mutex<HashMap<String, Vec<Waiter>>>,
    upstream: ArcSwap<TokioAsyncResolver>,
    stats: Arc<DnsStats>,
}

impl DnsResolver {
    pub fn new(nameservers: &[IpAddr], stats: Arc<DnsStats>) -> Arc<Self> {
        Arc::new(Self {
            cache: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            upstream: ArcSwap::from_pointee(make_upstream(nameservers)),
            stats,
        })
    }

    /// Replaces the upstream nameserver set on a config update.
    pub fn update_nameservers(&self, nameservers: &[IpAddr]) {
        self.upstream.store(Arc::new(make_upstream(nameservers)));
    }

    /// Resolves `hostname` to an address of the requested family.
    ///
    /// The future completes when the cache answers, when a coalesced
    /// upstream lookup finishes, or never (caller must wrap it into its own
    /// timeout).
    pub async fn resolve(
        self: &Arc<Self>,
        hostname: &str,
        version: IpVersion,
    ) -> Result<IpAddr, ResolveFailure> {
        if let Some(found) = self.try_resolve_from_cache(hostname, version) {
            self.stats.cache_hits.inc();
            debug!(hostname, address = %found, "resolved from cache");
            return Ok(found);
        }

        let rx = self.add_to_waiting_and_lookup(hostname, version);

        match rx.await {
            Ok(result) => result,
            // The resolver instance went away while we were waiting.
            Err(_) => Err(ResolveFailure("DNS lookup canceled".to_string())),
        }
    }

    fn try_resolve_from_cache(&self, hostname: &str, version: IpVersion) -> Option<IpAddr> {
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(hostname)?;
        if entry.is_outdated(Instant::now()) {
            return None;
        }
        entry.pick(version)
    }

    fn add_to_waiting_and_lookup(
        self: &Arc<Self>,
        hostname: &str,
        version: IpVersion,
    ) -> oneshot::Receiver<Result<IpAddr, ResolveFailure>> {
        let (tx, rx) = oneshot::channel();

        let need_lookup = {
            let mut waiting = self.waiting.lock();
            match waiting.get_mut(hostname) {
                Some(waiters) => {
                    // A lookup for this hostname is already in flight.
                    waiters.push(Waiter { version, tx });
                    false
                }
                None => {
                    waiting.insert(hostname.to_string(), vec![Waiter { version, tx }]);
                    true
                }
            }
        };

        if need_lookup {
            let this = Arc::clone(self);
            let hostname = hostname.to_string();
            tokio::spawn(async move {
                debug!(hostname, "async_resolve initiated");
                let result = this.upstream.load().lookup_ip(hostname.as_str()).await;
                this.handle_lookup_result(&hostname, result);
            });
        }

        rx
    }

    fn handle_lookup_result(
        &self,
        hostname: &str,
        result: Result<
            hickory_resolver::lookup_ip::LookupIp,
            hickory_resolver::error::ResolveError,
        >,
    ) {
        let waiters = self
            .waiting
            .lock()
            .remove(hostname)
            .unwrap_or_default();

        match result {
            Ok(lookup) => {
                self.stats.successful_lookups.inc();

                let mut v4 = Vec::new();
                let mut v6 = Vec::new();
                for addr in lookup.iter() {
                    match addr {
                        IpAddr::V4(a) => v4.push(a),
                        IpAddr::V6(a) => v6.push(a),
                    }
                }
                info!(hostname, results = ?lookup.iter().collect::<Vec<_>>(), "async_resolve success");

                let mut entry = CacheEntry {
                    v4,
                    v6,
                    created_at: Instant::now(),
                    next_pick: 0,
                };

                for waiter in waiters {
                    let reply = entry.pick(waiter.version).ok_or_else(|| {
                        ResolveFailure(format!("no {} address for {}", waiter.version, hostname))
                    });
                    // The waiter may be gone already (its own timeout).
                    let _ = waiter.tx.send(reply);
                }

                self.cache.lock().insert(hostname.to_string(), entry);
            }
            Err(error) => {
                self.stats.failed_lookups.inc();
                warn!(hostname, %error, "async_resolve failure");

                let failure = ResolveFailure(error.to_string());
                for waiter in waiters {
                    let _ = waiter.tx.send(Err(failure.clone()));
                }
            }
        }
    }

    /// Stores an address set for `hostname` with the creation timestamp of
    /// now. This is the cache-fill step of a completed lookup; it is also
    /// the seam test harnesses use to pre-seed names.
    pub fn add_records(&self, hostname: &str, addresses: impl IntoIterator<Item = IpAddr>) {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for addr in addresses {
            match addr {
                IpAddr::V4(a) => v4.push(a),
                IpAddr::V6(a) => v6.push(a),
            }
        }
        self.cache.lock().insert(
            hostname.to_string(),
            CacheEntry { v4, v6, created_at: Instant::now(), next_pick: 0 },
        );
    }

    /// Removes every cache entry whose age exceeds the TTL. Driven
    /// periodically with the configured cleanup period.
    pub fn remove_outdated_records(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, entry| !entry.is_outdated(now));
        before - cache.len()
    }

}

fn make_upstream(nameservers: &[IpAddr]) -> TokioAsyncResolver {
    let group = NameServerConfigGroup::from_ips_clear(nameservers, 53, true);
    let config = ResolverConfig::from_parts(None, Vec::new(), group);

    let mut opts = ResolverOpts::default();
    // Both families are requested so one upstream round-trip can feed
    // either kind of waiter.
    opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
    // The local cache above is the only cache.
    opts.cache_size = 0;

    TokioAsyncResolver::tokio(config, opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_resolver() -> Arc<DnsResolver> {
        DnsResolver::new(&[IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))], Arc::default())
    }

    #[tokio::test]
    async fn cache_hit_answers_without_upstream() {
        let resolver = test_resolver();
        resolver.add_records("example.org", [IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]);

        let found = resolver.resolve("example.org", IpVersion::V4).await.unwrap();
        assert_eq!(found, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(resolver.stats.cache_hits.get(), 1);
    }

    #[tokio::test]
    async fn cache_rotates_over_addresses() {
        let resolver = test_resolver();
        resolver.add_records(
            "example.org",
            [
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)),
            ],
        );

        let a = resolver.resolve("example.org", IpVersion::V4).await.unwrap();
        let b = resolver.resolve("example.org", IpVersion::V4).await.unwrap();
        let c = resolver.resolve("example.org", IpVersion::V4).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[tokio::test]
    async fn coalesced_requests_share_one_lookup() {
        let resolver = test_resolver();

        // Register two waiters by hand; only the first may trigger a lookup.
        let rx1 = resolver.add_to_waiting_and_lookup("coalesce.test", IpVersion::V4);
        let rx2 = resolver.add_to_waiting_and_lookup("coalesce.test", IpVersion::V4);
        assert_eq!(resolver.waiting.lock().get("coalesce.test").map(Vec::len), Some(2));

        // Complete the lookup synthetically and check that both waiters
        // are drained together.
        let waiters = resolver.waiting.lock().remove("coalesce.test").unwrap();
        for waiter in waiters {
            let _ = waiter
                .tx
                .send(Ok(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))));
        }

        assert_eq!(rx1.await.unwrap().unwrap(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)));
        assert_eq!(rx2.await.unwrap().unwrap(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)));
    }

    #[tokio::test]
    async fn version_mismatch_is_a_failure() {
        let resolver = test_resolver();
        resolver.add_records("v4only.test", [IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]);

        // A cached entry without an address of the requested family is a
        // miss: the pick returns None and the request goes to the waiting
        // list instead.
        assert!(resolver
            .try_resolve_from_cache("v4only.test", IpVersion::V6)
            .is_none());
    }

    #[test]
    fn sweep_removes_outdated_entries() {
        let resolver = test_resolver();
        resolver.cache.lock().insert(
            "old.test".to_string(),
            CacheEntry {
                v4: vec![Ipv4Addr::new(192, 0, 2, 1)],
                v6: vec![],
                created_at: Instant::now() - CACHE_ENTRY_TTL - Duration::from_secs(1),
                next_pick: 0,
            },
        );
        resolver.add_records("fresh.test", [IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2))]);

        assert_eq!(resolver.remove_outdated_records(), 1);
        assert!(resolver.cache.lock().contains_key("fresh.test"));
    }
}
