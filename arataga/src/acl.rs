//! ACL lifecycle: one TCP listener per configured ingress, connection
//! acceptance with a maxconn bound, and the distribution of ACLs over I/O
//! contexts.
//!
//! An I/O context is the unit of service locality: it owns one DNS
//! resolver instance, one authenticator instance and one user registry.
//! Every ACL is assigned to exactly one context; a connection uses the
//! services of its ACL's context.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::bandlim::UserRegistry;
use crate::config::{AclConfig, CommonAclParams, Config};
use crate::dns::DnsResolver;
use crate::handlers::{self, ConnCtx, Handler, RemoveReason};
use crate::stats::{AclStats, AuthStats, DnsStats};
use crate::user_list::AuthData;

/// Listener backlog for ACL ingress sockets.
const LISTEN_BACKLOG: u32 = 10;

/// Delay before retrying to open an ingress that failed to bind.
const ENTRY_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Everything a connection handler reaches through its ACL.
pub struct AclContext {
    pub name: String,
    pub config: AclConfig,
    pub params: Arc<ArcSwap<CommonAclParams>>,
    pub dns: Arc<DnsResolver>,
    pub auth: Arc<Authenticator>,
    pub stats: Arc<AclStats>,
}

/// The per-context service bundle.
pub struct IoContext {
    pub dns: Arc<DnsResolver>,
    pub auth: Arc<Authenticator>,
    pub users: Arc<UserRegistry>,
}

struct RunningAcl {
    config: AclConfig,
    context_index: usize,
    shutdown: CancellationToken,
    stats: Arc<AclStats>,
}

/// Owns the I/O contexts and the set of running ACLs; applies config
/// updates by diffing the running set against the configured one.
pub struct AclDispatcher {
    contexts: Vec<Arc<IoContext>>,
    running: Mutex<Vec<RunningAcl>>,
    params: Arc<ArcSwap<CommonAclParams>>,
    dns_cache_cleanup_period: ArcSwap<Duration>,
    pub dns_stats: Arc<DnsStats>,
    pub auth_stats: Arc<AuthStats>,
    shutdown: CancellationToken,
}

impl AclDispatcher {
    pub fn new(io_context_count: usize, shutdown: CancellationToken) -> Arc<Self> {
        let params = Arc::new(ArcSwap::from_pointee(CommonAclParams::default()));
        let dns_stats = Arc::new(DnsStats::default());
        let auth_stats = Arc::new(AuthStats::default());

        let contexts = (0..io_context_count.max(1))
            .map(|_| {
                let users = UserRegistry::new(params.load().client_bandlim);
                let dns = DnsResolver::new(&[], Arc::clone(&dns_stats));
                let auth = Authenticator::new(Arc::clone(&users), Arc::clone(&auth_stats));
                Arc::new(IoContext { dns, auth, users })
            })
            .collect();

        let dispatcher = Arc::new(Self {
            contexts,
            running: Mutex::new(Vec::new()),
            params,
            dns_cache_cleanup_period: ArcSwap::from_pointee(Duration::from_secs(30)),
            dns_stats,
            auth_stats,
            shutdown,
        });

        tokio::spawn(global_ticker(Arc::clone(&dispatcher)));

        dispatcher
    }

    /// Applies a complete configuration: shared parameters, per-context
    /// services, and the ACL set difference.
    pub fn apply_config(&self, cfg: &Config) {
        self.params.store(Arc::new(cfg.common_acl_params.clone()));
        self.dns_cache_cleanup_period
            .store(Arc::new(cfg.dns_cache_cleanup_period));

        for context in &self.contexts {
            context.users.update_defaults(cfg.common_acl_params.client_bandlim);
            context.dns.update_nameservers(&cfg.nameserver_ips);
            context.auth.update_params(
                cfg.denied_ports.clone(),
                cfg.common_acl_params.failed_auth_reply_timeout,
            );
        }

        let mut running = self.running.lock();

        // Obsolete ACLs (keyed by the full identity tuple) are shut down.
        running.retain(|acl| {
            let still_wanted = cfg.acls.iter().any(|wanted| *wanted == acl.config);
            if !still_wanted {
                info!(acl = %acl.config, "shutting down ACL");
                acl.shutdown.cancel();
            }
            still_wanted
        });

        // New ACLs go to the least-loaded context; each following
        // placement moves to the neighbouring context only when it is
        // strictly less loaded.
        let mut counts = vec![0usize; self.contexts.len()];
        for acl in running.iter() {
            counts[acl.context_index] += 1;
        }

        let mut cursor: Option<usize> = None;
        for wanted in &cfg.acls {
            if running.iter().any(|acl| acl.config == *wanted) {
                continue;
            }

            let index = match cursor {
                None => counts
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, count)| **count)
                    .map(|(index, _)| index)
                    .unwrap_or(0),
                Some(previous) => {
                    let neighbour = (previous + 1) % counts.len();
                    if counts[neighbour] < counts[previous] {
                        neighbour
                    } else {
                        previous
                    }
                }
            };
            cursor = Some(index);
            counts[index] += 1;

            running.push(self.spawn_acl(wanted.clone(), index));
        }
    }

    /// Replaces the user-list in every context's authenticator.
    pub fn apply_user_list(&self, auth_data: &AuthData) {
        for context in &self.contexts {
            context.auth.update_user_list(auth_data.clone());
        }
    }

    pub fn context(&self, index: usize) -> &Arc<IoContext> {
        &self.contexts[index]
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// (config, context index, stats) of every running ACL.
    pub fn acl_snapshot(&self) -> Vec<(AclConfig, usize, Arc<AclStats>)> {
        self.running
            .lock()
            .iter()
            .map(|acl| (acl.config.clone(), acl.context_index, Arc::clone(&acl.stats)))
            .collect()
    }

    pub fn shutdown_all(&self) {
        for acl in self.running.lock().drain(..) {
            acl.shutdown.cancel();
        }
    }

    fn spawn_acl(&self, config: AclConfig, context_index: usize) -> RunningAcl {
        let context = &self.contexts[context_index];
        let stats = Arc::new(AclStats::default());
        let shutdown = self.shutdown.child_token();

        let acl = Arc::new(AclContext {
            name: format!("acl-{}", config.port),
            config: config.clone(),
            params: Arc::clone(&self.params),
            dns: Arc::clone(&context.dns),
            auth: Arc::clone(&context.auth),
            stats: Arc::clone(&stats),
        });

        info!(acl = %config, context = context_index, "starting ACL");
        tokio::spawn(run_acl(acl, shutdown.clone()));

        RunningAcl { config, context_index, shutdown, stats }
    }
}

/// The process-wide 1 Hz timer: bandwidth turn advancement and the DNS
/// cache sweep.
async fn global_ticker(dispatcher: Arc<AclDispatcher>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut since_dns_cleanup = Duration::ZERO;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = dispatcher.shutdown.cancelled() => return,
        }

        for context in &dispatcher.contexts {
            context.users.advance_turn();
        }

        since_dns_cleanup += Duration::from_secs(1);
        if since_dns_cleanup >= **dispatcher.dns_cache_cleanup_period.load() {
            since_dns_cleanup = Duration::ZERO;
            for context in &dispatcher.contexts {
                let n_removed = context.dns.remove_outdated_records();
                if n_removed > 0 {
                    debug!("DNS cache cleaned up ({n_removed} item(s) removed)");
                }
            }
        }
    }
}

/// One ACL: opens the ingress (retrying on failure) and accepts
/// connections until shutdown.
async fn run_acl(acl: Arc<AclContext>, shutdown: CancellationToken) {
    let endpoint = SocketAddr::new(acl.config.in_ip.into(), acl.config.port);

    let listener = loop {
        info!(acl = %acl.name, %endpoint, "trying to open an entry");

        match open_entry(endpoint) {
            Ok(listener) => break listener,
            Err(error) => {
                // Failure to own the ingress endpoint is critical: nothing
                // works for this ACL until the bind succeeds.
                error!(acl = %acl.name, %endpoint, %error, critical = true, "unable to open entry");
                tokio::select! {
                    _ = tokio::time::sleep(ENTRY_RETRY_DELAY) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    };

    accept_loop(acl, listener, shutdown).await;
}

fn open_entry(endpoint: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(endpoint)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Decrements the live-connection count and wakes the accept loop.
struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_waiters();
    }
}

async fn accept_loop(acl: Arc<AclContext>, listener: TcpListener, shutdown: CancellationToken) {
    let active = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(Notify::new());
    let id_counter = AtomicU64::new(0);

    loop {
        // Accepting pauses while the connection count is at the limit and
        // resumes as soon as a removal drops it below maxconn.
        let maxconn = acl.params.load().maxconn;
        if active.load(Ordering::Acquire) >= maxconn {
            warn!(
                acl = %acl.name,
                current = active.load(Ordering::Acquire),
                limit = maxconn,
                "pausing the acception of new connections"
            );
            loop {
                let release = released.notified();
                let maxconn = acl.params.load().maxconn;
                if active.load(Ordering::Acquire) < maxconn {
                    break;
                }
                tokio::select! {
                    _ = release => {}
                    _ = shutdown.cancelled() => return,
                }
            }
            debug!(
                acl = %acl.name,
                current = active.load(Ordering::Acquire),
                "resuming the acception of new connections"
            );
        }

        let (connection, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(acl = %acl.name, %error, "async_accept failure");
                    continue;
                }
            },
            _ = shutdown.cancelled() => return,
        };

        let id = id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        acl.stats.total_connections.inc();
        let long_id = format!("{}_{}", acl.config.port, id);
        debug!(acl = %acl.name, connection = %long_id, %peer, "new connection accepted");

        active.fetch_add(1, Ordering::AcqRel);
        let guard = ConnectionGuard {
            active: Arc::clone(&active),
            released: Arc::clone(&released),
        };

        let acl = Arc::clone(&acl);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _guard = guard;
            serve_connection(acl, id, connection, shutdown).await;
        });
    }
}

async fn serve_connection(
    acl: Arc<AclContext>,
    id: u64,
    connection: TcpStream,
    shutdown: CancellationToken,
) {
    let ctx = ConnCtx { acl: Arc::clone(&acl), id };
    let long_id = ctx.long_id();

    let driver = handlers::drive(
        Handler::ProtocolDetection(handlers::detect::ProtocolDetectionHandler::new(connection)),
        ctx,
    );

    // A panic inside a handler must not take the ACL down; it becomes an
    // `unhandled_exception` removal.
    let reason = tokio::select! {
        caught = std::panic::AssertUnwindSafe(driver).catch_unwind() => match caught {
            Ok(reason) => reason,
            Err(_) => {
                error!(acl = %acl.name, connection = %long_id, "exception caught in connection handler");
                RemoveReason::UnhandledException
            }
        },
        _ = shutdown.cancelled() => RemoveReason::CurrentOperationCanceled,
    };

    acl.stats.remove_reasons.inc(reason);
    debug!(acl = %acl.name, connection = %long_id, %reason, "connection removed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AclProtocol;
    use std::net::Ipv4Addr;

    fn acl_cfg(port: u16) -> AclConfig {
        AclConfig {
            protocol: AclProtocol::Auto,
            port,
            in_ip: Ipv4Addr::LOCALHOST,
            out_ip: Ipv4Addr::LOCALHOST.into(),
        }
    }

    fn config_with_acls(ports: &[u16]) -> Config {
        Config {
            nameserver_ips: vec![Ipv4Addr::new(127, 0, 0, 53).into()],
            acls: ports.iter().map(|&p| acl_cfg(p)).collect(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn acls_are_distributed_over_contexts() {
        let dispatcher = AclDispatcher::new(2, CancellationToken::new());
        dispatcher.apply_config(&config_with_acls(&[3001, 3002, 3003, 3004]));

        let snapshot = dispatcher.acl_snapshot();
        assert_eq!(snapshot.len(), 4);
        let on_first = snapshot.iter().filter(|(_, index, _)| *index == 0).count();
        let on_second = snapshot.iter().filter(|(_, index, _)| *index == 1).count();
        assert_eq!(on_first, 2);
        assert_eq!(on_second, 2);

        dispatcher.shutdown_all();
    }

    #[tokio::test]
    async fn config_diff_keeps_survivors_and_drops_obsolete() {
        let dispatcher = AclDispatcher::new(2, CancellationToken::new());
        dispatcher.apply_config(&config_with_acls(&[3001, 3002]));

        let before = dispatcher.acl_snapshot();
        let surviving_context = before
            .iter()
            .find(|(config, _, _)| config.port == 3001)
            .map(|(_, index, _)| *index)
            .unwrap();

        dispatcher.apply_config(&config_with_acls(&[3001, 3003]));

        let after = dispatcher.acl_snapshot();
        assert_eq!(after.len(), 2);
        assert!(after.iter().any(|(config, _, _)| config.port == 3003));
        assert!(!after.iter().any(|(config, _, _)| config.port == 3002));

        // the survivor stays on its context
        let still_there = after
            .iter()
            .find(|(config, _, _)| config.port == 3001)
            .map(|(_, index, _)| *index)
            .unwrap();
        assert_eq!(surviving_context, still_there);

        dispatcher.shutdown_all();
    }
}
