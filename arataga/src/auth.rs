//! Client authentication against the user-list.
//!
//! Two lookup tables (by client IP, by login/password), the denied-port
//! check and the per-domain limit lookup. Negative results are delayed by
//! `failed_auth_reply_timeout` before being delivered to rate-limit
//! brute-force attempts; positive results are delivered immediately
//! together with a fresh traffic-limiter handle.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::bandlim::{TrafficLimiter, UserRegistry};
use crate::config::DeniedPorts;
use crate::stats::AuthStats;
use crate::user_list::{
    AuthByIpKey, AuthByLoginKey, AuthData, DomainName, OneSiteLimit, UserData,
};

/// Parameters of one authentication request.
#[derive(Debug)]
pub struct AuthRequest {
    pub user_ip: Ipv4Addr,
    pub username: Option<String>,
    pub password: Option<String>,
    pub target_host: String,
    pub target_port: u16,
}

/// Why the authentication failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    UnknownUser,
    TargetBlocked,
}

impl AuthFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthFailure::UnknownUser => "unknown_user",
            AuthFailure::TargetBlocked => "target_blocked",
        }
    }
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A positive authentication result.
pub struct AuthSuccess {
    pub user_id: crate::user_list::UserId,
    pub traffic_limiter: TrafficLimiter,
}

/// Mutable-on-update knobs taken from the config.
struct AuthParams {
    denied_ports: DeniedPorts,
    failed_auth_reply_timeout: Duration,
}

/// One authenticator instance; one per I/O context.
pub struct Authenticator {
    auth_data: ArcSwap<AuthData>,
    params: ArcSwap<AuthParams>,
    users: Arc<UserRegistry>,
    stats: Arc<AuthStats>,
}

impl Authenticator {
    pub fn new(users: Arc<UserRegistry>, stats: Arc<AuthStats>) -> Arc<Self> {
        Arc::new(Self {
            auth_data: ArcSwap::from_pointee(AuthData::default()),
            params: ArcSwap::from_pointee(AuthParams {
                denied_ports: DeniedPorts::default(),
                failed_auth_reply_timeout: Duration::from_millis(750),
            }),
            users,
            stats,
        })
    }

    pub fn update_user_list(&self, auth_data: AuthData) {
        self.auth_data.store(Arc::new(auth_data));
    }

    pub fn update_params(&self, denied_ports: DeniedPorts, failed_auth_reply_timeout: Duration) {
        self.params.store(Arc::new(AuthParams { denied_ports, failed_auth_reply_timeout }));
    }

    /// Performs the whole authentication procedure for a connection.
    ///
    /// On success the user's connection count is incremented and a traffic
    /// limiter for the (user, optional domain) pair is returned.
    pub async fn authenticate(
        &self,
        proxy_in_addr: Ipv4Addr,
        proxy_port: u16,
        request: AuthRequest,
    ) -> Result<AuthSuccess, AuthFailure> {
        self.stats.total_count.inc();

        match self.check(proxy_in_addr, proxy_port, &request) {
            Ok((user_data, domain_limits)) => {
                debug!(
                    user_id = user_data.user_id,
                    target_host = %request.target_host,
                    "auth_request succeeded"
                );

                let traffic_limiter = self.users.register_connection(
                    user_data.user_id,
                    user_data.bandlims,
                    domain_limits.map(|limit| (limit.domain, limit.bandlims)),
                );

                Ok(AuthSuccess { user_id: user_data.user_id, traffic_limiter })
            }
            Err(reason) => {
                let reply_timeout = self.params.load().failed_auth_reply_timeout;
                debug!(%reason, ?reply_timeout, "auth_request failed");

                tokio::time::sleep(reply_timeout).await;
                Err(reason)
            }
        }
    }

    /// The bare decision procedure, without latency shaping and without
    /// touching connection counts. Used by [`Self::authenticate`] and by
    /// the `GET /debug/auth` probe.
    pub fn check(
        &self,
        proxy_in_addr: Ipv4Addr,
        proxy_port: u16,
        request: &AuthRequest,
    ) -> Result<(UserData, Option<OneSiteLimit>), AuthFailure> {
        let params = self.params.load();
        if params.denied_ports.is_denied(request.target_port) {
            self.stats.denied_port_count.inc();
            return Err(AuthFailure::TargetBlocked);
        }

        let auth_data = self.auth_data.load();

        let user_data = match &request.username {
            Some(username) => {
                let key = AuthByLoginKey {
                    proxy_in_addr,
                    proxy_port,
                    username: username.clone(),
                    password: request.password.clone().unwrap_or_default(),
                };
                match auth_data.by_login.get(&key) {
                    Some(data) => {
                        self.stats.by_login_count.inc();
                        *data
                    }
                    None => {
                        self.stats.failed_by_login_count.inc();
                        return Err(AuthFailure::UnknownUser);
                    }
                }
            }
            None => {
                let key = AuthByIpKey { proxy_in_addr, proxy_port, user_ip: request.user_ip };
                match auth_data.by_ip.get(&key) {
                    Some(data) => {
                        self.stats.by_ip_count.inc();
                        *data
                    }
                    None => {
                        self.stats.failed_by_ip_count.inc();
                        return Err(AuthFailure::UnknownUser);
                    }
                }
            }
        };

        let domain_limits = auth_data
            .site_limits
            .get(&user_data.site_limits_id)
            .and_then(|limits| {
                limits.try_find_limits_for(&DomainName::new(request.target_host.as_str()))
            })
            .cloned();

        Ok((user_data, domain_limits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BandLimits, DeniedPortsCase};
    use crate::user_list::parse_auth_data;

    fn make_authenticator(user_list: &str) -> Arc<Authenticator> {
        let users = UserRegistry::new(BandLimits::default());
        let auth = Authenticator::new(users, Arc::default());
        auth.update_user_list(parse_auth_data(user_list).unwrap());
        auth
    }

    const USER_LIST: &str = "\
192.168.1.1 3000 192.168.100.1 = 0 0 1 7
192.168.1.1 3000 user 12345 = 0 0 1 8
1 = vk.com 100KiB 100KiB api.vk.com 50KiB 50KiB
";

    fn ip_request(target_port: u16) -> AuthRequest {
        AuthRequest {
            user_ip: "192.168.100.1".parse().unwrap(),
            username: None,
            password: None,
            target_host: "example.org".to_string(),
            target_port,
        }
    }

    #[test]
    fn auth_by_ip_hit_and_miss() {
        let auth = make_authenticator(USER_LIST);
        let in_addr: Ipv4Addr = "192.168.1.1".parse().unwrap();

        let (user, _) = auth.check(in_addr, 3000, &ip_request(80)).unwrap();
        assert_eq!(user.user_id, 7);

        // wrong ingress port
        assert_eq!(
            auth.check(in_addr, 3001, &ip_request(80)).unwrap_err(),
            AuthFailure::UnknownUser
        );
    }

    #[test]
    fn auth_by_login_requires_exact_password() {
        let auth = make_authenticator(USER_LIST);
        let in_addr: Ipv4Addr = "192.168.1.1".parse().unwrap();

        let mut request = ip_request(80);
        request.username = Some("user".to_string());
        request.password = Some("12345".to_string());
        let (user, _) = auth.check(in_addr, 3000, &request).unwrap();
        assert_eq!(user.user_id, 8);

        request.password = Some("wrong".to_string());
        assert_eq!(
            auth.check(in_addr, 3000, &request).unwrap_err(),
            AuthFailure::UnknownUser
        );
    }

    #[test]
    fn denied_port_wins_over_user_lookup() {
        let auth = make_authenticator(USER_LIST);
        auth.update_params(
            DeniedPorts::new(vec![DeniedPortsCase::Single(25)]),
            Duration::from_millis(1),
        );
        let in_addr: Ipv4Addr = "192.168.1.1".parse().unwrap();

        assert_eq!(
            auth.check(in_addr, 3000, &ip_request(25)).unwrap_err(),
            AuthFailure::TargetBlocked
        );
    }

    #[test]
    fn most_specific_domain_limit_is_selected() {
        let auth = make_authenticator(USER_LIST);
        let in_addr: Ipv4Addr = "192.168.1.1".parse().unwrap();

        let mut request = ip_request(80);
        request.target_host = "v1.api.vk.com".to_string();
        let (_, domain) = auth.check(in_addr, 3000, &request).unwrap();
        assert_eq!(domain.unwrap().domain.as_str(), "api.vk.com");

        request.target_host = "static.vk.com".to_string();
        let (_, domain) = auth.check(in_addr, 3000, &request).unwrap();
        assert_eq!(domain.unwrap().domain.as_str(), "vk.com");

        request.target_host = "example.org".to_string();
        let (_, domain) = auth.check(in_addr, 3000, &request).unwrap();
        assert!(domain.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn negative_reply_is_delayed() {
        let auth = make_authenticator(USER_LIST);
        auth.update_params(DeniedPorts::default(), Duration::from_millis(750));
        let in_addr: Ipv4Addr = "10.0.0.1".parse().unwrap();

        let started = tokio::time::Instant::now();
        let result = auth.authenticate(in_addr, 3000, ip_request(80)).await;
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_millis(750));
    }
}
