//! The user-list: authentication data loaded from `local-user-list.cfg`
//! or pushed through the admin endpoint.
//!
//! Line format, `#` comments allowed:
//!
//! ```text
//! # by-IP: proxy_in_ip proxy_port user_ip = bandlim_in bandlim_out site_limits_id user_id
//! 192.168.1.1 3000 192.168.100.1 = 0 0 1 7
//! # by-login: proxy_in_ip proxy_port login password = ...
//! 192.168.1.1 3000 user 12345 = 50KiB 50KiB 0 8
//! # site limits: site_limits_id = {domain bandlim_in bandlim_out}*
//! 1 = vk.com 100KiB 100KiB api.vk.com 0 0
//! ```

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::config::{parse_transfer_speed, BandLimits, UNLIMITED};

pub type UserId = u32;
pub type SiteLimitsId = u32;

/// Key for authentication by client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AuthByIpKey {
    pub proxy_in_addr: Ipv4Addr,
    pub proxy_port: u16,
    pub user_ip: Ipv4Addr,
}

/// Key for authentication by login/password.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AuthByLoginKey {
    pub proxy_in_addr: Ipv4Addr,
    pub proxy_port: u16,
    pub username: String,
    pub password: String,
}

/// Per-user data attached to an authentication entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData {
    pub bandlims: BandLimits,
    pub site_limits_id: SiteLimitsId,
    pub user_id: UserId,
}

/// A domain name in normalized form: ASCII lower-cased, leading dots
/// stripped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainName(String);

impl DomainName {
    pub fn new(value: impl Into<String>) -> Self {
        let mut value: String = value.into();
        value.make_ascii_lowercase();
        let trimmed = value.trim_start_matches('.');
        if trimmed.len() != value.len() {
            value = trimmed.to_string();
        }
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DomainName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

/// Tells whether `full_name` is `domain` itself or a subdomain of it.
///
/// The match is on whole labels: `v1.api.vk.com` is a subdomain of
/// `api.vk.com` and of `vk.com`, but `notvk.com` is not a subdomain of
/// `vk.com`.
pub fn is_subdomain_of(full_name: &DomainName, domain: &DomainName) -> bool {
    let fn_ = full_name.as_str().as_bytes();
    let d = domain.as_str().as_bytes();

    if fn_.len() == d.len() {
        fn_ == d
    } else if fn_.len() > d.len() {
        let pos = fn_.len() - d.len() - 1;
        fn_[pos] == b'.' && &fn_[pos + 1..] == d
    } else {
        false
    }
}

/// Bandwidth limits for a single domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneSiteLimit {
    pub domain: DomainName,
    pub bandlims: BandLimits,
}

/// A set of per-domain limits shared by all users referencing the same
/// `site_limits_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteLimitsData {
    pub limits: Vec<OneSiteLimit>,
}

impl SiteLimitsData {
    /// Finds the most specific entry matching `host`: among the entries for
    /// which `host` is a subdomain, the one with the longest domain wins.
    pub fn try_find_limits_for(&self, host: &DomainName) -> Option<&OneSiteLimit> {
        let mut last_found: Option<&OneSiteLimit> = None;
        for limit in &self.limits {
            if is_subdomain_of(host, &limit.domain) {
                match last_found {
                    None => last_found = Some(limit),
                    Some(found) => {
                        if is_subdomain_of(&limit.domain, &found.domain) {
                            last_found = Some(limit);
                        }
                    }
                }
            }
        }
        last_found
    }
}

/// The complete client-authentication storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthData {
    pub by_ip: BTreeMap<AuthByIpKey, UserData>,
    pub by_login: BTreeMap<AuthByLoginKey, UserData>,
    pub site_limits: BTreeMap<SiteLimitsId, SiteLimitsData>,
}

#[derive(Debug, thiserror::Error)]
#[error("unable to parse line #{line}: {reason}")]
pub struct UserListError {
    pub line: usize,
    pub reason: String,
}

/// Parses the in-memory content of a user-list file.
pub fn parse_auth_data(content: &str) -> Result<AuthData, UserListError> {
    let mut result = AuthData::default();

    for (line_no, raw_line) in content.lines().enumerate() {
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        parse_line(line, &mut result).map_err(|reason| UserListError {
            line: line_no + 1,
            reason,
        })?;
    }

    Ok(result)
}

fn parse_line(line: &str, result: &mut AuthData) -> Result<(), String> {
    let (key_part, data_part) = line
        .split_once('=')
        .ok_or_else(|| "expected '=' separator".to_string())?;

    let key_tokens: Vec<&str> = key_part.split_ascii_whitespace().collect();
    match key_tokens.as_slice() {
        // site_limits_id = {domain in out}*
        [id] => {
            let id: SiteLimitsId = id
                .parse()
                .map_err(|_| format!("invalid site_limits_id: {id}"))?;
            let data = parse_site_limits(data_part)?;
            result.site_limits.insert(id, data);
        }
        // in_ip port user_ip = user_data
        [in_ip, port, user_ip] => {
            let key = AuthByIpKey {
                proxy_in_addr: parse_ipv4(in_ip)?,
                proxy_port: port.parse().map_err(|_| format!("invalid port: {port}"))?,
                user_ip: parse_ipv4(user_ip)?,
            };
            result.by_ip.insert(key, parse_user_data(data_part)?);
        }
        // in_ip port login password = user_data
        [in_ip, port, username, password] => {
            let key = AuthByLoginKey {
                proxy_in_addr: parse_ipv4(in_ip)?,
                proxy_port: port.parse().map_err(|_| format!("invalid port: {port}"))?,
                username: (*username).to_string(),
                password: (*password).to_string(),
            };
            result.by_login.insert(key, parse_user_data(data_part)?);
        }
        _ => return Err(format!("unrecognized rule: {line}")),
    }

    Ok(())
}

/// An IPv4 address in dotted form or as a single integer.
fn parse_ipv4(value: &str) -> Result<Ipv4Addr, String> {
    if let Ok(addr) = value.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    value
        .parse::<u32>()
        .map(Ipv4Addr::from)
        .map_err(|_| format!("invalid IPv4 address: {value}"))
}

fn parse_bandlims(in_value: &str, out_value: &str) -> Result<BandLimits, String> {
    Ok(BandLimits {
        to_user: parse_transfer_speed(in_value)?,
        to_target: parse_transfer_speed(out_value)?,
    })
}

fn parse_user_data(data: &str) -> Result<UserData, String> {
    let tokens: Vec<&str> = data.split_ascii_whitespace().collect();
    let [bl_in, bl_out, site_limits_id, user_id] = tokens.as_slice() else {
        return Err(format!(
            "expected 'bandlim_in bandlim_out site_limits_id user_id', got: {data}"
        ));
    };

    Ok(UserData {
        bandlims: parse_bandlims(bl_in, bl_out)?,
        site_limits_id: site_limits_id
            .parse()
            .map_err(|_| format!("invalid site_limits_id: {site_limits_id}"))?,
        user_id: user_id
            .parse()
            .map_err(|_| format!("invalid user_id: {user_id}"))?,
    })
}

fn parse_site_limits(data: &str) -> Result<SiteLimitsData, String> {
    let tokens: Vec<&str> = data.split_ascii_whitespace().collect();
    if tokens.len() % 3 != 0 {
        return Err(format!(
            "expected a sequence of 'domain bandlim_in bandlim_out' triples, got: {data}"
        ));
    }

    let mut limits = Vec::with_capacity(tokens.len() / 3);
    for triple in tokens.chunks_exact(3) {
        limits.push(OneSiteLimit {
            domain: DomainName::new(triple[0]),
            bandlims: parse_bandlims(triple[1], triple[2])?,
        });
    }

    Ok(SiteLimitsData { limits })
}

/// Loads and parses a user-list file.
pub fn load_auth_data(path: &std::path::Path) -> anyhow::Result<AuthData> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_auth_data(&content)?)
}
