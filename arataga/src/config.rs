//! Runtime configuration: the snapshot types consumed by the core and the
//! line-based config file grammar.
//!
//! The file format is command-per-line with `#` comments:
//!
//! ```text
//! log_level debug
//! nserver 8.8.8.8, 1.1.1.1
//! timeout.idle_connection 5min
//! acl auto, port=3000, in_ip=192.168.1.1, out_ip=203.0.113.7
//! ```

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use utils::logging::LogLevel;

/// Sentinel for a direction without a configured limit.
///
/// Comparisons treat it as infinite free space, so a reservation never
/// fails solely because of an unlimited direction.
pub const UNLIMITED: u64 = u64::MAX;

/// Per-direction bandwidth limits, in bytes per turn (= per second).
///
/// `to_user` limits target→user traffic (`bandlim.in`), `to_target` limits
/// user→target traffic (`bandlim.out`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandLimits {
    pub to_user: u64,
    pub to_target: u64,
}

impl Default for BandLimits {
    fn default() -> Self {
        Self { to_user: UNLIMITED, to_target: UNLIMITED }
    }
}

impl BandLimits {
    pub fn is_unlimited(&self) -> bool {
        self.to_user == UNLIMITED && self.to_target == UNLIMITED
    }
}

/// TCP ports the clients are not allowed to connect to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeniedPorts {
    cases: Vec<DeniedPortsCase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeniedPortsCase {
    Single(u16),
    /// Inclusive range `[low, high]`.
    Range(u16, u16),
}

impl DeniedPorts {
    pub fn new(cases: Vec<DeniedPortsCase>) -> Self {
        Self { cases }
    }

    pub fn is_denied(&self, port: u16) -> bool {
        self.cases.iter().any(|case| match *case {
            DeniedPortsCase::Single(p) => p == port,
            DeniedPortsCase::Range(low, high) => (low..=high).contains(&port),
        })
    }
}

/// Protocol expected on an ACL's ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AclProtocol {
    Auto,
    Socks,
    Http,
}

impl std::fmt::Display for AclProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AclProtocol::Auto => "auto",
            AclProtocol::Socks => "socks",
            AclProtocol::Http => "http",
        })
    }
}

/// One configured ingress endpoint of the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclConfig {
    pub protocol: AclProtocol,
    pub port: u16,
    pub in_ip: Ipv4Addr,
    pub out_ip: IpAddr,
}

impl std::fmt::Display for AclConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, port={}, in_ip={}, out_ip={}",
            self.protocol, self.port, self.in_ip, self.out_ip
        )
    }
}

/// Size limits for entities of an HTTP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpMessageLimits {
    pub max_request_target_length: usize,
    pub max_field_name_length: usize,
    pub max_field_value_length: usize,
    pub max_total_headers_size: usize,
    pub max_status_line_length: usize,
}

impl Default for HttpMessageLimits {
    fn default() -> Self {
        Self {
            max_request_target_length: 8 * 1024,
            max_field_name_length: 2 * 1024,
            max_field_value_length: 10 * 1024,
            max_total_headers_size: 80 * 1024,
            max_status_line_length: 1024,
        }
    }
}

/// Parameters shared by all ACLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonAclParams {
    /// Maximum number of concurrent connections to one ACL.
    pub maxconn: usize,

    /// Default per-client bandwidth limits, applied when the user-list does
    /// not set personal ones.
    pub client_bandlim: BandLimits,

    /// Delay before a negative authentication result is delivered.
    pub failed_auth_reply_timeout: Duration,

    pub protocol_detection_timeout: Duration,
    pub socks_handshake_phase_timeout: Duration,
    pub dns_resolving_timeout: Duration,
    pub authentification_timeout: Duration,
    pub connect_target_timeout: Duration,
    pub socks_bind_timeout: Duration,
    pub idle_connection_timeout: Duration,
    pub http_headers_complete_timeout: Duration,
    pub http_negative_response_timeout: Duration,

    /// Size of one I/O buffer for connections past the handshake stage.
    pub io_chunk_size: usize,
    /// Number of I/O buffers per transfer direction.
    pub io_chunk_count: usize,

    pub http_message_limits: HttpMessageLimits,
}

impl Default for CommonAclParams {
    fn default() -> Self {
        Self {
            maxconn: 100,
            client_bandlim: BandLimits::default(),
            failed_auth_reply_timeout: Duration::from_millis(750),
            protocol_detection_timeout: Duration::from_secs(3),
            socks_handshake_phase_timeout: Duration::from_secs(5),
            dns_resolving_timeout: Duration::from_secs(4),
            authentification_timeout: Duration::from_millis(1500),
            connect_target_timeout: Duration::from_secs(5),
            socks_bind_timeout: Duration::from_secs(20),
            idle_connection_timeout: Duration::from_secs(300),
            http_headers_complete_timeout: Duration::from_secs(5),
            http_negative_response_timeout: Duration::from_secs(2),
            io_chunk_size: 8 * 1024,
            io_chunk_count: 4,
            http_message_limits: HttpMessageLimits::default(),
        }
    }
}

/// The whole arataga configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub log_level: LogLevel,
    pub dns_cache_cleanup_period: Duration,
    pub nameserver_ips: Vec<IpAddr>,
    pub denied_ports: DeniedPorts,
    pub common_acl_params: CommonAclParams,
    pub acls: Vec<AclConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            dns_cache_cleanup_period: Duration::from_secs(30),
            nameserver_ips: Vec::new(),
            denied_ports: DeniedPorts::default(),
            common_acl_params: CommonAclParams::default(),
            acls: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown command {command} at line {line}")]
    UnknownCommand { command: String, line: usize },

    #[error("unable to process command {command} at line {line}: {reason}")]
    BadCommand {
        command: String,
        line: usize,
        reason: String,
    },

    #[error("empty config")]
    EmptyConfig,

    #[error("at least one name server IP should be specified")]
    NoNameservers,

    #[error("duplicated ingress endpoint {in_ip}:{port}")]
    DuplicatedIngress { in_ip: Ipv4Addr, port: u16 },
}

/// Parses the content of a config file.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();
    let mut commands_processed = 0usize;

    for (line_no, raw_line) in content.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let (command, args) = split_line(line);
        let line = line_no + 1;

        apply_command(&mut cfg, command, args).map_err(|reason| {
            ConfigError::BadCommand {
                command: command.to_string(),
                line,
                reason,
            }
        })?;

        commands_processed += 1;
    }

    if commands_processed == 0 {
        return Err(ConfigError::EmptyConfig);
    }
    if cfg.nameserver_ips.is_empty() {
        return Err(ConfigError::NoNameservers);
    }

    let mut seen = BTreeSet::new();
    for acl in &cfg.acls {
        if !seen.insert((acl.port, acl.in_ip)) {
            return Err(ConfigError::DuplicatedIngress {
                in_ip: acl.in_ip,
                port: acl.port,
            });
        }
    }

    Ok(cfg)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn split_line(line: &str) -> (&str, &str) {
    match line.find(|ch: char| ch.is_ascii_whitespace()) {
        Some(pos) => (&line[..pos], line[pos..].trim_start()),
        None => (line, ""),
    }
}

fn apply_command(cfg: &mut Config, command: &str, args: &str) -> Result<(), String> {
    match command {
        "log_level" => {
            cfg.log_level = LogLevel::from_name(args)
                .ok_or_else(|| format!("unsupported log-level: {args}"))?;
        }
        "dns_cache_cleanup_period" => {
            let v = parse_timeout(args)?;
            if v.is_zero() {
                return Err("dns_cache_cleanup_period can't be 0".to_string());
            }
            cfg.dns_cache_cleanup_period = v;
        }
        "nserver" => {
            // New IPs are appended to the already collected ones.
            for item in comma_separated(args) {
                let addr: Ipv4Addr = item
                    .parse()
                    .map_err(|_| format!("invalid IPv4 address: {item}"))?;
                cfg.nameserver_ips.push(IpAddr::V4(addr));
            }
        }
        "bandlim.in" => cfg.common_acl_params.client_bandlim.to_user = parse_transfer_speed(args)?,
        "bandlim.out" => {
            cfg.common_acl_params.client_bandlim.to_target = parse_transfer_speed(args)?
        }
        "denied_ports" => cfg.denied_ports = parse_denied_ports(args)?,
        "timeout.failed_auth_reply" => {
            cfg.common_acl_params.failed_auth_reply_timeout = parse_timeout(args)?
        }
        "timeout.protocol_detection" => {
            cfg.common_acl_params.protocol_detection_timeout = parse_timeout(args)?
        }
        "timeout.socks.handshake" => {
            cfg.common_acl_params.socks_handshake_phase_timeout = parse_timeout(args)?
        }
        "timeout.dns_resolving" => {
            cfg.common_acl_params.dns_resolving_timeout = parse_timeout(args)?
        }
        "timeout.authentification" => {
            cfg.common_acl_params.authentification_timeout = parse_timeout(args)?
        }
        "timeout.connect_target" => {
            cfg.common_acl_params.connect_target_timeout = parse_timeout(args)?
        }
        "timeout.socks.bind" => cfg.common_acl_params.socks_bind_timeout = parse_timeout(args)?,
        "timeout.idle_connection" => {
            cfg.common_acl_params.idle_connection_timeout = parse_timeout(args)?
        }
        "timeout.http.headers_complete" => {
            cfg.common_acl_params.http_headers_complete_timeout = parse_timeout(args)?
        }
        "timeout.http.negative_response" => {
            cfg.common_acl_params.http_negative_response_timeout = parse_timeout(args)?
        }
        "acl.max.conn" => {
            let v: usize = args
                .parse()
                .map_err(|_| format!("invalid number: {args}"))?;
            if v == 0 {
                return Err("acl.max.conn can't be 0".to_string());
            }
            cfg.common_acl_params.maxconn = v;
        }
        "acl.io.chunk_size" => {
            let v = parse_byte_count(args)?;
            if v == 0 {
                return Err("acl.io.chunk_size can't be 0".to_string());
            }
            cfg.common_acl_params.io_chunk_size = v as usize;
        }
        "acl.io.chunk_count" => {
            let v: usize = args
                .parse()
                .map_err(|_| format!("invalid number: {args}"))?;
            if v == 0 {
                return Err("acl.io.chunk_count can't be 0".to_string());
            }
            cfg.common_acl_params.io_chunk_count = v;
        }
        "http.limits.request_target" => {
            cfg.common_acl_params.http_message_limits.max_request_target_length =
                parse_nonzero_size(args)?
        }
        "http.limits.field_name" => {
            cfg.common_acl_params.http_message_limits.max_field_name_length =
                parse_nonzero_size(args)?
        }
        "http.limits.field_value" => {
            cfg.common_acl_params.http_message_limits.max_field_value_length =
                parse_nonzero_size(args)?
        }
        "http.limits.total_headers_size" => {
            cfg.common_acl_params.http_message_limits.max_total_headers_size =
                parse_nonzero_size(args)?
        }
        "http.limits.status_line" => {
            cfg.common_acl_params.http_message_limits.max_status_line_length =
                parse_nonzero_size(args)?
        }
        "acl" => cfg.acls.push(parse_acl(args)?),
        _ => {
            return Err(format!("unknown command {command}"));
        }
    }

    Ok(())
}

fn comma_separated(args: &str) -> impl Iterator<Item = &str> {
    // A trailing comma is allowed.
    args.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parses a timeout value with an optional `ms`, `s` or `min` suffix.
/// A bare number means seconds.
pub fn parse_timeout(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let digits_end = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(digits_end);
    let count: u64 = digits
        .parse()
        .map_err(|_| format!("invalid timeout value: {value}"))?;

    let millis = match suffix.trim() {
        "" | "s" => count.saturating_mul(1000),
        "ms" => count,
        "min" => count.saturating_mul(60_000),
        other => return Err(format!("unknown timeout suffix: {other}")),
    };

    Ok(Duration::from_millis(millis))
}

/// Parses a byte count with an optional `b`, `kib`, `mib` or `gib` suffix
/// (case-insensitive).
pub fn parse_byte_count(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let digits_end = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(digits_end);
    let count: u64 = digits
        .parse()
        .map_err(|_| format!("invalid byte count: {value}"))?;

    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kib" => 1024,
        "mib" => 1024 * 1024,
        "gib" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown byte count suffix: {other}")),
    };

    Ok(count.saturating_mul(multiplier))
}

fn parse_nonzero_size(value: &str) -> Result<usize, String> {
    let v = parse_byte_count(value)?;
    if v == 0 {
        return Err("size limit can't be 0".to_string());
    }
    Ok(v as usize)
}

/// Parses a transfer speed into bytes per second.
///
/// Accepts a byte count (`b`, `kib`, `mib`, `gib` suffixes) or a bit-rate
/// (`bps`, `kbps`) or `kibps` for KiB per second. `0` means unlimited.
pub fn parse_transfer_speed(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let digits_end = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(digits_end);
    let count: u64 = digits
        .parse()
        .map_err(|_| format!("invalid transfer speed: {value}"))?;

    let bytes = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => count,
        "kib" => count.saturating_mul(1024),
        "mib" => count.saturating_mul(1024 * 1024),
        "gib" => count.saturating_mul(1024 * 1024 * 1024),
        "bps" => count / 8,
        "kbps" => count.saturating_mul(1000) / 8,
        "kibps" => count.saturating_mul(1024),
        other => return Err(format!("unknown transfer speed suffix: {other}")),
    };

    if bytes == 0 {
        Ok(UNLIMITED)
    } else {
        Ok(bytes)
    }
}

fn parse_denied_ports(args: &str) -> Result<DeniedPorts, String> {
    let mut cases = Vec::new();
    for item in comma_separated(args) {
        let case = match item.split_once('-') {
            Some((low, high)) => {
                let low: u16 = low
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid port: {item}"))?;
                let high: u16 = high
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid port: {item}"))?;
                if low > high {
                    return Err(format!("invalid ports range: {low}-{high}"));
                }
                DeniedPortsCase::Range(low, high)
            }
            None => DeniedPortsCase::Single(
                item.parse().map_err(|_| format!("invalid port: {item}"))?,
            ),
        };
        cases.push(case);
    }
    Ok(DeniedPorts::new(cases))
}

fn parse_acl(args: &str) -> Result<AclConfig, String> {
    let mut items = comma_separated(args);

    let protocol = match items.next() {
        Some("auto") => AclProtocol::Auto,
        Some("socks") => AclProtocol::Socks,
        Some("http") => AclProtocol::Http,
        Some(other) => return Err(format!("unknown ACL protocol: {other}")),
        None => return Err("ACL protocol is not specified".to_string()),
    };

    let mut port = None;
    let mut in_ip = None;
    let mut out_ip = None;

    for item in items {
        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| format!("expected name=value, got: {item}"))?;
        let (name, value) = (name.trim(), value.trim());
        match name {
            "port" => {
                if port.is_some() {
                    return Err("port parameter is already set".to_string());
                }
                port = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| format!("invalid port: {value}"))?,
                );
            }
            "in_ip" => {
                if in_ip.is_some() {
                    return Err("in_ip parameter is already set".to_string());
                }
                in_ip = Some(
                    value
                        .parse::<Ipv4Addr>()
                        .map_err(|_| format!("invalid in_ip: {value}"))?,
                );
            }
            "out_ip" => {
                if out_ip.is_some() {
                    return Err("out_ip parameter is already set".to_string());
                }
                out_ip = Some(
                    value
                        .parse::<IpAddr>()
                        .map_err(|_| format!("invalid out_ip: {value}"))?,
                );
            }
            other => return Err(format!("unknown ACL parameter: {other}")),
        }
    }

    Ok(AclConfig {
        protocol,
        port: port.ok_or("port is not specified")?,
        in_ip: in_ip.ok_or("in_ip is not specified")?,
        out_ip: out_ip.ok_or("out_ip is not specified")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_suffixes() {
        assert_eq!(parse_timeout("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_timeout("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_timeout("15").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_timeout("5min").unwrap(), Duration::from_secs(300));
        assert!(parse_timeout("5h").is_err());
    }

    #[test]
    fn byte_count_suffixes() {
        assert_eq!(parse_byte_count("512").unwrap(), 512);
        assert_eq!(parse_byte_count("512b").unwrap(), 512);
        assert_eq!(parse_byte_count("8KiB").unwrap(), 8192);
        assert_eq!(parse_byte_count("2mib").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_byte_count("1gib").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn transfer_speed_zero_is_unlimited() {
        assert_eq!(parse_transfer_speed("0").unwrap(), UNLIMITED);
        assert_eq!(parse_transfer_speed("800bps").unwrap(), 100);
        assert_eq!(parse_transfer_speed("8kbps").unwrap(), 1000);
        assert_eq!(parse_transfer_speed("4KiBps").unwrap(), 4096);
    }

    #[test]
    fn denied_ports_matching() {
        let ports = parse_denied_ports("25, 100-110, 6000,").unwrap();
        assert!(ports.is_denied(25));
        assert!(ports.is_denied(100));
        assert!(ports.is_denied(105));
        assert!(ports.is_denied(110));
        assert!(ports.is_denied(6000));
        assert!(!ports.is_denied(111));
        assert!(!ports.is_denied(24));
    }

    #[test]
    fn denied_ports_invalid_range() {
        assert!(parse_denied_ports("110-100").is_err());
    }
}
