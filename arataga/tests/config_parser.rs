//! Config file grammar coverage, mirroring the original parser suite.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rstest::rstest;

use arataga::config::{parse_config, AclProtocol, Config, ConfigError};
use utils::logging::LogLevel;

fn parse(content: &str) -> Config {
    parse_config(content).expect("config must parse")
}

#[test]
fn minimal_config() {
    let cfg = parse("nserver 8.8.8.8\n");
    assert_eq!(cfg.nameserver_ips, vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))]);
    assert!(cfg.acls.is_empty());

    // the defaults stay untouched
    assert_eq!(cfg.common_acl_params.maxconn, 100);
    assert_eq!(cfg.common_acl_params.io_chunk_size, 8 * 1024);
    assert_eq!(
        cfg.common_acl_params.protocol_detection_timeout,
        Duration::from_secs(3)
    );
    assert_eq!(cfg.log_level, LogLevel::Info);
}

#[test]
fn empty_config_is_an_error() {
    assert!(matches!(parse_config(""), Err(ConfigError::EmptyConfig)));
    assert!(matches!(
        parse_config("# only comments\n\n"),
        Err(ConfigError::EmptyConfig)
    ));
}

#[test]
fn nameservers_are_mandatory() {
    assert!(matches!(
        parse_config("log_level debug\n"),
        Err(ConfigError::NoNameservers)
    ));
}

#[test]
fn nserver_lists_accumulate() {
    let cfg = parse("nserver 8.8.8.8, 8.8.4.4\nnserver 1.1.1.1\n");
    assert_eq!(cfg.nameserver_ips.len(), 3);
}

#[test]
fn full_config_round_trip() {
    let content = "\
# arataga test config
log_level warn
dns_cache_cleanup_period 1min
nserver 8.8.8.8
bandlim.in 50KiB
bandlim.out 8kbps
denied_ports 25, 100-110
timeout.failed_auth_reply 250ms
timeout.protocol_detection 2s
timeout.socks.handshake 3s
timeout.dns_resolving 1500ms
timeout.authentification 2s
timeout.connect_target 10s
timeout.socks.bind 1min
timeout.idle_connection 2min
timeout.http.headers_complete 7s
timeout.http.negative_response 1s
acl.max.conn 250
acl.io.chunk_size 16KiB
acl.io.chunk_count 8
http.limits.request_target 4KiB
http.limits.field_name 1KiB
http.limits.field_value 4KiB
http.limits.total_headers_size 40KiB
http.limits.status_line 512
acl auto, port=3000, in_ip=192.168.1.104, out_ip=192.168.1.104
acl socks, port=3001, in_ip=192.168.1.104, out_ip=2001:db8::10
";

    let cfg = parse(content);

    assert_eq!(cfg.log_level, LogLevel::Warn);
    assert_eq!(cfg.dns_cache_cleanup_period, Duration::from_secs(60));
    assert_eq!(cfg.common_acl_params.client_bandlim.to_user, 50 * 1024);
    assert_eq!(cfg.common_acl_params.client_bandlim.to_target, 1000);
    assert!(cfg.denied_ports.is_denied(25));
    assert!(cfg.denied_ports.is_denied(105));
    assert!(!cfg.denied_ports.is_denied(111));
    assert_eq!(
        cfg.common_acl_params.failed_auth_reply_timeout,
        Duration::from_millis(250)
    );
    assert_eq!(cfg.common_acl_params.socks_bind_timeout, Duration::from_secs(60));
    assert_eq!(cfg.common_acl_params.maxconn, 250);
    assert_eq!(cfg.common_acl_params.io_chunk_size, 16 * 1024);
    assert_eq!(cfg.common_acl_params.io_chunk_count, 8);
    assert_eq!(
        cfg.common_acl_params.http_message_limits.max_request_target_length,
        4 * 1024
    );
    assert_eq!(
        cfg.common_acl_params.http_message_limits.max_status_line_length,
        512
    );

    assert_eq!(cfg.acls.len(), 2);
    assert_eq!(cfg.acls[0].protocol, AclProtocol::Auto);
    assert_eq!(cfg.acls[0].port, 3000);
    assert_eq!(cfg.acls[0].in_ip, Ipv4Addr::new(192, 168, 1, 104));
    assert_eq!(cfg.acls[1].protocol, AclProtocol::Socks);
    assert!(cfg.acls[1].out_ip.is_ipv6());
}

#[test]
fn acl_parameters_in_any_order() {
    let cfg = parse("nserver 8.8.8.8\nacl http, out_ip=10.0.0.1, in_ip=192.168.1.1, port=8080,\n");
    assert_eq!(cfg.acls[0].protocol, AclProtocol::Http);
    assert_eq!(cfg.acls[0].port, 8080);
}

#[rstest]
#[case::unknown_command("no_such_command 1\nnserver 8.8.8.8\n")]
#[case::bad_log_level("log_level loud\nnserver 8.8.8.8\n")]
#[case::zero_cleanup_period("dns_cache_cleanup_period 0\nnserver 8.8.8.8\n")]
#[case::zero_maxconn("acl.max.conn 0\nnserver 8.8.8.8\n")]
#[case::zero_chunk_size("acl.io.chunk_size 0\nnserver 8.8.8.8\n")]
#[case::zero_chunk_count("acl.io.chunk_count 0\nnserver 8.8.8.8\n")]
#[case::inverted_port_range("denied_ports 110-100\nnserver 8.8.8.8\n")]
#[case::acl_without_port("acl auto, in_ip=192.168.1.1, out_ip=10.0.0.1\nnserver 8.8.8.8\n")]
#[case::acl_without_in_ip("acl auto, port=3000, out_ip=10.0.0.1\nnserver 8.8.8.8\n")]
#[case::acl_without_out_ip("acl auto, port=3000, in_ip=192.168.1.1\nnserver 8.8.8.8\n")]
#[case::acl_duplicated_port_param(
    "acl auto, port=3000, port=3001, in_ip=192.168.1.1, out_ip=10.0.0.1\nnserver 8.8.8.8\n"
)]
#[case::acl_unknown_protocol("acl quic, port=3000, in_ip=192.168.1.1, out_ip=10.0.0.1\nnserver 8.8.8.8\n")]
fn bad_configs_are_rejected(#[case] content: &str) {
    assert!(parse_config(content).is_err());
}

#[test]
fn error_reports_the_line_number() {
    let error = parse_config("nserver 8.8.8.8\nacl.max.conn zero\n").unwrap_err();
    let ConfigError::BadCommand { command, line, .. } = error else {
        panic!("expected BadCommand, got: {error}");
    };
    assert_eq!(command, "acl.max.conn");
    assert_eq!(line, 2);
}

#[test]
fn duplicated_ingress_pairs_are_rejected() {
    let content = "\
nserver 8.8.8.8
acl auto, port=3000, in_ip=192.168.1.1, out_ip=10.0.0.1
acl http, port=3000, in_ip=192.168.1.1, out_ip=10.0.0.2
";
    assert!(matches!(
        parse_config(content),
        Err(ConfigError::DuplicatedIngress { .. })
    ));
}

#[test]
fn comments_and_blank_lines_are_skipped() {
    let cfg = parse("\n# leading comment\nnserver 8.8.8.8 # trailing comment\n\n");
    assert_eq!(cfg.nameserver_ips.len(), 1);
}
