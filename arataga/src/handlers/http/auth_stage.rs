//! The authentication stage of the HTTP pipeline: credential extraction,
//! target derivation, request-target rewriting and the authenticator
//! round-trip.

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

use crate::auth::AuthRequest;
use crate::handlers::{ConnCtx, Handler, Outcome, RemoveReason};

use super::connect_stage::TargetConnectorHandler;
use super::{responses, send_negative_response_then_close, RequestInfo};

pub struct AuthentificationHandler {
    connection: TcpStream,
    input: BytesMut,
    request_info: RequestInfo,
}

enum Credentials {
    None,
    Provided { username: String, password: String },
}

impl AuthentificationHandler {
    pub fn new(connection: TcpStream, input: BytesMut, request_info: RequestInfo) -> Self {
        Self { connection, input, request_info }
    }

    pub(crate) async fn run(mut self, ctx: &ConnCtx) -> Outcome {
        let credentials = match extract_username_and_password(&mut self.request_info) {
            Ok(credentials) => credentials,
            Err(description) => {
                warn!(
                    connection = %ctx.long_id(),
                    %description,
                    "username/password extraction failure"
                );
                return Outcome::Remove(
                    send_negative_response_then_close(
                        ctx,
                        &mut self.connection,
                        responses::BAD_REQUEST_AUTH_PARAMS_EXTRACTION_FAILURE,
                        RemoveReason::ProtocolError,
                    )
                    .await,
                );
            }
        };

        if let Err(description) = derive_target_and_rewrite(&mut self.request_info) {
            warn!(
                connection = %ctx.long_id(),
                %description,
                "target-host+port extraction failure"
            );
            return Outcome::Remove(
                send_negative_response_then_close(
                    ctx,
                    &mut self.connection,
                    responses::BAD_REQUEST_TARGET_HOST_EXTRACTION_FAILURE,
                    RemoveReason::ProtocolError,
                )
                .await,
            );
        }

        let (username, password) = match credentials {
            Credentials::None => (None, None),
            Credentials::Provided { username, password } => (Some(username), Some(password)),
        };

        let user_ip = match self.connection.peer_addr().ok().and_then(|addr| match addr.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(ip) => ip.to_ipv4_mapped(),
        }) {
            Some(ip) => ip,
            None => {
                return Outcome::Remove(
                    send_negative_response_then_close(
                        ctx,
                        &mut self.connection,
                        responses::INTERNAL_SERVER_ERROR,
                        RemoveReason::UnexpectedAndUnsupportedCase,
                    )
                    .await,
                )
            }
        };

        let params = ctx.acl.params.load_full();
        let auth_result = timeout(
            params.authentification_timeout,
            ctx.acl.auth.authenticate(
                ctx.acl.config.in_ip,
                ctx.acl.config.port,
                AuthRequest {
                    user_ip,
                    username,
                    password,
                    target_host: self.request_info.target_host.clone(),
                    target_port: self.request_info.target_port,
                },
            ),
        )
        .await;

        let traffic_limiter = match auth_result {
            Ok(Ok(success)) => success.traffic_limiter,
            Ok(Err(reason)) => {
                warn!(connection = %ctx.long_id(), %reason, "user is not authentificated");
                return Outcome::Remove(
                    send_negative_response_then_close(
                        ctx,
                        &mut self.connection,
                        responses::PROXY_AUTH_REQUIRED_NOT_AUTHORIZED,
                        RemoveReason::ProtocolError,
                    )
                    .await,
                );
            }
            Err(_) => {
                warn!(connection = %ctx.long_id(), "authentification timed out");
                return Outcome::Remove(
                    send_negative_response_then_close(
                        ctx,
                        &mut self.connection,
                        responses::PROXY_AUTH_REQUIRED_AUTH_TIMEOUT,
                        RemoveReason::CurrentOperationTimedOut,
                    )
                    .await,
                );
            }
        };

        Outcome::Replace(Handler::HttpTargetConnect(TargetConnectorHandler::new(
            self.connection,
            self.input,
            self.request_info,
            traffic_limiter,
        )))
    }
}

/// Pulls Basic credentials out of `Proxy-Authorization`, removing the
/// header. Any scheme other than Basic is an error.
fn extract_username_and_password(request_info: &mut RequestInfo) -> Result<Credentials, String> {
    let Some(value) = request_info.headers.opt_value_of("Proxy-Authorization") else {
        return Ok(Credentials::None);
    };

    let (scheme, payload) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| format!("malformed Proxy-Authorization value: {value}"))?;

    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(format!("unsupported auth-scheme: {scheme}"));
    }

    let decoded = base64::decode(payload.trim())
        .map_err(|error| format!("bad base64 in Proxy-Authorization: {error}"))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| "basic-auth credentials are not valid UTF-8".to_string())?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| "no ':' separator in basic-auth credentials".to_string())?;

    let credentials = Credentials::Provided {
        username: username.to_string(),
        password: password.to_string(),
    };

    request_info.headers.remove_all_of("Proxy-Authorization");

    Ok(credentials)
}

/// Fills `target_host`/`target_port` and rewrites the request-target to
/// origin-form.
///
/// The target comes from the request-target when it is an absolute URI or
/// a CONNECT authority, from the `Host` field otherwise. The `Host` field
/// is consumed either way: the rewriter emits its own.
fn derive_target_and_rewrite(request_info: &mut RequestInfo) -> Result<(), String> {
    let extracted = if request_info.method == "CONNECT" {
        parse_host_and_port(&request_info.request_target, None)
    } else {
        extract_from_absolute_form(request_info)
    };

    let (host, port) = match extracted {
        Ok(found) => found,
        // Fall back to the Host field.
        Err(_) => {
            let mut hosts = request_info.headers.values_of("Host");
            let value = hosts.next().ok_or("no Host http-field")?;
            parse_host_and_port(value, Some(80))?
        }
    };

    request_info.headers.remove_all_of("Host");
    request_info.target_host = host;
    request_info.target_port = port;

    Ok(())
}

/// Absolute-form handling: `http://host[:port]/path?query#fragment`.
/// Rewrites the stored request-target to origin-form on success.
fn extract_from_absolute_form(request_info: &mut RequestInfo) -> Result<(String, u16), String> {
    let url = url::Url::parse(&request_info.request_target)
        .map_err(|error| format!("unable to parse request-target: {error}"))?;

    let default_port = match url.scheme() {
        "http" => 80,
        "https" => 443,
        other if url.has_authority() => {
            return Err(format!("unsupported schema in request-target: {other}"))
        }
        // An opaque target such as `localhost:9090` is not an absolute
        // URI; let the Host fallback handle it.
        _ => return Err("no target-host and port in request-target".to_string()),
    };

    let host = match url.host() {
        Some(url::Host::Domain(domain)) => domain.to_string(),
        Some(url::Host::Ipv4(addr)) => addr.to_string(),
        Some(url::Host::Ipv6(addr)) => addr.to_string(),
        None => return Err("no target-host and port in request-target".to_string()),
    };
    let port = url.port().unwrap_or(default_port);

    // origin-form: path (never empty), optional query, optional fragment
    let mut origin_form = String::new();
    let path = url.path();
    if path.is_empty() {
        origin_form.push('/');
    } else {
        origin_form.push_str(path);
    }
    if let Some(query) = url.query() {
        origin_form.push('?');
        origin_form.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        origin_form.push('#');
        origin_form.push_str(fragment);
    }
    request_info.request_target = origin_form;

    Ok((host, port))
}

/// Parses `reg-name | IPv4 | "[" IPv6 "]"` with an optional `:port`.
fn parse_host_and_port(value: &str, default_port: Option<u16>) -> Result<(String, u16), String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty host value".to_string());
    }

    if let Some(rest) = value.strip_prefix('[') {
        // bracketed IPv6 form
        let (addr, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unbalanced brackets in host value: {value}"))?;
        addr.parse::<std::net::Ipv6Addr>()
            .map_err(|_| format!("invalid IPv6 address in host value: {value}"))?;

        let port = match tail.strip_prefix(':') {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| format!("invalid port in host value: {value}"))?,
            None if tail.is_empty() => {
                default_port.ok_or_else(|| format!("no port in host value: {value}"))?
            }
            None => return Err(format!("garbage after brackets in host value: {value}")),
        };

        return Ok((addr.to_string(), port));
    }

    match value.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() || host.contains(':') {
                return Err(format!("invalid host value: {value}"));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid port in host value: {value}"))?;
            Ok((host.to_string(), port))
        }
        None => {
            let port = default_port.ok_or_else(|| format!("no port in host value: {value}"))?;
            Ok((value.to_string(), port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::http::parser::BodyKind;
    use crate::handlers::http::HeaderList;

    fn request_info(method: &str, target: &str, host_field: Option<&str>) -> RequestInfo {
        let mut headers = HeaderList::default();
        if let Some(host) = host_field {
            headers.add_field("Host", host);
        }
        RequestInfo {
            method: method.to_string(),
            request_target: target.to_string(),
            headers,
            target_host: String::new(),
            target_port: 0,
            keep_user_end_alive: true,
            body: BodyKind::None,
        }
    }

    #[test]
    fn absolute_form_is_rewritten_to_origin_form() {
        let mut info = request_info("GET", "http://127.0.0.1:9090/a/b?x=1#frag", None);
        derive_target_and_rewrite(&mut info).unwrap();

        assert_eq!(info.target_host, "127.0.0.1");
        assert_eq!(info.target_port, 9090);
        assert_eq!(info.request_target, "/a/b?x=1#frag");
    }

    #[test]
    fn scheme_defaults_apply() {
        let mut info = request_info("GET", "http://example.org/", None);
        derive_target_and_rewrite(&mut info).unwrap();
        assert_eq!(info.target_port, 80);

        let mut info = request_info("GET", "https://example.org/", None);
        derive_target_and_rewrite(&mut info).unwrap();
        assert_eq!(info.target_port, 443);
    }

    #[test]
    fn unsupported_scheme_is_rejected_without_host_fallback() {
        let mut info = request_info("GET", "ftp://example.org/file", Some("example.org"));
        // the ftp URI carries an authority, so this is an error, not a
        // fallback case
        assert!(derive_target_and_rewrite(&mut info).is_err());
    }

    #[test]
    fn host_field_fallback_with_default_port() {
        let mut info = request_info("GET", "/index.html", Some("localhost:9090"));
        derive_target_and_rewrite(&mut info).unwrap();

        assert_eq!(info.target_host, "localhost");
        assert_eq!(info.target_port, 9090);
        assert_eq!(info.request_target, "/index.html");
        // the Host field was consumed
        assert_eq!(info.headers.count_of("Host"), 0);

        let mut info = request_info("GET", "/", Some("example.org"));
        derive_target_and_rewrite(&mut info).unwrap();
        assert_eq!(info.target_port, 80);
    }

    #[test]
    fn bracketed_ipv6_host() {
        let mut info = request_info("GET", "/", Some("[2001:db8::1]:8080"));
        derive_target_and_rewrite(&mut info).unwrap();
        assert_eq!(info.target_host, "2001:db8::1");
        assert_eq!(info.target_port, 8080);
    }

    #[test]
    fn connect_authority_form() {
        let mut info = request_info("CONNECT", "example.org:443", None);
        derive_target_and_rewrite(&mut info).unwrap();
        assert_eq!(info.target_host, "example.org");
        assert_eq!(info.target_port, 443);
    }

    #[test]
    fn basic_credentials_extraction() {
        let mut info = request_info("GET", "/", Some("h"));
        info.headers
            .add_field("Proxy-Authorization", "basic dXNlcjoxMjM0NQ==");

        let Credentials::Provided { username, password } =
            extract_username_and_password(&mut info).unwrap()
        else {
            panic!("expected credentials");
        };
        assert_eq!(username, "user");
        assert_eq!(password, "12345");
        assert_eq!(info.headers.count_of("Proxy-Authorization"), 0);
    }

    #[test]
    fn non_basic_scheme_is_an_error() {
        let mut info = request_info("GET", "/", Some("h"));
        info.headers
            .add_field("Proxy-Authorization", "Bearer abcdef");
        assert!(extract_username_and_password(&mut info).is_err());
    }

    #[test]
    fn missing_credentials_are_fine() {
        let mut info = request_info("GET", "/", Some("h"));
        assert!(matches!(
            extract_username_and_password(&mut info).unwrap(),
            Credentials::None
        ));
    }
}
