//! HTTP/1.1 proxy pipeline: initial request parsing, authentication,
//! outbound connect and the request/response rewriter.

pub mod auth_stage;
pub mod connect_stage;
pub mod initial;
pub mod parser;
pub mod rewriter;

pub mod responses {
    //! Canned negative responses. Each is a complete HTTP message; the
    //! connection is closed right after it is written.

    pub const BAD_REQUEST_PARSE_ERROR: &str = "HTTP/1.1 400 Bad Request\r\n\
        Proxy-Connection: close\r\n\
        Content-Length: 0\r\n\r\n";

    pub const BAD_REQUEST_AUTH_PARAMS_EXTRACTION_FAILURE: &str = "HTTP/1.1 400 Bad Request\r\n\
        Proxy-Connection: close\r\n\
        Content-Length: 0\r\n\r\n";

    pub const BAD_REQUEST_TARGET_HOST_EXTRACTION_FAILURE: &str = "HTTP/1.1 400 Bad Request\r\n\
        Proxy-Connection: close\r\n\
        Content-Length: 0\r\n\r\n";

    pub const REQUEST_TIMEOUT_HEADERS_COMPLETE_TIMEOUT: &str = "HTTP/1.1 408 Request Timeout\r\n\
        Proxy-Connection: close\r\n\
        Content-Length: 0\r\n\r\n";

    pub const PROXY_AUTH_REQUIRED_NOT_AUTHORIZED: &str =
        "HTTP/1.1 407 Proxy Authentication Required\r\n\
        Proxy-Authenticate: Basic realm=\"arataga\"\r\n\
        Proxy-Connection: close\r\n\
        Content-Length: 0\r\n\r\n";

    pub const PROXY_AUTH_REQUIRED_AUTH_TIMEOUT: &str =
        "HTTP/1.1 407 Proxy Authentication Required\r\n\
        Proxy-Authenticate: Basic realm=\"arataga\"\r\n\
        Proxy-Connection: close\r\n\
        Content-Length: 0\r\n\r\n";

    pub const BAD_GATEWAY_DNS_FAILURE: &str = "HTTP/1.1 502 Bad Gateway\r\n\
        Proxy-Connection: close\r\n\
        Content-Length: 0\r\n\r\n";

    pub const BAD_GATEWAY_CONNECT_FAILURE: &str = "HTTP/1.1 502 Bad Gateway\r\n\
        Proxy-Connection: close\r\n\
        Content-Length: 0\r\n\r\n";

    pub const BAD_GATEWAY_CONNECT_TIMEOUT: &str = "HTTP/1.1 502 Bad Gateway\r\n\
        Proxy-Connection: close\r\n\
        Content-Length: 0\r\n\r\n";

    pub const BAD_GATEWAY_INVALID_RESPONSE: &str = "HTTP/1.1 502 Bad Gateway\r\n\
        Proxy-Connection: close\r\n\
        Content-Length: 0\r\n\r\n";

    pub const INTERNAL_SERVER_ERROR: &str = "HTTP/1.1 500 Internal Server Error\r\n\
        Proxy-Connection: close\r\n\
        Content-Length: 0\r\n\r\n";

    /// The positive CONNECT reply.
    pub const CONNECT_ESTABLISHED: &str = "HTTP/1.1 200 Ok\r\n\r\n";
}

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

use super::{ConnCtx, RemoveReason};

/// Writes a canned negative response, bounded by
/// `http_negative_response_timeout`, then reports the removal reason.
pub(super) async fn send_negative_response_then_close(
    ctx: &ConnCtx,
    connection: &mut TcpStream,
    response: &'static str,
    reason: RemoveReason,
) -> RemoveReason {
    let limit = ctx.acl.params.load_full().http_negative_response_timeout;
    match timeout(limit, connection.write_all(response.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            warn!(connection = %ctx.long_id(), %error, "IO-error on writing negative response");
        }
        Err(_) => {
            warn!(connection = %ctx.long_id(), "writing negative response timed out");
        }
    }
    reason
}

/// An ordered, case-insensitive multi-map of HTTP header fields.
///
/// The relative order of surviving fields is preserved through rewriting.
#[derive(Debug, Default, Clone)]
pub struct HeaderList {
    fields: Vec<(String, String)>,
}

impl HeaderList {
    pub fn add_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn count_of(&self, name: &str) -> usize {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .count()
    }

    /// The value of the first field with this name.
    pub fn opt_value_of(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn values_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_all_of(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// What the initial parsing learned about the client's request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub request_target: String,
    pub headers: HeaderList,
    pub target_host: String,
    pub target_port: u16,
    /// Whether the client connection survives the request.
    pub keep_user_end_alive: bool,
    /// How the request body is framed.
    pub body: parser::BodyKind,
}

/// Methods whose request message ends at `headers_complete`.
pub fn is_bodyless_method(method: &str) -> bool {
    matches!(method, "HEAD" | "GET" | "DELETE" | "OPTIONS" | "TRACE" | "CONNECT")
}

/// Hop-by-hop fields stripped unconditionally from both directions.
///
/// `Transfer-Encoding` stays (bodies are forwarded with the framing the
/// client sent) and `Proxy-Authorization` stays for the authentication
/// stage which removes it itself. The misspelled `Proxy-Authentificate` is
/// the historical wire name.
pub const HOP_BY_HOP_HEADERS: &[&str] = &["Keep-Alive", "TE", "Trailer", "Proxy-Authentificate"];

/// Applies the `Connection`/`Proxy-Connection` rewriting to `headers`.
///
/// Every token listed in those fields is union-aggregated; `close` flips
/// the keep-alive flag, any other token names a field to drop (except
/// `transfer-encoding`). The `Connection`-family fields themselves are
/// removed afterwards.
pub fn handle_connection_headers(headers: &mut HeaderList, field_name: &str) -> bool {
    let mut keep_alive = true;

    let aggregated: Vec<String> = headers
        .values_of(field_name)
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for token in &aggregated {
        if token == "close" {
            keep_alive = false;
        } else if token != "transfer-encoding" {
            headers.remove_all_of(token);
        }
    }

    headers.remove_all_of(field_name);

    keep_alive
}
