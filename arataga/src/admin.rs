//! The administrative HTTP endpoint: runtime reconfiguration, user-list
//! replacement, live statistics and diagnostic probes.
//!
//! Every request must carry the `Arataga-Admin-Token` header. POST bodies
//! are plain text; an accepted POST is persisted under the local config
//! path so the next start applies it before the admin server accepts
//! requests again.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::acl::AclDispatcher;
use crate::auth::AuthRequest;
use crate::config::parse_config;
use crate::dns::IpVersion;
use crate::user_list::parse_auth_data;

/// The header carrying the admin credential.
pub const ADMIN_TOKEN_HEADER: &str = "Arataga-Admin-Token";

pub const LOCAL_CONFIG_FILE: &str = "local-config.cfg";
pub const LOCAL_USER_LIST_FILE: &str = "local-user-list.cfg";

/// Deadline for the synthetic DNS probe.
const DEBUG_DNS_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AdminState {
    pub admin_token: String,
    pub local_config_path: PathBuf,
    pub dispatcher: Arc<AclDispatcher>,
    pub log_level: utils::logging::LogLevelHandle,
}

/// Serves admin requests until shutdown.
pub async fn run_admin_server(
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "admin HTTP entry is ready");

    loop {
        let (stream, _peer) = tokio::select! {
            accepted = listener.accept() => accepted.context("accepting admin connection")?,
            _ = shutdown.cancelled() => return Ok(()),
        };

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let state = Arc::clone(&state);
                async move { Ok::<_, std::convert::Infallible>(handle(state, request).await) }
            });

            if let Err(error) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                warn!(%error, "admin connection error");
            }
        });
    }
}

async fn handle(state: Arc<AdminState>, request: Request<Incoming>) -> Response<Full<Bytes>> {
    let authorized = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == state.admin_token)
        .unwrap_or(false);
    if !authorized {
        return plain(StatusCode::FORBIDDEN, "admin token is missing or invalid\r\n");
    }

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    match (method.as_str(), path.as_str()) {
        ("POST", "/config") => on_post_config(state, request).await,
        ("POST", "/users") => on_post_users(state, request).await,
        ("GET", "/acls") => on_get_acls(state),
        ("GET", "/stats") => on_get_stats(state),
        ("GET", "/debug/auth") => on_debug_auth(state, &request),
        ("GET", "/debug/dns-resolve") => on_debug_dns_resolve(state, &request).await,
        _ => plain(StatusCode::NOT_FOUND, "unknown admin entry point\r\n"),
    }
}

fn plain(code: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .header("Content-Type", "text/plain")
        .body(Full::new(body.into()))
        .expect("static response construction can't fail")
}

fn json(code: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .expect("static response construction can't fail")
}

async fn read_text_body(request: Request<Incoming>) -> Result<String, Response<Full<Bytes>>> {
    let is_text_plain = request
        .headers()
        .get("Content-Type")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("text/plain"))
        .unwrap_or(false);
    if !is_text_plain {
        return Err(plain(
            StatusCode::BAD_REQUEST,
            "Content-Type must be text/plain\r\n",
        ));
    }

    let body = request
        .into_body()
        .collect()
        .await
        .map_err(|error| {
            plain(
                StatusCode::BAD_REQUEST,
                format!("unable to read request body: {error}\r\n"),
            )
        })?
        .to_bytes();

    String::from_utf8(body.to_vec()).map_err(|_| {
        plain(StatusCode::BAD_REQUEST, "request body is not valid UTF-8\r\n")
    })
}

/// Persists the accepted text under the local config path (truncate,
/// rewrite).
fn store_local_file(state: &AdminState, file_name: &str, content: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(&state.local_config_path)?;
    std::fs::write(state.local_config_path.join(file_name), content)?;
    Ok(())
}

async fn on_post_config(
    state: Arc<AdminState>,
    request: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let content = match read_text_body(request).await {
        Ok(content) => content,
        Err(response) => return response,
    };

    // A failure at any point here aborts the update: the previous config
    // keeps working.
    let cfg = match parse_config(&content) {
        Ok(cfg) => cfg,
        Err(error) => {
            warn!(%error, "new config rejected");
            return plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("config parsing failed: {error}\r\n"),
            );
        }
    };

    if let Err(error) = state.log_level.set(cfg.log_level) {
        error!(%error, critical = true, "unable to apply new log level");
        return plain(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unable to apply new log level\r\n",
        );
    }
    state.dispatcher.apply_config(&cfg);

    if let Err(error) = store_local_file(&state, LOCAL_CONFIG_FILE, &content) {
        error!(%error, "unable to store local config copy");
        return plain(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to store local config copy: {error}\r\n"),
        );
    }

    info!("new config applied");
    plain(StatusCode::OK, "config applied\r\n")
}

async fn on_post_users(
    state: Arc<AdminState>,
    request: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let content = match read_text_body(request).await {
        Ok(content) => content,
        Err(response) => return response,
    };

    let auth_data = match parse_auth_data(&content) {
        Ok(auth_data) => auth_data,
        Err(error) => {
            warn!(%error, "new user-list rejected");
            return plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("user-list parsing failed: {error}\r\n"),
            );
        }
    };

    state.dispatcher.apply_user_list(&auth_data);

    if let Err(error) = store_local_file(&state, LOCAL_USER_LIST_FILE, &content) {
        error!(%error, "unable to store local user-list copy");
        return plain(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to store local user-list copy: {error}\r\n"),
        );
    }

    info!("new user-list applied");
    plain(StatusCode::OK, "user-list applied\r\n")
}

fn on_get_acls(state: Arc<AdminState>) -> Response<Full<Bytes>> {
    let acls: Vec<serde_json::Value> = state
        .dispatcher
        .acl_snapshot()
        .into_iter()
        .map(|(config, context_index, _)| {
            serde_json::json!({
                "protocol": config.protocol,
                "port": config.port,
                "in_ip": config.in_ip.to_string(),
                "out_ip": config.out_ip.to_string(),
                "io_context": context_index,
            })
        })
        .collect();

    json(StatusCode::OK, &serde_json::json!({ "acls": acls }))
}

fn on_get_stats(state: Arc<AdminState>) -> Response<Full<Bytes>> {
    let acls: Vec<serde_json::Value> = state
        .dispatcher
        .acl_snapshot()
        .into_iter()
        .map(|(config, _, stats)| {
            serde_json::json!({
                "endpoint": format!("{}:{}", config.in_ip, config.port),
                "stats": serde_json::to_value(&*stats).unwrap_or_default(),
            })
        })
        .collect();

    let value = serde_json::json!({
        "acls": acls,
        "dns": serde_json::to_value(&*state.dispatcher.dns_stats).unwrap_or_default(),
        "auth": serde_json::to_value(&*state.dispatcher.auth_stats).unwrap_or_default(),
    });

    json(StatusCode::OK, &value)
}

fn query_params(request: &Request<Incoming>) -> HashMap<String, String> {
    request
        .uri()
        .query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

/// Synthetic authentication probe: runs the bare decision procedure
/// without latency shaping or connection accounting.
fn on_debug_auth(state: Arc<AdminState>, request: &Request<Incoming>) -> Response<Full<Bytes>> {
    let params = query_params(request);

    let required = |name: &str| -> Result<String, Response<Full<Bytes>>> {
        params.get(name).cloned().ok_or_else(|| {
            plain(
                StatusCode::BAD_REQUEST,
                format!("missing query parameter: {name}\r\n"),
            )
        })
    };

    let result = (|| -> Result<Response<Full<Bytes>>, Response<Full<Bytes>>> {
        let in_ip: Ipv4Addr = required("in_ip")?
            .parse()
            .map_err(|_| plain(StatusCode::BAD_REQUEST, "invalid in_ip\r\n"))?;
        let port: u16 = required("port")?
            .parse()
            .map_err(|_| plain(StatusCode::BAD_REQUEST, "invalid port\r\n"))?;
        let user_ip: Ipv4Addr = required("user_ip")?
            .parse()
            .map_err(|_| plain(StatusCode::BAD_REQUEST, "invalid user_ip\r\n"))?;
        let target_host = required("target_host")?;
        let target_port: u16 = required("target_port")?
            .parse()
            .map_err(|_| plain(StatusCode::BAD_REQUEST, "invalid target_port\r\n"))?;

        let auth_request = AuthRequest {
            user_ip,
            username: params.get("username").cloned(),
            password: params.get("password").cloned(),
            target_host,
            target_port,
        };

        let outcome = state
            .dispatcher
            .context(0)
            .auth
            .check(in_ip, port, &auth_request);

        let value = match outcome {
            Ok((user_data, domain_limits)) => serde_json::json!({
                "result": "success",
                "user_id": user_data.user_id,
                "site_limits_id": user_data.site_limits_id,
                "domain_limit": domain_limits.map(|limit| limit.domain.as_str().to_string()),
            }),
            Err(reason) => serde_json::json!({
                "result": "failure",
                "reason": reason.as_str(),
            }),
        };

        Ok(json(StatusCode::OK, &value))
    })();

    match result {
        Ok(response) | Err(response) => response,
    }
}

/// Synthetic DNS probe against the first I/O context's resolver.
async fn on_debug_dns_resolve(
    state: Arc<AdminState>,
    request: &Request<Incoming>,
) -> Response<Full<Bytes>> {
    let params = query_params(request);

    let Some(host) = params.get("host").cloned() else {
        return plain(StatusCode::BAD_REQUEST, "missing query parameter: host\r\n");
    };
    let version = match params.get("ip_version").map(String::as_str) {
        None | Some("4") => IpVersion::V4,
        Some("6") => IpVersion::V6,
        Some(other) => {
            return plain(
                StatusCode::BAD_REQUEST,
                format!("invalid ip_version: {other}\r\n"),
            )
        }
    };

    let resolver = Arc::clone(&state.dispatcher.context(0).dns);
    let outcome = tokio::time::timeout(DEBUG_DNS_TIMEOUT, resolver.resolve(&host, version)).await;

    let value = match outcome {
        Ok(Ok(address)) => serde_json::json!({
            "result": "success",
            "host": host,
            "address": address.to_string(),
        }),
        Ok(Err(failure)) => serde_json::json!({
            "result": "failure",
            "host": host,
            "error": failure.to_string(),
        }),
        Err(_) => serde_json::json!({
            "result": "failure",
            "host": host,
            "error": "resolve timed out",
        }),
    };

    json(StatusCode::OK, &value)
}
