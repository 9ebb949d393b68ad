//! The per-connection handler chain.
//!
//! A connection is driven by exactly one active handler at a time. A
//! handler owns the sockets of its stage; its `run` future either
//! *replaces* the handler with its successor (moving the sockets into it)
//! or *removes* the connection with one of the [`RemoveReason`]s. Dropping
//! a handler closes everything it owns, so an abandoned stage cannot leave
//! I/O behind — the release-and-ignore-late-callbacks discipline of a
//! callback design collapses into ownership here.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::buffers::InBuffer;

pub mod data_transfer;
pub mod detect;
pub mod http;
pub mod socks5;

/// Why a connection handler is being removed. The complete vocabulary used
/// for stats and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    NormalCompletion,
    IoError,
    CurrentOperationTimedOut,
    UnsupportedProtocol,
    ProtocolError,
    UnexpectedAndUnsupportedCase,
    NoActivityForTooLong,
    CurrentOperationCanceled,
    UnhandledException,
    IpVersionMismatch,
    AccessDenied,
    UnresolvedTarget,
    TargetEndBroken,
    UserEndBroken,
    HttpResponseBeforeCompletionOfHttpRequest,
    UserEndClosedByClient,
    HttpNoIncomingRequest,
}

impl RemoveReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoveReason::NormalCompletion => "normal_completion",
            RemoveReason::IoError => "io_error",
            RemoveReason::CurrentOperationTimedOut => "current_operation_timed_out",
            RemoveReason::UnsupportedProtocol => "unsupported_protocol",
            RemoveReason::ProtocolError => "protocol_error",
            RemoveReason::UnexpectedAndUnsupportedCase => "unexpected_and_unsupported_case",
            RemoveReason::NoActivityForTooLong => "no_activity_for_too_long",
            RemoveReason::CurrentOperationCanceled => "current_operation_canceled",
            RemoveReason::UnhandledException => "unhandled_exception",
            RemoveReason::IpVersionMismatch => "ip_version_mismatch",
            RemoveReason::AccessDenied => "access_denied",
            RemoveReason::UnresolvedTarget => "unresolved_target",
            RemoveReason::TargetEndBroken => "target_end_broken",
            RemoveReason::UserEndBroken => "user_end_broken",
            RemoveReason::HttpResponseBeforeCompletionOfHttpRequest => {
                "http_response_before_completion_of_http_request"
            }
            RemoveReason::UserEndClosedByClient => "user_end_closed_by_client",
            RemoveReason::HttpNoIncomingRequest => "http_no_incoming_request",
        }
    }
}

impl std::fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a handler needs from its ACL: configuration snapshot, the
/// per-context DNS and authentication services, stats, and the connection
/// identity for logging.
pub struct ConnCtx {
    pub acl: Arc<crate::acl::AclContext>,
    pub id: u64,
}

impl ConnCtx {
    /// The globally unique log id: ingress port + per-ACL counter.
    pub fn long_id(&self) -> String {
        format!("{}_{}", self.acl.config.port, self.id)
    }
}

/// What a finished handler stage tells the connection driver.
pub enum Outcome {
    /// Replace the current handler with its successor.
    Replace(Handler),
    /// Drop the connection for the given reason.
    Remove(RemoveReason),
}

/// The current stage of one connection.
pub enum Handler {
    ProtocolDetection(detect::ProtocolDetectionHandler),
    Socks5MethodSelection(socks5::MethodSelectionHandler),
    Socks5UsernamePasswordAuth(socks5::UsernamePasswordAuthHandler),
    Socks5NoAuthentification(socks5::NoAuthentificationHandler),
    Socks5Command(socks5::CommandHandler),
    Socks5Connect(socks5::ConnectCommandHandler),
    Socks5Bind(socks5::BindCommandHandler),
    HttpInitial(http::initial::InitialHttpHandler),
    HttpAuthentification(http::auth_stage::AuthentificationHandler),
    HttpTargetConnect(http::connect_stage::TargetConnectorHandler),
    HttpOrdinaryMethod(http::rewriter::OrdinaryMethodHandler),
    DataTransfer(data_transfer::DataTransferHandler),
}

impl Handler {
    pub fn name(&self) -> &'static str {
        match self {
            Handler::ProtocolDetection(_) => "protocol-detection-handler",
            Handler::Socks5MethodSelection(_) => "socks5-auth-method-detector",
            Handler::Socks5UsernamePasswordAuth(_) => "socks5-username-password-auth-handler",
            Handler::Socks5NoAuthentification(_) => "socks5-no-authentification-handler",
            Handler::Socks5Command(_) => "socks5-command-handler",
            Handler::Socks5Connect(_) => "socks5-connect-command-handler",
            Handler::Socks5Bind(_) => "socks5-bind-command-handler",
            Handler::HttpInitial(_) => "http-initial-handler",
            Handler::HttpAuthentification(_) => "http-authentification-handler",
            Handler::HttpTargetConnect(_) => "http-target-connect-handler",
            Handler::HttpOrdinaryMethod(_) => "http-ordinary-method-handler",
            Handler::DataTransfer(_) => "data-transfer-handler",
        }
    }

    async fn run(self, ctx: &ConnCtx) -> Outcome {
        match self {
            Handler::ProtocolDetection(h) => h.run(ctx).await,
            Handler::Socks5MethodSelection(h) => h.run(ctx).await,
            Handler::Socks5UsernamePasswordAuth(h) => h.run(ctx).await,
            Handler::Socks5NoAuthentification(h) => h.run(ctx).await,
            Handler::Socks5Command(h) => h.run(ctx).await,
            Handler::Socks5Connect(h) => h.run(ctx).await,
            Handler::Socks5Bind(h) => h.run(ctx).await,
            Handler::HttpInitial(h) => h.run(ctx).await,
            Handler::HttpAuthentification(h) => h.run(ctx).await,
            Handler::HttpTargetConnect(h) => h.run(ctx).await,
            Handler::HttpOrdinaryMethod(h) => h.run(ctx).await,
            Handler::DataTransfer(h) => h.run(ctx).await,
        }
    }
}

/// Drives one connection through its handler chain until removal.
pub async fn drive(mut handler: Handler, ctx: ConnCtx) -> RemoveReason {
    loop {
        let name = handler.name();
        match handler.run(&ctx).await {
            Outcome::Replace(next) => {
                trace!(
                    connection = %ctx.long_id(),
                    old = name,
                    new = next.name(),
                    "handler changed"
                );
                handler = next;
            }
            Outcome::Remove(reason) => return reason,
        }
    }
}

/// Reads one chunk from the socket into the buffer's free tail.
///
/// `Ok(0)` means EOF (the buffer is assumed to have free space).
pub(crate) async fn read_some(
    connection: &mut TcpStream,
    buffer: &mut InBuffer,
) -> std::io::Result<usize> {
    let n = connection.read(buffer.free_space_mut()).await?;
    buffer.increment_bytes_read(n);
    Ok(n)
}

/// Writes the whole unsent part of the buffer.
pub(crate) async fn write_whole(
    connection: &mut TcpStream,
    buffer: &mut crate::buffers::OutBuffer,
) -> std::io::Result<()> {
    let len = buffer.remaining();
    connection.write_all(buffer.unsent()).await?;
    buffer.increment_bytes_written(len);
    Ok(())
}
