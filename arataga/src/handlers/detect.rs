//! Protocol detection: the very first handler of an accepted connection.

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::buffers::InBuffer;
use crate::config::AclProtocol;

use super::{http, read_some, socks5, ConnCtx, Handler, Outcome, RemoveReason};

/// SOCKS5 PDUs start with the protocol version byte.
const SOCKS5_VERSION: u8 = 0x05;

/// How many of the first bytes are enough for the decision.
const DETECTION_BUFFER_SIZE: usize = 16;

pub struct ProtocolDetectionHandler {
    connection: TcpStream,
}

impl ProtocolDetectionHandler {
    pub fn new(connection: TcpStream) -> Self {
        Self { connection }
    }

    pub(super) async fn run(mut self, ctx: &ConnCtx) -> Outcome {
        let params = ctx.acl.params.load_full();

        match ctx.acl.config.protocol {
            AclProtocol::Socks => {
                ctx.acl.stats.socks5_connections.inc();
                return Outcome::Replace(Handler::Socks5MethodSelection(
                    socks5::MethodSelectionHandler::new(self.connection, &[]),
                ));
            }
            AclProtocol::Http => {
                ctx.acl.stats.http_connections.inc();
                return Outcome::Replace(Handler::HttpInitial(http::initial::InitialHttpHandler::new(
                    ctx,
                    self.connection,
                    &[],
                )));
            }
            AclProtocol::Auto => {}
        }

        let mut first_bytes = InBuffer::new(DETECTION_BUFFER_SIZE);

        let n = match timeout(
            params.protocol_detection_timeout,
            read_some(&mut self.connection, &mut first_bytes),
        )
        .await
        {
            Ok(Ok(n)) => n,
            Ok(Err(error)) => {
                warn!(connection = %ctx.long_id(), %error, "IO-error on protocol detection");
                return Outcome::Remove(RemoveReason::IoError);
            }
            Err(_) => {
                warn!(connection = %ctx.long_id(), "protocol detection timed out");
                return Outcome::Remove(RemoveReason::CurrentOperationTimedOut);
            }
        };

        if n == 0 {
            // The client connected and went away without sending a byte.
            return Outcome::Remove(RemoveReason::HttpNoIncomingRequest);
        }

        let prefix = first_bytes.whole_data();
        if prefix[0] == SOCKS5_VERSION {
            debug!(connection = %ctx.long_id(), "protocol detected: socks5");
            ctx.acl.stats.socks5_connections.inc();
            Outcome::Replace(Handler::Socks5MethodSelection(
                socks5::MethodSelectionHandler::new(self.connection, prefix),
            ))
        } else {
            debug!(connection = %ctx.long_id(), "protocol detected: http");
            ctx.acl.stats.http_connections.inc();
            Outcome::Replace(Handler::HttpInitial(http::initial::InitialHttpHandler::new(
                ctx,
                self.connection,
                prefix,
            )))
        }
    }
}
