//! The first stage of the HTTP pipeline: read and parse the request head,
//! rewrite the connection-control headers, pick the next stage.

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use crate::handlers::{ConnCtx, Handler, Outcome, RemoveReason};

use super::parser::{self, HeadParse, ParsedRequestHead};
use super::{
    auth_stage, handle_connection_headers, responses, send_negative_response_then_close,
    RequestInfo, HOP_BY_HOP_HEADERS,
};

pub struct InitialHttpHandler {
    connection: TcpStream,
    input: BytesMut,
}

impl InitialHttpHandler {
    pub fn new(_ctx: &ConnCtx, connection: TcpStream, prefix: &[u8]) -> Self {
        Self { connection, input: BytesMut::from(prefix) }
    }

    pub(crate) async fn run(mut self, ctx: &ConnCtx) -> Outcome {
        let params = ctx.acl.params.load_full();
        let limits = params.http_message_limits;
        let deadline = Instant::now() + params.http_headers_complete_timeout;

        let head = loop {
            match parser::parse_request_head(&self.input, &limits) {
                Ok(HeadParse::Complete { head, consumed }) => {
                    let _ = self.input.split_to(consumed);
                    break head;
                }
                Ok(HeadParse::NeedMore) => {}
                Err(error) => {
                    warn!(connection = %ctx.long_id(), %error, "bad incoming HTTP request");
                    return Outcome::Remove(
                        send_negative_response_then_close(
                            ctx,
                            &mut self.connection,
                            responses::BAD_REQUEST_PARSE_ERROR,
                            RemoveReason::ProtocolError,
                        )
                        .await,
                    );
                }
            }

            self.input.reserve(params.io_chunk_size);
            match timeout_at(deadline, self.connection.read_buf(&mut self.input)).await {
                Ok(Ok(0)) => {
                    // An idle keep-alive close is normal; a mid-request
                    // close is worth a record.
                    if self.input.is_empty() {
                        return Outcome::Remove(RemoveReason::UserEndClosedByClient);
                    }
                    warn!(
                        connection = %ctx.long_id(),
                        bytes_received = self.input.len(),
                        "user_end closed by client in the middle of an incoming request"
                    );
                    return Outcome::Remove(RemoveReason::UserEndClosedByClient);
                }
                Ok(Ok(_)) => {}
                Ok(Err(error)) => {
                    warn!(
                        connection = %ctx.long_id(),
                        %error,
                        "IO-error on reading incoming HTTP-request"
                    );
                    return Outcome::Remove(RemoveReason::IoError);
                }
                Err(_) => {
                    return self.handle_headers_complete_timeout(ctx).await;
                }
            }
        };

        self.handle_parsed_head(ctx, head).await
    }

    /// Nothing received at all means the client simply never sent a
    /// request; a started request that stalls earns a 408.
    async fn handle_headers_complete_timeout(mut self, ctx: &ConnCtx) -> Outcome {
        if self.input.is_empty() {
            info!(connection = %ctx.long_id(), "no incoming HTTP request for a long time");
            return Outcome::Remove(RemoveReason::HttpNoIncomingRequest);
        }

        warn!(connection = %ctx.long_id(), "http_headers_complete timed out");
        Outcome::Remove(
            send_negative_response_then_close(
                ctx,
                &mut self.connection,
                responses::REQUEST_TIMEOUT_HEADERS_COMPLETE_TIMEOUT,
                RemoveReason::CurrentOperationTimedOut,
            )
            .await,
        )
    }

    async fn handle_parsed_head(mut self, ctx: &ConnCtx, head: ParsedRequestHead) -> Outcome {
        let ParsedRequestHead { method, request_target, minor_version: _, headers } = head;

        info!(
            connection = %ctx.long_id(),
            incoming_request = %method,
            request_target = %truncated(&request_target, 100),
            "incoming request"
        );

        let mut headers = headers;

        if headers.count_of("Host") > 1 {
            warn!(connection = %ctx.long_id(), "duplicated Host http-field");
            return Outcome::Remove(
                send_negative_response_then_close(
                    ctx,
                    &mut self.connection,
                    responses::BAD_REQUEST_PARSE_ERROR,
                    RemoveReason::ProtocolError,
                )
                .await,
            );
        }

        let body = match parser::request_body_kind(&method, &headers) {
            Ok(body) => body,
            Err(reason) => {
                warn!(connection = %ctx.long_id(), %reason, "bad incoming HTTP request");
                return Outcome::Remove(
                    send_negative_response_then_close(
                        ctx,
                        &mut self.connection,
                        responses::BAD_REQUEST_PARSE_ERROR,
                        RemoveReason::ProtocolError,
                    )
                    .await,
                );
            }
        };

        // Union-aggregate both connection-control fields; either one may
        // carry `close`.
        let keep_from_connection = handle_connection_headers(&mut headers, "Connection");
        let keep_from_proxy_connection =
            handle_connection_headers(&mut headers, "Proxy-Connection");
        let keep_user_end_alive = keep_from_connection && keep_from_proxy_connection;

        for name in HOP_BY_HOP_HEADERS {
            headers.remove_all_of(name);
        }

        // A CONNECT request must be the last thing in the buffer: the
        // tunnel bytes only start after our 200 reply.
        if method == "CONNECT" && !self.input.is_empty() {
            warn!(
                connection = %ctx.long_id(),
                leftover = self.input.len(),
                "incoming buffer is not empty after parsing a CONNECT request"
            );
            return Outcome::Remove(
                send_negative_response_then_close(
                    ctx,
                    &mut self.connection,
                    responses::BAD_REQUEST_PARSE_ERROR,
                    RemoveReason::ProtocolError,
                )
                .await,
            );
        }

        let request_info = RequestInfo {
            method,
            request_target,
            headers,
            target_host: String::new(),
            target_port: 0,
            keep_user_end_alive,
            body,
        };

        Outcome::Replace(Handler::HttpAuthentification(auth_stage::AuthentificationHandler::new(
            self.connection,
            self.input,
            request_info,
        )))
    }
}

fn truncated(value: &str, max: usize) -> &str {
    let mut end = max.min(value.len());
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
