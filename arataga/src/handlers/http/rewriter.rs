//! The request/response rewriter for ordinary (non-CONNECT) HTTP methods.
//!
//! Two independent incremental parsers run concurrently: one continues the
//! client's request (its head was consumed by the initial stage), one
//! parses the target's response. Bodies are forwarded with their original
//! framing; chunk headers are re-emitted from scratch, which drops chunk
//! extensions, and trailers are not forwarded. Every write reserves
//! capacity from the traffic limiter first.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::bandlim::{Direction, TrafficLimiter};
use crate::buffers::{OutCursor, OutPiece};
use crate::config::CommonAclParams;
use crate::handlers::data_transfer::idle_watchdog;
use crate::handlers::{ConnCtx, Handler, Outcome, RemoveReason};

use super::parser::{
    self, BodyDecoder, BodyEvent, BodyKind, HeadParse, ParsedResponseHead,
};
use super::{
    handle_connection_headers, initial, responses, HeaderList, RequestInfo, HOP_BY_HOP_HEADERS,
};

pub struct OrdinaryMethodHandler {
    connection: TcpStream,
    input: BytesMut,
    request_info: RequestInfo,
    traffic_limiter: TrafficLimiter,
    out_connection: TcpStream,
}

impl OrdinaryMethodHandler {
    pub fn new(
        connection: TcpStream,
        input: BytesMut,
        request_info: RequestInfo,
        traffic_limiter: TrafficLimiter,
        out_connection: TcpStream,
    ) -> Self {
        Self { connection, input, request_info, traffic_limiter, out_connection }
    }

    pub(crate) async fn run(self, ctx: &ConnCtx) -> Outcome {
        let params = ctx.acl.params.load_full();

        let host_field_value = host_field_value(
            &self.request_info.target_host,
            self.request_info.target_port,
        );

        info!(
            connection = %ctx.long_id(),
            outgoing_request = %self.request_info.method,
            host = %host_field_value,
            request_target = %self.request_info.request_target,
            "outgoing request"
        );

        let keep_user_end_alive = self.request_info.keep_user_end_alive;
        let request_head = serialize_request_head(&self.request_info, &host_field_value);
        let request_method = self.request_info.method.clone();

        let limiter = Arc::new(self.traffic_limiter);
        let last_read_at = Arc::new(Mutex::new(Instant::now()));

        let (client_read, client_write) = self.connection.into_split();
        let (target_read, target_write) = self.out_connection.into_split();

        let client_pump = request_pump(
            ctx,
            Arc::clone(&params),
            client_read,
            target_write,
            self.input,
            request_head,
            self.request_info.body,
            Arc::clone(&limiter),
            Arc::clone(&last_read_at),
        );
        let response_pump = response_pump(
            ctx,
            Arc::clone(&params),
            target_read,
            client_write,
            request_method,
            Arc::clone(&limiter),
            Arc::clone(&last_read_at),
        );
        let watchdog = idle_watchdog(last_read_at.clone(), params.idle_connection_timeout);

        tokio::pin!(client_pump);
        tokio::pin!(response_pump);
        tokio::pin!(watchdog);

        // The request side parks once the request is through (keeping the
        // socket halves for the keep-alive path); the response side
        // finishing is what ends the exchange.
        let mut request_done: Option<RequestPumpEnd> = None;

        loop {
            tokio::select! {
                finished = &mut client_pump, if request_done.is_none() => match finished {
                    Ok(end) => request_done = Some(end),
                    Err(reason) => return Outcome::Remove(reason),
                },
                finished = &mut response_pump => {
                    let client_write = match finished {
                        Ok(client_write) => client_write,
                        Err(reason) => return Outcome::Remove(reason),
                    };

                    let Some(end) = request_done else {
                        // The whole response arrived before the request was
                        // fully received: a protocol anomaly. The response
                        // has been written out already.
                        warn!(
                            connection = %ctx.long_id(),
                            "HTTP response completed before the HTTP request"
                        );
                        return Outcome::Remove(
                            RemoveReason::HttpResponseBeforeCompletionOfHttpRequest,
                        );
                    };

                    if !keep_user_end_alive {
                        return Outcome::Remove(RemoveReason::NormalCompletion);
                    }

                    // Keep-alive: hand the client socket (with any
                    // pipelined bytes) to a fresh initial handler.
                    return match end.client_read.reunite(client_write) {
                        Ok(connection) => Outcome::Replace(Handler::HttpInitial(
                            initial::InitialHttpHandler::new(ctx, connection, &end.leftover),
                        )),
                        Err(_) => Outcome::Remove(RemoveReason::UnexpectedAndUnsupportedCase),
                    };
                },
                () = &mut watchdog => {
                    warn!(connection = %ctx.long_id(), "no data read for long time");
                    return Outcome::Remove(RemoveReason::NoActivityForTooLong);
                }
            }
        }
    }
}

/// For the `Host` field the port is omitted when it is the default 80;
/// IPv6 literals are re-bracketed.
fn host_field_value(target_host: &str, target_port: u16) -> String {
    let host = if target_host.contains(':') {
        format!("[{target_host}]")
    } else {
        target_host.to_string()
    };
    if target_port == 80 {
        host
    } else {
        format!("{host}:{target_port}")
    }
}

/// Start-line, `Host`, then every surviving header in original order.
/// Outbound requests are always HTTP/1.1.
fn serialize_request_head(request_info: &RequestInfo, host_field_value: &str) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = write!(
        out,
        "{} {} HTTP/1.1\r\n",
        request_info.method, request_info.request_target
    );
    let _ = write!(out, "Host: {host_field_value}\r\n");
    for (name, value) in request_info.headers.iter() {
        let _ = write!(out, "{name}: {value}\r\n");
    }
    out.push_str("\r\n");
    out
}

/// `HTTP/1.1 <code> <reason>`, rewritten headers, blank line.
fn serialize_response_head(head: &ParsedResponseHead, headers: &HeaderList) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = write!(out, "HTTP/1.1 {} {}\r\n", head.code, head.reason);
    for (name, value) in headers.iter() {
        let _ = write!(out, "{name}: {value}\r\n");
    }
    out.push_str("\r\n");
    out
}

/// Converts decoder events into outgoing pieces, re-emitting the chunk
/// framing. Returns true once the message is complete.
fn push_body_pieces(
    events: &mut Vec<BodyEvent>,
    chunked: bool,
    queue: &mut VecDeque<OutCursor>,
) -> bool {
    let mut complete = false;
    for event in events.drain(..) {
        match event {
            BodyEvent::ChunkBegin(size) => {
                queue.push_back(OutCursor::new(OutPiece::Owned(format!("{size:x}\r\n"))));
            }
            BodyEvent::Data(data) => queue.push_back(OutCursor::new(OutPiece::Shared(data))),
            BodyEvent::ChunkEnd => queue.push_back(OutCursor::new(OutPiece::Static("\r\n"))),
            BodyEvent::Complete => {
                if chunked {
                    queue.push_back(OutCursor::new(OutPiece::Static("0\r\n\r\n")));
                }
                complete = true;
            }
        }
    }
    complete
}

/// Writes the head of the queue, shrunk to the limiter's reservation.
/// Returns the written byte count.
async fn write_gated(
    queue: &mut VecDeque<OutCursor>,
    writer: &mut OwnedWriteHalf,
    limiter: &TrafficLimiter,
    direction: Direction,
) -> std::io::Result<usize> {
    let Some(front) = queue.front_mut() else {
        return Ok(0);
    };

    let reservation = limiter.reserve(direction, front.remaining()).await;
    let result = writer.write(&front.unsent()[..reservation.capacity]).await;
    limiter.release_reserved_capacity(direction, reservation, *result.as_ref().unwrap_or(&0));

    let n = result?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "socket accepted no bytes",
        ));
    }
    front.advance(n);
    if front.remaining() == 0 {
        queue.pop_front();
    }
    Ok(n)
}

/// What the request pump hands back for the keep-alive path.
struct RequestPumpEnd {
    client_read: OwnedReadHalf,
    /// Unparsed bytes of a pipelined next request.
    leftover: BytesMut,
    /// Kept alive so the target does not see a premature FIN.
    _target_write: OwnedWriteHalf,
}

/// Streams the (already serialized) request head and the client's body to
/// the target, then parks.
#[allow(clippy::too_many_arguments)]
async fn request_pump(
    ctx: &ConnCtx,
    params: Arc<CommonAclParams>,
    mut client_read: OwnedReadHalf,
    mut target_write: OwnedWriteHalf,
    mut input: BytesMut,
    request_head: String,
    body: BodyKind,
    limiter: Arc<TrafficLimiter>,
    last_read_at: Arc<Mutex<Instant>>,
) -> Result<RequestPumpEnd, RemoveReason> {
    let chunked = body == BodyKind::Chunked;
    let mut decoder = BodyDecoder::new(body);
    let mut events = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(OutCursor::new(OutPiece::Owned(request_head)));

    // Body bytes may have arrived together with the head.
    if let Err(error) = decoder.decode(&mut input, &mut events) {
        warn!(connection = %ctx.long_id(), %error, "bad request body from client");
        return Err(RemoveReason::ProtocolError);
    }
    let mut complete = push_body_pieces(&mut events, chunked, &mut queue);

    loop {
        while !queue.is_empty() {
            if let Err(error) =
                write_gated(&mut queue, &mut target_write, &limiter, Direction::FromUser).await
            {
                warn!(connection = %ctx.long_id(), %error, "error writing to target_end");
                return Err(RemoveReason::IoError);
            }
        }

        if complete {
            // Reading stops here: anything else in `input` belongs to the
            // next keep-alive request.
            return Ok(RequestPumpEnd {
                client_read,
                leftover: input,
                _target_write: target_write,
            });
        }

        input.reserve(params.io_chunk_size);
        match client_read.read_buf(&mut input).await {
            Ok(0) => {
                warn!(
                    connection = %ctx.long_id(),
                    "user_end closed in the middle of an incoming request"
                );
                return Err(RemoveReason::UserEndBroken);
            }
            Ok(_) => {
                *last_read_at.lock() = Instant::now();
            }
            Err(error) => {
                warn!(connection = %ctx.long_id(), %error, "error reading data from user_end");
                return Err(RemoveReason::IoError);
            }
        }

        if let Err(error) = decoder.decode(&mut input, &mut events) {
            warn!(connection = %ctx.long_id(), %error, "bad request body from client");
            return Err(RemoveReason::ProtocolError);
        }
        complete = push_body_pieces(&mut events, chunked, &mut queue) || complete;
    }
}

/// Parses the target's response, rewrites its head and relays it to the
/// client. Returns the client write half on completion.
async fn response_pump(
    ctx: &ConnCtx,
    params: Arc<CommonAclParams>,
    mut target_read: OwnedReadHalf,
    mut client_write: OwnedWriteHalf,
    request_method: String,
    limiter: Arc<TrafficLimiter>,
    last_read_at: Arc<Mutex<Instant>>,
) -> Result<OwnedWriteHalf, RemoveReason> {
    let limits = params.http_message_limits;
    let mut input = BytesMut::new();
    let mut bytes_sent_to_client: u64 = 0;

    // Nothing has been sent to the client yet, so a broken response can
    // still be converted into a clean 502.
    macro_rules! fail {
        ($reason:expr) => {{
            if bytes_sent_to_client == 0 {
                let _ = timeout(
                    params.http_negative_response_timeout,
                    client_write.write_all(responses::BAD_GATEWAY_INVALID_RESPONSE.as_bytes()),
                )
                .await;
            }
            return Err($reason);
        }};
    }

    let head = loop {
        match parser::parse_response_head(&input, &limits) {
            Ok(HeadParse::Complete { head, consumed }) => {
                let _ = input.split_to(consumed);
                break head;
            }
            Ok(HeadParse::NeedMore) => {}
            Err(error) => {
                warn!(connection = %ctx.long_id(), %error, "bad response from target");
                fail!(RemoveReason::ProtocolError);
            }
        }

        input.reserve(params.io_chunk_size);
        match target_read.read_buf(&mut input).await {
            Ok(0) => {
                warn!(
                    connection = %ctx.long_id(),
                    "target_end closed before the response head completed"
                );
                fail!(RemoveReason::TargetEndBroken);
            }
            Ok(_) => {
                *last_read_at.lock() = Instant::now();
            }
            Err(error) => {
                warn!(connection = %ctx.long_id(), %error, "error reading data from target_end");
                fail!(RemoveReason::IoError);
            }
        }
    };

    info!(
        connection = %ctx.long_id(),
        incoming_reply = head.code,
        reason = %head.reason,
        "incoming reply"
    );

    let body_kind = match parser::response_body_kind(&request_method, head.code, &head.headers) {
        Ok(kind) => kind,
        Err(reason) => {
            warn!(connection = %ctx.long_id(), %reason, "bad response framing from target");
            fail!(RemoveReason::ProtocolError);
        }
    };

    // The rewrite of the response head: `close` here only affects the
    // header set, never the client keep-alive decision.
    let mut headers = head.headers.clone();
    let _ = handle_connection_headers(&mut headers, "Connection");
    for name in HOP_BY_HOP_HEADERS {
        headers.remove_all_of(name);
    }

    let chunked = body_kind == BodyKind::Chunked;
    let mut decoder = BodyDecoder::new(body_kind);
    let mut events = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(OutCursor::new(OutPiece::Owned(serialize_response_head(
        &head, &headers,
    ))));

    if let Err(error) = decoder.decode(&mut input, &mut events) {
        warn!(connection = %ctx.long_id(), %error, "bad response body from target");
        fail!(RemoveReason::ProtocolError);
    }
    let mut complete = push_body_pieces(&mut events, chunked, &mut queue);

    loop {
        while !queue.is_empty() {
            match write_gated(&mut queue, &mut client_write, &limiter, Direction::FromTarget)
                .await
            {
                Ok(n) => bytes_sent_to_client += n as u64,
                Err(error) => {
                    warn!(connection = %ctx.long_id(), %error, "error writing to user_end");
                    return Err(RemoveReason::IoError);
                }
            }
        }

        if complete {
            return Ok(client_write);
        }

        input.reserve(params.io_chunk_size);
        match target_read.read_buf(&mut input).await {
            Ok(0) => {
                if let Err(error) = decoder.on_eof(&mut events) {
                    warn!(connection = %ctx.long_id(), %error, "target_end closed mid-response");
                    fail!(RemoveReason::TargetEndBroken);
                }
            }
            Ok(_) => {
                *last_read_at.lock() = Instant::now();
                if let Err(error) = decoder.decode(&mut input, &mut events) {
                    warn!(connection = %ctx.long_id(), %error, "bad response body from target");
                    fail!(RemoveReason::ProtocolError);
                }
            }
            Err(error) => {
                warn!(connection = %ctx.long_id(), %error, "error reading data from target_end");
                fail!(RemoveReason::IoError);
            }
        }

        complete = push_body_pieces(&mut events, chunked, &mut queue) || complete;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::http::parser::BodyKind;

    #[test]
    fn request_head_serialization() {
        let mut headers = HeaderList::default();
        headers.add_field("Accept", "*/*");
        headers.add_field("Content-Length", "0");

        let info = RequestInfo {
            method: "GET".to_string(),
            request_target: "/".to_string(),
            headers,
            target_host: "127.0.0.1".to_string(),
            target_port: 9090,
            keep_user_end_alive: true,
            body: BodyKind::None,
        };

        let head = serialize_request_head(&info, &host_field_value("127.0.0.1", 9090));
        assert_eq!(
            head,
            "GET / HTTP/1.1\r\nHost: 127.0.0.1:9090\r\nAccept: */*\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn default_port_is_omitted_from_host() {
        assert_eq!(host_field_value("example.org", 80), "example.org");
        assert_eq!(host_field_value("example.org", 8080), "example.org:8080");
        assert_eq!(host_field_value("2001:db8::1", 443), "[2001:db8::1]:443");
    }

    #[test]
    fn chunk_framing_is_re_emitted() {
        let mut events = vec![
            BodyEvent::ChunkBegin(0xE),
            BodyEvent::Data(bytes::Bytes::from_static(b" in\r\n\r\nchunks.")),
            BodyEvent::ChunkEnd,
            BodyEvent::Complete,
        ];
        let mut queue = VecDeque::new();
        let complete = push_body_pieces(&mut events, true, &mut queue);
        assert!(complete);

        let emitted: Vec<u8> = queue
            .iter()
            .flat_map(|cursor| cursor.unsent().to_vec())
            .collect();
        assert_eq!(emitted, b"e\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n");
    }
}
