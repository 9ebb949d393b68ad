//! Incremental HTTP/1.1 parsing: message heads via `httparse` (restartable
//! on partial input) and an explicit body decoder that preserves the chunk
//! structure of the stream.
//!
//! Both sides only consume what they are fed, so pausing at any message
//! boundary is free: bytes of a pipelined next message stay in the input
//! buffer untouched.

use bytes::{Bytes, BytesMut};

use crate::config::HttpMessageLimits;

use super::HeaderList;

/// Guards the parser against heads that never complete.
const MAX_HEADERS: usize = 96;
const CHUNK_SIZE_LINE_LIMIT: usize = 1024;
const TRAILER_LINE_LIMIT: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    #[error("malformed message head: {0}")]
    Parse(httparse::Error),

    #[error("{entity} exceeds limit: size={size}, limit={limit}")]
    LimitExceeded {
        entity: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("message head does not fit into the allowed size")]
    HeadTooLarge,
}

/// Parsing either returned a complete head consuming `consumed` bytes, or
/// needs more input.
pub enum HeadParse<T> {
    NeedMore,
    Complete { head: T, consumed: usize },
}

#[derive(Debug)]
pub struct ParsedRequestHead {
    pub method: String,
    pub request_target: String,
    /// 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub minor_version: u8,
    pub headers: HeaderList,
}

#[derive(Debug)]
pub struct ParsedResponseHead {
    pub code: u16,
    pub reason: String,
    pub headers: HeaderList,
}

fn check_field_limits(
    headers: &[httparse::Header<'_>],
    limits: &HttpMessageLimits,
) -> Result<(), HeadError> {
    let mut total = 0usize;
    for header in headers {
        if header.name.len() > limits.max_field_name_length {
            return Err(HeadError::LimitExceeded {
                entity: "http-field name",
                size: header.name.len(),
                limit: limits.max_field_name_length,
            });
        }
        if header.value.len() > limits.max_field_value_length {
            return Err(HeadError::LimitExceeded {
                entity: "http-field value",
                size: header.value.len(),
                limit: limits.max_field_value_length,
            });
        }
        total += header.name.len() + header.value.len();
    }
    if total > limits.max_total_headers_size {
        return Err(HeadError::LimitExceeded {
            entity: "total http-fields size",
            size: total,
            limit: limits.max_total_headers_size,
        });
    }
    Ok(())
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> HeaderList {
    let mut list = HeaderList::default();
    for header in headers {
        list.add_field(header.name, String::from_utf8_lossy(header.value).into_owned());
    }
    list
}

/// The ceiling for an incomplete head: everything the limits allow plus a
/// margin for the request line scaffolding.
fn head_size_cap(limits: &HttpMessageLimits) -> usize {
    limits.max_total_headers_size + limits.max_request_target_length + 256
}

/// Tries to parse a request head out of `buf`.
pub fn parse_request_head(
    buf: &[u8],
    limits: &HttpMessageLimits,
) -> Result<HeadParse<ParsedRequestHead>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let target = request.path.unwrap_or_default();
            if target.len() > limits.max_request_target_length {
                return Err(HeadError::LimitExceeded {
                    entity: "request-target",
                    size: target.len(),
                    limit: limits.max_request_target_length,
                });
            }
            check_field_limits(request.headers, limits)?;

            Ok(HeadParse::Complete {
                head: ParsedRequestHead {
                    method: request.method.unwrap_or_default().to_string(),
                    request_target: target.to_string(),
                    minor_version: request.version.unwrap_or(1),
                    headers: collect_headers(request.headers),
                },
                consumed,
            })
        }
        Ok(httparse::Status::Partial) => {
            // The request line has not even finished: a run-away
            // request-target is caught without waiting for the whole head.
            if !buf.contains(&b'\n') && buf.len() > limits.max_request_target_length + 32 {
                return Err(HeadError::LimitExceeded {
                    entity: "request-target",
                    size: buf.len(),
                    limit: limits.max_request_target_length,
                });
            }
            if buf.len() > head_size_cap(limits) {
                return Err(HeadError::HeadTooLarge);
            }
            Ok(HeadParse::NeedMore)
        }
        Err(error) => Err(HeadError::Parse(error)),
    }
}

/// Tries to parse a response head out of `buf`.
pub fn parse_response_head(
    buf: &[u8],
    limits: &HttpMessageLimits,
) -> Result<HeadParse<ParsedResponseHead>, HeadError> {
    // The status-line limit is enforced before the full parse so a target
    // streaming an endless status line is cut off early.
    match buf.iter().position(|&b| b == b'\n') {
        Some(pos) if pos > limits.max_status_line_length => {
            return Err(HeadError::LimitExceeded {
                entity: "status-line",
                size: pos,
                limit: limits.max_status_line_length,
            })
        }
        None if buf.len() > limits.max_status_line_length => {
            return Err(HeadError::LimitExceeded {
                entity: "status-line",
                size: buf.len(),
                limit: limits.max_status_line_length,
            })
        }
        _ => {}
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            check_field_limits(response.headers, limits)?;

            Ok(HeadParse::Complete {
                head: ParsedResponseHead {
                    code: response.code.unwrap_or(0),
                    reason: response.reason.unwrap_or_default().to_string(),
                    headers: collect_headers(response.headers),
                },
                consumed,
            })
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > head_size_cap(limits) {
                return Err(HeadError::HeadTooLarge);
            }
            Ok(HeadParse::NeedMore)
        }
        Err(error) => Err(HeadError::Parse(error)),
    }
}

/// How a message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    ContentLength(u64),
    Chunked,
    /// A response delimited by the target closing the connection.
    UntilEof,
}

/// Determines the framing of a request body. Bodiless methods must not
/// announce a body at all.
pub fn request_body_kind(method: &str, headers: &HeaderList) -> Result<BodyKind, String> {
    let kind = framing_from_headers(headers)?;

    if super::is_bodyless_method(method) && kind != BodyKind::None {
        return Err(format!("HTTP body for bodyless method {method}"));
    }

    Ok(kind)
}

/// Determines the framing of a response body.
pub fn response_body_kind(
    request_method: &str,
    code: u16,
    headers: &HeaderList,
) -> Result<BodyKind, String> {
    if request_method == "HEAD" || (100..200).contains(&code) || code == 204 || code == 304 {
        return Ok(BodyKind::None);
    }

    match framing_from_headers(headers)? {
        // A response without explicit framing runs until the target
        // closes the connection.
        BodyKind::None if headers.opt_value_of("Content-Length").is_none() => {
            Ok(BodyKind::UntilEof)
        }
        kind => Ok(kind),
    }
}

fn framing_from_headers(headers: &HeaderList) -> Result<BodyKind, String> {
    let chunked = headers
        .values_of("Transfer-Encoding")
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(BodyKind::Chunked);
    }

    let mut content_length: Option<u64> = None;
    for value in headers.values_of("Content-Length") {
        let parsed: u64 = value
            .trim()
            .parse()
            .map_err(|_| format!("invalid Content-Length: {value}"))?;
        match content_length {
            Some(previous) if previous != parsed => {
                return Err("conflicting Content-Length values".to_string())
            }
            _ => content_length = Some(parsed),
        }
    }

    match content_length {
        Some(0) | None => Ok(BodyKind::None),
        Some(n) => Ok(BodyKind::ContentLength(n)),
    }
}

/// One event produced by the body decoder.
///
/// Chunk framing is reported separately from the data so the rewriter can
/// re-emit its own `<hex>\r\n` headers (dropping chunk extensions).
#[derive(Debug, PartialEq, Eq)]
pub enum BodyEvent {
    ChunkBegin(u64),
    Data(Bytes),
    ChunkEnd,
    Complete,
}

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("invalid chunk size line")]
    InvalidChunkSize,

    #[error("missing CRLF after chunk data")]
    MissingChunkCrlf,

    #[error("chunk size line too long")]
    ChunkSizeLineTooLong,

    #[error("trailer line too long")]
    TrailerTooLong,

    #[error("EOF in the middle of a message body")]
    UnexpectedEof,
}

#[derive(Debug)]
enum DecoderState {
    /// The message has no body: the first `decode` call reports
    /// completion.
    Empty,
    ContentLength { remaining: u64 },
    UntilEof,
    ChunkSizeLine,
    ChunkData { remaining: u64 },
    ChunkDataCrlf,
    /// Trailing headers after the last chunk; ignored by design.
    Trailers,
    Done,
}

/// Incremental body decoder. Stops consuming at message completion,
/// leaving pipelined bytes in the input buffer.
#[derive(Debug)]
pub struct BodyDecoder {
    state: DecoderState,
}

impl BodyDecoder {
    pub fn new(kind: BodyKind) -> Self {
        let state = match kind {
            BodyKind::None => DecoderState::Empty,
            BodyKind::ContentLength(n) => DecoderState::ContentLength { remaining: n },
            BodyKind::Chunked => DecoderState::ChunkSizeLine,
            BodyKind::UntilEof => DecoderState::UntilEof,
        };
        Self { state }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, DecoderState::Done)
    }

    /// Consumes as much of `input` as possible, appending events to `out`.
    pub fn decode(
        &mut self,
        input: &mut BytesMut,
        out: &mut Vec<BodyEvent>,
    ) -> Result<(), BodyError> {
        loop {
            match &mut self.state {
                DecoderState::Empty => {
                    self.state = DecoderState::Done;
                    out.push(BodyEvent::Complete);
                }
                DecoderState::Done => return Ok(()),
                DecoderState::UntilEof => {
                    if !input.is_empty() {
                        let data = input.split_to(input.len()).freeze();
                        out.push(BodyEvent::Data(data));
                    }
                    return Ok(());
                }
                DecoderState::ContentLength { remaining } => {
                    let take = (*remaining).min(input.len() as u64) as usize;
                    if take > 0 {
                        *remaining -= take as u64;
                        out.push(BodyEvent::Data(input.split_to(take).freeze()));
                    }
                    if *remaining == 0 {
                        self.state = DecoderState::Done;
                        out.push(BodyEvent::Complete);
                        return Ok(());
                    }
                    return Ok(());
                }
                DecoderState::ChunkSizeLine => {
                    let Some(line_end) = input.iter().position(|&b| b == b'\n') else {
                        if input.len() > CHUNK_SIZE_LINE_LIMIT {
                            return Err(BodyError::ChunkSizeLineTooLong);
                        }
                        return Ok(());
                    };

                    let line = &input[..line_end];
                    let line = line.strip_suffix(b"\r").unwrap_or(line);
                    // Chunk extensions are dropped.
                    let size_part = match line.iter().position(|&b| b == b';') {
                        Some(pos) => &line[..pos],
                        None => line,
                    };
                    let size_str = std::str::from_utf8(size_part)
                        .map_err(|_| BodyError::InvalidChunkSize)?
                        .trim();
                    let size = u64::from_str_radix(size_str, 16)
                        .map_err(|_| BodyError::InvalidChunkSize)?;

                    let _ = input.split_to(line_end + 1);

                    if size == 0 {
                        self.state = DecoderState::Trailers;
                    } else {
                        out.push(BodyEvent::ChunkBegin(size));
                        self.state = DecoderState::ChunkData { remaining: size };
                    }
                }
                DecoderState::ChunkData { remaining } => {
                    let take = (*remaining).min(input.len() as u64) as usize;
                    if take > 0 {
                        *remaining -= take as u64;
                        out.push(BodyEvent::Data(input.split_to(take).freeze()));
                    }
                    if *remaining == 0 {
                        self.state = DecoderState::ChunkDataCrlf;
                    } else {
                        return Ok(());
                    }
                }
                DecoderState::ChunkDataCrlf => {
                    if input.len() < 2 {
                        return Ok(());
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(BodyError::MissingChunkCrlf);
                    }
                    let _ = input.split_to(2);
                    out.push(BodyEvent::ChunkEnd);
                    self.state = DecoderState::ChunkSizeLine;
                }
                DecoderState::Trailers => {
                    let Some(line_end) = input.iter().position(|&b| b == b'\n') else {
                        if input.len() > TRAILER_LINE_LIMIT {
                            return Err(BodyError::TrailerTooLong);
                        }
                        return Ok(());
                    };

                    let line = &input[..line_end];
                    let is_empty = line.strip_suffix(b"\r").unwrap_or(line).is_empty();
                    let _ = input.split_to(line_end + 1);

                    if is_empty {
                        self.state = DecoderState::Done;
                        out.push(BodyEvent::Complete);
                        return Ok(());
                    }
                    // a trailing header, not forwarded
                }
            }
        }
    }

    /// The peer closed its end of the stream.
    pub fn on_eof(&mut self, out: &mut Vec<BodyEvent>) -> Result<(), BodyError> {
        match self.state {
            DecoderState::UntilEof => {
                self.state = DecoderState::Done;
                out.push(BodyEvent::Complete);
                Ok(())
            }
            DecoderState::Done => Ok(()),
            _ => Err(BodyError::UnexpectedEof),
        }
    }
}
