//! SOCKS5 connection handlers (RFC 1928, RFC 1929).
//!
//! Only CONNECT and BIND are supported. The handshake stages share one
//! deadline counted from the moment the connection was accepted
//! (`socks_handshake_phase_timeout`).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::auth::AuthRequest;
use crate::bandlim::TrafficLimiter;
use crate::buffers::{InBuffer, OutBuffer, ParseOutcome, ReadTx};
use crate::dns::IpVersion;

use super::{data_transfer, read_some, write_whole, ConnCtx, Handler, Outcome, RemoveReason};

const VERSION_BYTE: u8 = 0x05;
const NO_AUTHENTIFICATION_METHOD: u8 = 0x00;
const USERNAME_PASSWORD_AUTH_METHOD: u8 = 0x02;
const NO_ACCEPTABLE_METHODS: u8 = 0xff;

const ATYPE_IPV4: u8 = 0x01;
const ATYPE_DOMAINNAME: u8 = 0x03;
const ATYPE_IPV6: u8 = 0x04;

const COMMAND_REPLY_SUCCESSED: u8 = 0x00;
const COMMAND_REPLY_GENERAL_SERVER_FAILURE: u8 = 0x01;
const COMMAND_REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
const COMMAND_REPLY_HOST_UNREACHABLE: u8 = 0x04;
const COMMAND_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const COMMAND_REPLY_ATYPE_NOT_SUPPORTED: u8 = 0x08;

const CONNECT_CMD: u8 = 0x01;
const BIND_CMD: u8 = 0x02;

/// Sub-negotiation protocol version (RFC 1929).
const AUTH_PDU_VERSION: u8 = 0x01;
const ACCESS_GRANTED: u8 = 0x00;

/// Negative command replies are always these 4 bytes: VER, REP, RSV, ATYP.
async fn send_negative_command_reply(connection: &mut TcpStream, reply_code: u8) {
    // The connection is going away either way; a failed write changes
    // nothing.
    let _ = connection
        .write_all(&[VERSION_BYTE, reply_code, 0x00, 0x00])
        .await;
}

/// Fills a positive command reply: VER, REP, RSV, ATYP, BND.ADDR, BND.PORT.
fn make_positive_response_content(to: &mut OutBuffer, endpoint_to_report: SocketAddr) {
    to.write_byte(VERSION_BYTE);
    to.write_byte(COMMAND_REPLY_SUCCESSED);
    to.write_byte(0x00);

    match endpoint_to_report.ip() {
        IpAddr::V4(addr) => {
            to.write_byte(ATYPE_IPV4);
            to.write_slice(&addr.octets());
        }
        IpAddr::V6(addr) => {
            to.write_byte(ATYPE_IPV6);
            to.write_slice(&addr.octets());
        }
    }

    to.write_slice(&endpoint_to_report.port().to_be_bytes());
}

/// Reads another chunk of a handshake PDU, bounded by the stage deadline.
///
/// Returns the removal reason when reading cannot continue.
async fn read_more_or_fail(
    ctx: &ConnCtx,
    connection: &mut TcpStream,
    buffer: &mut InBuffer,
    deadline: Instant,
) -> Result<(), RemoveReason> {
    if buffer.is_full() {
        warn!(connection = %ctx.long_id(), "socks5: PDU does not fit into its maximum size");
        return Err(RemoveReason::ProtocolError);
    }

    match timeout_at(deadline, read_some(connection, buffer)).await {
        Ok(Ok(0)) => {
            warn!(connection = %ctx.long_id(), "socks5: EOF in the middle of a handshake PDU");
            Err(RemoveReason::IoError)
        }
        Ok(Ok(_)) => Ok(()),
        Ok(Err(error)) => {
            warn!(connection = %ctx.long_id(), %error, "IO-error on read");
            Err(RemoveReason::IoError)
        }
        Err(_) => {
            warn!(connection = %ctx.long_id(), "socks5: handshake phase timed out");
            Err(RemoveReason::CurrentOperationTimedOut)
        }
    }
}

//
// Method selection
//

/// First PDU: `VER NMETHODS METHODS...`.
pub struct MethodSelectionHandler {
    connection: TcpStream,
    first_pdu: InBuffer,
    deadline: Instant,
}

impl MethodSelectionHandler {
    /// Maximum size of the first PDU: VER + count + up to 255 methods.
    const FIRST_PDU_MAX_SIZE: usize = 1 + 1 + 255;

    pub fn new(connection: TcpStream, whole_first_pdu: &[u8]) -> Self {
        Self {
            connection,
            first_pdu: InBuffer::with_initial(Self::FIRST_PDU_MAX_SIZE, whole_first_pdu),
            deadline: Instant::now(),
        }
    }

    pub(super) async fn run(mut self, ctx: &ConnCtx) -> Outcome {
        self.deadline =
            Instant::now() + ctx.acl.params.load_full().socks_handshake_phase_timeout;

        loop {
            match self.try_parse_methods(ctx) {
                ParseOutcome::Success => break,
                ParseOutcome::NeedMore => {
                    if let Err(reason) = read_more_or_fail(
                        ctx,
                        &mut self.connection,
                        &mut self.first_pdu,
                        self.deadline,
                    )
                    .await
                    {
                        return Outcome::Remove(reason);
                    }
                }
                ParseOutcome::InvalidData => {
                    return Outcome::Remove(RemoveReason::ProtocolError)
                }
            }
        }

        self.handle_auth_methods(ctx).await
    }

    fn try_parse_methods(&mut self, ctx: &ConnCtx) -> ParseOutcome {
        let mut tx = ReadTx::new(&mut self.first_pdu);

        // The version byte was already checked by protocol detection.
        if tx.read_byte().is_none() {
            return ParseOutcome::NeedMore;
        }

        let Some(methods) = tx.read_byte() else {
            return ParseOutcome::NeedMore;
        };
        let methods = methods as usize;

        if methods == tx.remaining() {
            tx.commit();
            ParseOutcome::Success
        } else if methods < tx.remaining() {
            warn!(
                connection = %ctx.long_id(),
                methods,
                bytes_read = tx.total_size(),
                "socks5: PDU with auth methods too long"
            );
            ParseOutcome::InvalidData
        } else {
            ParseOutcome::NeedMore
        }
    }

    async fn handle_auth_methods(mut self, ctx: &ConnCtx) -> Outcome {
        let offered = self.first_pdu.read_bytes(255).unwrap_or(&[]).to_vec();
        trace!(connection = %ctx.long_id(), methods = ?offered, "socks5: auth methods from client");

        let accepted_method = [USERNAME_PASSWORD_AUTH_METHOD, NO_AUTHENTIFICATION_METHOD]
            .into_iter()
            .find(|m| offered.contains(m));

        let Some(method) = accepted_method else {
            let _ = self
                .connection
                .write_all(&[VERSION_BYTE, NO_ACCEPTABLE_METHODS])
                .await;
            warn!(
                connection = %ctx.long_id(),
                client_methods = ?offered,
                "socks5: no supported auth methods"
            );
            return Outcome::Remove(RemoveReason::ProtocolError);
        };

        trace!(connection = %ctx.long_id(), method, "socks5: auth method to be used");

        let mut response = OutBuffer::new();
        response.write_byte(VERSION_BYTE);
        response.write_byte(method);
        if let Err(error) = write_whole(&mut self.connection, &mut response).await {
            warn!(connection = %ctx.long_id(), %error, "IO-error on write");
            return Outcome::Remove(RemoveReason::IoError);
        }

        if method == NO_AUTHENTIFICATION_METHOD {
            Outcome::Replace(Handler::Socks5NoAuthentification(NoAuthentificationHandler {
                connection: self.connection,
                auth_pdu: InBuffer::new(NoAuthentificationHandler::AUTH_PDU_MAX_SIZE),
                deadline: self.deadline,
            }))
        } else {
            Outcome::Replace(Handler::Socks5UsernamePasswordAuth(
                UsernamePasswordAuthHandler {
                    connection: self.connection,
                    auth_pdu: InBuffer::new(UsernamePasswordAuthHandler::AUTH_PDU_MAX_SIZE),
                    deadline: self.deadline,
                },
            ))
        }
    }
}

//
// Username/password sub-negotiation
//

/// RFC 1929 PDU: `VER ULEN UNAME PLEN PASSWD`.
pub struct UsernamePasswordAuthHandler {
    connection: TcpStream,
    auth_pdu: InBuffer,
    deadline: Instant,
}

enum AuthPduParse {
    NeedMore,
    Invalid,
    Complete { username: String, password: String },
}

impl UsernamePasswordAuthHandler {
    const AUTH_PDU_MAX_SIZE: usize = 1 + 1 + 255 + 1 + 255;

    pub(super) async fn run(mut self, ctx: &ConnCtx) -> Outcome {
        let (username, password) = loop {
            match self.try_parse_auth_pdu(ctx) {
                AuthPduParse::Complete { username, password } => break (username, password),
                AuthPduParse::Invalid => return Outcome::Remove(RemoveReason::ProtocolError),
                AuthPduParse::NeedMore => {
                    if let Err(reason) = read_more_or_fail(
                        ctx,
                        &mut self.connection,
                        &mut self.auth_pdu,
                        self.deadline,
                    )
                    .await
                    {
                        return Outcome::Remove(reason);
                    }
                }
            }
        };

        let mut response = OutBuffer::new();
        response.write_byte(AUTH_PDU_VERSION);
        response.write_byte(ACCESS_GRANTED);
        if let Err(error) = write_whole(&mut self.connection, &mut response).await {
            warn!(connection = %ctx.long_id(), %error, "IO-error on write");
            return Outcome::Remove(RemoveReason::IoError);
        }

        Outcome::Replace(Handler::Socks5Command(CommandHandler {
            connection: self.connection,
            command_pdu: InBuffer::new(CommandHandler::COMMAND_PDU_MAX_SIZE),
            username: Some(username),
            password: Some(password),
            deadline: self.deadline,
        }))
    }

    fn try_parse_auth_pdu(&mut self, ctx: &ConnCtx) -> AuthPduParse {
        let mut tx = ReadTx::new(&mut self.auth_pdu);

        let Some(version) = tx.read_byte() else {
            return AuthPduParse::NeedMore;
        };
        if version != AUTH_PDU_VERSION {
            warn!(
                connection = %ctx.long_id(),
                version,
                expected = AUTH_PDU_VERSION,
                "unsupported version of socks5 username/password auth PDU"
            );
            return AuthPduParse::Invalid;
        }

        let Some(uname_len) = tx.read_byte() else {
            return AuthPduParse::NeedMore;
        };
        if (uname_len as usize) > tx.remaining() {
            return AuthPduParse::NeedMore;
        }
        let username = String::from_utf8_lossy(
            tx.read_bytes(uname_len as usize).unwrap_or(&[]),
        )
        .into_owned();

        let Some(passwd_len) = tx.read_byte() else {
            return AuthPduParse::NeedMore;
        };
        if (passwd_len as usize) > tx.remaining() {
            return AuthPduParse::NeedMore;
        }
        let password = String::from_utf8_lossy(
            tx.read_bytes(passwd_len as usize).unwrap_or(&[]),
        )
        .into_owned();

        if tx.remaining() != 0 {
            warn!(
                connection = %ctx.long_id(),
                remaining = tx.remaining(),
                "some garbage in auth PDU after reading username/password"
            );
            return AuthPduParse::Invalid;
        }

        tx.commit();
        AuthPduParse::Complete { username, password }
    }
}

//
// No-authentification quirk handling
//

/// After the no-auth method is selected, curl still sends an RFC 1929 PDU
/// with empty credentials while Firefox goes straight to the command PDU.
/// A leading `0x05` means the latter: the collected bytes are the start of
/// the command PDU.
pub struct NoAuthentificationHandler {
    connection: TcpStream,
    auth_pdu: InBuffer,
    deadline: Instant,
}

enum NoAuthParse {
    NeedMore,
    Invalid,
    EmptyCredentials,
    CommandPduAlready,
}

impl NoAuthentificationHandler {
    /// VER + ULEN(0) + PLEN(0).
    const AUTH_PDU_MAX_SIZE: usize = 3;

    pub(super) async fn run(mut self, ctx: &ConnCtx) -> Outcome {
        loop {
            match self.try_parse_auth_pdu(ctx) {
                NoAuthParse::CommandPduAlready => {
                    // Everything read so far belongs to the command PDU.
                    return Outcome::Replace(Handler::Socks5Command(CommandHandler {
                        command_pdu: InBuffer::with_initial(
                            CommandHandler::COMMAND_PDU_MAX_SIZE,
                            self.auth_pdu.whole_data(),
                        ),
                        connection: self.connection,
                        username: None,
                        password: None,
                        deadline: self.deadline,
                    }));
                }
                NoAuthParse::EmptyCredentials => break,
                NoAuthParse::Invalid => return Outcome::Remove(RemoveReason::ProtocolError),
                NoAuthParse::NeedMore => {
                    if let Err(reason) = read_more_or_fail(
                        ctx,
                        &mut self.connection,
                        &mut self.auth_pdu,
                        self.deadline,
                    )
                    .await
                    {
                        return Outcome::Remove(reason);
                    }
                }
            }
        }

        let mut response = OutBuffer::new();
        response.write_byte(AUTH_PDU_VERSION);
        response.write_byte(ACCESS_GRANTED);
        if let Err(error) = write_whole(&mut self.connection, &mut response).await {
            warn!(connection = %ctx.long_id(), %error, "IO-error on write");
            return Outcome::Remove(RemoveReason::IoError);
        }

        Outcome::Replace(Handler::Socks5Command(CommandHandler {
            connection: self.connection,
            command_pdu: InBuffer::new(CommandHandler::COMMAND_PDU_MAX_SIZE),
            username: None,
            password: None,
            deadline: self.deadline,
        }))
    }

    fn try_parse_auth_pdu(&mut self, ctx: &ConnCtx) -> NoAuthParse {
        let mut tx = ReadTx::new(&mut self.auth_pdu);

        let Some(version) = tx.read_byte() else {
            return NoAuthParse::NeedMore;
        };

        if version == VERSION_BYTE {
            return NoAuthParse::CommandPduAlready;
        }

        if version != AUTH_PDU_VERSION {
            warn!(
                connection = %ctx.long_id(),
                version,
                expected = AUTH_PDU_VERSION,
                "unsupported version of socks5 username/password auth PDU"
            );
            return NoAuthParse::Invalid;
        }

        let Some(uname_len) = tx.read_byte() else {
            return NoAuthParse::NeedMore;
        };
        if uname_len != 0 {
            warn!(connection = %ctx.long_id(), uname_len, "expected 0 as username length");
            return NoAuthParse::Invalid;
        }

        let Some(passwd_len) = tx.read_byte() else {
            return NoAuthParse::NeedMore;
        };
        if passwd_len != 0 {
            warn!(connection = %ctx.long_id(), passwd_len, "expected 0 as password length");
            return NoAuthParse::Invalid;
        }

        tx.commit();
        NoAuthParse::EmptyCredentials
    }
}

//
// Command PDU
//

/// The target address from a command PDU.
#[derive(Debug, Clone)]
pub(super) enum DestinationAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

pub struct CommandHandler {
    connection: TcpStream,
    command_pdu: InBuffer,
    username: Option<String>,
    password: Option<String>,
    deadline: Instant,
}

enum CommandParse {
    NeedMore,
    /// A negative reply was prepared; send it and close.
    Reject(u8),
    Invalid,
    Complete { cmd: u8, dst_addr: DestinationAddr, dst_port: u16 },
}

impl CommandHandler {
    /// VER + CMD + RSV + ATYP + longest DST.ADDR + DST.PORT.
    const COMMAND_PDU_MAX_SIZE: usize = 1 + 1 + 1 + 1 + 256 + 2;

    pub(super) async fn run(mut self, ctx: &ConnCtx) -> Outcome {
        let (cmd, dst_addr, dst_port) = loop {
            match self.try_parse_command_pdu(ctx) {
                CommandParse::Complete { cmd, dst_addr, dst_port } => {
                    break (cmd, dst_addr, dst_port)
                }
                CommandParse::Invalid => return Outcome::Remove(RemoveReason::ProtocolError),
                CommandParse::Reject(reply_code) => {
                    send_negative_command_reply(&mut self.connection, reply_code).await;
                    return Outcome::Remove(RemoveReason::ProtocolError);
                }
                CommandParse::NeedMore => {
                    if let Err(reason) = read_more_or_fail(
                        ctx,
                        &mut self.connection,
                        &mut self.command_pdu,
                        self.deadline,
                    )
                    .await
                    {
                        return Outcome::Remove(reason);
                    }
                }
            }
        };

        match cmd {
            CONNECT_CMD => Outcome::Replace(Handler::Socks5Connect(ConnectCommandHandler {
                connection: self.connection,
                username: self.username,
                password: self.password,
                dst_addr,
                dst_port,
            })),
            BIND_CMD => Outcome::Replace(Handler::Socks5Bind(BindCommandHandler {
                connection: self.connection,
                username: self.username,
                password: self.password,
                dst_addr,
                dst_port,
            })),
            _ => {
                send_negative_command_reply(
                    &mut self.connection,
                    COMMAND_REPLY_COMMAND_NOT_SUPPORTED,
                )
                .await;
                Outcome::Remove(RemoveReason::ProtocolError)
            }
        }
    }

    fn try_parse_command_pdu(&mut self, ctx: &ConnCtx) -> CommandParse {
        let mut tx = ReadTx::new(&mut self.command_pdu);

        let Some(version) = tx.read_byte() else {
            return CommandParse::NeedMore;
        };
        if version != VERSION_BYTE {
            warn!(
                connection = %ctx.long_id(),
                version,
                "unsupported version of socks5 command PDU"
            );
            return CommandParse::Invalid;
        }

        if tx.remaining() < 3 {
            return CommandParse::NeedMore;
        }
        let cmd = tx.read_byte().expect("checked above");
        let _rsv = tx.read_byte().expect("checked above");
        let atype = tx.read_byte().expect("checked above");

        let dst_addr = match atype {
            ATYPE_IPV4 => {
                if tx.remaining() < 4 {
                    return CommandParse::NeedMore;
                }
                let octets: [u8; 4] = tx.read_bytes(4).unwrap().try_into().unwrap();
                DestinationAddr::V4(Ipv4Addr::from(octets))
            }
            ATYPE_IPV6 => {
                if tx.remaining() < 16 {
                    return CommandParse::NeedMore;
                }
                let octets: [u8; 16] = tx.read_bytes(16).unwrap().try_into().unwrap();
                DestinationAddr::V6(Ipv6Addr::from(octets))
            }
            ATYPE_DOMAINNAME => {
                let Some(name_len) = tx.read_byte() else {
                    return CommandParse::NeedMore;
                };
                if name_len == 0 {
                    warn!(
                        connection = %ctx.long_id(),
                        "domainname length is zero in SOCKS5 command PDU"
                    );
                    return CommandParse::Invalid;
                }
                if tx.remaining() < name_len as usize {
                    return CommandParse::NeedMore;
                }
                let name = String::from_utf8_lossy(
                    tx.read_bytes(name_len as usize).unwrap(),
                )
                .into_owned();
                DestinationAddr::Domain(name)
            }
            _ => return CommandParse::Reject(COMMAND_REPLY_ATYPE_NOT_SUPPORTED),
        };

        if tx.remaining() < 2 {
            return CommandParse::NeedMore;
        }
        let port_bytes: [u8; 2] = tx.read_bytes(2).unwrap().try_into().unwrap();
        let dst_port = u16::from_be_bytes(port_bytes);

        if tx.remaining() != 0 {
            warn!(
                connection = %ctx.long_id(),
                remaining = tx.remaining(),
                "some garbage in command PDU after reading all the data"
            );
            return CommandParse::Invalid;
        }

        tx.commit();
        CommandParse::Complete { cmd, dst_addr, dst_port }
    }
}

//
// Shared CONNECT/BIND preparation: authentication and DNS resolution
//

struct PreparedTarget {
    target_endpoint: SocketAddr,
    traffic_limiter: TrafficLimiter,
}

/// Authenticates the client and resolves the target endpoint.
///
/// The authentication goes first: a DNS lookup is comparatively expensive
/// and is only worth doing for a client that is allowed to proceed.
async fn authenticate_and_resolve(
    ctx: &ConnCtx,
    connection: &mut TcpStream,
    username: Option<String>,
    password: Option<String>,
    dst_addr: &DestinationAddr,
    dst_port: u16,
) -> Result<PreparedTarget, RemoveReason> {
    let params = ctx.acl.params.load_full();
    let out_addr = ctx.acl.config.out_ip;

    // The target endpoint is known without DNS for direct addresses; the
    // egress family decides how the address is used.
    let (target_host, known_endpoint) = match dst_addr {
        DestinationAddr::V4(addr) => {
            let endpoint = if out_addr.is_ipv6() {
                SocketAddr::new(IpAddr::V6(addr.to_ipv6_mapped()), dst_port)
            } else {
                SocketAddr::new(IpAddr::V4(*addr), dst_port)
            };
            (addr.to_string(), Some(endpoint))
        }
        DestinationAddr::V6(addr) => {
            if out_addr.is_ipv4() {
                warn!(
                    connection = %ctx.long_id(),
                    target_addr = %addr,
                    "target with IPv6 address can't be served by ACL with IPv4 out address"
                );
                send_negative_command_reply(connection, COMMAND_REPLY_ATYPE_NOT_SUPPORTED).await;
                return Err(RemoveReason::IpVersionMismatch);
            }
            (addr.to_string(), Some(SocketAddr::new(IpAddr::V6(*addr), dst_port)))
        }
        DestinationAddr::Domain(name) => (name.clone(), None),
    };

    let user_ip = match peer_ipv4(connection) {
        Some(ip) => ip,
        None => {
            send_negative_command_reply(connection, COMMAND_REPLY_GENERAL_SERVER_FAILURE).await;
            return Err(RemoveReason::UnexpectedAndUnsupportedCase);
        }
    };

    let auth_result = timeout(
        params.authentification_timeout,
        ctx.acl.auth.authenticate(
            ctx.acl.config.in_ip,
            ctx.acl.config.port,
            AuthRequest {
                user_ip,
                username,
                password,
                target_host: target_host.clone(),
                target_port: dst_port,
            },
        ),
    )
    .await;

    let traffic_limiter = match auth_result {
        Ok(Ok(success)) => success.traffic_limiter,
        Ok(Err(reason)) => {
            warn!(connection = %ctx.long_id(), %reason, "user is not authentificated");
            send_negative_command_reply(connection, COMMAND_REPLY_CONNECTION_NOT_ALLOWED).await;
            return Err(RemoveReason::AccessDenied);
        }
        Err(_) => {
            warn!(connection = %ctx.long_id(), "socks5: authentification timed out");
            send_negative_command_reply(connection, COMMAND_REPLY_CONNECTION_NOT_ALLOWED).await;
            return Err(RemoveReason::CurrentOperationTimedOut);
        }
    };

    let target_endpoint = match known_endpoint {
        Some(endpoint) => endpoint,
        None => {
            let version = if out_addr.is_ipv6() { IpVersion::V6 } else { IpVersion::V4 };
            let resolved = timeout(
                params.dns_resolving_timeout,
                ctx.acl.dns.resolve(&target_host, version),
            )
            .await;

            match resolved {
                Ok(Ok(ip)) => SocketAddr::new(ip, dst_port),
                Ok(Err(failure)) => {
                    warn!(connection = %ctx.long_id(), %failure, "DNS resolving failure");
                    send_negative_command_reply(connection, COMMAND_REPLY_HOST_UNREACHABLE)
                        .await;
                    return Err(RemoveReason::UnresolvedTarget);
                }
                Err(_) => {
                    warn!(connection = %ctx.long_id(), "socks5: DNS resolving timed out");
                    send_negative_command_reply(connection, COMMAND_REPLY_HOST_UNREACHABLE)
                        .await;
                    return Err(RemoveReason::CurrentOperationTimedOut);
                }
            }
        }
    };

    Ok(PreparedTarget { target_endpoint, traffic_limiter })
}

fn peer_ipv4(connection: &TcpStream) -> Option<Ipv4Addr> {
    match connection.peer_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

/// Opens an outbound socket bound to the ACL's egress address with an
/// ephemeral port.
pub(super) fn make_out_socket(out_addr: IpAddr) -> std::io::Result<TcpSocket> {
    let socket = match out_addr {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(out_addr, 0))?;
    Ok(socket)
}

//
// CONNECT
//

pub struct ConnectCommandHandler {
    connection: TcpStream,
    username: Option<String>,
    password: Option<String>,
    dst_addr: DestinationAddr,
    dst_port: u16,
}

impl ConnectCommandHandler {
    pub(super) async fn run(mut self, ctx: &ConnCtx) -> Outcome {
        let prepared = match authenticate_and_resolve(
            ctx,
            &mut self.connection,
            self.username.take(),
            self.password.take(),
            &self.dst_addr,
            self.dst_port,
        )
        .await
        {
            Ok(prepared) => prepared,
            Err(reason) => return Outcome::Remove(reason),
        };

        let params = ctx.acl.params.load_full();
        let out_addr = ctx.acl.config.out_ip;

        let out_socket = match make_out_socket(out_addr) {
            Ok(socket) => socket,
            Err(error) => {
                warn!(
                    connection = %ctx.long_id(),
                    %out_addr,
                    %error,
                    "unable to bind outgoing socket"
                );
                send_negative_command_reply(
                    &mut self.connection,
                    COMMAND_REPLY_GENERAL_SERVER_FAILURE,
                )
                .await;
                return Outcome::Remove(RemoveReason::IoError);
            }
        };

        trace!(
            connection = %ctx.long_id(),
            target = %prepared.target_endpoint,
            "trying to connect"
        );

        let out_connection = match timeout(
            params.connect_target_timeout,
            out_socket.connect(prepared.target_endpoint),
        )
        .await
        {
            Ok(Ok(out_connection)) => out_connection,
            Ok(Err(error)) => {
                warn!(
                    connection = %ctx.long_id(),
                    target = %prepared.target_endpoint,
                    %error,
                    "can't connect to target host"
                );
                send_negative_command_reply(
                    &mut self.connection,
                    COMMAND_REPLY_CONNECTION_NOT_ALLOWED,
                )
                .await;
                return Outcome::Remove(RemoveReason::IoError);
            }
            Err(_) => {
                warn!(connection = %ctx.long_id(), "socks5: connect target-host timed out");
                send_negative_command_reply(
                    &mut self.connection,
                    COMMAND_REPLY_HOST_UNREACHABLE,
                )
                .await;
                return Outcome::Remove(RemoveReason::CurrentOperationTimedOut);
            }
        };

        let local_endpoint = match out_connection.local_addr() {
            Ok(endpoint) => endpoint,
            Err(error) => {
                warn!(connection = %ctx.long_id(), %error, "no local endpoint for outgoing socket");
                send_negative_command_reply(
                    &mut self.connection,
                    COMMAND_REPLY_GENERAL_SERVER_FAILURE,
                )
                .await;
                return Outcome::Remove(RemoveReason::IoError);
            }
        };

        debug!(
            connection = %ctx.long_id(),
            target = %prepared.target_endpoint,
            from = %local_endpoint,
            "outgoing connection established"
        );

        // BND.ADDR/BND.PORT report the local endpoint of the outbound
        // socket.
        let mut response = OutBuffer::new();
        make_positive_response_content(&mut response, local_endpoint);
        if let Err(error) = write_whole(&mut self.connection, &mut response).await {
            warn!(connection = %ctx.long_id(), %error, "IO-error on write");
            return Outcome::Remove(RemoveReason::IoError);
        }

        Outcome::Replace(Handler::DataTransfer(data_transfer::DataTransferHandler::new(
            self.connection,
            out_connection,
            prepared.traffic_limiter,
        )))
    }
}

//
// BIND
//

pub struct BindCommandHandler {
    connection: TcpStream,
    username: Option<String>,
    password: Option<String>,
    dst_addr: DestinationAddr,
    dst_port: u16,
}

impl BindCommandHandler {
    pub(super) async fn run(mut self, ctx: &ConnCtx) -> Outcome {
        let prepared = match authenticate_and_resolve(
            ctx,
            &mut self.connection,
            self.username.take(),
            self.password.take(),
            &self.dst_addr,
            self.dst_port,
        )
        .await
        {
            Ok(prepared) => prepared,
            Err(reason) => return Outcome::Remove(reason),
        };

        let params = ctx.acl.params.load_full();
        let out_addr = ctx.acl.config.out_ip;

        // One incoming connection is expected, hence the backlog of 1.
        let listener = match make_out_socket(out_addr).and_then(|socket| socket.listen(1)) {
            Ok(listener) => listener,
            Err(error) => {
                warn!(connection = %ctx.long_id(), %error, "unable to make new entry point");
                send_negative_command_reply(
                    &mut self.connection,
                    COMMAND_REPLY_GENERAL_SERVER_FAILURE,
                )
                .await;
                return Outcome::Remove(RemoveReason::IoError);
            }
        };

        let listen_endpoint = match listener.local_addr() {
            Ok(endpoint) => endpoint,
            Err(error) => {
                warn!(connection = %ctx.long_id(), %error, "no local endpoint for entry point");
                send_negative_command_reply(
                    &mut self.connection,
                    COMMAND_REPLY_GENERAL_SERVER_FAILURE,
                )
                .await;
                return Outcome::Remove(RemoveReason::IoError);
            }
        };

        // First reply: the endpoint we are listening on.
        let mut response = OutBuffer::new();
        make_positive_response_content(&mut response, listen_endpoint);
        if let Err(error) = write_whole(&mut self.connection, &mut response).await {
            warn!(connection = %ctx.long_id(), %error, "IO-error on write");
            return Outcome::Remove(RemoveReason::IoError);
        }

        debug!(
            connection = %ctx.long_id(),
            on = %listen_endpoint,
            "accepting incoming connection"
        );

        let bind_deadline = Instant::now() + params.socks_bind_timeout;
        let (in_connection, in_endpoint) = loop {
            match timeout_at(bind_deadline, listener.accept()).await {
                Ok(Ok((in_connection, in_endpoint))) => {
                    trace!(
                        connection = %ctx.long_id(),
                        from = %in_endpoint,
                        "incoming connection accepted"
                    );

                    // Only the host named in the BIND request may connect;
                    // anything else is closed and the accept continues.
                    if ip_matches(in_endpoint.ip(), prepared.target_endpoint.ip()) {
                        break (in_connection, in_endpoint);
                    }
                    drop(in_connection);
                }
                Ok(Err(error)) => {
                    warn!(connection = %ctx.long_id(), %error, "can't accept a new connection");
                    send_negative_command_reply(
                        &mut self.connection,
                        COMMAND_REPLY_GENERAL_SERVER_FAILURE,
                    )
                    .await;
                    return Outcome::Remove(RemoveReason::IoError);
                }
                Err(_) => {
                    warn!(
                        connection = %ctx.long_id(),
                        "socks5: accepting an incoming connection timed out"
                    );
                    send_negative_command_reply(
                        &mut self.connection,
                        COMMAND_REPLY_HOST_UNREACHABLE,
                    )
                    .await;
                    return Outcome::Remove(RemoveReason::CurrentOperationTimedOut);
                }
            }
        };

        // Second reply: the endpoint of the accepted peer.
        let mut response = OutBuffer::new();
        make_positive_response_content(&mut response, in_endpoint);
        if let Err(error) = write_whole(&mut self.connection, &mut response).await {
            warn!(connection = %ctx.long_id(), %error, "IO-error on write");
            return Outcome::Remove(RemoveReason::IoError);
        }

        Outcome::Replace(Handler::DataTransfer(data_transfer::DataTransferHandler::new(
            self.connection,
            in_connection,
            prepared.traffic_limiter,
        )))
    }
}

/// Compares peer addresses treating an IPv4 and its v6-mapped form as
/// equal.
fn ip_matches(a: IpAddr, b: IpAddr) -> bool {
    let canonical = |ip: IpAddr| match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    };
    canonical(a) == canonical(b)
}
