//! DNS resolution and the outbound connect of the HTTP pipeline.

use std::net::{IpAddr, SocketAddr};

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::bandlim::TrafficLimiter;
use crate::dns::IpVersion;
use crate::handlers::socks5::make_out_socket;
use crate::handlers::{data_transfer, ConnCtx, Handler, Outcome, RemoveReason};

use super::rewriter::OrdinaryMethodHandler;
use super::{responses, send_negative_response_then_close, RequestInfo};

pub struct TargetConnectorHandler {
    connection: TcpStream,
    input: BytesMut,
    request_info: RequestInfo,
    traffic_limiter: TrafficLimiter,
}

impl TargetConnectorHandler {
    pub fn new(
        connection: TcpStream,
        input: BytesMut,
        request_info: RequestInfo,
        traffic_limiter: TrafficLimiter,
    ) -> Self {
        Self { connection, input, request_info, traffic_limiter }
    }

    pub(crate) async fn run(mut self, ctx: &ConnCtx) -> Outcome {
        let params = ctx.acl.params.load_full();
        let out_addr = ctx.acl.config.out_ip;

        // An IP-literal target needs no DNS round-trip.
        let target_ip = match self.request_info.target_host.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) if out_addr.is_ipv4() => {
                warn!(
                    connection = %ctx.long_id(),
                    target_addr = %addr,
                    "target with IPv6 address can't be served by ACL with IPv4 out address"
                );
                return Outcome::Remove(
                    send_negative_response_then_close(
                        ctx,
                        &mut self.connection,
                        responses::BAD_GATEWAY_CONNECT_FAILURE,
                        RemoveReason::IpVersionMismatch,
                    )
                    .await,
                );
            }
            Ok(IpAddr::V4(addr)) if out_addr.is_ipv6() => {
                IpAddr::V6(addr.to_ipv6_mapped())
            }
            Ok(addr) => addr,
            Err(_) => {
                let version = if out_addr.is_ipv6() { IpVersion::V6 } else { IpVersion::V4 };
                let resolved = timeout(
                    params.dns_resolving_timeout,
                    ctx.acl.dns.resolve(&self.request_info.target_host, version),
                )
                .await;

                match resolved {
                    Ok(Ok(ip)) => ip,
                    Ok(Err(failure)) => {
                        warn!(connection = %ctx.long_id(), %failure, "DNS resolving failure");
                        return Outcome::Remove(
                            send_negative_response_then_close(
                                ctx,
                                &mut self.connection,
                                responses::BAD_GATEWAY_DNS_FAILURE,
                                RemoveReason::UnresolvedTarget,
                            )
                            .await,
                        );
                    }
                    Err(_) => {
                        warn!(connection = %ctx.long_id(), "DNS resolving timed out");
                        return Outcome::Remove(
                            send_negative_response_then_close(
                                ctx,
                                &mut self.connection,
                                responses::BAD_GATEWAY_DNS_FAILURE,
                                RemoveReason::CurrentOperationTimedOut,
                            )
                            .await,
                        );
                    }
                }
            }
        };

        let target_endpoint = SocketAddr::new(target_ip, self.request_info.target_port);

        let out_socket = match make_out_socket(out_addr) {
            Ok(socket) => socket,
            Err(error) => {
                warn!(
                    connection = %ctx.long_id(),
                    %out_addr,
                    %error,
                    "unable to bind outgoing socket"
                );
                return Outcome::Remove(
                    send_negative_response_then_close(
                        ctx,
                        &mut self.connection,
                        responses::INTERNAL_SERVER_ERROR,
                        RemoveReason::IoError,
                    )
                    .await,
                );
            }
        };

        trace!(connection = %ctx.long_id(), target = %target_endpoint, "trying to connect");

        let out_connection = match timeout(
            params.connect_target_timeout,
            out_socket.connect(target_endpoint),
        )
        .await
        {
            Ok(Ok(out_connection)) => out_connection,
            Ok(Err(error)) => {
                warn!(
                    connection = %ctx.long_id(),
                    target = %target_endpoint,
                    %error,
                    "can't connect to target host"
                );
                return Outcome::Remove(
                    send_negative_response_then_close(
                        ctx,
                        &mut self.connection,
                        responses::BAD_GATEWAY_CONNECT_FAILURE,
                        RemoveReason::IoError,
                    )
                    .await,
                );
            }
            Err(_) => {
                warn!(connection = %ctx.long_id(), "connect target-host timed out");
                return Outcome::Remove(
                    send_negative_response_then_close(
                        ctx,
                        &mut self.connection,
                        responses::BAD_GATEWAY_CONNECT_TIMEOUT,
                        RemoveReason::CurrentOperationTimedOut,
                    )
                    .await,
                );
            }
        };

        debug!(
            connection = %ctx.long_id(),
            target = %target_endpoint,
            "outgoing connection established"
        );

        if self.request_info.method == "CONNECT" {
            // The tunnel is up; from here on the payload is opaque.
            if let Err(error) = self
                .connection
                .write_all(responses::CONNECT_ESTABLISHED.as_bytes())
                .await
            {
                warn!(connection = %ctx.long_id(), %error, "IO-error on write");
                return Outcome::Remove(RemoveReason::IoError);
            }

            return Outcome::Replace(Handler::DataTransfer(
                data_transfer::DataTransferHandler::new(
                    self.connection,
                    out_connection,
                    self.traffic_limiter,
                ),
            ));
        }

        Outcome::Replace(Handler::HttpOrdinaryMethod(OrdinaryMethodHandler::new(
            self.connection,
            self.input,
            self.request_info,
            self.traffic_limiter,
            out_connection,
        )))
    }
}
