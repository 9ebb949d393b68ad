//! The bidirectional relay driven after a successful SOCKS5 CONNECT/BIND
//! or an HTTP CONNECT.
//!
//! Each direction pumps through a ring of `io_chunk_count` buffers of
//! `io_chunk_size` bytes: a reader future fills free buffers (sized by the
//! bandwidth reservation), a writer future drains filled buffers into the
//! opposite socket. At most one read and one write are outstanding per
//! direction. The first direction that reaches EOF and drains its queue
//! finishes the relay.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::bandlim::{Direction, TrafficLimiter};

use super::{ConnCtx, Outcome, RemoveReason};

pub struct DataTransferHandler {
    in_connection: TcpStream,
    out_connection: TcpStream,
    traffic_limiter: TrafficLimiter,
}

/// How one direction of the relay ended.
enum DirectionEnd {
    /// EOF was read and everything queued has been written.
    Completed,
    Failed(RemoveReason),
}

impl DataTransferHandler {
    pub fn new(
        in_connection: TcpStream,
        out_connection: TcpStream,
        traffic_limiter: TrafficLimiter,
    ) -> Self {
        Self { in_connection, out_connection, traffic_limiter }
    }

    pub(super) async fn run(self, ctx: &ConnCtx) -> Outcome {
        let params = ctx.acl.params.load_full();
        let io_chunk_size = params.io_chunk_size;
        let io_chunk_count = params.io_chunk_count;
        let idle_timeout = params.idle_connection_timeout;

        let limiter = Arc::new(self.traffic_limiter);
        let last_read_at = Arc::new(Mutex::new(Instant::now()));

        let (user_read, user_write) = self.in_connection.into_split();
        let (target_read, target_write) = self.out_connection.into_split();

        let user_to_target = relay_direction(
            ctx,
            "user-end",
            user_read,
            target_write,
            Direction::FromUser,
            Arc::clone(&limiter),
            Arc::clone(&last_read_at),
            io_chunk_size,
            io_chunk_count,
        );
        let target_to_user = relay_direction(
            ctx,
            "target-end",
            target_read,
            user_write,
            Direction::FromTarget,
            Arc::clone(&limiter),
            Arc::clone(&last_read_at),
            io_chunk_size,
            io_chunk_count,
        );

        let watchdog = idle_watchdog(last_read_at.clone(), idle_timeout);

        // Whichever direction finishes first decides the outcome; the
        // other one is dropped, which closes its pending I/O.
        let end = tokio::select! {
            end = user_to_target => end,
            end = target_to_user => end,
            () = watchdog => {
                warn!(connection = %ctx.long_id(), "no data read for long time");
                return Outcome::Remove(RemoveReason::NoActivityForTooLong);
            }
        };

        match end {
            DirectionEnd::Completed => Outcome::Remove(RemoveReason::NormalCompletion),
            DirectionEnd::Failed(reason) => Outcome::Remove(reason),
        }
    }
}

/// Resolves once no successful read has happened for `idle_timeout`.
pub(crate) async fn idle_watchdog(last_read_at: Arc<Mutex<Instant>>, idle_timeout: Duration) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if last_read_at.lock().elapsed() >= idle_timeout {
            return;
        }
    }
}

/// Pumps one direction until EOF or error.
#[allow(clippy::too_many_arguments)]
async fn relay_direction(
    ctx: &ConnCtx,
    name: &'static str,
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    direction: Direction,
    limiter: Arc<TrafficLimiter>,
    last_read_at: Arc<Mutex<Instant>>,
    io_chunk_size: usize,
    io_chunk_count: usize,
) -> DirectionEnd {
    // The buffer ring: free buffers circulate through `pool`, filled ones
    // through `filled`. Channel capacities bound the ring to
    // io_chunk_count buffers with no extra copies.
    let (pool_tx, mut pool_rx) = mpsc::channel::<Vec<u8>>(io_chunk_count);
    let (filled_tx, mut filled_rx) = mpsc::channel::<(Vec<u8>, usize)>(io_chunk_count);
    for _ in 0..io_chunk_count {
        pool_tx
            .try_send(vec![0u8; io_chunk_size])
            .expect("pool channel has exactly io_chunk_count slots");
    }

    let reader = async move {
        loop {
            let Some(mut buffer) = pool_rx.recv().await else {
                // The writer is gone; its error is the one to report.
                return Ok(());
            };

            // A zero reservation means the traffic limit of this turn is
            // exceeded; reserve() parks until the next turn.
            let reservation = limiter.reserve(direction, io_chunk_size).await;

            let read_result = read_half.read(&mut buffer[..reservation.capacity]).await;
            limiter.release_reserved_capacity(
                direction,
                reservation,
                *read_result.as_ref().unwrap_or(&0),
            );

            match read_result {
                Ok(0) => {
                    trace!(connection = %ctx.long_id(), from = name, "EOF");
                    return Ok(());
                }
                Ok(n) => {
                    *last_read_at.lock() = Instant::now();
                    if filled_tx.send((buffer, n)).await.is_err() {
                        return Ok(());
                    }
                }
                Err(error) => {
                    warn!(
                        connection = %ctx.long_id(),
                        from = name,
                        %error,
                        "error reading data"
                    );
                    return Err(RemoveReason::IoError);
                }
            }
        }
    };

    let writer = async move {
        while let Some((buffer, n)) = filled_rx.recv().await {
            if let Err(error) = write_half.write_all(&buffer[..n]).await {
                warn!(
                    connection = %ctx.long_id(),
                    to = name,
                    %error,
                    "error writing data"
                );
                return Err(RemoveReason::IoError);
            }
            if pool_tx.send(buffer).await.is_err() {
                return Ok(());
            }
        }
        // Reader hit EOF and every queued buffer has been written;
        // pass the FIN on to the opposite side.
        let _ = write_half.shutdown().await;
        Ok(())
    };

    // The reader ends the loop by dropping `filled_tx` on EOF, which lets
    // the writer drain and finish. `try_join` keeps the drain running
    // after the reader is done, but aborts the still-pending side as soon
    // as either one fails.
    match tokio::try_join!(reader, writer) {
        Ok(((), ())) => DirectionEnd::Completed,
        Err(reason) => DirectionEnd::Failed(reason),
    }
}
