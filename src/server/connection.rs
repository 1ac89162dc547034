//! Peer connection handling.
//!
//! Each accepted socket becomes at most one session: the peer's first
//! frame must be a Join declaring its identity, and admission fails if a
//! live session already exists for that identity (the old session is
//! kept, the new socket is closed).
//!
//! A live session runs two tasks: the read loop (this module's
//! [`serve`]) decoding frames and handing them to the router, and a
//! writer task draining the outbound queue while interleaving periodic
//! heartbeats. Teardown funnels through the failure detector's
//! epoch-checked disconnect path, so a loss is reported at most once no
//! matter which side notices first.
//!
//! [`Connector`] is the outbound side: an explicit
//! `Disconnected -> Connecting -> Handshaking -> Live` state machine
//! with capped exponential backoff, used by simulation servers dialing
//! the master (and by tests standing in for them).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterError, ClusterResult};
use crate::error::{Error, Result};
use crate::metrics;
use crate::protocol::{Frame, Message, decode_frame};
use crate::types::{LoadReport, ServerId};

use super::MasterContext;
use super::registry::SessionHandle;

/// Serve one accepted socket for its whole lifetime.
///
/// Returns once the session ends, for any reason; all errors are
/// connection-local and never propagate beyond the session.
pub(crate) async fn serve(stream: TcpStream, remote_addr: SocketAddr, ctx: Arc<MasterContext>) {
    let (mut read_half, write_half) = stream.into_split();

    // Handshake: the first complete frame must be a Join.
    let mut buf = BytesMut::with_capacity(4096);
    let join = match timeout(
        ctx.config.handshake_timeout,
        read_one_frame(&mut read_half, &mut buf, ctx.config.max_frame_size),
    )
    .await
    {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            debug!(%remote_addr, error = %e, "Connection closed before handshake");
            return;
        }
        Err(_) => {
            warn!(%remote_addr, "Handshake timed out");
            metrics::HANDSHAKES_REJECTED.inc();
            return;
        }
    };

    let (identity, address) = match join.message {
        Message::Join { identity, address } => (identity, address),
        other => {
            warn!(
                %remote_addr,
                kind = %other.kind(),
                "First frame was not a Join, rejecting connection"
            );
            metrics::HANDSHAKES_REJECTED.inc();
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(ctx.config.outbound_queue_depth);
    let handle = match ctx
        .registry
        .admit(identity.clone(), address, remote_addr, outbound_tx)
    {
        Ok(handle) => handle,
        Err(e) => {
            // Duplicate identity: keep the existing session, drop this one.
            warn!(%remote_addr, error = %e, "Handshake rejected");
            return;
        }
    };

    let epoch = handle.epoch();
    ctx.detector.register(&identity, epoch);
    if let Err(e) = ctx.arbiter.admit(identity.clone()).await {
        warn!(%identity, error = %e, "Admission failed, closing session");
        ctx.registry.remove(&identity, epoch);
        ctx.detector.unregister(&identity, epoch);
        return;
    }
    info!(%identity, %epoch, %remote_addr, "Peer connected");

    let writer = tokio::spawn(write_loop(
        write_half,
        outbound_rx,
        handle.clone(),
        ctx.clone(),
    ));

    // Read loop: decode frames and dispatch until the stream ends or the
    // session is asked to close.
    let reason = read_loop(&mut read_half, &mut buf, &identity, &handle, &ctx).await;

    writer.abort();
    ctx.registry.remove(&identity, epoch);
    match reason {
        SessionEnd::Graceful => {
            info!(%identity, %epoch, "Peer session closed");
        }
        SessionEnd::Lost(error) => {
            debug!(%identity, %epoch, %error, "Peer connection lost");
            if let Some(event) = ctx.detector.report_disconnect(&identity, epoch) {
                ctx.arbiter.member_lost(event.identity, event.epoch).await;
            }
        }
    }
}

enum SessionEnd {
    /// The peer left gracefully or the session was superseded.
    Graceful,
    /// The transport failed or the peer vanished without a Leave.
    Lost(Error),
}

async fn read_loop(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    buf: &mut BytesMut,
    identity: &ServerId,
    handle: &Arc<SessionHandle>,
    ctx: &Arc<MasterContext>,
) -> SessionEnd {
    loop {
        // Drain every complete frame already buffered.
        loop {
            match decode_frame(buf, ctx.config.max_frame_size) {
                Ok(Some(frame)) => {
                    handle.record_received();
                    let leaving = matches!(frame.message, Message::Leave);
                    if let Err(e) = ctx.router.dispatch(identity, frame).await {
                        warn!(%identity, error = %e, "Dispatch failed");
                    }
                    if leaving {
                        return SessionEnd::Graceful;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%identity, error = %e, "Framing violation, closing connection");
                    return SessionEnd::Lost(e);
                }
            }
        }

        tokio::select! {
            read = read_half.read_buf(buf) => match read {
                Ok(0) => {
                    return SessionEnd::Lost(Error::MissingData("connection closed".to_owned()));
                }
                Ok(_) => {}
                Err(e) => return SessionEnd::Lost(e.into()),
            },
            _ = handle.closed() => return SessionEnd::Graceful,
        }
    }
}

/// Drain the outbound queue and interleave periodic heartbeats.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Frame>,
    handle: Arc<SessionHandle>,
    ctx: Arc<MasterContext>,
) {
    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
            _ = heartbeat.tick() => Frame::heartbeat(LoadReport::default()),
        };

        match frame.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!(identity = %handle.identity(), error = %e, "Write failed");
                    handle.close();
                    return;
                }
                handle.record_sent();
            }
            Err(e) => {
                warn!(identity = %handle.identity(), error = %e, "Frame encoding failed");
            }
        }
    }
}

/// Read exactly one complete frame, buffering partial reads.
async fn read_one_frame(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    buf: &mut BytesMut,
    max_frame: usize,
) -> Result<Frame> {
    loop {
        if let Some(frame) = decode_frame(buf, max_frame)? {
            return Ok(frame);
        }
        let n = read_half.read_buf(buf).await?;
        if n == 0 {
            return Err(Error::MissingData("connection closed".to_owned()));
        }
    }
}

/// Lifecycle of an outbound link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No transport; waiting to dial or out of attempts.
    Disconnected,
    /// TCP connect in flight.
    Connecting,
    /// Transport up, Join not yet sent.
    Handshaking,
    /// Handshake sent; the link carries traffic.
    Live,
}

/// Outbound dialer with an explicit reconnect state machine.
///
/// Simulation servers use this to reach the master: dial, declare
/// identity, and on failure retry with capped exponential backoff and
/// jitter. After the configured attempt budget the connector stops and
/// surfaces [`ClusterError::PermanentLoss`] instead of retrying forever.
pub struct Connector {
    master_addr: String,
    identity: ServerId,
    advertised_addr: String,
    reconnect: crate::cluster::ReconnectConfig,
    state: Mutex<LinkState>,
}

impl Connector {
    pub fn new(
        master_addr: impl Into<String>,
        identity: ServerId,
        advertised_addr: impl Into<String>,
        reconnect: crate::cluster::ReconnectConfig,
    ) -> Self {
        Self {
            master_addr: master_addr.into(),
            identity,
            advertised_addr: advertised_addr.into(),
            reconnect,
            state: Mutex::new(LinkState::Disconnected),
        }
    }

    /// The link's current lifecycle state.
    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: LinkState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
        debug!(identity = %self.identity, state = ?next, "Link state changed");
    }

    /// Dial the master, handshake, and return the live stream.
    ///
    /// Retries transport failures with exponential backoff until the
    /// attempt budget is exhausted, then reports `PermanentLoss`.
    pub async fn connect(&self) -> ClusterResult<TcpStream> {
        let mut delays = ExponentialBuilder::default()
            .with_min_delay(self.reconnect.min_delay)
            .with_max_delay(self.reconnect.max_delay)
            .with_max_times(self.reconnect.max_attempts)
            .with_jitter()
            .build();

        let mut attempts = 0usize;
        loop {
            attempts += 1;
            match self.try_connect().await {
                Ok(stream) => {
                    self.set_state(LinkState::Live);
                    return Ok(stream);
                }
                Err(e) => {
                    self.set_state(LinkState::Disconnected);
                    match delays.next() {
                        Some(delay) => {
                            debug!(
                                identity = %self.identity,
                                attempt = attempts,
                                delay_ms = delay.as_millis(),
                                error = %e,
                                "Connect failed, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(
                                identity = %self.identity,
                                attempts,
                                "Reconnect budget exhausted"
                            );
                            return Err(ClusterError::PermanentLoss {
                                identity: self.identity.clone(),
                                attempts,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<TcpStream> {
        self.set_state(LinkState::Connecting);
        let mut stream = TcpStream::connect(&self.master_addr).await?;

        self.set_state(LinkState::Handshaking);
        let join = Frame::new(
            crate::types::Generation::INITIAL,
            Message::Join {
                identity: self.identity.clone(),
                address: self.advertised_addr.clone(),
            },
        );
        stream.write_all(&join.to_bytes()?).await?;
        Ok(stream)
    }
}
