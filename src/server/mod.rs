//! The master coordinator server.
//!
//! [`MasterServer`] owns the whole coordination stack: it binds the
//! listening socket, wires up the shared tables, spawns the arbiter and
//! failure-detector tasks, and accepts peer connections. All shared
//! state is explicitly owned here and handed to components by `Arc`;
//! lifecycle is bound to this object, not to process-global statics.
//!
//! # Example
//! ```rust,no_run
//! use gridmaster::cluster::CoordinatorConfig;
//! use gridmaster::server::MasterServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = MasterServer::bind("0.0.0.0:35565", CoordinatorConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

mod connection;
mod registry;

pub use connection::{Connector, LinkState};
pub use registry::{ConnectionRegistry, SessionHandle};

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{
    Arbiter, ArbiterHandle, CoordinatorConfig, FailureDetector, FailureDetectorConfig,
    LeastLoadedPlacement, LoadTable, OwnershipTable, Placement, Router,
};
use crate::error::{Error, Result};

/// Shared dependencies handed to every connection task.
pub(crate) struct MasterContext {
    pub(crate) config: CoordinatorConfig,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) detector: Arc<FailureDetector>,
    pub(crate) arbiter: ArbiterHandle,
    pub(crate) router: Arc<Router>,
}

/// The coordinator process: listener, shared tables, and background
/// tasks, with graceful shutdown support.
pub struct MasterServer {
    listener: TcpListener,
    ctx: Arc<MasterContext>,
    table: Arc<OwnershipTable>,
    loads: Arc<LoadTable>,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl MasterServer {
    /// Bind the coordinator with the default least-loaded placement.
    pub async fn bind(addr: &str, config: CoordinatorConfig) -> Result<Self> {
        Self::bind_with(addr, config, None).await
    }

    /// Bind the coordinator with a custom placement collaborator.
    pub async fn bind_with_placement(
        addr: &str,
        config: CoordinatorConfig,
        placement: Arc<dyn Placement>,
    ) -> Result<Self> {
        Self::bind_with(addr, config, Some(placement)).await
    }

    async fn bind_with(
        addr: &str,
        config: CoordinatorConfig,
        placement: Option<Arc<dyn Placement>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        let table = Arc::new(OwnershipTable::new());
        let loads = Arc::new(LoadTable::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let detector = Arc::new(FailureDetector::new(FailureDetectorConfig::from_coordinator(
            &config,
        )));
        let placement = placement
            .unwrap_or_else(|| Arc::new(LeastLoadedPlacement::new(loads.clone(), table.clone())));

        let (arbiter, arbiter_task) = Arbiter::spawn(
            table.clone(),
            registry.clone(),
            loads.clone(),
            placement,
            config.clone(),
        );

        let router = Arc::new(Router::new(
            table.clone(),
            registry.clone(),
            loads.clone(),
            detector.clone(),
            arbiter.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let detector_task = spawn_detector_loop(
            detector.clone(),
            registry.clone(),
            arbiter.clone(),
            config.check_interval,
            shutdown_tx.subscribe(),
        );

        info!(
            addr = %addr,
            heartbeat_ms = config.heartbeat_interval.as_millis(),
            detection_ms = config.detection_time().as_millis(),
            "Coordinator listening"
        );

        let ctx = Arc::new(MasterContext {
            config,
            registry,
            detector,
            arbiter,
            router,
        });

        Ok(Self {
            listener,
            ctx,
            table,
            loads,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
            background_tasks: vec![arbiter_task, detector_task],
        })
    }

    /// Handle for submitting ownership commands.
    pub fn arbiter(&self) -> ArbiterHandle {
        self.ctx.arbiter.clone()
    }

    /// The authoritative region ownership table (read-only access).
    pub fn ownership(&self) -> Arc<OwnershipTable> {
        self.table.clone()
    }

    /// The live membership table.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.ctx.registry.clone()
    }

    /// Per-server load state.
    pub fn loads(&self) -> Arc<LoadTable> {
        self.loads.clone()
    }

    /// The local address the coordinator is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::from)
    }

    /// The number of currently served connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Signal the accept loop and background tasks to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Shutdown signal sent");
    }

    /// Shut down and wait for connections to drain, up to `timeout`.
    ///
    /// Returns `true` if all connections drained in time.
    pub async fn shutdown_and_wait(&self, timeout: std::time::Duration) -> bool {
        self.shutdown();

        let start = tokio::time::Instant::now();
        let check_interval = std::time::Duration::from_millis(100);

        while start.elapsed() < timeout {
            if self.active_connections.load(Ordering::SeqCst) == 0 {
                info!("All connections drained");
                return true;
            }
            tokio::time::sleep(check_interval).await;
        }

        warn!(
            remaining = self.active_connections.load(Ordering::SeqCst),
            "Shutdown timeout, connections still active"
        );
        false
    }

    /// Accept and serve peer connections until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Coordinator shutting down, no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let max = self.ctx.config.max_total_connections;
                    if max > 0 && self.active_connections.load(Ordering::SeqCst) >= max {
                        warn!(%remote_addr, max, "Rejecting connection, at capacity");
                        drop(stream);
                        continue;
                    }

                    debug!(%remote_addr, "Accepted connection");
                    let ctx = self.ctx.clone();
                    let counter = self.active_connections.clone();
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        connection::serve(stream, remote_addr, ctx).await;
                        counter.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }
    }
}

impl Drop for MasterServer {
    fn drop(&mut self) {
        for task in &self.background_tasks {
            task.abort();
        }
    }
}

/// Periodic liveness scan feeding loss events into the arbiter.
fn spawn_detector_loop(
    detector: Arc<FailureDetector>,
    registry: Arc<ConnectionRegistry>,
    arbiter: ArbiterHandle,
    check_interval: std::time::Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = ticker.tick() => {
                    for event in detector.check() {
                        // Tear the session down before reassigning, so the
                        // dead peer cannot receive frames for regions it
                        // no longer owns.
                        if let Some(handle) = registry.get(&event.identity) {
                            if handle.epoch() == event.epoch {
                                handle.close();
                                registry.remove(&event.identity, event.epoch);
                            }
                        }
                        arbiter.member_lost(event.identity, event.epoch).await;
                    }
                }
            }
        }
    })
}
