//! Connection handlers for the Canopy server.
//!
//! Every accepted TCP connection becomes a registered node. Packets read from
//! it are routed on the connection's dispatcher task and answered with a
//! Meta ACK or NACK.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Json};
use canopy_core::{DeliveryError, NodeHandle, Router, RouterError, Subscriber};
use canopy_protocol::{NodeId, Packet};
use canopy_transport::{FramedTransport, ListenerEvent, ListenerObserver, TransportConfig};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};

/// Shared server state.
pub struct AppState {
    /// The message router.
    pub router: Arc<Router>,
    /// The broker's own node ID.
    pub server_id: NodeId,
    /// Framing settings for new connections.
    pub transport: TransportConfig,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            router: Arc::new(Router::with_config(config.router_config())),
            server_id: config.server_id(),
            transport: config.transport_config(),
            config,
        }
    }
}

/// Run the broker, the admin endpoint and the sweeper until Ctrl-C.
///
/// # Errors
///
/// Returns an error if a listener cannot be bound.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config));
    let config = &state.config;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    if config.admin.enabled {
        let addr = SocketAddr::new(config.bind_addr()?.ip(), config.admin.port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin endpoint on {addr}"))?;
        info!("Admin endpoint listening on http://{}", addr);
        let app = admin_router(Arc::clone(&state));
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Admin endpoint failed: {}", e);
            }
        });
    }

    if let Some(interval) = config.sweep_interval() {
        tokio::spawn(sweep_loop(
            Arc::clone(&state.router),
            interval,
            shutdown_rx.clone(),
        ));
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Canopy broker listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutting down");
        let _ = shutdown_tx.send(true);
    });

    serve(listener, Arc::clone(&state), shutdown_rx).await
}

/// Accept connections until shutdown is signalled.
///
/// # Errors
///
/// Returns an error if accepting fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("Failed to accept connection")?;
                let state = Arc::clone(&state);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, state, shutdown).await {
                        warn!(peer = %peer, error = %e, "Connection setup failed");
                        metrics::record_error("connection");
                    }
                });
            }
        }
    }
    Ok(())
}

/// Build the admin HTTP router.
pub fn admin_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Router statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "stats": state.router.stats(),
        "channels": state.router.channel_names(),
    }))
}

async fn sweep_loop(
    router: Arc<Router>,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let removed = router.sweep_empty_channels();
                if removed > 0 {
                    debug!(removed, "Swept empty channels");
                }
                metrics::set_active_channels(router.stats().channel_count);
            }
        }
    }
}

/// The router's view of a connected peer.
struct RemoteNode {
    id: NodeId,
    transport: Arc<FramedTransport>,
}

impl Subscriber for RemoteNode {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn deliver(&self, packet: Arc<Packet>) -> Result<(), DeliveryError> {
        let kind = packet.kind();
        self.transport
            .send(packet)
            .map_err(|_| DeliveryError::Closed(self.id.clone()))?;
        metrics::record_packet(kind, "outbound");
        Ok(())
    }
}

/// Handles the events of one connection.
struct Session {
    router: Arc<Router>,
    node: NodeHandle,
    server_id: NodeId,
    transport: Weak<FramedTransport>,
    closed: Mutex<Option<oneshot::Sender<()>>>,
}

impl Session {
    fn reply(&self, packet: Packet) {
        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        let kind = packet.kind();
        if transport.send(packet).is_ok() {
            metrics::record_packet(kind, "outbound");
        }
    }

    fn route(&self, packet: &Arc<Packet>) -> Result<(), RouterError> {
        match packet.as_ref() {
            Packet::Message { .. } => {
                let start = Instant::now();
                let count = self.router.submit(&self.node, Arc::clone(packet))?;
                metrics::record_route_time(start.elapsed().as_secs_f64());
                metrics::record_deliveries(count);
                trace!(node = %self.node.id(), recipients = count, "Routed");
            }
            Packet::Subscribe { channel, .. } => {
                self.router.subscribe(&self.node, Some(channel))?;
                metrics::record_subscription();
                metrics::set_active_channels(self.router.stats().channel_count);
            }
            Packet::Unsubscribe { channel, .. } => {
                self.router.unsubscribe(&self.node, Some(channel))?;
                metrics::set_active_channels(self.router.stats().channel_count);
            }
            Packet::Meta { .. } | Packet::Error { .. } => {}
        }
        Ok(())
    }

    fn close(&self) {
        if let Some(closed) = self.closed.lock().ok().and_then(|mut c| c.take()) {
            let _ = closed.send(());
        }
    }
}

impl ListenerObserver for Session {
    fn on_event(&self, event: &ListenerEvent) {
        if let Some(packet) = event.packet() {
            metrics::record_packet(packet.kind(), "inbound");
        }

        match event {
            ListenerEvent::Message(packet) => match self.route(packet) {
                Ok(()) => self.reply(Packet::ack(self.server_id.clone(), Some(packet.id()), true)),
                Err(e) => {
                    debug!(node = %self.node.id(), error = %e, "Request rejected");
                    metrics::record_error("rejected");
                    self.reply(Packet::error(self.server_id.clone(), false, Some(e.to_string())));
                    self.reply(Packet::ack(self.server_id.clone(), Some(packet.id()), false));
                }
            },
            ListenerEvent::Meta(packet) => {
                trace!(node = %self.node.id(), packet = packet.id(), "Meta from peer");
            }
            ListenerEvent::Error(packet) => {
                if let Packet::Error {
                    exception,
                    diagnostic,
                    ..
                } = packet.as_ref()
                {
                    warn!(
                        node = %self.node.id(),
                        exception,
                        diagnostic = diagnostic.as_deref().unwrap_or(""),
                        "Peer reported an error"
                    );
                }
            }
            ListenerEvent::InvalidData(e) => {
                warn!(node = %self.node.id(), error = %e, "Invalid data, requesting resend");
                metrics::record_invalid_frame();
                self.reply(Packet::resend(self.server_id.clone()));
            }
            ListenerEvent::Null => {}
            ListenerEvent::Exception(e) => {
                debug!(node = %self.node.id(), error = %e, "Connection ended");
                self.close();
            }
        }
    }
}

/// Serve one connection until it closes or the server shuts down.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let _metrics_guard = ConnectionMetricsGuard::new();
    stream.set_nodelay(true)?;

    let transport = Arc::new(FramedTransport::new(stream, &state.transport)?);
    let id = NodeId::generate();
    let node = NodeHandle::from_subscriber(RemoteNode {
        id: id.clone(),
        transport: Arc::clone(&transport),
    });

    let (closed_tx, closed_rx) = oneshot::channel();
    let observer = transport.add_observer(Session {
        router: Arc::clone(&state.router),
        node: node.clone(),
        server_id: state.server_id.clone(),
        transport: Arc::downgrade(&transport),
        closed: Mutex::new(Some(closed_tx)),
    });

    if !state.router.register(node.clone()) {
        transport.remove_observer(observer);
        transport.stop().await;
        anyhow::bail!("node {id} is already registered");
    }
    if let Err(e) = transport.start().await {
        state.router.unregister(&node);
        return Err(e.into());
    }
    debug!(node = %id, peer = %peer, "Connection opened");

    tokio::select! {
        _ = closed_rx => {}
        _ = shutdown.changed() => {}
    }

    state.router.unregister(&node);
    transport.remove_observer(observer);
    transport.stop().await;
    metrics::set_active_channels(state.router.stats().channel_count);
    debug!(node = %id, peer = %peer, "Connection closed");
    Ok(())
}
