//! TCP transport for the Concord cluster network.
//!
//! Links are simplex: this node dials every configured peer and writes
//! frames on the outbound connection, while the listener accepts inbound
//! connections and reads frames. Frames are a big-endian u32 length prefix
//! followed by the binary-encoded `ProtocolMessage`. Outbound connections
//! reconnect with exponential backoff; send failures are logged and
//! dropped, matching the best-effort delivery contract.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use concord_core::messages::{MessageBody, ProtocolMessage};
use concord_core::wire::{BinaryCodec, WireCodec};
use concord_core::{ClusterNetwork, ConsensusError, NodeId, Result};

/// Reconnect backoff for outbound links.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Configuration for the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpNetworkConfig {
    /// Local listener address; port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Known peer addresses. Membership is static per run.
    pub peer_addresses: HashMap<NodeId, SocketAddr>,
    pub connection_timeout: Duration,
    pub max_message_size: usize,
    pub retry: RetryConfig,
}

impl Default for TcpNetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().expect("valid loopback address"),
            peer_addresses: HashMap::new(),
            connection_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024,
            retry: RetryConfig::default(),
        }
    }
}

struct PeerLink {
    addr: SocketAddr,
    outbound_tx: mpsc::UnboundedSender<ProtocolMessage>,
    writer: JoinHandle<()>,
}

/// TCP implementation of `ClusterNetwork`.
pub struct TcpClusterNetwork {
    node_id: NodeId,
    config: TcpNetworkConfig,
    codec: BinaryCodec,
    local_addr: SocketAddr,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    peers: Arc<RwLock<HashMap<NodeId, PeerLink>>>,
    /// Dispatcher channel for protocol traffic (votes, proposals, ...).
    inbound_tx: mpsc::UnboundedSender<ProtocolMessage>,
    /// Pong arrivals for the liveness detector.
    liveness_tx: Option<mpsc::UnboundedSender<NodeId>>,
    running: AtomicBool,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Back-reference for spawning tasks from trait methods.
    self_ref: Weak<Self>,
}

impl TcpClusterNetwork {
    /// Binds the listener and prepares the transport. `start` spawns the
    /// accept loop and the outbound links.
    pub async fn bind(
        node_id: NodeId,
        config: TcpNetworkConfig,
        inbound_tx: mpsc::UnboundedSender<ProtocolMessage>,
        liveness_tx: Option<mpsc::UnboundedSender<NodeId>>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("node {} listening on {}", node_id, local_addr);

        Ok(Arc::new_cyclic(|weak| Self {
            node_id,
            config,
            codec: BinaryCodec,
            local_addr,
            listener: parking_lot::Mutex::new(Some(listener)),
            peers: Arc::new(RwLock::new(HashMap::new())),
            inbound_tx,
            liveness_tx,
            running: AtomicBool::new(false),
            accept_task: parking_lot::Mutex::new(None),
            self_ref: weak.clone(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Adds a peer link and spawns its writer. Used at startup for every
    /// configured peer and by `connect` for late administrative additions.
    pub fn register_peer(self: &Arc<Self>, node_id: NodeId, addr: SocketAddr) {
        if node_id == self.node_id {
            return;
        }
        let mut peers = self.peers.write();
        if peers.contains_key(&node_id) {
            return;
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(Self::writer_loop(
            Arc::clone(self),
            node_id,
            addr,
            outbound_rx,
        ));
        peers.insert(
            node_id,
            PeerLink {
                addr,
                outbound_tx,
                writer,
            },
        );
        debug!("registered peer {} at {}", node_id, addr);
    }

    /// Drains the outbound queue onto a (re)connecting TCP stream.
    async fn writer_loop(
        net: Arc<Self>,
        peer: NodeId,
        addr: SocketAddr,
        mut outbound_rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    ) {
        let mut delay = net.config.retry.base_delay;
        loop {
            let stream = match timeout(net.config.connection_timeout, TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("connect to {} ({}) failed: {}", peer, addr, e);
                    sleep(delay).await;
                    delay = next_delay(delay, &net.config.retry);
                    continue;
                }
                Err(_) => {
                    debug!("connect to {} ({}) timed out", peer, addr);
                    sleep(delay).await;
                    delay = next_delay(delay, &net.config.retry);
                    continue;
                }
            };
            debug!("outbound link to {} established", peer);
            delay = net.config.retry.base_delay;

            let mut stream = stream;
            loop {
                let Some(message) = outbound_rx.recv().await else {
                    // Peer disconnected administratively.
                    return;
                };
                let frame = match net.encode_frame(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("dropping unencodable message to {}: {}", peer, e);
                        continue;
                    }
                };
                if let Err(e) = stream.write_all(&frame).await {
                    debug!("link to {} broke: {}; reconnecting", peer, e);
                    break;
                }
            }
        }
    }

    fn encode_frame(&self, message: &ProtocolMessage) -> Result<BytesMut> {
        let payload = self.codec.encode(message)?;
        if payload.len() > self.config.max_message_size {
            return Err(ConsensusError::network(format!(
                "message of {} bytes exceeds limit",
                payload.len()
            )));
        }
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        Ok(frame)
    }

    /// Accepts inbound connections and spawns a reader per connection.
    async fn accept_loop(net: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!("inbound connection from {}", remote);
                    tokio::spawn(Self::reader_loop(Arc::clone(&net), stream));
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn reader_loop(net: Arc<Self>, mut stream: TcpStream) {
        loop {
            let len = match stream.read_u32().await {
                Ok(len) => len as usize,
                Err(_) => return,
            };
            if len > net.config.max_message_size {
                warn!("dropping oversized frame of {} bytes", len);
                return;
            }
            let mut payload = vec![0u8; len];
            if stream.read_exact(&mut payload).await.is_err() {
                return;
            }
            match net.codec.decode::<ProtocolMessage>(&payload) {
                Ok(message) => net.dispatch(message).await,
                Err(e) => warn!("dropping undecodable frame: {}", e),
            }
        }
    }

    /// Routes one inbound message: pings are answered here, pongs feed the
    /// liveness detector, everything else goes to the dispatcher.
    async fn dispatch(&self, message: ProtocolMessage) {
        match &message.body {
            MessageBody::Ping(ping) => {
                let pong = ProtocolMessage::pong(self.node_id, ping.nonce);
                self.send_to(ping.node_id, pong).await;
            }
            MessageBody::Pong(pong) => {
                if let Some(liveness) = &self.liveness_tx {
                    let _ = liveness.send(pong.node_id);
                }
            }
            _ => {
                if self.inbound_tx.send(message).is_err() {
                    debug!("dispatcher gone; dropping inbound message");
                }
            }
        }
    }
}

fn next_delay(current: Duration, retry: &RetryConfig) -> Duration {
    let next = current.mul_f64(retry.backoff_multiplier);
    next.min(retry.max_delay)
}

#[async_trait]
impl ClusterNetwork for TcpClusterNetwork {
    async fn send_to(&self, target: NodeId, message: ProtocolMessage) {
        let peers = self.peers.read();
        match peers.get(&target) {
            Some(link) => {
                if link.outbound_tx.send(message).is_err() {
                    debug!("outbound queue for {} closed; message dropped", target);
                }
            }
            None => debug!("no link to {}; message dropped", target),
        }
    }

    async fn broadcast(&self, message: ProtocolMessage) {
        let peers = self.peers.read();
        for (peer, link) in peers.iter() {
            if link.outbound_tx.send(message.clone()).is_err() {
                debug!("outbound queue for {} closed; message dropped", peer);
            }
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<()> {
        // Static membership: the address must belong to a configured peer.
        let node_id = self
            .config
            .peer_addresses
            .iter()
            .find(|(_, peer_addr)| **peer_addr == addr)
            .map(|(node_id, _)| *node_id)
            .ok_or_else(|| {
                ConsensusError::invalid_config(format!("no configured peer at {}", addr))
            })?;
        let net = self
            .self_ref
            .upgrade()
            .ok_or_else(|| ConsensusError::internal("transport dropped"))?;
        net.register_peer(node_id, addr);
        Ok(())
    }

    async fn disconnect(&self, node_id: NodeId) -> Result<()> {
        let mut peers = self.peers.write();
        match peers.remove(&node_id) {
            Some(link) => {
                link.writer.abort();
                info!("disconnected peer {} at {}", node_id, link.addr);
                Ok(())
            }
            None => Err(ConsensusError::NodeNotFound { node_id }),
        }
    }

    async fn list_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.peers.read().keys().copied().collect();
        nodes.sort();
        nodes
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let net = self
            .self_ref
            .upgrade()
            .ok_or_else(|| ConsensusError::internal("transport dropped"))?;
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| ConsensusError::internal("transport already consumed its listener"))?;

        *self.accept_task.lock() = Some(tokio::spawn(Self::accept_loop(
            Arc::clone(&net),
            listener,
        )));
        for (node_id, addr) in self.config.peer_addresses.clone() {
            net.register_peer(node_id, addr);
        }
        info!("tcp transport for node {} started", self.node_id);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let mut peers = self.peers.write();
        for (_, link) in peers.drain() {
            link.writer.abort();
        }
        info!("tcp transport for node {} stopped", self.node_id);
        Ok(())
    }
}
