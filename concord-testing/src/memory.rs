//! In-memory cluster network with fault injection.
//!
//! A central router owns one port per node and delivers messages
//! synchronously, applying crash and drop rules on the way. Ping/pong is
//! handled at delivery, mirroring the TCP transport: pings are answered
//! for the receiver and pongs feed its liveness channel.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use concord_core::messages::{MessageBody, ProtocolMessage};
use concord_core::{ClusterNetwork, NodeId, Result};

/// Wire message categories, for selective drop rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Proposal,
    Round1Vote,
    Round2Vote,
    Decision,
    BatchFetchRequest,
    BatchFetchResponse,
    Ping,
    Pong,
}

fn kind_of(body: &MessageBody) -> MessageKind {
    match body {
        MessageBody::Proposal(_) => MessageKind::Proposal,
        MessageBody::Round1Vote(_) => MessageKind::Round1Vote,
        MessageBody::Round2Vote(_) => MessageKind::Round2Vote,
        MessageBody::Decision(_) => MessageKind::Decision,
        MessageBody::BatchFetchRequest(_) => MessageKind::BatchFetchRequest,
        MessageBody::BatchFetchResponse(_) => MessageKind::BatchFetchResponse,
        MessageBody::Ping(_) => MessageKind::Ping,
        MessageBody::Pong(_) => MessageKind::Pong,
    }
}

/// Drops every matching message. `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct DropRule {
    pub from: Option<NodeId>,
    pub to: Option<NodeId>,
    pub kind: Option<MessageKind>,
}

impl DropRule {
    fn matches(&self, from: NodeId, to: NodeId, message: &ProtocolMessage) -> bool {
        self.from.map_or(true, |f| f == from)
            && self.to.map_or(true, |t| t == to)
            && self.kind.map_or(true, |k| k == kind_of(&message.body))
    }
}

pub type RuleId = u64;

struct Port {
    inbound_tx: mpsc::UnboundedSender<ProtocolMessage>,
    liveness_tx: Option<mpsc::UnboundedSender<NodeId>>,
}

#[derive(Default)]
struct RouterInner {
    ports: RwLock<HashMap<NodeId, Port>>,
    rules: RwLock<Vec<(RuleId, DropRule)>>,
    crashed: RwLock<HashSet<NodeId>>,
    next_rule: AtomicU64,
    dropped: AtomicU64,
}

/// Central message hub shared by all in-memory networks of one test.
#[derive(Clone, Default)]
pub struct InMemoryRouter {
    inner: Arc<RouterInner>,
}

impl InMemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&self, rule: DropRule) -> RuleId {
        let id = self.inner.next_rule.fetch_add(1, Ordering::Relaxed);
        self.inner.rules.write().push((id, rule));
        id
    }

    pub fn remove_rule(&self, id: RuleId) {
        self.inner.rules.write().retain(|(rule_id, _)| *rule_id != id);
    }

    pub fn clear_rules(&self) {
        self.inner.rules.write().clear();
    }

    /// Crashes a node: all its inbound and outbound traffic is dropped.
    pub fn crash(&self, node_id: NodeId) {
        self.inner.crashed.write().insert(node_id);
    }

    pub fn recover(&self, node_id: NodeId) {
        self.inner.crashed.write().remove(&node_id);
    }

    pub fn dropped_messages(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.inner.ports.read().keys().copied().collect();
        nodes.sort();
        nodes
    }

    fn register(
        &self,
        node_id: NodeId,
        inbound_tx: mpsc::UnboundedSender<ProtocolMessage>,
        liveness_tx: Option<mpsc::UnboundedSender<NodeId>>,
    ) {
        self.inner.ports.write().insert(
            node_id,
            Port {
                inbound_tx,
                liveness_tx,
            },
        );
    }

    fn unregister(&self, node_id: NodeId) {
        self.inner.ports.write().remove(&node_id);
    }

    fn route(&self, from: NodeId, to: NodeId, message: ProtocolMessage) {
        {
            let crashed = self.inner.crashed.read();
            if crashed.contains(&from) || crashed.contains(&to) {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        {
            let rules = self.inner.rules.read();
            if rules.iter().any(|(_, rule)| rule.matches(from, to, &message)) {
                debug!("dropping {:?} {} -> {}", kind_of(&message.body), from, to);
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        // Clone the port endpoints and release the lock before acting, so
        // the ping auto-reply can re-enter route().
        let (inbound_tx, liveness_tx) = {
            let ports = self.inner.ports.read();
            let Some(port) = ports.get(&to) else {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            };
            (port.inbound_tx.clone(), port.liveness_tx.clone())
        };

        match &message.body {
            MessageBody::Ping(ping) => {
                let pong = ProtocolMessage::pong(to, ping.nonce);
                self.route(to, ping.node_id, pong);
            }
            MessageBody::Pong(pong) => {
                if let Some(liveness) = liveness_tx {
                    let _ = liveness.send(pong.node_id);
                }
            }
            _ => {
                let _ = inbound_tx.send(message);
            }
        }
    }
}

/// In-memory implementation of `ClusterNetwork` backed by the router.
pub struct InMemoryClusterNetwork {
    node_id: NodeId,
    router: InMemoryRouter,
    started: AtomicBool,
}

impl InMemoryClusterNetwork {
    pub fn new(
        node_id: NodeId,
        router: InMemoryRouter,
        inbound_tx: mpsc::UnboundedSender<ProtocolMessage>,
        liveness_tx: Option<mpsc::UnboundedSender<NodeId>>,
    ) -> Arc<Self> {
        router.register(node_id, inbound_tx, liveness_tx);
        Arc::new(Self {
            node_id,
            router,
            started: AtomicBool::new(true),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

#[async_trait]
impl ClusterNetwork for InMemoryClusterNetwork {
    async fn send_to(&self, target: NodeId, message: ProtocolMessage) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.router.route(self.node_id, target, message);
    }

    async fn broadcast(&self, message: ProtocolMessage) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        for peer in self.router.nodes() {
            if peer != self.node_id {
                self.router.route(self.node_id, peer, message.clone());
            }
        }
    }

    async fn connect(&self, _addr: SocketAddr) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self, node_id: NodeId) -> Result<()> {
        self.router.unregister(node_id);
        Ok(())
    }

    async fn list_nodes(&self) -> Vec<NodeId> {
        self.router
            .nodes()
            .into_iter()
            .filter(|n| *n != self.node_id)
            .collect()
    }

    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::messages::Round1VoteMessage;
    use concord_core::{Phase, Slot, StateValue};

    fn vote(from: NodeId) -> ProtocolMessage {
        ProtocolMessage::round1_vote(
            from,
            Round1VoteMessage {
                slot: Slot::ZERO,
                phase: Phase::ZERO,
                node_id: from,
                value: StateValue::V0,
            },
        )
    }

    #[tokio::test]
    async fn routes_between_registered_nodes() {
        let router = InMemoryRouter::new();
        let a = NodeId::from(1u32);
        let b = NodeId::from(2u32);
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a_net = InMemoryClusterNetwork::new(a, router.clone(), a_tx, None);
        let _b_net = InMemoryClusterNetwork::new(b, router.clone(), b_tx, None);

        a_net.send_to(b, vote(a)).await;
        assert_eq!(b_rx.recv().await.unwrap(), vote(a));
    }

    #[tokio::test]
    async fn drop_rules_filter_selectively() {
        let router = InMemoryRouter::new();
        let a = NodeId::from(1u32);
        let b = NodeId::from(2u32);
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a_net = InMemoryClusterNetwork::new(a, router.clone(), a_tx, None);
        let _b_net = InMemoryClusterNetwork::new(b, router.clone(), b_tx, None);

        let rule = router.add_rule(DropRule {
            from: Some(a),
            to: Some(b),
            kind: Some(MessageKind::Round1Vote),
        });

        a_net.send_to(b, vote(a)).await;
        assert!(b_rx.try_recv().is_err());
        assert_eq!(router.dropped_messages(), 1);

        router.remove_rule(rule);
        a_net.send_to(b, vote(a)).await;
        assert!(b_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn crashed_nodes_are_cut_off_both_ways() {
        let router = InMemoryRouter::new();
        let a = NodeId::from(1u32);
        let b = NodeId::from(2u32);
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a_net = InMemoryClusterNetwork::new(a, router.clone(), a_tx, None);
        let b_net = InMemoryClusterNetwork::new(b, router.clone(), b_tx, None);

        router.crash(b);
        a_net.send_to(b, vote(a)).await;
        b_net.send_to(a, vote(b)).await;
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());

        router.recover(b);
        a_net.send_to(b, vote(a)).await;
        assert!(b_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn ping_is_auto_answered_into_the_liveness_channel() {
        let router = InMemoryRouter::new();
        let a = NodeId::from(1u32);
        let b = NodeId::from(2u32);
        let (a_tx, mut a_in) = mpsc::unbounded_channel();
        let (a_live_tx, mut a_live) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let a_net = InMemoryClusterNetwork::new(a, router.clone(), a_tx, Some(a_live_tx));
        let _b_net = InMemoryClusterNetwork::new(b, router.clone(), b_tx, None);

        a_net.send_to(b, ProtocolMessage::ping(a, 5)).await;
        assert_eq!(a_live.recv().await.unwrap(), b);
        assert!(a_in.try_recv().is_err());
    }
}
