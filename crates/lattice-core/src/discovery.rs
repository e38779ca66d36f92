//! Cluster membership: who is up, who went away.
//!
//! One actor owns the membership table. Members appear on first contact
//! (explicit registration or any heartbeat) and are pruned by a periodic
//! sweep when their `last_seen` goes stale. Subscribers get `Up`/`Down`
//! events in the order the actor processes them; a subscriber whose
//! receiver is gone is pruned silently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::DiscoveryConfig;
use crate::node_id::NodeId;
use crate::supervision::{RestartIntensity, supervise};

/// Membership change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Up { node: NodeId, at: DateTime<Utc> },
    Down { node: NodeId, at: DateTime<Utc> },
}

impl MembershipEvent {
    pub fn node(&self) -> &NodeId {
        match self {
            Self::Up { node, .. } | Self::Down { node, .. } => node,
        }
    }

    pub fn is_down(&self) -> bool {
        matches!(self, Self::Down { .. })
    }
}

enum DiscoveryMsg {
    Register {
        node: NodeId,
        reply: oneshot::Sender<()>,
    },
    Heartbeat {
        node: NodeId,
        at: DateTime<Utc>,
    },
    ListUp {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    Subscribe {
        sink: mpsc::Sender<MembershipEvent>,
    },
    /// Node-down signal from the transport layer; equivalent to a missed
    /// heartbeat timeout.
    TransportDown {
        node: NodeId,
    },
    Sweep,
}

struct State {
    members: HashMap<NodeId, DateTime<Utc>>,
    subscribers: Vec<mpsc::Sender<MembershipEvent>>,
}

/// Handle to the membership actor. Cheap to clone.
#[derive(Clone)]
pub struct Discovery {
    tx: mpsc::Sender<DiscoveryMsg>,
}

impl Discovery {
    /// Spawn the membership actor and its sweep ticker.
    pub fn spawn(config: &DiscoveryConfig, intensity: RestartIntensity) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let state = Arc::new(Mutex::new(State {
            members: HashMap::new(),
            subscribers: Vec::new(),
        }));
        let cleanup_interval = config.cleanup_interval();

        let tick_tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the immediate first tick
            loop {
                ticker.tick().await;
                if tick_tx.send(DiscoveryMsg::Sweep).await.is_err() {
                    return;
                }
            }
        });

        supervise("discovery", intensity, move |_generation| {
            let rx = Arc::clone(&rx);
            let state = Arc::clone(&state);
            tokio::spawn(run(rx, state, cleanup_interval))
        });

        Self { tx }
    }

    /// Mark a node up with `last_seen = now`.
    pub async fn register(&self, node: NodeId) {
        let (reply, ack) = oneshot::channel();
        if self
            .tx
            .send(DiscoveryMsg::Register { node, reply })
            .await
            .is_ok()
        {
            let _ = ack.await;
        }
    }

    /// Refresh a node's `last_seen`, registering it on first contact.
    pub async fn heartbeat(&self, node: NodeId, at: DateTime<Utc>) {
        let _ = self.tx.send(DiscoveryMsg::Heartbeat { node, at }).await;
    }

    /// Snapshot of the current up set.
    pub async fn list_up(&self) -> Vec<NodeId> {
        let (reply, response) = oneshot::channel();
        if self.tx.send(DiscoveryMsg::ListUp { reply }).await.is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Register an event sink. Dropped receivers are pruned silently.
    pub async fn subscribe(&self, sink: mpsc::Sender<MembershipEvent>) {
        let _ = self.tx.send(DiscoveryMsg::Subscribe { sink }).await;
    }

    /// Convenience subscription as a stream.
    pub async fn watch(&self) -> ReceiverStream<MembershipEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribe(tx).await;
        ReceiverStream::new(rx)
    }

    /// Fold a transport-level node-down signal into membership.
    pub async fn transport_down(&self, node: NodeId) {
        let _ = self.tx.send(DiscoveryMsg::TransportDown { node }).await;
    }
}

async fn run(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DiscoveryMsg>>>,
    state: Arc<Mutex<State>>,
    cleanup_interval: Duration,
) {
    loop {
        let msg = { rx.lock().await.recv().await };
        let Some(msg) = msg else { return };

        match msg {
            DiscoveryMsg::Register { node, reply } => {
                touch(&state, node, Utc::now()).await;
                let _ = reply.send(());
            }
            DiscoveryMsg::Heartbeat { node, at } => {
                touch(&state, node, at).await;
            }
            DiscoveryMsg::ListUp { reply } => {
                let mut up: Vec<NodeId> = lock(&state).members.keys().cloned().collect();
                up.sort();
                let _ = reply.send(up);
            }
            DiscoveryMsg::Subscribe { sink } => {
                lock(&state).subscribers.push(sink);
            }
            DiscoveryMsg::TransportDown { node } => {
                let removed = lock(&state).members.remove(&node).is_some();
                if removed {
                    tracing::info!(node = %node, "node down (transport signal)");
                    emit(
                        &state,
                        MembershipEvent::Down {
                            node,
                            at: Utc::now(),
                        },
                    )
                    .await;
                }
            }
            DiscoveryMsg::Sweep => {
                let now = Utc::now();
                let max_age = chrono::Duration::from_std(cleanup_interval)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
                let stale: Vec<NodeId> = lock(&state)
                    .members
                    .iter()
                    .filter(|(_, last_seen)| now - **last_seen > max_age)
                    .map(|(node, _)| node.clone())
                    .collect();

                for node in stale {
                    lock(&state).members.remove(&node);
                    tracing::info!(node = %node, "node down (heartbeat timeout)");
                    emit(&state, MembershipEvent::Down { node, at: now }).await;
                }
            }
        }
    }
}

fn lock(state: &Arc<Mutex<State>>) -> std::sync::MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

async fn touch(state: &Arc<Mutex<State>>, node: NodeId, at: DateTime<Utc>) {
    let is_new = {
        let mut guard = lock(state);
        let is_new = !guard.members.contains_key(&node);
        let entry = guard.members.entry(node.clone()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        is_new
    };

    if is_new {
        tracing::info!(node = %node, "node up");
        emit(state, MembershipEvent::Up { node, at }).await;
    }
}

async fn emit(state: &Arc<Mutex<State>>, event: MembershipEvent) {
    let sinks = lock(state).subscribers.clone();
    let mut dead = Vec::new();

    for sink in &sinks {
        if sink.send(event.clone()).await.is_err() {
            dead.push(sink.clone());
        }
    }

    if !dead.is_empty() {
        lock(state)
            .subscribers
            .retain(|s| !dead.iter().any(|d| d.same_channel(s)));
    }
}
