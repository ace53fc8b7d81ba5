//! Rendezvous hub: identity registry plus link/call routing.
//!
//! ```text
//! session A ──ClientFrame──┐                    ┌──ServerFrame──► session B
//!                          ├── HubState ────────┤
//! session B ──ClientFrame──┘  peers: id → tx    └──ServerFrame──► session A
//!                             links: uuid → (initiator, target)
//!                             calls: uuid → (initiator, target)
//! ```
//!
//! The hub is transport agnostic: every session is a pair of unbounded
//! channels. [`crate::server::RendezvousServer`] bridges WebSockets into
//! it; tests and embedded setups attach directly.
//!
//! Claims are resolved under one lock, so two sessions racing for the same
//! identity always end with exactly one `granted` and one `taken`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::protocol::{ClientFrame, ServerFrame};
use crate::signaling::FramePipe;

/// Snapshot of hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub claims_granted: u64,
    pub claims_refused: u64,
    pub frames_routed: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    total_sessions: AtomicU64,
    active_sessions: AtomicU64,
    claims_granted: AtomicU64,
    claims_refused: AtomicU64,
    frames_routed: AtomicU64,
}

/// Both ends of a link or call.
#[derive(Debug, Clone)]
struct Route {
    initiator: String,
    target: String,
}

impl Route {
    fn other(&self, me: &str) -> Option<&str> {
        if self.initiator == me {
            Some(&self.target)
        } else if self.target == me {
            Some(&self.initiator)
        } else {
            None
        }
    }

    fn involves(&self, me: &str) -> bool {
        self.initiator == me || self.target == me
    }
}

struct Registered {
    session: u64,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<String, Registered>,
    links: HashMap<Uuid, Route>,
    calls: HashMap<Uuid, Route>,
}

impl HubState {
    fn deliver(&self, to: &str, frame: ServerFrame) -> bool {
        match self.peers.get(to) {
            Some(peer) => peer.tx.send(frame).is_ok(),
            None => false,
        }
    }
}

struct HubInner {
    state: Mutex<HubState>,
    stats: AtomicHubStats,
    next_session: AtomicU64,
}

/// In-process rendezvous service. Cheap to clone.
#[derive(Clone)]
pub struct RendezvousHub {
    inner: Arc<HubInner>,
}

impl Default for RendezvousHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RendezvousHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState::default()),
                stats: AtomicHubStats::default(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Start a new session. Dropping the pipe's sender ends the session and
    /// releases whatever identity it claimed.
    pub fn attach(&self) -> FramePipe {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed);

        self.inner.stats.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.active_sessions.fetch_add(1, Ordering::Relaxed);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_session(session, client_rx, server_tx).await;
        });

        FramePipe::new(client_tx, server_rx)
    }

    /// Whether `id` is currently claimed.
    pub async fn is_claimed(&self, id: &str) -> bool {
        self.inner.state.lock().await.peers.contains_key(id)
    }

    pub fn stats(&self) -> HubStats {
        let s = &self.inner.stats;
        HubStats {
            total_sessions: s.total_sessions.load(Ordering::Relaxed),
            active_sessions: s.active_sessions.load(Ordering::Relaxed),
            claims_granted: s.claims_granted.load(Ordering::Relaxed),
            claims_refused: s.claims_refused.load(Ordering::Relaxed),
            frames_routed: s.frames_routed.load(Ordering::Relaxed),
        }
    }
}

impl HubInner {
    async fn run_session(
        &self,
        session: u64,
        mut rx: mpsc::UnboundedReceiver<ClientFrame>,
        tx: mpsc::UnboundedSender<ServerFrame>,
    ) {
        let mut identity: Option<String> = None;

        while let Some(frame) = rx.recv().await {
            match frame {
                ClientFrame::Claim { id } => {
                    if identity.is_some() {
                        let _ = tx.send(ServerFrame::Error {
                            message: "identity already granted".into(),
                        });
                        continue;
                    }
                    identity = self.claim(session, id, &tx).await;
                }
                other => match identity.as_deref() {
                    Some(me) => self.route(me, other, &tx).await,
                    None => {
                        let _ = tx.send(ServerFrame::Error {
                            message: "claim an identity first".into(),
                        });
                    }
                },
            }
        }

        if let Some(id) = identity {
            self.release(session, &id).await;
        }
        self.stats.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    async fn claim(
        &self,
        session: u64,
        requested: Option<String>,
        tx: &mpsc::UnboundedSender<ServerFrame>,
    ) -> Option<String> {
        let mut state = self.state.lock().await;

        let id = match requested {
            Some(id) if state.peers.contains_key(&id) => {
                self.stats.claims_refused.fetch_add(1, Ordering::Relaxed);
                log::debug!("Refused claim for taken id '{id}'");
                let _ = tx.send(ServerFrame::Taken { id });
                return None;
            }
            Some(id) => id,
            None => loop {
                let candidate = Uuid::new_v4().to_string();
                if !state.peers.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        state.peers.insert(
            id.clone(),
            Registered {
                session,
                tx: tx.clone(),
            },
        );
        self.stats.claims_granted.fetch_add(1, Ordering::Relaxed);
        log::info!("Granted identity '{id}' to session {session}");
        let _ = tx.send(ServerFrame::Granted { id: id.clone() });
        Some(id)
    }

    async fn route(&self, me: &str, frame: ClientFrame, tx: &mpsc::UnboundedSender<ServerFrame>) {
        let mut state = self.state.lock().await;

        let delivered = match frame {
            ClientFrame::Claim { .. } => false,

            ClientFrame::Connect { to, link } => {
                if state.peers.contains_key(&to) {
                    state.links.insert(
                        link,
                        Route {
                            initiator: me.to_owned(),
                            target: to.clone(),
                        },
                    );
                    state.deliver(
                        &to,
                        ServerFrame::Incoming {
                            from: me.to_owned(),
                            link,
                        },
                    );
                    tx.send(ServerFrame::Opened { link }).is_ok()
                } else {
                    log::debug!("'{me}' tried to connect to unknown '{to}'");
                    let _ = tx.send(ServerFrame::Unreachable { to, id: link });
                    false
                }
            }

            ClientFrame::Data { link, payload } => {
                match state.links.get(&link).and_then(|r| r.other(me)).map(str::to_owned) {
                    Some(other) => state.deliver(&other, ServerFrame::Data { link, payload }),
                    None => false,
                }
            }

            ClientFrame::Close { link } => {
                let other = match state.links.get(&link) {
                    Some(route) => route.other(me).map(str::to_owned),
                    None => None,
                };
                match other {
                    Some(other) => {
                        state.links.remove(&link);
                        state.deliver(&other, ServerFrame::Closed { link })
                    }
                    None => false,
                }
            }

            ClientFrame::Call { to, call } => {
                if state.peers.contains_key(&to) {
                    state.calls.insert(
                        call,
                        Route {
                            initiator: me.to_owned(),
                            target: to.clone(),
                        },
                    );
                    state.deliver(
                        &to,
                        ServerFrame::IncomingCall {
                            from: me.to_owned(),
                            call,
                        },
                    )
                } else {
                    let _ = tx.send(ServerFrame::Unreachable { to, id: call });
                    false
                }
            }

            ClientFrame::Answer { call } => match state.calls.get(&call) {
                Some(route) if route.target == me => {
                    let initiator = route.initiator.clone();
                    state.deliver(&initiator, ServerFrame::Answered { call })
                }
                _ => false,
            },

            ClientFrame::Hangup { call } => {
                let other = match state.calls.get(&call) {
                    Some(route) => route.other(me).map(str::to_owned),
                    None => None,
                };
                match other {
                    Some(other) => {
                        state.calls.remove(&call);
                        state.deliver(&other, ServerFrame::HungUp { call })
                    }
                    None => false,
                }
            }

            ClientFrame::Media(packet) => {
                match state.calls.get(&packet.call).and_then(|r| r.other(me)).map(str::to_owned) {
                    Some(other) => state.deliver(&other, ServerFrame::Media(packet)),
                    None => false,
                }
            }
        };

        if delivered {
            self.stats.frames_routed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop an identity and tell every counterpart its links and calls ended.
    async fn release(&self, session: u64, id: &str) {
        let mut state = self.state.lock().await;

        if state.peers.get(id).map(|p| p.session) == Some(session) {
            state.peers.remove(id);
        }

        let links: Vec<(Uuid, Route)> = state
            .links
            .iter()
            .filter(|(_, r)| r.involves(id))
            .map(|(k, r)| (*k, r.clone()))
            .collect();
        for (link, route) in links {
            state.links.remove(&link);
            if let Some(other) = route.other(id) {
                state.deliver(other, ServerFrame::Closed { link });
            }
        }

        let calls: Vec<(Uuid, Route)> = state
            .calls
            .iter()
            .filter(|(_, r)| r.involves(id))
            .map(|(k, r)| (*k, r.clone()))
            .collect();
        for (call, route) in calls {
            state.calls.remove(&call);
            if let Some(other) = route.other(id) {
                state.deliver(other, ServerFrame::HungUp { call });
            }
        }

        log::info!("Released identity '{id}'");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AudioFrame, MediaPacket};
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    async fn next(pipe: &mut FramePipe) -> ServerFrame {
        timeout(Duration::from_secs(1), pipe.recv())
            .await
            .expect("frame within timeout")
            .expect("pipe open")
    }

    async fn claimed(hub: &RendezvousHub, id: Option<&str>) -> (FramePipe, String) {
        let mut pipe = hub.attach();
        pipe.send(ClientFrame::Claim { id: id.map(str::to_owned) }).unwrap();
        match next(&mut pipe).await {
            ServerFrame::Granted { id } => (pipe, id),
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_claim_requested_id() {
        let hub = RendezvousHub::new();
        let (_pipe, id) = claimed(&hub, Some("room")).await;
        assert_eq!(id, "room");
        assert!(hub.is_claimed("room").await);
    }

    #[tokio::test]
    async fn test_claim_any_is_unique() {
        let hub = RendezvousHub::new();
        let (_a, a) = claimed(&hub, None).await;
        let (_b, b) = claimed(&hub, None).await;
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[tokio::test]
    async fn test_second_claim_is_taken() {
        let hub = RendezvousHub::new();
        let (_host, _) = claimed(&hub, Some("room")).await;

        let mut other = hub.attach();
        other.send(ClientFrame::Claim { id: Some("room".into()) }).unwrap();
        assert_eq!(next(&mut other).await, ServerFrame::Taken { id: "room".into() });

        let stats = hub.stats();
        assert_eq!(stats.claims_granted, 1);
        assert_eq!(stats.claims_refused, 1);
    }

    #[tokio::test]
    async fn test_identity_released_on_drop() {
        let hub = RendezvousHub::new();
        let (pipe, _) = claimed(&hub, Some("room")).await;
        drop(pipe);

        timeout(Duration::from_secs(1), async {
            while hub.is_claimed("room").await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let (_again, id) = claimed(&hub, Some("room")).await;
        assert_eq!(id, "room");
    }

    #[tokio::test]
    async fn test_frames_before_claim_rejected() {
        let hub = RendezvousHub::new();
        let mut pipe = hub.attach();
        pipe.send(ClientFrame::Close { link: Uuid::new_v4() }).unwrap();
        assert!(matches!(next(&mut pipe).await, ServerFrame::Error { .. }));
    }

    #[tokio::test]
    async fn test_link_routing_and_close() {
        let hub = RendezvousHub::new();
        let (mut host, _) = claimed(&hub, Some("room")).await;
        let (mut guest, guest_id) = claimed(&hub, None).await;

        let link = Uuid::new_v4();
        guest.send(ClientFrame::Connect { to: "room".into(), link }).unwrap();
        assert_eq!(next(&mut guest).await, ServerFrame::Opened { link });
        assert_eq!(
            next(&mut host).await,
            ServerFrame::Incoming { from: guest_id, link }
        );

        host.send(ClientFrame::Data { link, payload: json!({"hello": 1}) }).unwrap();
        assert_eq!(
            next(&mut guest).await,
            ServerFrame::Data { link, payload: json!({"hello": 1}) }
        );

        guest.send(ClientFrame::Close { link }).unwrap();
        assert_eq!(next(&mut host).await, ServerFrame::Closed { link });
    }

    #[tokio::test]
    async fn test_connect_to_unknown_is_unreachable() {
        let hub = RendezvousHub::new();
        let (mut guest, _) = claimed(&hub, None).await;
        let link = Uuid::new_v4();
        guest.send(ClientFrame::Connect { to: "nobody".into(), link }).unwrap();
        assert_eq!(
            next(&mut guest).await,
            ServerFrame::Unreachable { to: "nobody".into(), id: link }
        );
    }

    #[tokio::test]
    async fn test_call_answer_and_media() {
        let hub = RendezvousHub::new();
        let (mut host, _) = claimed(&hub, Some("room")).await;
        let (mut guest, guest_id) = claimed(&hub, None).await;

        let call = Uuid::new_v4();
        guest.send(ClientFrame::Call { to: "room".into(), call }).unwrap();
        assert_eq!(
            next(&mut host).await,
            ServerFrame::IncomingCall { from: guest_id, call }
        );
        host.send(ClientFrame::Answer { call }).unwrap();
        assert_eq!(next(&mut guest).await, ServerFrame::Answered { call });

        let packet = MediaPacket {
            call,
            seq: 0,
            frame: AudioFrame::silence(8_000, 80),
        };
        host.send(ClientFrame::Media(packet.clone())).unwrap();
        assert_eq!(next(&mut guest).await, ServerFrame::Media(packet));
    }

    #[tokio::test]
    async fn test_departure_closes_links_and_calls() {
        let hub = RendezvousHub::new();
        let (mut host, _) = claimed(&hub, Some("room")).await;
        let (mut guest, _) = claimed(&hub, None).await;

        let link = Uuid::new_v4();
        let call = Uuid::new_v4();
        guest.send(ClientFrame::Connect { to: "room".into(), link }).unwrap();
        guest.send(ClientFrame::Call { to: "room".into(), call }).unwrap();
        next(&mut host).await;
        next(&mut host).await;

        drop(guest);
        let mut ended = vec![next(&mut host).await, next(&mut host).await];
        ended.sort_by_key(|f| matches!(f, ServerFrame::HungUp { .. }));
        assert_eq!(ended, vec![ServerFrame::Closed { link }, ServerFrame::HungUp { call }]);
    }
}
