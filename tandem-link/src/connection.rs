//! Connection manager: turns a shared channel identifier into a live
//! two-party session.
//!
//! ```text
//!                ┌──────────────┐  granted == channel   ┌───────────┐
//!   start ─────► │ Unidentified │ ────────────────────► │ HostIdle  │ ◄─────────┐
//!                └──────┬───────┘                       └─────┬─────┘           │
//!                  ▲    │ granted != channel                  │ incoming link   │ link closed
//!                  │    ▼                                     ▼                 │ (host)
//!                  │ ┌─────────────────┐   opened      ┌───────────┐            │
//!                  │ │ GuestConnecting │ ────────────► │ Connected │ ───────────┘
//!                  │ └───────┬─────────┘               └─────┬─────┘
//!                  │         │ unreachable                   │ link closed (guest)
//!                  │         ▼                               ▼
//!                  │    ┌───────────┐ ◄──────────────────────┘
//!                  └─── │ Resetting │
//!                       └───────────┘
//! ```
//!
//! A single driver task owns the rendezvous session and applies every
//! transition. Each identity gets a new epoch; channel handles and media
//! pumps remember the epoch they were made in and go inert once it passes,
//! so nothing from a discarded identity can touch the next one.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::LinkError;
use crate::identity;
use crate::protocol::{AudioFrame, ClientFrame, MediaPacket, ServerFrame};
use crate::role::{AfterClose, Role};
use crate::signaling::{FramePipe, Rendezvous};

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Pause before re-acquiring an identity after a reset or signaling loss
    pub retry_delay: Duration,
    /// Buffered peer events per subscriber
    pub event_capacity: usize,
    /// Buffered audio frames per media subscriber
    pub media_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            event_capacity: 256,
            media_capacity: 64,
        }
    }
}

impl LinkConfig {
    /// Short delays for tests.
    pub fn for_testing() -> Self {
        Self {
            retry_delay: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

/// Where the state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Unidentified,
    HostIdle,
    GuestConnecting,
    Connected,
    Resetting,
}

/// Human-facing status, updated on every transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Initializing,
    Identified { identity: String, role: Role },
    WaitingForPeer,
    Connecting { to: String },
    Connected { peer: String },
    CallEstablished { peer: String },
    CallEnded,
    SelfCallIgnored,
    Disconnected,
    Resetting,
    Error(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Initializing => write!(f, "Initializing..."),
            Status::Identified { identity, role } => write!(f, "Peer ID: {identity} ({role})"),
            Status::WaitingForPeer => write!(f, "Waiting for peer..."),
            Status::Connecting { to } => write!(f, "Connecting to {to}..."),
            Status::Connected { peer } => write!(f, "Peer connected to: {peer}"),
            Status::CallEstablished { peer } => write!(f, "Call established with {peer}."),
            Status::CallEnded => write!(f, "Call ended."),
            Status::SelfCallIgnored => write!(f, "Self call. Ignored."),
            Status::Disconnected => write!(f, "Connection closed."),
            Status::Resetting => write!(f, "Resetting connection..."),
            Status::Error(e) => write!(f, "Error: {e}"),
        }
    }
}

/// Events for collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Any message received on the data channel.
    RemoteData(serde_json::Value),
    /// The remote media leg is attached; frames flow via `incoming_media`.
    PeerStreamEstablished { remote: String, call: Uuid },
}

struct DataChannel {
    link: Uuid,
    epoch: u64,
    tx: mpsc::UnboundedSender<ClientFrame>,
}

struct MediaCall {
    id: Uuid,
    remote: String,
    pump: Option<JoinHandle<()>>,
}

impl Drop for MediaCall {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[derive(Default)]
struct SessionState {
    phase: Phase,
    identity: Option<String>,
    role: Option<Role>,
    remote: Option<String>,
    channel: Option<DataChannel>,
    call: Option<MediaCall>,
}

struct Shared {
    channel_id: String,
    rendezvous: Arc<dyn Rendezvous>,
    config: LinkConfig,
    epoch: Arc<AtomicU64>,
    session: Mutex<SessionState>,
    ready: watch::Sender<bool>,
    status: watch::Sender<Status>,
    events: broadcast::Sender<PeerEvent>,
    /// Lossless taps on the data channel, one per `inbound_data` caller.
    inbound: Mutex<Vec<mpsc::UnboundedSender<serde_json::Value>>>,
    media_out: broadcast::Sender<AudioFrame>,
    media_in: broadcast::Sender<AudioFrame>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Run `f` against the session state only if `epoch` is still current.
    fn update<R>(&self, epoch: u64, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        let mut state = self.state();
        if self.current_epoch() != epoch {
            log::debug!("Discarding completion from stale epoch {epoch}");
            return None;
        }
        Some(f(&mut state))
    }

    fn set_status(&self, status: Status) {
        log::info!("[{}] {status}", self.channel_id);
        self.status.send_replace(status);
    }

    /// Hand a received payload to every inbound tap, then to event subscribers.
    fn deliver(&self, payload: serde_json::Value) {
        let mut taps = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        taps.retain(|tap| tap.send(payload.clone()).is_ok());
        drop(taps);
        self.emit(PeerEvent::RemoteData(payload));
    }

    fn emit(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Start a fresh identity context. Anything tagged with an older epoch is stale from here on.
    fn begin_epoch(&self) -> u64 {
        let mut state = self.state();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *state = SessionState::default();
        drop(state);
        self.ready.send_replace(false);
        self.set_status(Status::Initializing);
        epoch
    }

    /// Drop every handle belonging to the current identity.
    fn teardown(&self) {
        let mut state = self.state();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(channel) = state.channel.take() {
            let _ = channel.tx.send(ClientFrame::Close { link: channel.link });
        }
        state.call = None;
        state.remote = None;
        state.identity = None;
        state.role = None;
        state.phase = Phase::Resetting;
        drop(state);
        self.ready.send_replace(false);
    }
}

/// Handle to the session for one channel identifier. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        channel_id: impl Into<String>,
        rendezvous: Arc<dyn Rendezvous>,
        config: LinkConfig,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        let (status, _) = watch::channel(Status::Initializing);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (media_out, _) = broadcast::channel(config.media_capacity.max(1));
        let (media_in, _) = broadcast::channel(config.media_capacity.max(1));

        Self {
            shared: Arc::new(Shared {
                channel_id: channel_id.into(),
                rendezvous,
                config,
                epoch: Arc::new(AtomicU64::new(0)),
                session: Mutex::new(SessionState::default()),
                ready,
                status,
                events,
                inbound: Mutex::new(Vec::new()),
                media_out,
                media_in,
                driver: Mutex::new(None),
            }),
        }
    }

    /// Spawn the driver task. Calling again while it runs does nothing.
    pub fn start(&self) {
        let mut driver = self.shared.driver.lock().unwrap_or_else(|e| e.into_inner());
        if driver.as_ref().is_some_and(|d| !d.is_finished()) {
            return;
        }
        let shared = self.shared.clone();
        *driver = Some(tokio::spawn(drive(shared)));
    }

    /// Start and wait until a data channel exists.
    pub async fn initialize(&self) {
        self.start();
        self.wait_for_ready().await;
    }

    /// Resolve once a data channel exists; immediately if one already does.
    pub async fn wait_for_ready(&self) {
        let mut ready = self.shared.ready.subscribe();
        let _ = ready.wait_for(|open| *open).await;
    }

    /// Whether a data channel is open right now.
    pub fn is_open(&self) -> bool {
        let state = self.shared.state();
        let epoch = self.shared.current_epoch();
        state.channel.as_ref().is_some_and(|c| c.epoch == epoch)
    }

    /// Send a structured message to the peer.
    ///
    /// Fails with [`LinkError::NoChannel`] when there is no open channel;
    /// callers are expected to gate on [`wait_for_ready`](Self::wait_for_ready).
    pub fn send<M: Serialize>(&self, message: &M) -> Result<(), LinkError> {
        let payload = serde_json::to_value(message)
            .map_err(|e| crate::protocol::ProtocolError::Serialization(e.to_string()))?;

        let state = self.shared.state();
        let epoch = self.shared.current_epoch();
        let channel = state
            .channel
            .as_ref()
            .filter(|c| c.epoch == epoch)
            .ok_or(LinkError::NoChannel)?;
        channel
            .tx
            .send(ClientFrame::Data {
                link: channel.link,
                payload,
            })
            .map_err(|_| LinkError::SignalingClosed)
    }

    /// Every payload received on the data channel, in order, with nothing
    /// dropped. Unlike [`subscribe`](Self::subscribe) the buffer is unbounded,
    /// so the receiver must be drained.
    pub fn inbound_data(&self) -> mpsc::UnboundedReceiver<serde_json::Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Subscribe to peer events. Slow subscribers skip events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    /// Feed outgoing audio here; it is forwarded on whichever call is live.
    pub fn media_sender(&self) -> broadcast::Sender<AudioFrame> {
        self.shared.media_out.clone()
    }

    /// Audio arriving from the peer.
    pub fn incoming_media(&self) -> broadcast::Receiver<AudioFrame> {
        self.shared.media_in.subscribe()
    }

    pub fn status(&self) -> Status {
        self.shared.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.shared.status.subscribe()
    }

    pub fn phase(&self) -> Phase {
        self.shared.state().phase
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.state().role
    }

    pub fn local_identity(&self) -> Option<String> {
        self.shared.state().identity.clone()
    }

    pub fn remote_identity(&self) -> Option<String> {
        self.shared.state().remote.clone()
    }

    /// Remote identity of the live media call, if any.
    pub fn call_peer(&self) -> Option<String> {
        self.shared.state().call.as_ref().map(|c| c.remote.clone())
    }

    pub fn channel_id(&self) -> &str {
        &self.shared.channel_id
    }

    /// Stop the driver and give up the current identity.
    pub fn shutdown(&self) {
        let driver = self
            .shared
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(driver) = driver {
            driver.abort();
        }
        self.shared.teardown();
        self.shared.set_status(Status::Disconnected);
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Reset,
    SignalingLost,
}

async fn drive(shared: Arc<Shared>) {
    let channel = shared.channel_id.clone();
    let mut requested = Some(channel.clone());

    loop {
        let epoch = shared.begin_epoch();

        let endpoint =
            match identity::acquire(shared.rendezvous.as_ref(), requested.as_deref()).await {
                Ok(endpoint) => endpoint,
                Err(LinkError::IdentityTaken(id)) => {
                    log::info!("'{id}' is already claimed; retrying with any identity");
                    shared.set_status(Status::Error(LinkError::IdentityTaken(id).to_string()));
                    requested = None;
                    continue;
                }
                Err(e) => {
                    log::warn!("Identity acquisition failed: {e}");
                    shared.set_status(Status::Error(e.to_string()));
                    tokio::time::sleep(shared.config.retry_delay).await;
                    requested = Some(channel.clone());
                    continue;
                }
            };

        let role = Role::arbitrate(&channel, &endpoint.identity);
        let session = Session {
            shared: shared.clone(),
            epoch,
            role,
            identity: endpoint.identity,
            pipe: endpoint.pipe,
            pending_link: None,
        };
        let end = session.run().await;

        shared.teardown();
        match end {
            SessionEnd::Reset => shared.set_status(Status::Resetting),
            SessionEnd::SignalingLost => {
                shared.set_status(Status::Error(LinkError::SignalingClosed.to_string()))
            }
        }
        tokio::time::sleep(shared.config.retry_delay).await;
        requested = Some(channel.clone());
    }
}

/// One identity's lifetime.
struct Session {
    shared: Arc<Shared>,
    epoch: u64,
    role: Role,
    identity: String,
    pipe: FramePipe,
    /// Guest's outbound link awaiting `opened`.
    pending_link: Option<Uuid>,
}

impl Session {
    async fn run(mut self) -> SessionEnd {
        let (identity, role) = (self.identity.clone(), self.role);
        self.shared.update(self.epoch, |state| {
            state.identity = Some(identity.clone());
            state.role = Some(role);
        });
        self.shared.set_status(Status::Identified { identity, role });

        match self.role.dial_target(&self.shared.channel_id) {
            Some(target) => {
                let target = target.to_owned();
                self.dial(target);
            }
            None => {
                self.shared.update(self.epoch, |state| state.phase = Phase::HostIdle);
                self.shared.set_status(Status::WaitingForPeer);
            }
        }

        loop {
            let Some(frame) = self.pipe.recv().await else {
                return SessionEnd::SignalingLost;
            };
            if let Some(end) = self.handle(frame) {
                return end;
            }
        }
    }

    /// Guest: open the data channel and place the call in one go.
    fn dial(&mut self, target: String) {
        let link = Uuid::new_v4();
        let call = Uuid::new_v4();
        self.pending_link = Some(link);

        self.shared.update(self.epoch, |state| {
            state.phase = Phase::GuestConnecting;
            state.remote = Some(target.clone());
            state.call = Some(MediaCall {
                id: call,
                remote: target.clone(),
                pump: None,
            });
        });
        self.shared.set_status(Status::Connecting { to: target.clone() });

        let _ = self.pipe.send(ClientFrame::Connect {
            to: target.clone(),
            link,
        });
        let _ = self.pipe.send(ClientFrame::Call { to: target, call });
    }

    fn handle(&mut self, frame: ServerFrame) -> Option<SessionEnd> {
        match frame {
            ServerFrame::Opened { link } if self.pending_link == Some(link) => {
                self.pending_link = None;
                let remote = self.shared.channel_id.clone();
                self.open_channel(link, remote);
                None
            }

            ServerFrame::Incoming { from, link } => {
                self.on_incoming(from, link);
                None
            }

            ServerFrame::Unreachable { to, id } => {
                if self.pending_link == Some(id) {
                    log::info!("'{to}' is unreachable; starting over");
                    return Some(SessionEnd::Reset);
                }
                let dropped = self.shared.update(self.epoch, |state| {
                    if state.call.as_ref().is_some_and(|c| c.id == id) {
                        state.call = None;
                        true
                    } else {
                        false
                    }
                });
                if dropped == Some(true) {
                    self.shared
                        .set_status(Status::Error(format!("Call to {to} failed: unreachable")));
                }
                None
            }

            ServerFrame::Data { link, payload } => {
                if self.is_current_link(link) {
                    self.shared.deliver(payload);
                } else {
                    log::debug!("Ignoring data on unknown link {link}");
                }
                None
            }

            ServerFrame::Closed { link } => {
                if !self.is_current_link(link) {
                    return None;
                }
                match self.role.on_channel_closed() {
                    AfterClose::Listen => {
                        self.shared.update(self.epoch, |state| {
                            state.channel = None;
                            state.remote = None;
                            state.phase = Phase::HostIdle;
                            // The call belonged to the departed guest.
                            if let Some(call) = state.call.take() {
                                let _ = self.pipe.send(ClientFrame::Hangup { call: call.id });
                            }
                        });
                        self.shared.ready.send_replace(false);
                        self.shared.set_status(Status::Disconnected);
                        self.shared.set_status(Status::WaitingForPeer);
                        None
                    }
                    AfterClose::Reset => {
                        self.shared.update(self.epoch, |state| state.phase = Phase::Resetting);
                        self.shared.set_status(Status::Disconnected);
                        Some(SessionEnd::Reset)
                    }
                }
            }

            ServerFrame::IncomingCall { from, call } => {
                self.on_incoming_call(from, call);
                None
            }

            ServerFrame::Answered { call } => {
                let remote = self.shared.update(self.epoch, |state| {
                    let tx = self.pipe.sender();
                    match state.call.as_mut() {
                        Some(live) if live.id == call && live.pump.is_none() => {
                            live.pump = Some(spawn_pump(&self.shared, self.epoch, call, tx));
                            Some(live.remote.clone())
                        }
                        _ => None,
                    }
                });
                if let Some(Some(remote)) = remote {
                    self.media_attached(remote, call);
                }
                None
            }

            ServerFrame::HungUp { call } => {
                let ended = self.shared.update(self.epoch, |state| {
                    if state.call.as_ref().is_some_and(|c| c.id == call) {
                        state.call = None;
                        true
                    } else {
                        false
                    }
                });
                if ended == Some(true) {
                    self.shared.set_status(Status::CallEnded);
                }
                None
            }

            ServerFrame::Media(packet) => {
                let live = self
                    .shared
                    .state()
                    .call
                    .as_ref()
                    .is_some_and(|c| c.id == packet.call);
                if live {
                    let _ = self.shared.media_in.send(packet.frame);
                }
                None
            }

            ServerFrame::Error { message } => {
                log::warn!("Rendezvous error: {message}");
                self.shared.set_status(Status::Error(message));
                None
            }

            other => {
                log::debug!("Ignoring {other:?}");
                None
            }
        }
    }

    fn is_current_link(&self, link: Uuid) -> bool {
        self.shared
            .update(self.epoch, |state| {
                state.channel.as_ref().is_some_and(|c| c.link == link)
            })
            .unwrap_or(false)
    }

    fn open_channel(&mut self, link: Uuid, remote: String) {
        let channel = DataChannel {
            link,
            epoch: self.epoch,
            tx: self.pipe.sender(),
        };
        let opened = self.shared.update(self.epoch, |state| {
            state.channel = Some(channel);
            state.remote = Some(remote.clone());
            state.phase = Phase::Connected;
        });
        if opened.is_some() {
            self.shared.ready.send_replace(true);
            self.shared.set_status(Status::Connected { peer: remote });
        }
    }

    fn on_incoming(&mut self, from: String, link: Uuid) {
        if from == self.identity {
            log::debug!("Ignoring loopback connection");
            let _ = self.pipe.send(ClientFrame::Close { link });
            return;
        }
        let busy = self.role.initiates()
            || self
                .shared
                .update(self.epoch, |state| state.channel.is_some())
                .unwrap_or(true);
        if busy {
            log::warn!("Rejecting connection from '{from}': session already paired");
            let _ = self.pipe.send(ClientFrame::Close { link });
            return;
        }
        self.open_channel(link, from);
    }

    fn on_incoming_call(&mut self, from: String, call: Uuid) {
        if from == self.identity {
            log::debug!("Self call. Ignoring.");
            self.shared.set_status(Status::SelfCallIgnored);
            return;
        }

        let tx = self.pipe.sender();
        let answered = self.shared.update(self.epoch, |state| {
            if state.call.is_some() {
                return false;
            }
            state.call = Some(MediaCall {
                id: call,
                remote: from.clone(),
                pump: Some(spawn_pump(&self.shared, self.epoch, call, tx)),
            });
            true
        });

        match answered {
            Some(true) => {
                let _ = self.pipe.send(ClientFrame::Answer { call });
                self.media_attached(from, call);
            }
            Some(false) => {
                log::warn!("Rejecting call from '{from}': already in a call");
                let _ = self.pipe.send(ClientFrame::Hangup { call });
            }
            None => {}
        }
    }

    fn media_attached(&self, remote: String, call: Uuid) {
        self.shared.set_status(Status::CallEstablished {
            peer: remote.clone(),
        });
        self.shared
            .emit(PeerEvent::PeerStreamEstablished { remote, call });
    }
}

/// Forward outgoing audio onto `call` until aborted or the epoch moves on.
fn spawn_pump(
    shared: &Shared,
    epoch: u64,
    call: Uuid,
    tx: mpsc::UnboundedSender<ClientFrame>,
) -> JoinHandle<()> {
    let mut source = shared.media_out.subscribe();
    let current = shared.epoch.clone();
    tokio::spawn(async move {
        let mut seq = 0u64;
        loop {
            match source.recv().await {
                Ok(frame) => {
                    if current.load(Ordering::SeqCst) != epoch {
                        break;
                    }
                    if tx.send(ClientFrame::Media(MediaPacket { call, seq, frame })).is_err() {
                        break;
                    }
                    seq += 1;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("Media pump skipped {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::RendezvousHub;
    use tokio::time::timeout;

    fn manager(hub: &RendezvousHub, channel: &str) -> ConnectionManager {
        ConnectionManager::new(channel, Arc::new(hub.clone()), LinkConfig::for_testing())
    }

    /// A host session for "room" fed by hand, with the frames it sends.
    fn host_session(conn: &ConnectionManager) -> (Session, mpsc::UnboundedReceiver<ClientFrame>) {
        let shared = conn.shared.clone();
        let epoch = shared.begin_epoch();
        let (outbound, sent) = mpsc::unbounded_channel();
        let (_, inbound) = mpsc::unbounded_channel::<ServerFrame>();
        let session = Session {
            shared,
            epoch,
            role: Role::Host,
            identity: "room".into(),
            pipe: FramePipe::new(outbound, inbound),
            pending_link: None,
        };
        (session, sent)
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(Status::Initializing.to_string(), "Initializing...");
        assert_eq!(
            Status::Connected { peer: "room".into() }.to_string(),
            "Peer connected to: room"
        );
        assert_eq!(
            Status::Identified {
                identity: "room".into(),
                role: Role::Host
            }
            .to_string(),
            "Peer ID: room (host)"
        );
    }

    #[tokio::test]
    async fn test_send_without_channel_is_an_error() {
        let hub = RendezvousHub::new();
        let conn = manager(&hub, "room");
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send(&serde_json::json!({"x": 1})),
            Err(LinkError::NoChannel)
        ));
    }

    #[tokio::test]
    async fn test_lone_participant_becomes_idle_host() {
        let hub = RendezvousHub::new();
        let conn = manager(&hub, "room");
        conn.start();

        let mut status = conn.watch_status();
        timeout(Duration::from_secs(1), status.wait_for(|s| *s == Status::WaitingForPeer))
            .await
            .unwrap()
            .unwrap();
        drop(status);

        assert_eq!(conn.role(), Some(Role::Host));
        assert_eq!(conn.phase(), Phase::HostIdle);
        assert_eq!(conn.local_identity().as_deref(), Some("room"));
        assert!(!conn.is_open());
        conn.shutdown();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let hub = RendezvousHub::new();
        let conn = manager(&hub, "room");
        conn.start();
        conn.start();

        let mut status = conn.watch_status();
        timeout(Duration::from_secs(1), status.wait_for(|s| *s == Status::WaitingForPeer))
            .await
            .unwrap()
            .unwrap();
        drop(status);

        // A second driver would have been refused the id and become a guest.
        assert_eq!(hub.stats().claims_refused, 0);
        conn.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_releases_identity() {
        let hub = RendezvousHub::new();
        let conn = manager(&hub, "room");
        conn.start();
        timeout(Duration::from_secs(1), async {
            while !hub.is_claimed("room").await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        conn.shutdown();
        timeout(Duration::from_secs(1), async {
            while hub.is_claimed("room").await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(conn.status(), Status::Disconnected);
        assert_eq!(conn.role(), None);
    }

    #[tokio::test]
    async fn test_call_from_own_identity_is_ignored() {
        let hub = RendezvousHub::new();
        let conn = manager(&hub, "room");
        let (mut session, mut sent) = host_session(&conn);
        let mut events = conn.subscribe();

        let end = session.handle(ServerFrame::IncomingCall {
            from: "room".into(),
            call: Uuid::new_v4(),
        });

        assert!(end.is_none());
        assert!(conn.shared.state().call.is_none());
        assert_eq!(conn.status(), Status::SelfCallIgnored);
        assert!(events.try_recv().is_err());
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_epoch_cannot_touch_state() {
        let hub = RendezvousHub::new();
        let conn = manager(&hub, "room");
        let (mut session, mut sent) = host_session(&conn);
        let mut payloads = conn.inbound_data();

        let link = Uuid::new_v4();
        session.handle(ServerFrame::Incoming {
            from: "guest".into(),
            link,
        });
        assert!(conn.is_open());
        assert!(*conn.shared.ready.borrow());

        conn.shared.teardown();
        assert_eq!(sent.try_recv().unwrap(), ClientFrame::Close { link });
        assert!(conn.shared.update(session.epoch, |_| ()).is_none());

        // The old session keeps receiving frames; none of them land.
        session.handle(ServerFrame::Incoming {
            from: "other".into(),
            link: Uuid::new_v4(),
        });
        session.handle(ServerFrame::Data {
            link,
            payload: serde_json::json!({"late": true}),
        });
        assert!(!conn.is_open());
        assert!(!*conn.shared.ready.borrow());
        assert!(conn.shared.state().channel.is_none());
        assert_eq!(conn.phase(), Phase::Resetting);
        assert!(payloads.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_host_hangs_up_departed_guests_call() {
        let hub = RendezvousHub::new();
        let conn = manager(&hub, "room");
        let (mut session, mut sent) = host_session(&conn);

        let link = Uuid::new_v4();
        let call = Uuid::new_v4();
        session.handle(ServerFrame::Incoming {
            from: "guest".into(),
            link,
        });
        session.handle(ServerFrame::IncomingCall {
            from: "guest".into(),
            call,
        });
        assert_eq!(sent.try_recv().unwrap(), ClientFrame::Answer { call });

        assert!(session.handle(ServerFrame::Closed { link }).is_none());
        assert_eq!(sent.try_recv().unwrap(), ClientFrame::Hangup { call });
        assert!(conn.shared.state().call.is_none());
        assert_eq!(conn.phase(), Phase::HostIdle);

        // The next guest's call is answered rather than refused as busy.
        let next_link = Uuid::new_v4();
        let next_call = Uuid::new_v4();
        session.handle(ServerFrame::Incoming {
            from: "guest-2".into(),
            link: next_link,
        });
        session.handle(ServerFrame::IncomingCall {
            from: "guest-2".into(),
            call: next_call,
        });
        assert_eq!(sent.try_recv().unwrap(), ClientFrame::Answer { call: next_call });
        assert!(conn.is_open());
    }
}
