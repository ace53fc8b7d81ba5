//! # tandem-link — two-party rendezvous, connection and store sync
//!
//! Two participants agree on a channel identifier out of band. Whoever
//! claims the identifier first hosts; the other dials it. Once paired they
//! share a reliable data channel, an audio call, and a replicated store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ws / in-process   ┌─────────────────┐
//! │ Connection  │ ◄─────────────────► │ RendezvousHub   │
//! │ Manager     │  ClientFrame /      │ (ids, links,    │
//! │ (per peer)  │  ServerFrame        │  calls)         │
//! └──────┬──────┘                     └─────────────────┘
//!        │ inbound_data (db-sync)
//!        ▼
//! ┌─────────────┐   write / DataChanged   ┌──────────────────┐
//! │ SyncedStore │ ──────────────────────► │ ReplicatedStore  │
//! └─────────────┘                         └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — control frames (JSON), media packets (bincode), `db-sync`
//! - [`hub`] — transport-agnostic rendezvous service
//! - [`server`] — WebSocket front end for the hub
//! - [`signaling`] — participant side of a rendezvous session
//! - [`identity`] — claim an identity, or any identity
//! - [`role`] — host/guest arbitration and per-role transitions
//! - [`connection`] — the connection state machine
//! - [`sync`] — forwards local writes, applies remote ones

pub mod connection;
pub mod error;
pub mod hub;
pub mod identity;
pub mod protocol;
pub mod role;
pub mod server;
pub mod signaling;
pub mod sync;

pub use connection::{ConnectionManager, LinkConfig, PeerEvent, Phase, Status};
pub use error::{LinkError, SyncError};
pub use hub::{HubStats, RendezvousHub};
pub use protocol::{
    AudioFrame, ClientFrame, MediaPacket, PeerMessage, ProtocolError, ServerFrame, Source,
    SyncUpdate,
};
pub use role::{AfterClose, Role};
pub use server::{RendezvousServer, ServerConfig};
pub use signaling::{FramePipe, Rendezvous, WsRendezvous};
pub use sync::SyncedStore;
