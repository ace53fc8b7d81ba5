//! Host/guest arbitration.
//!
//! Whoever is granted the channel identifier itself is the host; everyone
//! else is a guest that dials the identifier. The rendezvous service grants
//! each identifier to one session at a time, so two participants racing for
//! the same channel always split into one host and one guest.

use std::fmt;

/// Which side of the session this participant is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the channel identifier and waits for a guest.
    Host,
    /// Dials the host at the channel identifier.
    Guest,
}

/// What to do after the data channel closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterClose {
    /// Keep the identity and wait for the next guest.
    Listen,
    /// Drop the identity and arbitrate again from scratch.
    Reset,
}

impl Role {
    pub fn arbitrate(channel: &str, granted: &str) -> Self {
        if granted == channel {
            Role::Host
        } else {
            Role::Guest
        }
    }

    /// Whether this side opens the data channel and places the call.
    pub fn initiates(self) -> bool {
        match self {
            Role::Host => false,
            Role::Guest => true,
        }
    }

    /// The identity to dial, if this side dials.
    pub fn dial_target(self, channel: &str) -> Option<&str> {
        match self {
            Role::Host => None,
            Role::Guest => Some(channel),
        }
    }

    /// A host outlives any single guest; a guest has nobody to wait for
    /// once the host is gone.
    pub fn on_channel_closed(self) -> AfterClose {
        match self {
            Role::Host => AfterClose::Listen,
            Role::Guest => AfterClose::Reset,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Guest => f.write_str("guest"),
        }
    }
}
