//! Identity acquisition against a rendezvous service.

use crate::error::LinkError;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::signaling::{FramePipe, Rendezvous};

/// A granted identity and the session that holds it.
pub struct Endpoint {
    pub identity: String,
    pub pipe: FramePipe,
}

/// Open a session and claim `requested`, or any identity when `None`.
///
/// Fails with [`LinkError::IdentityTaken`] when `requested` is held by
/// someone else; the session is dropped in that case.
pub async fn acquire(
    rendezvous: &dyn Rendezvous,
    requested: Option<&str>,
) -> Result<Endpoint, LinkError> {
    let mut pipe = rendezvous.open().await?;
    pipe.send(ClientFrame::Claim {
        id: requested.map(str::to_owned),
    })?;

    loop {
        match pipe.recv().await {
            Some(ServerFrame::Granted { id }) => {
                return Ok(Endpoint { identity: id, pipe });
            }
            Some(ServerFrame::Taken { id }) => return Err(LinkError::IdentityTaken(id)),
            Some(ServerFrame::Error { message }) => return Err(LinkError::Rejected(message)),
            Some(other) => log::debug!("Ignoring {other:?} while awaiting identity"),
            None => return Err(LinkError::SignalingClosed),
        }
    }
}
