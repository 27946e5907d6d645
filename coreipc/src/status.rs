//! Per-session and per-node status snapshots.
//!
//! Both queries run under the same directory lock as the mutating
//! operations, so a snapshot never observes a slot mid-transition.

use crate::endpoint::EndpointHandle;
use crate::error::{Error, Result};
use crate::session::{ChannelKind, SessionIdx, SessionPool, SessionState};

/// Read-only view of one occupied session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub kind: ChannelKind,
    pub local_ep: EndpointHandle,
    pub remote_ep: Option<EndpointHandle>,
    pub remote_core: Option<u32>,
}

/// Aggregate occupancy snapshot of the whole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    /// Bitset of occupied slots.
    pub session_mask: u32,
    /// Bitset of slots mid-connect.
    pub session_pending: u32,
    /// Number of Free slots.
    pub nfree: u32,
}

pub(crate) fn session_status(pool: &SessionPool, idx: SessionIdx) -> Result<SessionStatus> {
    let session = pool.occupied(idx).map_err(|_| Error::SessionNotFound)?;
    Ok(SessionStatus {
        state: session.state,
        kind: session.kind,
        local_ep: session.local_ep,
        remote_ep: session.remote_ep,
        remote_core: session.remote_core,
    })
}

pub(crate) fn node_status(pool: &SessionPool) -> NodeStatus {
    let mut mask = 0u32;
    let mut pending = 0u32;
    let mut occupied = 0u32;
    for (i, session) in pool.iter() {
        mask |= 1 << i;
        occupied += 1;
        if session.state == SessionState::Connecting {
            pending |= 1 << i;
        }
    }
    NodeStatus {
        session_mask: mask,
        session_pending: pending,
        nfree: crate::session::MAX_SESSIONS as u32 - occupied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MAX_SESSIONS;

    fn ep(port: u32) -> EndpointHandle {
        EndpointHandle::encode(0, 0, port).unwrap()
    }

    #[test]
    fn test_node_status_counts() {
        let mut pool = SessionPool::new();
        let a = pool.create(ep(1), ChannelKind::Packet).unwrap();
        let b = pool.create(ep(2), ChannelKind::Packet).unwrap();
        let _c = pool.create(ep(3), ChannelKind::Scalar).unwrap();

        pool.connect_begin(b, EndpointHandle::encode(0, 1, 5).unwrap(), 1, ChannelKind::Packet)
            .unwrap();

        let status = node_status(&pool);
        assert_eq!(status.session_mask.count_ones(), 3);
        assert_eq!(status.session_pending, 1 << b.as_usize());
        assert_eq!(status.nfree, MAX_SESSIONS as u32 - 3);

        pool.release(a);
        let status = node_status(&pool);
        assert_eq!(status.session_mask.count_ones(), 2);
        assert_eq!(status.nfree, MAX_SESSIONS as u32 - 2);
    }

    #[test]
    fn test_session_status_free_slot() {
        let pool = SessionPool::new();
        let idx = SessionIdx::new(0).unwrap();
        assert_eq!(session_status(&pool, idx).err(), Some(Error::SessionNotFound));
    }
}
