//! Fixed-capacity session pool.
//!
//! Every slot walks Free → Created → Connecting → Connected → Closing →
//! Free; Created may fall straight back to Free on destroy. Slot lookup is
//! bounds-checked through the [`SessionIdx`] newtype and first-fit
//! allocation scans the fixed table, so a freed index is eventually
//! reused but never double-allocated while live.

use std::sync::Arc;

use crate::endpoint::EndpointHandle;
use crate::error::{Error, Result};
use crate::fabric::MsgQueue;

/// Size of the fixed session table. The occupancy and pending masks in
/// [`crate::status::NodeStatus`] are `u32` bitsets, which caps this at 32.
pub const MAX_SESSIONS: usize = 32;

/// Bounds-checked index into the session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionIdx(u16);

impl SessionIdx {
    /// Wrap a raw index; `None` if it exceeds the addressable range.
    pub fn new(raw: usize) -> Option<Self> {
        (raw < MAX_SESSIONS).then(|| SessionIdx(raw as u16))
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Channel discipline of a session, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Packet,
    Scalar,
}

impl ChannelKind {
    /// Decode the wire form used by the control plane.
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(ChannelKind::Packet),
            1 => Ok(ChannelKind::Scalar),
            _ => Err(Error::InvalidKind),
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            ChannelKind::Packet => 0,
            ChannelKind::Scalar => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Free,
    Created,
    Connecting,
    Connected,
    Closing,
}

/// One occupied slot. Free slots are not materialized.
pub(crate) struct Session {
    pub(crate) state: SessionState,
    pub(crate) kind: ChannelKind,
    pub(crate) local_ep: EndpointHandle,
    pub(crate) remote_ep: Option<EndpointHandle>,
    pub(crate) remote_core: Option<u32>,
    /// Destination queue, cached once the transport acknowledged the bind.
    pub(crate) remote_queue: Option<Arc<MsgQueue>>,
}

pub struct SessionPool {
    slots: Vec<Option<Session>>,
}

impl SessionPool {
    pub(crate) fn new() -> Self {
        SessionPool {
            slots: (0..MAX_SESSIONS).map(|_| None).collect(),
        }
    }

    /// First-fit allocation of a Free slot; Free → Created.
    pub(crate) fn create(
        &mut self,
        local_ep: EndpointHandle,
        kind: ChannelKind,
    ) -> Result<SessionIdx> {
        let raw = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::PoolExhausted)?;
        self.slots[raw] = Some(Session {
            state: SessionState::Created,
            kind,
            local_ep,
            remote_ep: None,
            remote_core: None,
            remote_queue: None,
        });
        Ok(SessionIdx(raw as u16))
    }

    /// Created → Connecting; records the peer. The slot only reaches
    /// Connected through [`SessionPool::connect_commit`] once the
    /// transport acknowledges the bind.
    pub(crate) fn connect_begin(
        &mut self,
        idx: SessionIdx,
        remote_ep: EndpointHandle,
        remote_core: u32,
        kind: ChannelKind,
    ) -> Result<()> {
        let session = self.occupied_mut(idx)?;
        if session.state != SessionState::Created {
            return Err(Error::AlreadyConnected);
        }
        if session.kind != kind {
            return Err(Error::KindMismatch);
        }
        session.state = SessionState::Connecting;
        session.remote_ep = Some(remote_ep);
        session.remote_core = Some(remote_core);
        Ok(())
    }

    /// Connecting → Connected, caching the acknowledged destination queue.
    pub(crate) fn connect_commit(&mut self, idx: SessionIdx, queue: Arc<MsgQueue>) -> Result<()> {
        let session = self.occupied_mut(idx)?;
        if session.state != SessionState::Connecting {
            return Err(Error::SessionNotConnected);
        }
        session.state = SessionState::Connected;
        session.remote_queue = Some(queue);
        Ok(())
    }

    /// Any state → Closing → Free. Idempotent: releasing a Free or
    /// out-of-table slot is a no-op returning the (absent) local endpoint.
    pub(crate) fn release(&mut self, idx: SessionIdx) -> Option<EndpointHandle> {
        let slot = self.slots.get_mut(idx.as_usize())?;
        let mut session = slot.take()?;
        session.state = SessionState::Closing;
        Some(session.local_ep)
    }

    pub(crate) fn occupied(&self, idx: SessionIdx) -> Result<&Session> {
        self.slots
            .get(idx.as_usize())
            .and_then(|s| s.as_ref())
            .ok_or(Error::SessionNotFound)
    }

    fn occupied_mut(&mut self, idx: SessionIdx) -> Result<&mut Session> {
        self.slots
            .get_mut(idx.as_usize())
            .and_then(|s| s.as_mut())
            .ok_or(Error::SessionNotFound)
    }

    /// Raw index of the slot owning a local port, for the channel binder.
    pub(crate) fn find_by_port(&self, port: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(sess) if sess.local_ep.port() == port))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &Session)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|sess| (i, sess)))
    }
}
