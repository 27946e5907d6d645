//! Channel binder: ties a local endpoint's session slot to a remote
//! endpoint in one step.
//!
//! The binder resolves the session slot from the local port, so callers
//! that only hold endpoint handles (the usual case for control-plane
//! code) never touch raw slot indices. It runs entirely under the node
//! lock and never suspends: if the remote endpoint is not yet published
//! the slot is left mid-connect and the caller decides whether to retry
//! or fall back to the suspending connect path.

use tracing::debug;

use crate::endpoint::EndpointHandle;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::session::{ChannelKind, SessionIdx};
use crate::NodeState;

/// Bind the session owning `local_ep`'s port to `remote_ep`.
///
/// On success the slot is Connected and the local endpoint carries the
/// receive-queue descriptor for `kind`. If the remote endpoint is not
/// published yet the slot stays in Connecting and `Timeout` is returned;
/// a later [`crate::Node::session_connect`] on the same slot completes
/// the bind.
pub fn bind_channel(
    state: &mut NodeState,
    fabric: &Fabric,
    local_ep: EndpointHandle,
    remote_ep: EndpointHandle,
    kind: ChannelKind,
) -> Result<SessionIdx> {
    // The local endpoint must be registered here before it can be bound.
    state.directory.entry(local_ep)?;

    let raw = state
        .pool
        .find_by_port(local_ep.port())
        .ok_or(Error::PortNotBound)?;
    let idx = SessionIdx::new(raw).ok_or(Error::SlotRangeExceeded)?;

    state
        .pool
        .connect_begin(idx, remote_ep, remote_ep.node(), kind)?;

    match fabric.route(remote_ep.decode()) {
        Some(queue) => {
            state.pool.connect_commit(idx, queue)?;
            state.directory.mark_connected(local_ep, remote_ep, kind)?;
            debug!(
                local = local_ep.as_raw(),
                remote = remote_ep.as_raw(),
                slot = idx.as_usize(),
                "channel bound"
            );
            Ok(idx)
        }
        None => Err(Error::Timeout),
    }
}
