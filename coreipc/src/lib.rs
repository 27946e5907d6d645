//! coreipc - Session-oriented inter-core message transport over a shared
//! fabric, in the MCAPI mold: endpoints addressed by (domain, node, port),
//! fixed session pools, and packet/scalar transfers in blocking and
//! non-blocking disciplines.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────┐      ┌────────────────────────────┐
//! │        Node (0,0)          │      │        Node (0,1)          │
//! │  ┌──────────┐ ┌─────────┐  │      │  ┌──────────┐ ┌─────────┐  │
//! │  │Directory │ │ Session │  │      │  │Directory │ │ Session │  │
//! │  │ port→ep  │ │  Pool   │  │      │  │ port→ep  │ │  Pool   │  │
//! │  └──────────┘ └─────────┘  │      │  └──────────┘ └─────────┘  │
//! │        │ one Mutex │       │      │        │ one Mutex │       │
//! └────────┼───────────┼───────┘      └────────┼───────────┼───────┘
//!          ▼           ▼                       ▼           ▼
//!     ┌──────────────────────────────────────────────────────────┐
//!     │                        Fabric                            │
//!     │   (domain,node,port) → bounded MsgQueue  +  presence cv  │
//!     └──────────────────────────────────────────────────────────┘
//! ```
//!
//! - **One lock per node**: directory and session pool share a single
//!   mutex; transfer calls never hold it while suspended.
//! - **Connect is two-phase**: the slot enters Connecting under the lock
//!   and only commits to Connected once the fabric acknowledges the peer.
//! - **Requests are owned**: non-blocking transfers hand back a
//!   [`Request`] that is polled freely and reaped exactly once.

pub mod channel;
pub mod endpoint;
pub mod error;
pub mod fabric;
pub mod session;
pub mod status;
pub mod transfer;
pub mod uncached;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::info;

pub use endpoint::{Directory, EndpointHandle, MAX_DOMAINS, MAX_ENDPOINTS, MAX_NODES, MAX_PORTS};
pub use error::{Error, Result};
pub use fabric::{Fabric, ScalarWidth};
pub use session::{ChannelKind, SessionIdx, SessionPool, SessionState, MAX_SESSIONS};
pub use status::{NodeStatus, SessionStatus};
pub use transfer::{Completion, Request, RequestStatus, ScalarMsg, WaitOutcome};
pub use uncached::{UncachedAllocator, UncachedBuf};

use fabric::{lock, Frame, MsgQueue};
use transfer::deadline_after;

/// Default per-endpoint receive queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Default maximum packet payload in bytes.
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;

/// Per-node tunables, fixed at initialization.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    /// Frames a single endpoint queue holds before senders back off.
    pub queue_depth: usize,
    /// Largest accepted packet payload; larger sends fail with
    /// [`Error::PayloadTooLarge`] before touching the fabric.
    pub max_payload: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Directory and session pool of one node, behind the node's single lock.
pub struct NodeState {
    pub(crate) directory: Directory,
    pub(crate) pool: SessionPool,
}

impl NodeState {
    pub(crate) fn new(domain: u32, node: u32) -> Self {
        NodeState {
            directory: Directory::new(domain, node),
            pool: SessionPool::new(),
        }
    }
}

/// One core's transport stack instance.
///
/// Created by [`Node::initialize`], torn down by [`Node::finalize`] or
/// drop; either way every published endpoint is retracted from the fabric
/// and its queue closed, so peers see sends fail rather than hang.
pub struct Node {
    fabric: Arc<Fabric>,
    domain: u32,
    node: u32,
    config: NodeConfig,
    state: Mutex<NodeState>,
    uncached: UncachedAllocator,
}

impl Node {
    /// Attach a (domain, node) stack instance to the fabric. The pair must
    /// be unattached and within the address ranges of the packed handle.
    pub fn initialize(
        fabric: &Arc<Fabric>,
        domain: u32,
        node: u32,
        config: NodeConfig,
    ) -> Result<Node> {
        if domain >= MAX_DOMAINS || node >= MAX_NODES {
            return Err(Error::InvalidAddress);
        }
        fabric.attach(domain, node)?;
        info!(domain, node, "node attached");
        Ok(Node {
            fabric: fabric.clone(),
            domain,
            node,
            config,
            state: Mutex::new(NodeState::new(domain, node)),
            uncached: UncachedAllocator::new(),
        })
    }

    /// This node's identity on the fabric.
    pub fn addr(&self) -> (u32, u32) {
        (self.domain, self.node)
    }

    /// Explicit teardown; equivalent to dropping the node.
    pub fn finalize(self) {}

    // === Endpoint directory ===

    /// Create (or re-fetch) the local endpoint on `port` and publish it.
    pub fn endpoint_create(&self, port: u32) -> Result<EndpointHandle> {
        let depth = self.config.queue_depth;
        let mut st = self.lock_state();
        let (handle, created) = st.directory.register(port, || MsgQueue::new(depth))?;
        if created {
            let queue = st.directory.entry(handle)?.queue.clone();
            drop(st);
            self.fabric.publish((self.domain, self.node, port), queue);
        }
        Ok(handle)
    }

    /// Tear down a local, unconnected endpoint.
    pub fn endpoint_delete(&self, handle: EndpointHandle) -> Result<()> {
        let mut st = self.lock_state();
        let queue = st.directory.unregister(handle)?;
        drop(st);
        self.fabric.retract(handle.decode());
        queue.close();
        Ok(())
    }

    /// Suspend until the remote endpoint is published, up to `timeout`
    /// (forever when `None`).
    pub fn endpoint_get(
        &self,
        domain: u32,
        node: u32,
        port: u32,
        timeout: Option<Duration>,
    ) -> Result<EndpointHandle> {
        let handle = EndpointHandle::encode(domain, node, port)?;
        match self.fabric.wait_for((domain, node, port), deadline_after(timeout)) {
            Some(_) => Ok(handle),
            None => Err(Error::Timeout),
        }
    }

    /// Non-suspending remote lookup; `None` while unpublished.
    pub fn endpoint_get_nonblocking(
        &self,
        domain: u32,
        node: u32,
        port: u32,
    ) -> Result<Option<EndpointHandle>> {
        let handle = EndpointHandle::encode(domain, node, port)?;
        Ok(self.fabric.route((domain, node, port)).map(|_| handle))
    }

    /// Resolve a handle back to its (domain, node, port) triple. Only
    /// handles live in this node's directory resolve; a deleted or
    /// foreign handle is `UnknownEndpoint` even though its bit pattern
    /// still decodes.
    pub fn endpoint_resolve(&self, handle: EndpointHandle) -> Result<(u32, u32, u32)> {
        let st = self.lock_state();
        st.directory.resolve(handle)
    }

    /// Frames currently queued on a local endpoint.
    pub fn available(&self, handle: EndpointHandle) -> Result<u32> {
        let st = self.lock_state();
        Ok(st.directory.entry(handle)?.queue.len() as u32)
    }

    // === Session pool ===

    /// Allocate a session slot anchored on a local endpoint.
    pub fn session_create(&self, local_ep: EndpointHandle, kind: ChannelKind) -> Result<SessionIdx> {
        let mut st = self.lock_state();
        st.directory.entry(local_ep)?;
        st.pool.create(local_ep, kind)
    }

    /// Connect a session to a remote endpoint, suspending up to `timeout`
    /// for the peer to be published. `remote_core` must agree with the
    /// node field of `remote_ep`. On timeout the slot stays in Connecting
    /// and a later call on the same slot resumes the connect.
    pub fn session_connect(
        &self,
        idx: SessionIdx,
        remote_ep: EndpointHandle,
        remote_core: u32,
        kind: ChannelKind,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if remote_core != remote_ep.node() {
            return Err(Error::InvalidAddress);
        }
        let local_ep = {
            let mut st = self.lock_state();
            let (state, prev_remote, prev_kind, local_ep) = {
                let s = st.pool.occupied(idx)?;
                (s.state, s.remote_ep, s.kind, s.local_ep)
            };
            match state {
                SessionState::Created => {
                    st.pool.connect_begin(idx, remote_ep, remote_core, kind)?;
                }
                // Resume a connect that previously timed out on this peer.
                SessionState::Connecting if prev_remote == Some(remote_ep) => {
                    if prev_kind != kind {
                        return Err(Error::KindMismatch);
                    }
                }
                _ => return Err(Error::AlreadyConnected),
            }
            local_ep
        };

        // Suspended fabric wait happens outside the node lock.
        let queue = self
            .fabric
            .wait_for(remote_ep.decode(), deadline_after(timeout))
            .ok_or(Error::Timeout)?;

        let mut st = self.lock_state();
        st.pool.connect_commit(idx, queue)?;
        st.directory.mark_connected(local_ep, remote_ep, kind)?;
        Ok(())
    }

    /// Tear down a session; idempotent. The slot goes through Closing to
    /// Free from any state, its index becomes reusable, and the local
    /// endpoint is unmarked so it can later be deleted.
    pub fn session_disconnect(&self, idx: SessionIdx) -> Result<()> {
        self.release_session(idx)
    }

    /// Free a session slot; same teardown as
    /// [`Node::session_disconnect`], kept as the destroy entry point.
    pub fn session_destroy(&self, idx: SessionIdx) -> Result<()> {
        self.release_session(idx)
    }

    fn release_session(&self, idx: SessionIdx) -> Result<()> {
        let mut st = self.lock_state();
        if let Some(local_ep) = st.pool.release(idx) {
            let _ = st.directory.mark_disconnected(local_ep);
        }
        Ok(())
    }

    // === Packet transfers ===

    /// Blocking packet send; returns the transferred length.
    pub fn send(
        &self,
        idx: SessionIdx,
        data: &[u8],
        priority: u32,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let req = self.send_async(idx, data, priority)?;
        match req.wait(timeout) {
            WaitOutcome::Completed(c) => Ok(c.size()),
            WaitOutcome::Failed(e) => Err(e),
            WaitOutcome::TimedOut(_) => Err(Error::Timeout),
        }
    }

    /// Non-blocking packet send.
    pub fn send_async(&self, idx: SessionIdx, data: &[u8], priority: u32) -> Result<Request> {
        if data.len() > self.config.max_payload {
            return Err(Error::PayloadTooLarge);
        }
        let (queue, local_ep) = self.connected_route(idx, ChannelKind::Packet)?;
        let frame = Frame::packet(local_ep, self.node, priority, data.to_vec());
        Ok(Request::send(queue, frame))
    }

    /// Blocking packet receive into `buf`; returns the received length
    /// and the sender's endpoint. A too-small `buf` fails with
    /// [`Error::BufferTooSmall`] and leaves the message queued.
    pub fn recv(
        &self,
        idx: SessionIdx,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<(usize, EndpointHandle)> {
        let req = self.recv_async(idx, buf.len())?;
        match req.wait(timeout) {
            WaitOutcome::Completed(Completion::Packet { data, src, .. }) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), src))
            }
            WaitOutcome::Completed(_) => Err(Error::KindMismatch),
            WaitOutcome::Failed(e) => Err(e),
            WaitOutcome::TimedOut(_) => Err(Error::Timeout),
        }
    }

    /// Non-blocking packet receive for a caller buffer of `capacity`.
    pub fn recv_async(&self, idx: SessionIdx, capacity: usize) -> Result<Request> {
        let queue = self.local_queue(idx, ChannelKind::Packet)?;
        Ok(Request::recv_packet(queue, capacity))
    }

    // === Scalar transfers ===

    /// Blocking scalar send. `size` picks the width tag: 1, 2 and 4 map
    /// to 8/16/32 bits, anything else is sent as 64-bit with both words.
    pub fn scalar_send(
        &self,
        idx: SessionIdx,
        word0: u32,
        word1: u32,
        size: usize,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let req = self.scalar_send_async(idx, word0, word1, size)?;
        match req.wait(timeout) {
            WaitOutcome::Completed(_) => Ok(()),
            WaitOutcome::Failed(e) => Err(e),
            WaitOutcome::TimedOut(_) => Err(Error::Timeout),
        }
    }

    /// Non-blocking scalar send.
    pub fn scalar_send_async(
        &self,
        idx: SessionIdx,
        word0: u32,
        word1: u32,
        size: usize,
    ) -> Result<Request> {
        let (queue, local_ep) = self.connected_route(idx, ChannelKind::Scalar)?;
        let width = ScalarWidth::from_payload_size(size);
        let frame = Frame::scalar(local_ep, self.node, word0, word1, width);
        Ok(Request::send(queue, frame))
    }

    /// Blocking scalar receive.
    pub fn scalar_recv(&self, idx: SessionIdx, timeout: Option<Duration>) -> Result<ScalarMsg> {
        let req = self.scalar_recv_async(idx)?;
        match req.wait(timeout) {
            WaitOutcome::Completed(Completion::Scalar(msg)) => Ok(msg),
            WaitOutcome::Completed(_) => Err(Error::KindMismatch),
            WaitOutcome::Failed(e) => Err(e),
            WaitOutcome::TimedOut(_) => Err(Error::Timeout),
        }
    }

    /// Non-blocking scalar receive.
    pub fn scalar_recv_async(&self, idx: SessionIdx) -> Result<Request> {
        let queue = self.local_queue(idx, ChannelKind::Scalar)?;
        Ok(Request::recv_scalar(queue))
    }

    // === Status and diagnostics ===

    pub fn session_status(&self, idx: SessionIdx) -> Result<SessionStatus> {
        let st = self.lock_state();
        status::session_status(&st.pool, idx)
    }

    pub fn node_status(&self) -> NodeStatus {
        let st = self.lock_state();
        status::node_status(&st.pool)
    }

    // === Uncached buffers ===

    /// Allocate an uncached (DMA-capable) buffer of at least `size` bytes.
    pub fn alloc_uncached(&self, size: usize) -> Result<UncachedBuf> {
        self.uncached.allocate(size)
    }

    /// Release an uncached buffer; the exact triple from the matching
    /// [`Node::alloc_uncached`] is required.
    pub fn release_uncached(&self, ptr: *mut u8, size: usize, paddr: u64) -> Result<()> {
        self.uncached.release(ptr, size, paddr)
    }

    // === Channel binder ===

    /// One-step non-suspending bind of the session owning `local_ep`'s
    /// port to `remote_ep`; see [`channel::bind_channel`].
    pub fn bind_channel(
        &self,
        local_ep: EndpointHandle,
        remote_ep: EndpointHandle,
        kind: ChannelKind,
    ) -> Result<SessionIdx> {
        let mut st = self.lock_state();
        channel::bind_channel(&mut st, &self.fabric, local_ep, remote_ep, kind)
    }

    // === Internals ===

    fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        lock(&self.state)
    }

    /// Connected-session route for a send: destination queue plus the
    /// local endpoint stamped as the frame source.
    fn connected_route(
        &self,
        idx: SessionIdx,
        kind: ChannelKind,
    ) -> Result<(Arc<MsgQueue>, EndpointHandle)> {
        let st = self.lock_state();
        let session = st.pool.occupied(idx)?;
        if session.state != SessionState::Connected {
            return Err(Error::SessionNotConnected);
        }
        if session.kind != kind {
            return Err(Error::KindMismatch);
        }
        let queue = session
            .remote_queue
            .clone()
            .ok_or(Error::SessionNotConnected)?;
        Ok((queue, session.local_ep))
    }

    /// Local endpoint queue for a receive on a connected session.
    fn local_queue(&self, idx: SessionIdx, kind: ChannelKind) -> Result<Arc<MsgQueue>> {
        let st = self.lock_state();
        let session = st.pool.occupied(idx)?;
        if session.state != SessionState::Connected {
            return Err(Error::SessionNotConnected);
        }
        if session.kind != kind {
            return Err(Error::KindMismatch);
        }
        Ok(st.directory.entry(session.local_ep)?.queue.clone())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let mut st = self.lock_state();
        for (port, queue) in st.directory.drain() {
            self.fabric.retract((self.domain, self.node, port));
            queue.close();
        }
        drop(st);
        self.fabric.detach(self.domain, self.node);
        info!(domain = self.domain, node = self.node, "node detached");
    }
}
