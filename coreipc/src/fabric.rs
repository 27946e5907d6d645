//! In-process point-to-point fabric connecting per-core stack instances.
//!
//! The fabric stands in for the privileged transport device: it routes
//! frames between cores by (domain, node, port), owns the bounded receive
//! queue of every published endpoint, and answers remote-endpoint presence
//! queries with an optional deadline. It carries no session state of its
//! own; sessions live in each core's [`crate::session::SessionPool`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::endpoint::EndpointHandle;
use crate::error::{Error, Result};

/// Scalar width tag, negotiated from the payload size at the send site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarWidth {
    W8,
    W16,
    W32,
    W64,
}

impl ScalarWidth {
    /// Width for a scalar payload of `size` bytes: 1, 2 and 4 map to the
    /// exact width, everything else is treated as 64-bit.
    pub fn from_payload_size(size: usize) -> Self {
        match size {
            1 => ScalarWidth::W8,
            2 => ScalarWidth::W16,
            4 => ScalarWidth::W32,
            _ => ScalarWidth::W64,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            ScalarWidth::W8 => 1,
            ScalarWidth::W16 => 2,
            ScalarWidth::W32 => 4,
            ScalarWidth::W64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }
}

/// One discrete message on the wire.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) src: EndpointHandle,
    pub(crate) src_core: u32,
    pub(crate) priority: u32,
    /// Length the sender declared; disagreement with the body is a
    /// protocol fault surfaced as `ShortTransfer`.
    pub(crate) declared_len: u32,
    pub(crate) body: FrameBody,
}

#[derive(Debug, Clone)]
pub(crate) enum FrameBody {
    Packet(Vec<u8>),
    Scalar {
        word0: u32,
        word1: u32,
        width: ScalarWidth,
    },
}

impl Frame {
    pub(crate) fn packet(src: EndpointHandle, src_core: u32, priority: u32, data: Vec<u8>) -> Self {
        Frame {
            src,
            src_core,
            priority,
            declared_len: data.len() as u32,
            body: FrameBody::Packet(data),
        }
    }

    pub(crate) fn scalar(
        src: EndpointHandle,
        src_core: u32,
        word0: u32,
        word1: u32,
        width: ScalarWidth,
    ) -> Self {
        Frame {
            src,
            src_core,
            priority: 0,
            declared_len: width.bytes() as u32,
            body: FrameBody::Scalar {
                word0,
                word1,
                width,
            },
        }
    }
}

/// Poison-tolerant lock acquisition; the protected state is only ever
/// mutated through complete transitions, so a poisoned guard stays valid.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Condvar wait honoring an optional absolute deadline.
/// Returns the reacquired guard and whether the deadline elapsed.
pub(crate) fn wait_until<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> (MutexGuard<'a, T>, bool) {
    match deadline {
        None => (cv.wait(guard).unwrap_or_else(PoisonError::into_inner), false),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return (guard, true);
            }
            let (guard, res) = cv
                .wait_timeout(guard, d - now)
                .unwrap_or_else(PoisonError::into_inner);
            (guard, res.timed_out())
        }
    }
}

pub(crate) struct QueueState {
    pub(crate) frames: VecDeque<Frame>,
    pub(crate) open: bool,
}

/// Bounded receive queue of one published endpoint.
///
/// Shared between the owning core (consumer) and every sending core; the
/// condvar is notified on push, pop and close so both directions of
/// blocking (full senders, empty receivers) wake up.
pub(crate) struct MsgQueue {
    pub(crate) state: Mutex<QueueState>,
    pub(crate) cv: Condvar,
    capacity: usize,
}

impl fmt::Debug for MsgQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgQueue")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

// Queues are shared via `Arc` and have no value semantics; equality is
// identity, which is all `assert_eq!` on `Result<Arc<MsgQueue>, _>` needs.
impl PartialEq for MsgQueue {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

#[derive(Debug)]
pub(crate) enum PushError {
    /// Queue full; the frame is handed back for retry.
    Full(Frame),
    /// Queue closed (endpoint torn down); the frame is handed back.
    Closed(Frame),
}

impl MsgQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(MsgQueue {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                open: true,
            }),
            cv: Condvar::new(),
            capacity,
        })
    }

    /// Non-suspending push.
    pub(crate) fn try_push(&self, frame: Frame) -> std::result::Result<(), PushError> {
        let mut st = lock(&self.state);
        if !st.open {
            return Err(PushError::Closed(frame));
        }
        if st.frames.len() >= self.capacity {
            return Err(PushError::Full(frame));
        }
        st.frames.push_back(frame);
        drop(st);
        self.cv.notify_all();
        Ok(())
    }

    /// Block until the queue has space for a push, is closed, or the
    /// deadline elapses. Returns whether the deadline elapsed; spurious
    /// returns are fine, callers loop and retry.
    pub(crate) fn wait_space(&self, deadline: Option<Instant>) -> bool {
        let st = lock(&self.state);
        if !st.open || st.frames.len() < self.capacity {
            return false;
        }
        let (_guard, timed_out) = wait_until(&self.cv, st, deadline);
        timed_out
    }

    /// Block until a frame is queued, the queue is closed, or the
    /// deadline elapses. Returns whether the deadline elapsed.
    pub(crate) fn wait_nonempty(&self, deadline: Option<Instant>) -> bool {
        let st = lock(&self.state);
        if !st.open || !st.frames.is_empty() {
            return false;
        }
        let (_guard, timed_out) = wait_until(&self.cv, st, deadline);
        timed_out
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).frames.len()
    }

    pub(crate) fn close(&self) {
        let mut st = lock(&self.state);
        st.open = false;
        drop(st);
        self.cv.notify_all();
    }
}

type Addr = (u32, u32, u32);

struct FabricState {
    cores: HashSet<(u32, u32)>,
    endpoints: HashMap<Addr, Arc<MsgQueue>>,
}

/// Shared fabric instance; one per process, handed to every
/// [`crate::Node`] at initialization.
pub struct Fabric {
    state: Mutex<FabricState>,
    presence: Condvar,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Fabric {
            state: Mutex::new(FabricState {
                cores: HashSet::new(),
                endpoints: HashMap::new(),
            }),
            presence: Condvar::new(),
        })
    }

    /// Attach a (domain, node) core. A second attach of the same pair is
    /// rejected; the pair stays taken until [`Fabric::detach`].
    pub(crate) fn attach(&self, domain: u32, node: u32) -> Result<()> {
        let mut st = lock(&self.state);
        if !st.cores.insert((domain, node)) {
            return Err(Error::InvalidAddress);
        }
        Ok(())
    }

    pub(crate) fn detach(&self, domain: u32, node: u32) {
        let mut st = lock(&self.state);
        st.cores.remove(&(domain, node));
        st.endpoints.retain(|addr, _| (addr.0, addr.1) != (domain, node));
    }

    pub(crate) fn publish(&self, addr: Addr, queue: Arc<MsgQueue>) {
        let mut st = lock(&self.state);
        st.endpoints.insert(addr, queue);
        drop(st);
        self.presence.notify_all();
    }

    pub(crate) fn retract(&self, addr: Addr) {
        let mut st = lock(&self.state);
        if let Some(queue) = st.endpoints.remove(&addr) {
            queue.close();
        }
    }

    /// Non-suspending presence/route query.
    pub(crate) fn route(&self, addr: Addr) -> Option<Arc<MsgQueue>> {
        lock(&self.state).endpoints.get(&addr).cloned()
    }

    /// Suspending presence query: waits until the endpoint is published
    /// or the deadline elapses.
    pub(crate) fn wait_for(&self, addr: Addr, deadline: Option<Instant>) -> Option<Arc<MsgQueue>> {
        let mut st = lock(&self.state);
        loop {
            if let Some(queue) = st.endpoints.get(&addr) {
                return Some(queue.clone());
            }
            let (guard, timed_out) = wait_until(&self.presence, st, deadline);
            st = guard;
            if timed_out {
                return None;
            }
        }
    }
}
