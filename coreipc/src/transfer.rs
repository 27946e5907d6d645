//! Transfer engine: packet and scalar movement over connected sessions.
//!
//! Every operation exists in two disciplines. Blocking calls suspend the
//! calling thread until completion or deadline; non-blocking calls return
//! an owned [`Request`] that is advanced by [`Request::poll`] and reaped
//! exactly once by [`Request::wait`]. Both disciplines share one decision
//! path against the endpoint's receive queue, and neither ever holds the
//! directory lock while suspended. A `wait` that times out hands the
//! request back: the underlying transfer is not cancelled and can still
//! complete on a later poll.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::error;

use crate::endpoint::EndpointHandle;
use crate::error::{Error, Result};
use crate::fabric::{lock, Frame, FrameBody, MsgQueue, PushError, ScalarWidth};

pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

/// A received scalar: two words plus the negotiated width tag and the
/// sender's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarMsg {
    pub word0: u32,
    pub word1: u32,
    pub width: ScalarWidth,
    pub src: EndpointHandle,
    pub src_core: u32,
}

/// Terminal payload of a completed request.
#[derive(Debug, Clone)]
pub enum Completion {
    Sent { len: usize },
    Packet {
        data: Vec<u8>,
        src: EndpointHandle,
        src_core: u32,
        priority: u32,
    },
    Scalar(ScalarMsg),
}

impl Completion {
    /// Transferred size: the payload length for packets, exactly the
    /// negotiated width for scalars.
    pub fn size(&self) -> usize {
        match self {
            Completion::Sent { len } => *len,
            Completion::Packet { data, .. } => data.len(),
            Completion::Scalar(msg) => msg.width.bytes(),
        }
    }
}

/// Snapshot returned by [`Request::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Completed(usize),
    Failed(Error),
}

/// Outcome of [`Request::wait`]. A timeout returns the request itself so
/// the in-flight transfer can be re-waited or explicitly abandoned.
#[derive(Debug)]
pub enum WaitOutcome {
    Completed(Completion),
    Failed(Error),
    TimedOut(Request),
}

enum Op {
    Send {
        queue: Arc<MsgQueue>,
        frame: Option<Frame>,
    },
    RecvPacket {
        queue: Arc<MsgQueue>,
        capacity: usize,
    },
    RecvScalar {
        queue: Arc<MsgQueue>,
    },
}

/// Handle for an outstanding non-blocking transfer.
///
/// Transitions Pending → Completed/Failed at most once; the terminal
/// state is immutable and the handle is consumed by `wait`.
pub struct Request {
    op: Op,
    done: Option<Result<Completion>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match &self.op {
            Op::Send { .. } => "send",
            Op::RecvPacket { .. } => "recv_packet",
            Op::RecvScalar { .. } => "recv_scalar",
        };
        f.debug_struct("Request")
            .field("op", &op)
            .field("done", &self.done)
            .finish()
    }
}

impl Request {
    pub(crate) fn send(queue: Arc<MsgQueue>, frame: Frame) -> Self {
        let mut req = Request {
            op: Op::Send {
                queue,
                frame: Some(frame),
            },
            done: None,
        };
        req.advance();
        req
    }

    pub(crate) fn recv_packet(queue: Arc<MsgQueue>, capacity: usize) -> Self {
        let mut req = Request {
            op: Op::RecvPacket { queue, capacity },
            done: None,
        };
        req.advance();
        req
    }

    pub(crate) fn recv_scalar(queue: Arc<MsgQueue>) -> Self {
        let mut req = Request {
            op: Op::RecvScalar { queue },
            done: None,
        };
        req.advance();
        req
    }

    /// Non-suspending completion check. Attempts one step of progress
    /// against the transport, then reports the recorded state.
    pub fn poll(&mut self) -> RequestStatus {
        self.advance();
        match &self.done {
            None => RequestStatus::Pending,
            Some(Ok(c)) => RequestStatus::Completed(c.size()),
            Some(Err(e)) => RequestStatus::Failed(*e),
        }
    }

    /// Suspend up to `timeout` (forever when `None`) for the terminal
    /// state, consuming the handle on completion or failure.
    pub fn wait(mut self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = deadline_after(timeout);
        loop {
            self.advance();
            if let Some(res) = self.done.take() {
                return match res {
                    Ok(c) => WaitOutcome::Completed(c),
                    Err(e) => WaitOutcome::Failed(e),
                };
            }
            let timed_out = match &self.op {
                Op::Send { queue, .. } => queue.wait_space(deadline),
                Op::RecvPacket { queue, .. } | Op::RecvScalar { queue } => {
                    queue.wait_nonempty(deadline)
                }
            };
            if timed_out {
                return WaitOutcome::TimedOut(self);
            }
        }
    }

    fn advance(&mut self) {
        if self.done.is_some() {
            return;
        }
        self.done = match &mut self.op {
            Op::Send { queue, frame } => match frame.take() {
                None => Some(Err(Error::SessionNotConnected)),
                Some(f) => {
                    let len = f.declared_len as usize;
                    match queue.try_push(f) {
                        Ok(()) => Some(Ok(Completion::Sent { len })),
                        Err(PushError::Full(f)) => {
                            *frame = Some(f);
                            None
                        }
                        Err(PushError::Closed(_)) => Some(Err(Error::SessionNotConnected)),
                    }
                }
            },
            Op::RecvPacket { queue, capacity } => take_packet(queue, *capacity),
            Op::RecvScalar { queue } => take_scalar(queue),
        };
    }
}

enum Decision {
    Wait,
    /// Fail and leave the frame queued (retryable by the caller).
    Fail(Error),
    /// Fail and discard the corrupt frame.
    DropFail(Error),
    Take,
}

/// One receive attempt for a packet session. `None` means nothing is
/// queued yet. A too-small buffer fails without consuming the message;
/// a declared/received length mismatch discards the frame and fails
/// loudly on the diagnostic channel.
fn take_packet(queue: &MsgQueue, capacity: usize) -> Option<Result<Completion>> {
    let mut st = lock(&queue.state);
    let decision = match st.frames.front() {
        None => {
            if st.open {
                Decision::Wait
            } else {
                Decision::Fail(Error::UnknownEndpoint)
            }
        }
        Some(frame) => match &frame.body {
            FrameBody::Scalar { .. } => Decision::Fail(Error::KindMismatch),
            FrameBody::Packet(data) => {
                let declared = frame.declared_len as usize;
                let received = data.len();
                if declared != received {
                    Decision::DropFail(Error::ShortTransfer { declared, received })
                } else if received > capacity {
                    Decision::Fail(Error::BufferTooSmall { needed: received })
                } else {
                    Decision::Take
                }
            }
        },
    };
    match decision {
        Decision::Wait => None,
        Decision::Fail(e) => Some(Err(e)),
        Decision::DropFail(e) => {
            st.frames.pop_front();
            drop(st);
            queue.cv.notify_all();
            if let Error::ShortTransfer { declared, received } = e {
                error!(declared, received, "short transfer on packet receive");
            }
            Some(Err(e))
        }
        Decision::Take => {
            let frame = st.frames.pop_front()?;
            drop(st);
            queue.cv.notify_all();
            match frame.body {
                FrameBody::Packet(data) => Some(Ok(Completion::Packet {
                    data,
                    src: frame.src,
                    src_core: frame.src_core,
                    priority: frame.priority,
                })),
                FrameBody::Scalar { .. } => Some(Err(Error::KindMismatch)),
            }
        }
    }
}

/// One receive attempt for a scalar session.
fn take_scalar(queue: &MsgQueue) -> Option<Result<Completion>> {
    let mut st = lock(&queue.state);
    let decision = match st.frames.front() {
        None => {
            if st.open {
                Decision::Wait
            } else {
                Decision::Fail(Error::UnknownEndpoint)
            }
        }
        Some(frame) => match &frame.body {
            FrameBody::Packet(_) => Decision::Fail(Error::KindMismatch),
            FrameBody::Scalar { width, .. } => {
                let declared = frame.declared_len as usize;
                let received = width.bytes();
                if declared != received {
                    Decision::DropFail(Error::ShortTransfer { declared, received })
                } else {
                    Decision::Take
                }
            }
        },
    };
    match decision {
        Decision::Wait => None,
        Decision::Fail(e) => Some(Err(e)),
        Decision::DropFail(e) => {
            st.frames.pop_front();
            drop(st);
            queue.cv.notify_all();
            if let Error::ShortTransfer { declared, received } = e {
                error!(declared, received, "short transfer on scalar receive");
            }
            Some(Err(e))
        }
        Decision::Take => {
            let frame = st.frames.pop_front()?;
            drop(st);
            queue.cv.notify_all();
            match frame.body {
                FrameBody::Scalar {
                    word0,
                    word1,
                    width,
                } => Some(Ok(Completion::Scalar(ScalarMsg {
                    word0,
                    word1,
                    width,
                    src: frame.src,
                    src_core: frame.src_core,
                }))),
                FrameBody::Packet(_) => Some(Err(Error::KindMismatch)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> EndpointHandle {
        EndpointHandle::encode(0, 1, 5).unwrap()
    }

    #[test]
    fn test_scalar_width_mapping() {
        assert_eq!(ScalarWidth::from_payload_size(1), ScalarWidth::W8);
        assert_eq!(ScalarWidth::from_payload_size(2), ScalarWidth::W16);
        assert_eq!(ScalarWidth::from_payload_size(4), ScalarWidth::W32);
        assert_eq!(ScalarWidth::from_payload_size(8), ScalarWidth::W64);
        assert_eq!(ScalarWidth::from_payload_size(3), ScalarWidth::W64);
        assert_eq!(ScalarWidth::W32.bits(), 32);
    }

    #[test]
    fn test_recv_request_completes_after_push() {
        let q = MsgQueue::new(4);
        let mut req = Request::recv_packet(q.clone(), 64);
        assert_eq!(req.poll(), RequestStatus::Pending);

        q.try_push(Frame::packet(src(), 1, 0, b"hi".to_vec())).unwrap();
        assert_eq!(req.poll(), RequestStatus::Completed(2));

        match req.wait(Some(Duration::from_millis(10))) {
            WaitOutcome::Completed(Completion::Packet { data, src: s, .. }) => {
                assert_eq!(data, b"hi");
                assert_eq!(s, src());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_buffer_too_small_leaves_message_queued() {
        let q = MsgQueue::new(4);
        q.try_push(Frame::packet(src(), 1, 0, vec![0u8; 16])).unwrap();

        let mut small = Request::recv_packet(q.clone(), 8);
        assert_eq!(
            small.poll(),
            RequestStatus::Failed(Error::BufferTooSmall { needed: 16 })
        );
        // The message is still there for a retry with a big enough buffer.
        assert_eq!(q.len(), 1);
        let mut big = Request::recv_packet(q.clone(), 16);
        assert_eq!(big.poll(), RequestStatus::Completed(16));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_packet_priority_surfaced() {
        let q = MsgQueue::new(4);
        q.try_push(Frame::packet(src(), 1, 7, b"urgent".to_vec()))
            .unwrap();
        let req = Request::recv_packet(q, 64);
        match req.wait(None) {
            WaitOutcome::Completed(Completion::Packet { priority, .. }) => {
                assert_eq!(priority, 7);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_short_transfer_detected_and_dropped() {
        let q = MsgQueue::new(4);
        let mut frame = Frame::packet(src(), 1, 0, vec![0u8; 8]);
        frame.declared_len = 12;
        q.try_push(frame).unwrap();

        let mut req = Request::recv_packet(q.clone(), 64);
        assert_eq!(
            req.poll(),
            RequestStatus::Failed(Error::ShortTransfer {
                declared: 12,
                received: 8
            })
        );
        // Corrupt frame is discarded, not redelivered.
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_kind_mismatch_on_cross_recv() {
        let q = MsgQueue::new(4);
        q.try_push(Frame::scalar(src(), 1, 4, 0, ScalarWidth::W32))
            .unwrap();
        let mut req = Request::recv_packet(q.clone(), 64);
        assert_eq!(req.poll(), RequestStatus::Failed(Error::KindMismatch));
        // The frame stays queued for a scalar receive.
        let mut scl = Request::recv_scalar(q.clone());
        match scl.poll() {
            RequestStatus::Completed(4) => {}
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[test]
    fn test_send_request_pending_while_full() {
        let q = MsgQueue::new(1);
        q.try_push(Frame::packet(src(), 1, 0, vec![1])).unwrap();

        let mut req = Request::send(q.clone(), Frame::packet(src(), 1, 0, vec![2, 2]));
        assert_eq!(req.poll(), RequestStatus::Pending);

        // Drain one slot; the pending send then goes through.
        let mut drain = Request::recv_packet(q.clone(), 64);
        assert_eq!(drain.poll(), RequestStatus::Completed(1));
        assert_eq!(req.poll(), RequestStatus::Completed(2));
    }

    #[test]
    fn test_wait_times_out_and_returns_request() {
        let q = MsgQueue::new(4);
        let req = Request::recv_packet(q.clone(), 64);
        match req.wait(Some(Duration::from_millis(20))) {
            WaitOutcome::TimedOut(req) => {
                // The transfer is still live: deliver and reap it.
                q.try_push(Frame::packet(src(), 1, 0, b"late".to_vec()))
                    .unwrap();
                match req.wait(Some(Duration::from_millis(100))) {
                    WaitOutcome::Completed(c) => assert_eq!(c.size(), 4),
                    other => panic!("unexpected outcome: {:?}", other),
                }
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_scalar_round_trip_words() {
        let q = MsgQueue::new(4);
        q.try_push(Frame::scalar(src(), 2, 0xdead_beef, 0x1234, ScalarWidth::W64))
            .unwrap();
        let mut req = Request::recv_scalar(q);
        match req.poll() {
            RequestStatus::Completed(8) => {}
            other => panic!("unexpected status: {:?}", other),
        }
        match req.wait(None) {
            WaitOutcome::Completed(Completion::Scalar(msg)) => {
                assert_eq!(msg.word0, 0xdead_beef);
                assert_eq!(msg.word1, 0x1234);
                assert_eq!(msg.width, ScalarWidth::W64);
                assert_eq!(msg.src_core, 2);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
