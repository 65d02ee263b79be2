//! Channels.
//!
//! A channel is a buffered queue plus FIFO queues of waiting fibers. The
//! VM owns the scheduling: `try_send`/`try_recv` never block, they report
//! whether the caller must suspend and which fiber (if any) to wake. Close
//! wakes every waiter in FIFO order.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::types::TypeHandle;
use crate::value::Value;

pub struct Channel {
    pub elem: TypeHandle,
    pub cap: usize,
    state: RefCell<ChanState>,
}

#[derive(Default)]
struct ChanState {
    queue: VecDeque<Value>,
    closed: bool,
    /// Fibers blocked on receive.
    recv_waiters: VecDeque<u32>,
    /// Fibers blocked on send, with the value they are sending.
    send_waiters: VecDeque<(u32, Value)>,
    /// Fibers parked in a select that includes this channel.
    select_waiters: VecDeque<u32>,
}

/// Outcome of a non-blocking send attempt.
pub enum SendOutcome {
    /// Value delivered (buffered or handed to a receiver); the fiber id,
    /// if present, must be woken.
    Sent(Option<u32>),
    /// Buffer full and no receiver: the caller must block.
    WouldBlock,
    /// Send on closed channel: runtime panic.
    Closed,
}

/// Outcome of a non-blocking receive attempt.
pub enum RecvOutcome {
    /// Value received; the fiber id, if present, is a sender to wake.
    Received(Value, Option<u32>),
    /// Channel closed and drained: zero value, ok=false.
    Drained,
    /// Nothing available: the caller must block.
    WouldBlock,
}

impl Channel {
    pub fn new(elem: TypeHandle, cap: usize) -> Channel {
        Channel {
            elem,
            cap,
            state: RefCell::new(ChanState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Attempts to send without blocking.
    pub fn try_send(&self, v: Value) -> SendOutcome {
        let mut st = self.state.borrow_mut();
        if st.closed {
            return SendOutcome::Closed;
        }
        if let Some(receiver) = st.recv_waiters.pop_front() {
            // Direct handoff: the receiver will pick the value from the
            // front of the queue when it resumes.
            st.queue.push_back(v);
            return SendOutcome::Sent(Some(receiver));
        }
        if st.queue.len() < self.cap {
            st.queue.push_back(v);
            let woken = st.select_waiters.pop_front();
            return SendOutcome::Sent(woken);
        }
        SendOutcome::WouldBlock
    }

    /// Attempts to receive without blocking.
    pub fn try_recv(&self) -> RecvOutcome {
        let mut st = self.state.borrow_mut();
        if let Some(v) = st.queue.pop_front() {
            // A parked sender can now move its value into the buffer.
            if let Some((sender, pending)) = st.send_waiters.pop_front() {
                st.queue.push_back(pending);
                return RecvOutcome::Received(v, Some(sender));
            }
            let woken = st.select_waiters.pop_front();
            return RecvOutcome::Received(v, woken);
        }
        if let Some((sender, pending)) = st.send_waiters.pop_front() {
            // Unbuffered rendezvous.
            return RecvOutcome::Received(pending, Some(sender));
        }
        if st.closed {
            return RecvOutcome::Drained;
        }
        RecvOutcome::WouldBlock
    }

    pub fn park_sender(&self, fiber: u32, v: Value) {
        self.state.borrow_mut().send_waiters.push_back((fiber, v));
    }

    pub fn park_receiver(&self, fiber: u32) {
        self.state.borrow_mut().recv_waiters.push_back(fiber);
    }

    pub fn park_selector(&self, fiber: u32) {
        let mut st = self.state.borrow_mut();
        if !st.select_waiters.contains(&fiber) {
            st.select_waiters.push_back(fiber);
        }
    }

    pub fn unpark_selector(&self, fiber: u32) {
        self.state.borrow_mut().select_waiters.retain(|f| *f != fiber);
    }

    /// Removes a parked receiver (used when a blocked receive is cancelled).
    pub fn unpark_receiver(&self, fiber: u32) {
        self.state.borrow_mut().recv_waiters.retain(|f| *f != fiber);
    }

    pub fn unpark_sender(&self, fiber: u32) {
        self.state.borrow_mut().send_waiters.retain(|(f, _)| *f != fiber);
    }

    /// Closes the channel, returning every waiting fiber in FIFO order.
    /// Closing an already-closed channel is a runtime panic; the VM checks
    /// the returned flag.
    pub fn close(&self) -> (bool, Vec<u32>) {
        let mut st = self.state.borrow_mut();
        if st.closed {
            return (false, Vec::new());
        }
        st.closed = true;
        let mut woken: Vec<u32> = st.recv_waiters.drain(..).collect();
        woken.extend(st.send_waiters.drain(..).map(|(f, _)| f));
        woken.extend(st.select_waiters.drain(..));
        (true, woken)
    }

    /// A send case of a select is ready if it would not block.
    pub fn send_ready(&self) -> bool {
        let st = self.state.borrow();
        st.closed || !st.recv_waiters.is_empty() || st.queue.len() < self.cap
    }

    /// A receive case of a select is ready if it would not block.
    pub fn recv_ready(&self) -> bool {
        let st = self.state.borrow();
        !st.queue.is_empty() || !st.send_waiters.is_empty() || st.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BasicKind, Type};

    #[test]
    fn buffered_send_recv() {
        let ch = Channel::new(Type::basic(BasicKind::Int), 2);
        assert!(matches!(ch.try_send(Value::Int(1)), SendOutcome::Sent(None)));
        assert!(matches!(ch.try_send(Value::Int(2)), SendOutcome::Sent(None)));
        assert!(matches!(ch.try_send(Value::Int(3)), SendOutcome::WouldBlock));
        match ch.try_recv() {
            RecvOutcome::Received(v, None) => assert_eq!(v.as_int(), 1),
            _ => panic!("expected value"),
        }
    }

    #[test]
    fn unbuffered_rendezvous_wakes_sender() {
        let ch = Channel::new(Type::basic(BasicKind::Int), 0);
        assert!(matches!(ch.try_send(Value::Int(9)), SendOutcome::WouldBlock));
        ch.park_sender(7, Value::Int(9));
        match ch.try_recv() {
            RecvOutcome::Received(v, Some(7)) => assert_eq!(v.as_int(), 9),
            _ => panic!("expected rendezvous with sender 7"),
        }
    }

    #[test]
    fn close_releases_waiters_in_fifo_order() {
        let ch = Channel::new(Type::basic(BasicKind::Int), 0);
        for f in 0..5 {
            ch.park_receiver(f);
        }
        let (first, woken) = ch.close();
        assert!(first);
        assert_eq!(woken, vec![0, 1, 2, 3, 4]);
        let (again, _) = ch.close();
        assert!(!again);
        assert!(matches!(ch.try_recv(), RecvOutcome::Drained));
    }

    #[test]
    fn recv_on_closed_drains_buffer_first() {
        let ch = Channel::new(Type::basic(BasicKind::Int), 1);
        let _ = ch.try_send(Value::Int(5));
        ch.close();
        assert!(matches!(ch.try_recv(), RecvOutcome::Received(_, None)));
        assert!(matches!(ch.try_recv(), RecvOutcome::Drained));
    }
}
