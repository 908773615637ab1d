//! Completion events and the channel that carries them into an agent.
//!
//! I/O tasks never touch ships or tours. Each of them ends by posting one
//! [`Letter`] into the owning agent's [`Postbox`]; the agent drains its queue
//! serially, which makes the agent loop the single writer of all connection state.
use std::{cell::RefCell, collections::VecDeque, io, rc::Rc, time::Duration};

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;

use crate::{
    agent::AgentCommand,
    rudder::{AcceptedAddr, AcceptedStream, ReadSide, RudderId, WriteSide},
};

pub enum Letter {
    Accepted {
        rudder: RudderId,
        client: AcceptedStream,
        addr: AcceptedAddr,
    },
    Connected {
        rudder: RudderId,
        stream: AcceptedStream,
    },
    /// An empty buffer reports end of stream.
    Read {
        rudder: RudderId,
        buf: Vec<u8>,
        reader: ReadSide,
    },
    Wrote {
        rudder: RudderId,
        n: usize,
        writer: WriteSide,
    },
    Closed {
        rudder: RudderId,
    },
    Error {
        rudder: RudderId,
        op: IoOp,
        err: io::Error,
    },
    Command(AgentCommand),
}

/// The operation an I/O task was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Accept,
    Connect,
    Read,
    Write,
}

impl Letter {
    pub fn rudder(&self) -> Option<RudderId> {
        match self {
            Letter::Accepted { rudder, .. }
            | Letter::Connected { rudder, .. }
            | Letter::Read { rudder, .. }
            | Letter::Wrote { rudder, .. }
            | Letter::Closed { rudder }
            | Letter::Error { rudder, .. } => Some(*rudder),
            Letter::Command(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Letter::Accepted { .. } => "accepted",
            Letter::Connected { .. } => "connected",
            Letter::Read { .. } => "read",
            Letter::Wrote { .. } => "wrote",
            Letter::Closed { .. } => "closed",
            Letter::Error { .. } => "error",
            Letter::Command(_) => "command",
        }
    }
}

/// Wakes an agent blocked in [`Recipient::receive`]. Cheap to clone and usable from
/// any thread.
#[derive(Clone)]
pub struct Wakeup(UnboundedSender<()>);

impl Wakeup {
    pub fn wakeup(&self) {
        // The receiver only goes away with its agent.
        let _ = self.0.unbounded_send(());
    }
}

pub struct Recipient {
    tx: UnboundedSender<()>,
    rx: UnboundedReceiver<()>,
}

impl Default for Recipient {
    fn default() -> Self {
        Self::new()
    }
}

impl Recipient {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn wakeup_handle(&self) -> Wakeup {
        Wakeup(self.tx.clone())
    }

    /// Blocks until woken or until `timeout` elapses. Returns false on timeout.
    /// Wakeups that piled up meanwhile are coalesced into this one.
    pub async fn receive(&mut self, timeout: Duration) -> bool {
        match monoio::time::timeout(timeout, self.rx.next()).await {
            Ok(Some(())) => {
                while self.rx.try_recv().is_ok() {}
                true
            }
            Ok(None) | Err(_) => false,
        }
    }
}

/// The producer end of an agent's letter queue, handed to every I/O task.
#[derive(Clone)]
pub struct Postbox {
    queue: Rc<RefCell<VecDeque<Letter>>>,
    wakeup: Wakeup,
}

impl Postbox {
    pub fn new(wakeup: Wakeup) -> Self {
        Self {
            queue: Default::default(),
            wakeup,
        }
    }

    pub fn post(&self, letter: Letter) {
        self.queue.borrow_mut().push_back(letter);
        self.wakeup.wakeup();
    }

    pub(crate) fn pop(&self) -> Option<Letter> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postbox_is_fifo() {
        let recipient = Recipient::new();
        let postbox = Postbox::new(recipient.wakeup_handle());
        for n in 1..=3u64 {
            postbox.post(Letter::Closed {
                rudder: RudderId(n),
            });
        }
        assert_eq!(postbox.pending(), 3);
        let order: Vec<_> = std::iter::from_fn(|| postbox.pop())
            .map(|l| l.rudder().unwrap())
            .collect();
        assert_eq!(order, vec![RudderId(1), RudderId(2), RudderId(3)]);
    }

    #[monoio::test(timer_enabled = true)]
    async fn receive_wakes_on_post() {
        let mut recipient = Recipient::new();
        let postbox = Postbox::new(recipient.wakeup_handle());
        postbox.post(Letter::Closed {
            rudder: RudderId(7),
        });
        postbox.post(Letter::Closed {
            rudder: RudderId(8),
        });
        assert!(recipient.receive(Duration::from_secs(5)).await);
        // both wakeups were coalesced
        assert!(!recipient.receive(Duration::from_millis(20)).await);
    }

    #[monoio::test(timer_enabled = true)]
    async fn wakeup_from_another_thread() {
        let mut recipient = Recipient::new();
        let wakeup = recipient.wakeup_handle();
        std::thread::spawn(move || wakeup.wakeup());
        assert!(recipient.receive(Duration::from_secs(5)).await);
    }
}
