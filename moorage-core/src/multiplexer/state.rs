use std::{collections::VecDeque, rc::Rc, time::Instant};

use bytes::Bytes;
use futures_channel::oneshot;

use crate::{
    post::Post,
    rudder::{Listener, ReadSide, RudderId, WriteSide},
};

pub(crate) enum Channel {
    Listener(Rc<Listener>),
    /// A side is `None` while a task holds it, or after it was shut down.
    Duplex {
        reader: Option<ReadSide>,
        writer: Option<WriteSide>,
    },
    /// An outbound socket waiting for its connect.
    Pending,
    Closed,
}

/// One buffer queued for writing. A short write leaves the unit at the head of the
/// queue and only the unwritten remainder is submitted next.
pub struct WriteUnit {
    buf: Bytes,
    pos: usize,
    pub(crate) tag: &'static str,
    pub(crate) done: Option<Post>,
}

impl WriteUnit {
    pub(crate) fn new(buf: Bytes, tag: &'static str, done: Option<Post>) -> Self {
        Self {
            buf,
            pos: 0,
            tag,
            done,
        }
    }

    #[inline]
    pub(crate) fn remaining(&self) -> Bytes {
        self.buf.slice(self.pos..)
    }

    /// Returns true once the whole buffer went out.
    pub(crate) fn advance(&mut self, n: usize) -> bool {
        self.pos = (self.pos + n).min(self.buf.len());
        self.pos == self.buf.len()
    }
}

/// Bookkeeping for one rudder. Only the agent loop touches it; I/O tasks own the
/// side they work on until their letter is handled.
pub struct RudderState {
    pub(crate) id: RudderId,
    pub(crate) channel: Channel,
    pub(crate) read_buf: Vec<u8>,
    pub(crate) write_queue: VecDeque<WriteUnit>,
    pub(crate) accepting: bool,
    pub(crate) connecting: bool,
    pub(crate) reading: bool,
    pub(crate) writing: bool,
    /// No new requests are taken; queued writes still drain unless aborted.
    pub(crate) closing: bool,
    /// The close task is on its way.
    pub(crate) closed: bool,
    pub(crate) shutdown_write: bool,
    /// Dropping a receiver cancels the task holding its sender.
    pub(crate) abort: Option<oneshot::Receiver<()>>,
    pub(crate) write_abort: Option<oneshot::Receiver<()>>,
    pub(crate) last_access: Instant,
    pub(crate) bytes_read: u64,
    pub(crate) bytes_written: u64,
}

impl RudderState {
    pub(crate) fn new(id: RudderId, channel: Channel) -> Self {
        Self {
            id,
            channel,
            read_buf: Vec::new(),
            write_queue: VecDeque::new(),
            accepting: false,
            connecting: false,
            reading: false,
            writing: false,
            closing: false,
            closed: false,
            shutdown_write: false,
            abort: None,
            write_abort: None,
            last_access: Instant::now(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    #[inline]
    pub(crate) fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    #[inline]
    pub(crate) fn is_listener(&self) -> bool {
        matches!(self.channel, Channel::Listener(_))
    }

    pub(crate) fn has_writer(&self) -> bool {
        matches!(
            self.channel,
            Channel::Duplex {
                writer: Some(_),
                ..
            }
        )
    }

    pub(crate) fn take_writer(&mut self) -> Option<WriteSide> {
        match &mut self.channel {
            Channel::Duplex { writer, .. } => writer.take(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_write_keeps_the_remainder() {
        let mut unit = WriteUnit::new(Bytes::from_static(b"abcdef"), "test", None);
        assert!(!unit.advance(4));
        assert_eq!(&unit.remaining()[..], b"ef");
        assert!(unit.advance(2));
        assert!(unit.remaining().is_empty());
    }

    #[test]
    fn empty_unit_completes_on_zero() {
        let mut unit = WriteUnit::new(Bytes::new(), "end", None);
        assert!(unit.advance(0));
    }
}
