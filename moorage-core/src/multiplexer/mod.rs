//! The job multiplexer: I/O through one short task per operation.
//!
//! Every `req_*` call validates the rudder, moves the side it needs out of the
//! [`RudderState`] and spawns a local task. The task performs exactly one syscall and
//! ends by posting exactly one [`Letter`], unless the rudder was closed underneath
//! it, in which case it swallows its result. The agent hands the letter back through
//! the matching `on_*` method, which restores the side and clears the flag. At most
//! one read and one write are in flight per rudder.
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    rc::Rc,
    time::Instant,
};

use bytes::Bytes;
use futures_channel::oneshot;
use monoio::net::TcpStream;
use tracing::{debug, trace};

use crate::{
    letter::{IoOp, Letter, Postbox},
    post::Post,
    rudder::{split, AcceptedStream, ReadSide, Rudder, RudderId, WriteSide},
};

mod state;

use state::Channel;
pub use state::{RudderState, WriteUnit};

/// Admission transition reported by [`JobMultiplexer::check_busy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Busy,
    Free,
}

pub struct JobMultiplexer {
    postbox: Postbox,
    states: HashMap<RudderId, RudderState>,
    next_id: u64,
    listeners: usize,
    max_rudders: usize,
    buf_size: usize,
    busy: bool,
}

fn not_registered(id: RudderId) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("rudder {id} is not registered"),
    )
}

fn closing(id: RudderId) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("rudder {id} is closing"),
    )
}

fn not_connected(id: RudderId, what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("rudder {id}: {what}"),
    )
}

impl JobMultiplexer {
    pub fn new(postbox: Postbox, max_rudders: usize, buf_size: usize) -> Self {
        Self {
            postbox,
            states: HashMap::new(),
            next_id: 1,
            listeners: 0,
            max_rudders,
            buf_size,
            busy: false,
        }
    }

    pub fn add_rudder(&mut self, rudder: Rudder) -> RudderId {
        let id = RudderId(self.next_id);
        self.next_id += 1;
        trace!(rudder = %id, kind = rudder.kind(), "rudder added");
        let channel = match rudder {
            Rudder::Listener(listener) => {
                self.listeners += 1;
                Channel::Listener(Rc::new(listener))
            }
            Rudder::Stream(stream) => {
                let (reader, writer) = split(stream);
                Channel::Duplex {
                    reader: Some(reader),
                    writer: Some(writer),
                }
            }
            Rudder::Pipe { reader, writer } => Channel::Duplex {
                reader: reader.map(ReadSide::Blocking),
                writer: writer.map(WriteSide::Blocking),
            },
            Rudder::Pending => Channel::Pending,
        };
        self.states.insert(id, RudderState::new(id, channel));
        id
    }

    /// Open rudders, listeners excluded.
    #[inline]
    pub fn len(&self) -> usize {
        self.states.len() - self.listeners
    }

    /// No rudder at all is left, listeners included.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn ids(&self) -> Vec<RudderId> {
        self.states.keys().copied().collect()
    }

    pub fn is_reading(&self, id: RudderId) -> bool {
        self.states.get(&id).map(|s| s.reading).unwrap_or(false)
    }

    pub fn is_writing(&self, id: RudderId) -> bool {
        self.states.get(&id).map(|s| s.writing).unwrap_or(false)
    }

    pub fn is_closing(&self, id: RudderId) -> bool {
        self.states.get(&id).map(|s| s.closing).unwrap_or(true)
    }

    pub fn queued_writes(&self, id: RudderId) -> usize {
        self.states
            .get(&id)
            .map(|s| s.write_queue.len())
            .unwrap_or(0)
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.len() >= self.max_rudders
    }

    /// Reports a crossing of the busy threshold since the last call.
    pub fn check_busy(&mut self) -> Option<Admission> {
        let busy = self.is_busy();
        if busy == self.busy {
            return None;
        }
        self.busy = busy;
        Some(if busy {
            Admission::Busy
        } else {
            Admission::Free
        })
    }

    fn live_state(&mut self, id: RudderId) -> io::Result<&mut RudderState> {
        match self.states.get_mut(&id) {
            None => Err(not_registered(id)),
            Some(state) if state.closing => Err(closing(id)),
            Some(state) => Ok(state),
        }
    }

    pub fn req_accept(&mut self, id: RudderId) -> io::Result<()> {
        let postbox = self.postbox.clone();
        let state = self.live_state(id)?;
        let Channel::Listener(listener) = &state.channel else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rudder {id} is not a listener"),
            ));
        };
        if state.accepting {
            return Ok(());
        }
        let listener = listener.clone();
        let (mut stop, abort) = oneshot::channel::<()>();
        state.accepting = true;
        state.abort = Some(abort);
        monoio::spawn(async move {
            let mut cancellation = stop.cancellation();
            monoio::select! {
                _ = &mut cancellation => {
                    trace!(rudder = %id, "accept cancelled");
                }
                res = listener.accept() => match res {
                    Ok((client, addr)) => postbox.post(Letter::Accepted { rudder: id, client, addr }),
                    Err(err) => postbox.post(Letter::Error { rudder: id, op: IoOp::Accept, err }),
                }
            }
        });
        Ok(())
    }

    /// Submits a connect. Returns once the connect is under way; its outcome arrives
    /// later as a `Connected` or `Error` letter.
    pub fn req_connect(&mut self, id: RudderId, addr: SocketAddr) -> io::Result<()> {
        let postbox = self.postbox.clone();
        let state = self.live_state(id)?;
        if !matches!(state.channel, Channel::Pending) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("rudder {id} is already connected"),
            ));
        }
        if state.connecting {
            return Ok(());
        }
        let (mut stop, abort) = oneshot::channel::<()>();
        state.connecting = true;
        state.abort = Some(abort);
        state.touch();
        monoio::spawn(async move {
            let mut cancellation = stop.cancellation();
            monoio::select! {
                _ = &mut cancellation => {
                    trace!(rudder = %id, "connect cancelled");
                }
                res = TcpStream::connect(addr) => match res {
                    Ok(stream) => postbox.post(Letter::Connected { rudder: id, stream: AcceptedStream::Tcp(stream) }),
                    Err(err) => postbox.post(Letter::Error { rudder: id, op: IoOp::Connect, err }),
                }
            }
        });
        Ok(())
    }

    /// Starts a read unless one is already outstanding.
    pub fn req_read(&mut self, id: RudderId) -> io::Result<()> {
        let postbox = self.postbox.clone();
        let buf_size = self.buf_size;
        let state = self.live_state(id)?;
        if state.reading {
            return Ok(());
        }
        let Channel::Duplex { reader, .. } = &mut state.channel else {
            return Err(not_connected(id, "nothing to read from"));
        };
        let Some(reader) = reader.take() else {
            return Err(not_connected(id, "read side is gone"));
        };
        let mut buf = std::mem::take(&mut state.read_buf);
        if buf.capacity() < buf_size {
            buf = Vec::with_capacity(buf_size);
        }
        let (mut stop, abort) = oneshot::channel::<()>();
        state.reading = true;
        state.abort = Some(abort);
        monoio::spawn(async move {
            let mut cancellation = stop.cancellation();
            monoio::select! {
                _ = &mut cancellation => {
                    trace!(rudder = %id, "read cancelled");
                }
                res = reader.read(buf) => match res {
                    Ok((buf, reader)) => postbox.post(Letter::Read { rudder: id, buf, reader }),
                    Err(err) => postbox.post(Letter::Error { rudder: id, op: IoOp::Read, err }),
                }
            }
        });
        Ok(())
    }

    /// Queues `buf` behind every earlier write of this rudder. `done` is handed back
    /// by [`JobMultiplexer::on_wrote`] once the whole buffer went out.
    pub fn req_write(
        &mut self,
        id: RudderId,
        buf: Bytes,
        tag: &'static str,
        done: Option<Post>,
    ) -> io::Result<()> {
        let state = self.live_state(id)?;
        if state.shutdown_write {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("rudder {id}: write side is shut down"),
            ));
        }
        if !state.writing && !state.has_writer() {
            return Err(not_connected(id, "nothing to write to"));
        }
        state.write_queue.push_back(WriteUnit::new(buf, tag, done));
        state.touch();
        if !state.writing {
            self.start_write(id);
        }
        Ok(())
    }

    fn start_write(&mut self, id: RudderId) {
        let postbox = self.postbox.clone();
        let Some(state) = self.states.get_mut(&id) else {
            return;
        };
        let Some(unit) = state.write_queue.front() else {
            state.writing = false;
            return;
        };
        let chunk = unit.remaining();
        let Some(writer) = state.take_writer() else {
            sink!("rudder {id}: write queued without a write side");
        };
        let (mut stop, abort) = oneshot::channel::<()>();
        state.writing = true;
        state.write_abort = Some(abort);
        monoio::spawn(async move {
            let mut cancellation = stop.cancellation();
            let expected = chunk.len();
            monoio::select! {
                _ = &mut cancellation => {
                    trace!(rudder = %id, "write cancelled");
                }
                res = writer.write(chunk) => match res {
                    Ok((0, _)) if expected > 0 => postbox.post(Letter::Error {
                        rudder: id,
                        op: IoOp::Write,
                        err: io::ErrorKind::WriteZero.into(),
                    }),
                    Ok((n, writer)) => postbox.post(Letter::Wrote { rudder: id, n, writer }),
                    Err(err) => postbox.post(Letter::Error { rudder: id, op: IoOp::Write, err }),
                }
            }
        });
    }

    /// Drops the write side once the queue drains, signalling end of stream to the
    /// peer. Reading goes on.
    pub fn req_shutdown_write(&mut self, id: RudderId) -> io::Result<()> {
        let state = self.live_state(id)?;
        if state.shutdown_write {
            return Ok(());
        }
        state.shutdown_write = true;
        if !state.writing {
            if let Some(writer) = state.take_writer() {
                monoio::spawn(writer.shutdown());
            }
        }
        Ok(())
    }

    /// Read cancellation only clears local flags: an outstanding read is not
    /// preempted, and its letter is still delivered.
    pub fn cancel_read(&mut self, id: RudderId) {
        if self.is_reading(id) {
            trace!(rudder = %id, "read outstanding, left to complete");
        }
    }

    /// Closes after the write queue drained. Outstanding accepts, connects and reads
    /// are cancelled right away.
    pub fn req_close(&mut self, id: RudderId) {
        let Some(state) = self.states.get_mut(&id) else {
            return;
        };
        if state.closing {
            return;
        }
        state.closing = true;
        state.abort = None;
        if state.writing {
            debug!(rudder = %id, queued = state.write_queue.len(), "close deferred until writes drain");
            return;
        }
        self.spawn_close(id);
    }

    /// Closes at once, dropping queued writes.
    pub fn req_abort(&mut self, id: RudderId) {
        let Some(state) = self.states.get_mut(&id) else {
            return;
        };
        if state.closed {
            return;
        }
        state.closing = true;
        state.abort = None;
        state.write_abort = None;
        state.writing = false;
        state.write_queue.clear();
        self.spawn_close(id);
    }

    fn spawn_close(&mut self, id: RudderId) {
        let Some(state) = self.states.get_mut(&id) else {
            return;
        };
        state.closed = true;
        let writer = state.take_writer();
        state.channel = Channel::Closed;
        let postbox = self.postbox.clone();
        monoio::spawn(async move {
            if let Some(writer) = writer {
                writer.shutdown().await;
            }
            postbox.post(Letter::Closed { rudder: id });
        });
    }

    /// Requests a graceful close of every rudder. Returns how many were asked.
    pub fn close_all(&mut self) -> usize {
        let ids = self.ids();
        let count = ids.len();
        for id in ids {
            self.req_close(id);
        }
        count
    }

    /// Idle seconds of every open connection, listeners excluded.
    pub fn idle_rudders(&self, now: Instant) -> Vec<(RudderId, u64)> {
        self.states
            .values()
            .filter(|s| !s.closing && !s.is_listener())
            .map(|s| (s.id, now.saturating_duration_since(s.last_access).as_secs()))
            .collect()
    }

    /// Returns false when the listener went away or is closing.
    pub(crate) fn on_accepted(&mut self, id: RudderId) -> bool {
        let Some(state) = self.states.get_mut(&id) else {
            return false;
        };
        state.accepting = false;
        state.abort = None;
        !state.closing
    }

    pub(crate) fn on_connected(&mut self, id: RudderId, stream: AcceptedStream) -> bool {
        let Some(state) = self.states.get_mut(&id) else {
            return false;
        };
        state.connecting = false;
        state.abort = None;
        if state.closing {
            return false;
        }
        let (reader, writer) = split(stream);
        state.channel = Channel::Duplex {
            reader: Some(reader),
            writer: Some(writer),
        };
        state.touch();
        true
    }

    /// Gives the read side back. Returns false when the letter must be discarded.
    pub(crate) fn on_read(&mut self, id: RudderId, reader: ReadSide, n: usize) -> bool {
        let Some(state) = self.states.get_mut(&id) else {
            return false;
        };
        state.reading = false;
        state.abort = None;
        if state.closing {
            return false;
        }
        if let Channel::Duplex { reader: slot, .. } = &mut state.channel {
            *slot = Some(reader);
        }
        state.bytes_read += n as u64;
        state.touch();
        true
    }

    pub(crate) fn recycle_buf(&mut self, id: RudderId, buf: Vec<u8>) {
        if let Some(state) = self.states.get_mut(&id) {
            if state.read_buf.capacity() == 0 {
                state.read_buf = buf;
            }
        }
    }

    /// Accounts a completed write, keeps the queue draining and hands back the done
    /// post of a fully written unit.
    pub(crate) fn on_wrote(&mut self, id: RudderId, n: usize, writer: WriteSide) -> Option<Post> {
        let state = self.states.get_mut(&id)?;
        if state.closed {
            return None;
        }
        state.writing = false;
        state.write_abort = None;
        if let Channel::Duplex { writer: slot, .. } = &mut state.channel {
            *slot = Some(writer);
        }
        state.bytes_written += n as u64;
        state.touch();
        let Some(unit) = state.write_queue.front_mut() else {
            sink!("rudder {id}: write queue empty on wrote");
        };
        let done = if unit.advance(n) {
            state.write_queue.pop_front().and_then(|unit| {
                trace!(rudder = %id, tag = unit.tag, "write unit flushed");
                unit.done
            })
        } else {
            None
        };
        if !state.write_queue.is_empty() {
            self.start_write(id);
        } else if state.closing {
            self.spawn_close(id);
        } else if state.shutdown_write {
            if let Some(writer) = state.take_writer() {
                monoio::spawn(writer.shutdown());
            }
        }
        done
    }

    /// Clears the flag of the failed operation. Returns false when the rudder is
    /// already closing and the error must be swallowed.
    pub(crate) fn on_error(&mut self, id: RudderId, op: IoOp) -> bool {
        let Some(state) = self.states.get_mut(&id) else {
            return false;
        };
        match op {
            IoOp::Accept => state.accepting = false,
            IoOp::Connect => state.connecting = false,
            IoOp::Read => state.reading = false,
            IoOp::Write => {
                state.writing = false;
                state.write_abort = None;
            }
        }
        if op != IoOp::Write {
            state.abort = None;
        }
        if state.closing {
            if !state.closed && !state.writing {
                self.spawn_close(id);
            }
            return false;
        }
        true
    }

    /// Forgets a closed rudder. Returns whether it was a listener.
    pub(crate) fn on_closed(&mut self, id: RudderId) -> Option<bool> {
        let state = self.states.remove(&id)?;
        let listener = state.is_listener();
        if listener {
            self.listeners -= 1;
        }
        debug!(
            rudder = %id,
            read = state.bytes_read,
            written = state.bytes_written,
            "rudder closed"
        );
        Some(listener)
    }
}
