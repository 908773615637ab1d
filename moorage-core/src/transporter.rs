//! Transporters bridge one ship to the multiplexer.
//!
//! Ship decisions go out as multiplexer requests through a [`Wire`], and read
//! completions come in through [`on_read`], which folds the ship's failure into a
//! [`NextSocketAction`].
use std::{io, net::SocketAddr};

use bytes::Bytes;
use tracing::debug;

use crate::{
    agent::Deck,
    error::ShipError,
    multiplexer::JobMultiplexer,
    post::Post,
    rudder::RudderId,
    ship::{NextSocketAction, Ship},
};

/// Idle limits of a connection, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub socket_sec: u64,
    pub keep_alive_sec: u64,
}

impl Timeouts {
    pub fn new(socket_sec: u64, keep_alive_sec: u64) -> Self {
        Self {
            socket_sec,
            keep_alive_sec,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transporter {
    rudder: RudderId,
    timeouts: Timeouts,
}

impl Transporter {
    pub fn new(rudder: RudderId, timeouts: Timeouts) -> Self {
        Self { rudder, timeouts }
    }

    #[inline]
    pub fn rudder(&self) -> RudderId {
        self.rudder
    }

    #[inline]
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn req_connect(&self, mux: &mut JobMultiplexer, addr: SocketAddr) -> io::Result<()> {
        mux.req_connect(self.rudder, addr)
    }

    pub fn req_read(&self, mux: &mut JobMultiplexer) -> io::Result<()> {
        mux.req_read(self.rudder)
    }

    pub fn req_write(
        &self,
        mux: &mut JobMultiplexer,
        buf: Bytes,
        tag: &'static str,
        done: Option<Post>,
    ) -> io::Result<()> {
        mux.req_write(self.rudder, buf, tag, done)
    }

    pub fn req_shutdown_write(&self, mux: &mut JobMultiplexer) -> io::Result<()> {
        mux.req_shutdown_write(self.rudder)
    }

    pub fn req_close(&self, mux: &mut JobMultiplexer) {
        mux.req_close(self.rudder)
    }

    /// Whether a connection idle for `duration_sec` seconds has outlived its limit.
    /// Idle keep-alive connections use the keep-alive limit.
    pub fn check_timeout(&self, duration_sec: u64, keeping: bool) -> bool {
        let limit = if keeping {
            self.timeouts.keep_alive_sec
        } else {
            self.timeouts.socket_sec
        };
        duration_sec >= limit
    }

    pub fn wire<'a>(&self, mux: &'a mut JobMultiplexer) -> Wire<'a> {
        Wire {
            rudder: self.rudder,
            mux,
        }
    }
}

/// A transporter bound to the multiplexer for the duration of one callback.
pub struct Wire<'a> {
    rudder: RudderId,
    mux: &'a mut JobMultiplexer,
}

impl Wire<'_> {
    #[inline]
    pub fn rudder(&self) -> RudderId {
        self.rudder
    }

    pub fn req_read(&mut self) -> io::Result<()> {
        self.mux.req_read(self.rudder)
    }

    pub fn req_write(
        &mut self,
        buf: Bytes,
        tag: &'static str,
        done: Option<Post>,
    ) -> io::Result<()> {
        self.mux.req_write(self.rudder, buf, tag, done)
    }

    pub fn req_connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.mux.req_connect(self.rudder, addr)
    }

    pub fn req_shutdown_write(&mut self) -> io::Result<()> {
        self.mux.req_shutdown_write(self.rudder)
    }

    pub fn req_close(&mut self) {
        self.mux.req_close(self.rudder)
    }

    pub fn is_closing(&self) -> bool {
        self.mux.is_closing(self.rudder)
    }
}

/// Feeds read bytes to the ship and maps its failure into an action.
pub(crate) fn on_read(ship: &mut Ship, buf: &[u8], deck: &mut Deck) -> NextSocketAction {
    match ship.notify_read(buf, deck) {
        Ok(action) => action,
        Err(ShipError::Protocol(err)) => match ship.notify_protocol_error(&err, deck) {
            Ok(false) => NextSocketAction::Continue,
            Ok(true) => NextSocketAction::Close,
            Err(io_err) => {
                debug!(rudder = %ship.meta().rudder(), "answering protocol error failed: {io_err}");
                NextSocketAction::Close
            }
        },
        Err(ShipError::Upgrade { protocol, rest }) => ship
            .upgrade(&protocol, &rest, deck)
            .unwrap_or(NextSocketAction::Close),
        Err(ShipError::Io(err)) => {
            ship.notify_error(&err, deck);
            NextSocketAction::Close
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_uses_its_own_limit() {
        let tp = Transporter::new(RudderId(1), Timeouts::new(300, 20));
        assert!(!tp.check_timeout(25, false));
        assert!(tp.check_timeout(25, true));
        assert!(tp.check_timeout(300, false));
        assert!(!tp.check_timeout(19, true));
    }
}
