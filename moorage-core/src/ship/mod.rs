//! Ships: per-connection actors.
//!
//! The variant set is closed, so notifications are dispatched by match. Every
//! callback receives the agent's [`Deck`] and may only touch its own ship and the
//! deck; effects on other ships are queued as posts.
use std::{
    fmt, io,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;

use crate::{
    agent::{AgentId, Deck},
    error::{ProtocolError, ShipError},
    rudder::RudderId,
    tour::{TourId, TourKey},
    transporter::Transporter,
};

mod cgi;
mod inbound;
mod sendfile;
mod warp;

pub use cgi::{CgiProcess, CgiStdErrShip, CgiStdOutShip};
pub use inbound::{InboundCx, InboundShip, ProtocolHandler, TourHandler};
pub use sendfile::SendFileShip;
pub use warp::{WarpCx, WarpHandler, WarpShip};

static NEXT_SHIP_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ShipId(pub(crate) u64);

impl ShipId {
    pub(crate) fn next() -> Self {
        ShipId(NEXT_SHIP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ShipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// What the agent should do with a rudder after a ship callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextSocketAction {
    /// Keep going as before: a completed read is re-armed.
    #[default]
    Continue,
    Read,
    /// Stop reading, the ship has output to flush first.
    Write,
    Close,
    /// Stop reading until resumed.
    Suspend,
}

pub struct ShipMeta {
    pub ship_id: ShipId,
    pub agent_id: AgentId,
    pub transporter: Transporter,
    /// Idle between requests of a persistent connection.
    pub keeping: bool,
}

impl ShipMeta {
    pub fn new(agent_id: AgentId, transporter: Transporter) -> Self {
        Self {
            ship_id: ShipId::next(),
            agent_id,
            transporter,
            keeping: false,
        }
    }

    #[inline]
    pub fn rudder(&self) -> RudderId {
        self.transporter.rudder()
    }

    pub fn check_timeout(&self, duration_sec: u64) -> bool {
        self.transporter.check_timeout(duration_sec, self.keeping)
    }
}

pub enum Ship {
    Inbound(InboundShip),
    Warp(WarpShip),
    SendFile(SendFileShip),
    CgiStdOut(CgiStdOutShip),
    CgiStdErr(CgiStdErrShip),
}

macro_rules! each_ship {
    ($ship: expr, $s: ident => $body: expr) => {
        match $ship {
            Ship::Inbound($s) => $body,
            Ship::Warp($s) => $body,
            Ship::SendFile($s) => $body,
            Ship::CgiStdOut($s) => $body,
            Ship::CgiStdErr($s) => $body,
        }
    };
}

impl Ship {
    pub fn meta(&self) -> &ShipMeta {
        each_ship!(self, s => &s.meta)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Ship::Inbound(_) => "inbound",
            Ship::Warp(_) => "warp",
            Ship::SendFile(_) => "send_file",
            Ship::CgiStdOut(_) => "cgi_stdout",
            Ship::CgiStdErr(_) => "cgi_stderr",
        }
    }

    pub fn notify_handshake_done(
        &mut self,
        protocol: &str,
        deck: &mut Deck,
    ) -> io::Result<NextSocketAction> {
        match self {
            Ship::Inbound(s) => s.notify_handshake_done(protocol, deck),
            _ => Ok(NextSocketAction::Read),
        }
    }

    pub fn notify_connect(&mut self, deck: &mut Deck) -> io::Result<NextSocketAction> {
        match self {
            Ship::Warp(s) => s.notify_connect(deck),
            _ => Ok(NextSocketAction::Continue),
        }
    }

    pub fn notify_read(
        &mut self,
        buf: &[u8],
        deck: &mut Deck,
    ) -> Result<NextSocketAction, ShipError> {
        each_ship!(self, s => s.notify_read(buf, deck))
    }

    pub fn notify_eof(&mut self, deck: &mut Deck) -> NextSocketAction {
        each_ship!(self, s => s.notify_eof(deck))
    }

    pub fn notify_error(&mut self, err: &io::Error, deck: &mut Deck) {
        each_ship!(self, s => s.notify_error(err, deck))
    }

    /// Returns whether the connection must be closed.
    pub fn notify_protocol_error(
        &mut self,
        err: &ProtocolError,
        deck: &mut Deck,
    ) -> io::Result<bool> {
        each_ship!(self, s => s.notify_protocol_error(err, deck))
    }

    pub fn notify_close(&mut self, deck: &mut Deck) {
        each_ship!(self, s => s.notify_close(deck))
    }

    pub fn check_timeout(&self, duration_sec: u64) -> bool {
        match self {
            Ship::Inbound(s) => s.check_timeout(duration_sec),
            other => other.meta().check_timeout(duration_sec),
        }
    }

    /// Switches an inbound connection to another protocol handler.
    pub fn upgrade(&mut self, protocol: &str, rest: &[u8], deck: &mut Deck) -> Option<NextSocketAction> {
        match self {
            Ship::Inbound(s) => s.upgrade(protocol, rest, deck),
            _ => None,
        }
    }

    /// Request content of a tour this ship consumes.
    pub fn on_req_content(
        &mut self,
        tour: TourKey,
        check: TourId,
        data: Bytes,
        deck: &mut Deck,
    ) -> NextSocketAction {
        match self {
            Ship::Warp(s) => s.on_req_content(tour, check, data, deck),
            Ship::CgiStdOut(s) => s.on_req_content(tour, check, data, deck),
            _ => {
                if let Some(t) = deck.tours.checked_mut(tour, check) {
                    t.req_consumed(check, data.len(), &mut deck.posts);
                }
                NextSocketAction::Continue
            }
        }
    }

    pub fn on_req_end(&mut self, tour: TourKey, check: TourId, deck: &mut Deck) -> NextSocketAction {
        match self {
            Ship::Warp(s) => s.on_req_end(tour, check, deck),
            Ship::CgiStdOut(s) => s.on_req_end(deck),
            _ => NextSocketAction::Continue,
        }
    }

    /// The client side of `tour` is gone; stop working for it.
    pub fn abandon(&mut self, tour: TourKey) -> NextSocketAction {
        match self {
            Ship::Warp(s) => s.abandon(tour),
            Ship::SendFile(s) => s.abandon(tour),
            Ship::CgiStdOut(s) => s.abandon(tour),
            Ship::Inbound(_) | Ship::CgiStdErr(_) => NextSocketAction::Continue,
        }
    }
}
