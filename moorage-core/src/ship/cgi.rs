use std::io::{self, Read, Write};

use bytes::Bytes;
use http::{
    header::{HeaderName, LOCATION},
    HeaderMap, HeaderValue, StatusCode,
};
use tracing::{debug, warn};

use super::{NextSocketAction, Ship, ShipMeta};
use crate::{
    agent::{Deck, Harbor},
    error::{HttpError, ProtocolError, ShipError},
    post::Post,
    rudder::{Rudder, RudderId},
    tour::{Consumer, TourId, TourKey},
    transporter::Timeouts,
};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_STDERR_LINE: usize = 4 * 1024;

/// A running CGI child.
pub trait CgiProcess {
    fn pid(&self) -> u32;

    fn kill(&mut self);

    /// The child's output is fully consumed; it may be reaped.
    fn release(&mut self);
}

/// Position right after the blank line ending a CGI header block, if complete.
fn head_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, p + 4));
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, p + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parses the header block a CGI script writes before its body.
fn parse_head(head: &[u8]) -> Result<(StatusCode, HeaderMap), ProtocolError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProtocolError::new("CGI header block is not valid UTF-8"))?;
    let mut status = None;
    let mut headers = HeaderMap::new();
    for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProtocolError::new(format!("malformed CGI header line {line:?}")));
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().unwrap_or_default();
            status = Some(
                code.parse::<u16>()
                    .ok()
                    .and_then(|c| StatusCode::from_u16(c).ok())
                    .ok_or_else(|| ProtocolError::new(format!("invalid CGI status {value:?}")))?,
            );
            continue;
        }
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ProtocolError::new(format!("invalid CGI header name {name:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ProtocolError::new(format!("invalid CGI header value for {name}")))?;
        headers.append(name, value);
    }
    let status = match status {
        Some(status) => status,
        None if headers.contains_key(LOCATION) => StatusCode::FOUND,
        None => StatusCode::OK,
    };
    Ok((status, headers))
}

/// Reads a CGI child's stdout into a tour's response and feeds the request
/// content to its stdin.
pub struct CgiStdOutShip {
    pub(crate) meta: ShipMeta,
    tour: Option<(TourKey, TourId)>,
    process: Box<dyn CgiProcess>,
    /// Header bytes until the blank line arrives.
    head: Vec<u8>,
    head_done: bool,
}

impl CgiStdOutShip {
    pub fn new(meta: ShipMeta, process: Box<dyn CgiProcess>, tour: TourKey, check: TourId) -> Self {
        Self {
            meta,
            tour: Some((tour, check)),
            process,
            head: Vec::new(),
            head_done: false,
        }
    }

    /// Moors a ship on the child's stdout and stdin, hands it the tour and starts
    /// reading.
    pub fn sail(
        harbor: &mut Harbor,
        process: Box<dyn CgiProcess>,
        stdout: impl Read + Send + 'static,
        stdin: impl Write + Send + 'static,
        timeouts: Timeouts,
        tour: TourKey,
        check: TourId,
    ) -> io::Result<RudderId> {
        harbor.try_launch(Rudder::pipe(stdout, stdin), timeouts, |meta, deck| {
            let ship = CgiStdOutShip::new(meta, process, tour, check);
            let rudder = ship.meta.rudder();
            if let Some(t) = deck.tours.checked_mut(tour, check) {
                t.res_set_listener(check, Some(rudder));
                t.req_set_consumer(check, Consumer::Ship(rudder), &mut deck.posts);
            }
            deck.mux.req_read(rudder)?;
            Ok(Ship::CgiStdOut(ship))
        })
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub(crate) fn notify_read(
        &mut self,
        buf: &[u8],
        deck: &mut Deck,
    ) -> Result<NextSocketAction, ShipError> {
        let Some((key, check)) = self.tour else {
            return Ok(NextSocketAction::Close);
        };
        let body = if self.head_done {
            Bytes::copy_from_slice(buf)
        } else {
            self.head.extend_from_slice(buf);
            let Some((end, body_start)) = head_end(&self.head) else {
                if self.head.len() > MAX_HEAD_SIZE {
                    return Err(ProtocolError::new("CGI header block too large").into());
                }
                return Ok(NextSocketAction::Continue);
            };
            let (status, headers) = parse_head(&self.head[..end])?;
            self.head_done = true;
            let body = Bytes::copy_from_slice(&self.head[body_start..]);
            self.head = Vec::new();
            let Some(tour) = deck.tours.checked_mut(key, check) else {
                self.tour = None;
                return Ok(NextSocketAction::Close);
            };
            tour.res.status = status;
            tour.res.headers = headers;
            tour.res_send_headers(check, &mut deck.posts);
            body
        };
        let Some(tour) = deck.tours.checked_mut(key, check) else {
            self.tour = None;
            return Ok(NextSocketAction::Close);
        };
        if tour.res_send_content(check, body, &mut deck.posts) {
            Ok(NextSocketAction::Continue)
        } else {
            Ok(NextSocketAction::Suspend)
        }
    }

    pub(crate) fn notify_eof(&mut self, deck: &mut Deck) -> NextSocketAction {
        self.finish(deck, "CGI script ended without headers", true);
        NextSocketAction::Close
    }

    pub(crate) fn notify_error(&mut self, err: &io::Error, deck: &mut Deck) {
        debug!(ship = %self.meta.ship_id, pid = self.process.pid(), "CGI pipe failed: {err}");
        self.finish(deck, "CGI script failed", false);
    }

    pub(crate) fn notify_protocol_error(
        &mut self,
        err: &ProtocolError,
        deck: &mut Deck,
    ) -> io::Result<bool> {
        warn!(ship = %self.meta.ship_id, pid = self.process.pid(), "{err}");
        self.finish(deck, "invalid CGI response", false);
        self.process.kill();
        Ok(true)
    }

    pub(crate) fn notify_close(&mut self, deck: &mut Deck) {
        self.finish(deck, "CGI script failed", false);
        self.process.release();
        deck.req_catch_up();
    }

    pub(crate) fn on_req_content(
        &mut self,
        tour: TourKey,
        check: TourId,
        data: Bytes,
        deck: &mut Deck,
    ) -> NextSocketAction {
        let len = data.len();
        let done = Post::ReqConsumed { tour, check, len };
        if let Err(e) = self
            .meta
            .transporter
            .req_write(&mut deck.mux, data, "cgi-stdin", Some(done))
        {
            debug!(ship = %self.meta.ship_id, "request content dropped: {e}");
            if let Some(t) = deck.tours.checked_mut(tour, check) {
                t.req_consumed(check, len, &mut deck.posts);
            }
        }
        NextSocketAction::Continue
    }

    /// Closes the child's stdin once the queued request content is written.
    pub(crate) fn on_req_end(&mut self, deck: &mut Deck) -> NextSocketAction {
        if let Err(e) = self.meta.transporter.req_shutdown_write(&mut deck.mux) {
            debug!(ship = %self.meta.ship_id, "stdin shutdown failed: {e}");
        }
        NextSocketAction::Continue
    }

    pub(crate) fn abandon(&mut self, tour: TourKey) -> NextSocketAction {
        match self.tour {
            Some((key, _)) if key == tour => {
                self.tour = None;
                self.process.kill();
                NextSocketAction::Close
            }
            _ => NextSocketAction::Continue,
        }
    }

    /// Ends the tour's response. `complete` is false when the child's output broke
    /// off rather than ended.
    fn finish(&mut self, deck: &mut Deck, reason: &str, complete: bool) {
        let Some((key, check)) = self.tour.take() else {
            return;
        };
        let Some(tour) = deck.tours.checked_mut(key, check) else {
            return;
        };
        tour.res_set_listener(check, None);
        if tour.res.header_sent() && complete {
            tour.res_end_content(check, &mut deck.posts);
        } else if tour.res.header_sent() {
            tour.res_cut_content(check, &mut deck.posts);
        } else {
            tour.res_send_error(
                check,
                HttpError::new(StatusCode::BAD_GATEWAY, reason),
                &mut deck.posts,
            );
        }
    }
}

/// Logs what a CGI child writes to stderr, one line at a time.
pub struct CgiStdErrShip {
    pub(crate) meta: ShipMeta,
    pid: u32,
    line: Vec<u8>,
}

impl CgiStdErrShip {
    pub fn new(meta: ShipMeta, pid: u32) -> Self {
        Self {
            meta,
            pid,
            line: Vec::new(),
        }
    }

    pub fn sail(
        harbor: &mut Harbor,
        stderr: impl Read + Send + 'static,
        timeouts: Timeouts,
        pid: u32,
    ) -> io::Result<RudderId> {
        harbor.try_launch(Rudder::reader(stderr), timeouts, |meta, deck| {
            let ship = CgiStdErrShip::new(meta, pid);
            deck.mux.req_read(ship.meta.rudder())?;
            Ok(Ship::CgiStdErr(ship))
        })
    }

    fn flush_line(&mut self) {
        if !self.line.is_empty() {
            warn!(pid = self.pid, "cgi stderr: {}", String::from_utf8_lossy(&self.line).trim_end());
            self.line.clear();
        }
    }

    pub(crate) fn notify_read(
        &mut self,
        buf: &[u8],
        _deck: &mut Deck,
    ) -> Result<NextSocketAction, ShipError> {
        for &b in buf {
            if b == b'\n' {
                self.flush_line();
            } else if self.line.len() < MAX_STDERR_LINE {
                self.line.push(b);
            }
        }
        Ok(NextSocketAction::Continue)
    }

    pub(crate) fn notify_eof(&mut self, _deck: &mut Deck) -> NextSocketAction {
        self.flush_line();
        NextSocketAction::Close
    }

    pub(crate) fn notify_error(&mut self, err: &io::Error, _deck: &mut Deck) {
        debug!(pid = self.pid, "cgi stderr failed: {err}");
    }

    pub(crate) fn notify_protocol_error(
        &mut self,
        _err: &ProtocolError,
        _deck: &mut Deck,
    ) -> io::Result<bool> {
        Ok(true)
    }

    pub(crate) fn notify_close(&mut self, _deck: &mut Deck) {
        self.flush_line();
    }
}
