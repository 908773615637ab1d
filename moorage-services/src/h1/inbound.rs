use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{
    header::{CONNECTION, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING},
    HeaderMap, HeaderValue, Method, StatusCode, Version,
};
use moorage_core::{
    error::{HttpError, ProtocolError, ShipError},
    post::Post,
    ship::{InboundCx, NextSocketAction, ProtocolHandler, TourHandler},
    tour::{Tour, TourId, TourKey, TourState},
    transporter::Wire,
};
use tracing::{debug, trace, warn};

use super::{
    content_length, is_chunked, is_hop_header, parse_request, plain_response, put_headers,
    status_line, upgrade_offers, wants_keep_alive, MAX_HEAD_SIZE, PROTOCOL,
};

/// The request currently served on the connection.
#[derive(Debug)]
struct Current {
    /// `None` once the tour is gone while its content is still arriving.
    tour: Option<(TourKey, TourId)>,
    remaining: u64,
    keep_alive: bool,
    version: Version,
    head_only: bool,
}

/// HTTP/1.x server side of a connection.
///
/// Requests are served one at a time. Pipelined requests wait in the buffer until
/// the response before them is flushed.
#[derive(Debug, Default)]
pub struct H1Handler {
    buf: BytesMut,
    next_req: u32,
    current: Option<Current>,
    chunked: bool,
    closing: bool,
    /// Inside [`ProtocolHandler::on_read`], the only place a switch can be reported.
    reading: bool,
}

impl H1Handler {
    pub fn new() -> Self {
        Self::default()
    }

    fn process(&mut self, cx: &mut InboundCx<'_>) -> Result<NextSocketAction, ShipError> {
        loop {
            if self.closing {
                return Ok(NextSocketAction::Continue);
            }
            if let Some(current) = &mut self.current {
                if current.remaining == 0 && current.tour.is_none() {
                    self.current = None;
                    continue;
                }
                if current.remaining == 0 {
                    if self.buf.len() > MAX_HEAD_SIZE {
                        return Ok(NextSocketAction::Suspend);
                    }
                    return Ok(NextSocketAction::Continue);
                }
                if self.buf.is_empty() {
                    return Ok(NextSocketAction::Continue);
                }
                return Ok(self.pass_content(cx));
            }
            if self.buf.is_empty() {
                return Ok(NextSocketAction::Continue);
            }
            let Some((len, head)) = parse_request(&self.buf)? else {
                return Ok(NextSocketAction::Continue);
            };
            self.buf.advance(len);
            if let Some(action) = self.start(head, cx)? {
                return Ok(action);
            }
        }
    }

    /// Leases a tour for a parsed request head. Returns an action when the request
    /// is refused.
    fn start(
        &mut self,
        head: super::RequestHead,
        cx: &mut InboundCx<'_>,
    ) -> Result<Option<NextSocketAction>, ShipError> {
        trace!(ship = %cx.ship_id(), method = %head.method, uri = %head.uri, "request head");
        if is_chunked(&head.headers) {
            return self.refuse(StatusCode::LENGTH_REQUIRED, "chunked request content is not supported", cx);
        }
        let length = content_length(&head.headers)?.unwrap_or(0);
        if self.reading && length == 0 && cx.active_tours() == 0 {
            let offered = upgrade_offers(&head.headers)
                .into_iter()
                .find(|p| cx.can_upgrade(p))
                .map(str::to_owned);
            if let Some(protocol) = offered {
                return Err(self.switch(protocol, cx)?);
            }
        }
        let req_key = self.next_req;
        self.next_req = self.next_req.wrapping_add(1);
        let (key, check) = match cx.rent_tour(req_key) {
            Ok(leased) => leased,
            Err(e) => {
                warn!(ship = %cx.ship_id(), "request refused: {e}");
                return self.refuse(StatusCode::SERVICE_UNAVAILABLE, "server is busy", cx);
            }
        };
        let expects_continue = length > 0
            && head
                .headers
                .get(EXPECT)
                .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"));
        let keep_alive = wants_keep_alive(head.version, &head.headers);
        self.current = Some(Current {
            tour: Some((key, check)),
            remaining: length,
            keep_alive,
            version: head.version,
            head_only: head.method == Method::HEAD,
        });
        let tour = cx.tour_mut(key, check);
        tour.req.method = head.method;
        tour.req.uri = head.uri;
        tour.req.version = head.version;
        tour.req.headers = head.headers;
        tour.req.content_length = length;
        cx.go(key, check);
        if expects_continue {
            cx.wire()
                .req_write(Bytes::from_static(b"HTTP/1.1 100 Continue\r\n\r\n"), "res-continue", None)?;
        }
        Ok(None)
    }

    /// Confirms the switch and hands over whatever followed the request head.
    fn switch(&mut self, protocol: String, cx: &mut InboundCx<'_>) -> Result<ShipError, ShipError> {
        debug!(ship = %cx.ship_id(), %protocol, "switching protocols");
        let mut buf = BytesMut::with_capacity(96);
        buf.put_slice(status_line(StatusCode::SWITCHING_PROTOCOLS).as_bytes());
        buf.put_slice(format!("connection: upgrade\r\nupgrade: {protocol}\r\n\r\n").as_bytes());
        cx.wire().req_write(buf.freeze(), "res-switch", None)?;
        self.closing = true;
        let rest = self.buf.split().freeze();
        Ok(ShipError::Upgrade { protocol, rest })
    }

    /// Answers outside of any tour and closes.
    fn refuse(
        &mut self,
        status: StatusCode,
        reason: &str,
        cx: &mut InboundCx<'_>,
    ) -> Result<Option<NextSocketAction>, ShipError> {
        debug!(ship = %cx.ship_id(), %status, "{reason}");
        self.closing = true;
        self.buf.clear();
        cx.wire()
            .req_write(plain_response(status, &format!("{status}: {reason}\n")), "res-refused", None)?;
        Ok(Some(NextSocketAction::Close))
    }

    /// Posts buffered request content to the current tour, or drops it when the tour
    /// no longer takes content.
    fn pass_content(&mut self, cx: &mut InboundCx<'_>) -> NextSocketAction {
        let Some(current) = &mut self.current else {
            return NextSocketAction::Continue;
        };
        let n = current.remaining.min(self.buf.len() as u64) as usize;
        let data = self.buf.split_to(n).freeze();
        current.remaining -= n as u64;
        let Some((key, check)) = current.tour else {
            return NextSocketAction::Continue;
        };
        if cx.tour_state(key, check) != Some(TourState::Reading) {
            return NextSocketAction::Continue;
        }
        let mut more = true;
        let mut res = cx.post_req_content(key, check, data).map(|m| more = m);
        if res.is_ok() && current.remaining == 0 {
            res = cx.end_req_content(key, check);
        }
        if let Err(err) = res {
            cx.fail(key, check, err);
            return NextSocketAction::Continue;
        }
        if more {
            NextSocketAction::Continue
        } else {
            trace!(ship = %cx.ship_id(), tour = %key, "request content backlog, reading paused");
            NextSocketAction::Suspend
        }
    }
}

impl TourHandler for H1Handler {
    fn send_headers(&mut self, tour: &Tour, wire: &mut Wire<'_>) -> io::Result<()> {
        let (keep_alive, version, head_only) = match &self.current {
            Some(c) => (c.keep_alive, c.version, c.head_only),
            None => (false, Version::HTTP_11, false),
        };
        let status = tour.res.status;
        let bodiless = head_only
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let sized = tour.res.headers.contains_key(CONTENT_LENGTH);
        self.chunked = !bodiless && !sized && version == Version::HTTP_11;
        // without a length an HTTP/1.0 body ends with the connection
        let keep_alive = keep_alive && (bodiless || sized || self.chunked);
        if let Some(c) = &mut self.current {
            c.keep_alive = keep_alive;
        }

        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(status_line(status).as_bytes());
        let mut headers = HeaderMap::with_capacity(tour.res.headers.len() + 2);
        for (name, value) in tour.res.headers.iter() {
            if !is_hop_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        if self.chunked {
            headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
        if !keep_alive {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        } else if version == Version::HTTP_10 {
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }
        put_headers(&mut buf, &headers);
        buf.put_slice(b"\r\n");
        wire.req_write(buf.freeze(), "res-headers", None)
    }

    fn send_content(
        &mut self,
        _tour: &Tour,
        buf: Bytes,
        done: Option<Post>,
        wire: &mut Wire<'_>,
    ) -> io::Result<()> {
        if self.current.as_ref().is_some_and(|c| c.head_only) {
            return wire.req_write(Bytes::new(), "res-content", done);
        }
        if !self.chunked {
            return wire.req_write(buf, "res-content", done);
        }
        let mut chunk = BytesMut::with_capacity(buf.len() + 12);
        chunk.put_slice(format!("{:x}\r\n", buf.len()).as_bytes());
        chunk.put_slice(&buf);
        chunk.put_slice(b"\r\n");
        wire.req_write(chunk.freeze(), "res-chunk", done)
    }

    fn send_end(
        &mut self,
        tour: &Tour,
        keep_alive: bool,
        done: Option<Post>,
        wire: &mut Wire<'_>,
    ) -> io::Result<()> {
        // a cut response must not look complete to the client
        let chunked = std::mem::take(&mut self.chunked);
        let tail = if chunked && !tour.res.truncated() {
            Bytes::from_static(b"0\r\n\r\n")
        } else {
            Bytes::new()
        };
        wire.req_write(tail, "res-end", done)?;
        let keep_alive = keep_alive && self.current.as_ref().is_some_and(|c| c.keep_alive);
        if !keep_alive {
            self.closing = true;
            wire.req_close();
        }
        Ok(())
    }

    fn on_protocol_error(&mut self, err: &ProtocolError, wire: &mut Wire<'_>) -> io::Result<bool> {
        self.closing = true;
        if self.current.is_none() {
            let body = format!("{}: {err}\n", StatusCode::BAD_REQUEST);
            wire.req_write(plain_response(StatusCode::BAD_REQUEST, &body), "res-bad-request", None)?;
        }
        Ok(true)
    }
}

impl ProtocolHandler for H1Handler {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn on_read(
        &mut self,
        buf: &[u8],
        cx: &mut InboundCx<'_>,
    ) -> Result<NextSocketAction, ShipError> {
        self.buf.extend_from_slice(buf);
        self.reading = true;
        let res = self.process(cx);
        self.reading = false;
        res
    }

    fn on_eof(&mut self, cx: &mut InboundCx<'_>) -> NextSocketAction {
        if let Some(Current {
            tour: Some((key, check)),
            remaining,
            ..
        }) = self.current
        {
            if remaining > 0 && cx.tour_state(key, check) == Some(TourState::Reading) {
                cx.fail(key, check, HttpError::bad_request("client closed before sending all content"));
            }
        }
        self.closing = true;
        NextSocketAction::Close
    }

    fn on_tour_ended(&mut self, tour: TourKey, cx: &mut InboundCx<'_>) -> NextSocketAction {
        let finished = match &mut self.current {
            Some(current) if current.tour.is_some_and(|(key, _)| key == tour) => {
                // content still arriving for a gone tour is dropped
                current.tour = None;
                current.remaining == 0
            }
            _ => false,
        };
        if finished {
            self.current = None;
        }
        if self.current.is_none() && cx.active_tours() == 0 {
            cx.set_keeping(true);
        }
        if self.closing || cx.wire().is_closing() {
            return NextSocketAction::Continue;
        }
        match self.process(cx) {
            Ok(NextSocketAction::Continue) => NextSocketAction::Read,
            Ok(action) => action,
            Err(ShipError::Protocol(err)) => {
                warn!(ship = %cx.ship_id(), "{err}");
                let _ = self.on_protocol_error(&err, &mut cx.wire());
                NextSocketAction::Close
            }
            Err(err) => {
                debug!(ship = %cx.ship_id(), "pipelined request failed: {err}");
                NextSocketAction::Close
            }
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.next_req = 0;
        self.current = None;
        self.chunked = false;
        self.closing = false;
        self.reading = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_pipelined_state() {
        let mut handler = H1Handler::new();
        handler.buf.extend_from_slice(b"GET / HTTP/1.1\r\n");
        handler.next_req = 7;
        handler.closing = true;
        handler.reset();
        assert!(handler.buf.is_empty());
        assert_eq!(handler.next_req, 0);
        assert!(!handler.closing);
        assert_eq!(handler.protocol(), PROTOCOL);
    }
}
