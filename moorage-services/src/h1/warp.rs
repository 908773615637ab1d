use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{header::CONTENT_LENGTH, HeaderMap, Method, StatusCode};
use moorage_core::{
    error::{ProtocolError, ShipError},
    post::Post,
    ship::{NextSocketAction, WarpCx, WarpHandler},
};
use tracing::trace;

use super::{content_length, is_hop_header, parse_response, put_headers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Head,
    Sized(u64),
    UntilClose,
    Done,
}

/// HTTP/1.0 client side of an upstream connection. Each connection carries one
/// request and the upstream closes it after the response.
#[derive(Debug)]
pub struct H1Warp {
    buf: BytesMut,
    warp_id: Option<u32>,
    body: Body,
}

impl Default for H1Warp {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            warp_id: None,
            body: Body::Head,
        }
    }
}

impl H1Warp {
    pub fn new() -> Self {
        Self::default()
    }

    fn on_head(&mut self, warp_id: u32, cx: &mut WarpCx<'_>) -> Result<bool, ShipError> {
        let Some((len, head)) = parse_response(&self.buf)? else {
            return Ok(false);
        };
        self.buf.advance(len);
        if head.status.is_informational() {
            trace!(warp_id, status = %head.status, "interim response skipped");
            return Ok(true);
        }
        let head_only = cx
            .tour(warp_id)
            .is_some_and(|t| t.req.method == Method::HEAD);
        self.body = if head_only
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
        {
            Body::Done
        } else {
            match content_length(&head.headers)? {
                Some(0) => Body::Done,
                Some(n) => Body::Sized(n),
                None => Body::UntilClose,
            }
        };
        let mut headers = HeaderMap::with_capacity(head.headers.len());
        for (name, value) in head.headers.iter() {
            if !is_hop_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        trace!(warp_id, status = %head.status, version = ?head.version, body = ?self.body, "upstream response head");
        cx.res_send_headers(warp_id, head.status, headers);
        if self.body == Body::Done {
            cx.res_end(warp_id);
        }
        Ok(true)
    }
}

impl WarpHandler for H1Warp {
    fn protocol(&self) -> &'static str {
        "http/1.0"
    }

    fn start_warp(&mut self, warp_id: u32, cx: &mut WarpCx<'_>) -> io::Result<()> {
        let Some(tour) = cx.tour(warp_id) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "warped tour is gone"));
        };
        let target = tour
            .req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(format!("{} {} HTTP/1.0\r\n", tour.req.method, target).as_bytes());
        let mut headers = HeaderMap::with_capacity(tour.req.headers.len() + 1);
        for (name, value) in tour.req.headers.iter() {
            if !is_hop_header(name) && *name != CONTENT_LENGTH {
                headers.append(name.clone(), value.clone());
            }
        }
        if tour.req.content_length > 0 {
            headers.insert(CONTENT_LENGTH, tour.req.content_length.into());
        }
        put_headers(&mut buf, &headers);
        buf.put_slice(b"\r\n");
        self.warp_id = Some(warp_id);
        self.body = Body::Head;
        self.buf.clear();
        cx.write(buf.freeze(), None)
    }

    fn send_req_content(
        &mut self,
        _warp_id: u32,
        data: Bytes,
        done: Option<Post>,
        cx: &mut WarpCx<'_>,
    ) -> io::Result<()> {
        cx.write(data, done)
    }

    fn end_req_content(&mut self, _warp_id: u32, _cx: &mut WarpCx<'_>) -> io::Result<()> {
        // the declared length already frames the request
        Ok(())
    }

    fn on_read(&mut self, buf: &[u8], cx: &mut WarpCx<'_>) -> Result<NextSocketAction, ShipError> {
        let Some(warp_id) = self.warp_id else {
            return Err(ProtocolError::new("upstream sent data before any request").into());
        };
        self.buf.extend_from_slice(buf);
        while self.body == Body::Head {
            if !self.on_head(warp_id, cx)? {
                return Ok(NextSocketAction::Continue);
            }
        }
        if self.buf.is_empty() {
            return Ok(NextSocketAction::Continue);
        }
        let more = match self.body {
            Body::Sized(remaining) => {
                let n = remaining.min(self.buf.len() as u64);
                let data = self.buf.split_to(n as usize).freeze();
                let more = cx.res_send_content(warp_id, data);
                if n == remaining {
                    self.body = Body::Done;
                    cx.res_end(warp_id);
                } else {
                    self.body = Body::Sized(remaining - n);
                }
                more
            }
            Body::UntilClose => {
                let data = self.buf.split().freeze();
                cx.res_send_content(warp_id, data)
            }
            Body::Head | Body::Done => {
                trace!(warp_id, extra = self.buf.len(), "bytes past the response dropped");
                self.buf.clear();
                true
            }
        };
        if more {
            Ok(NextSocketAction::Continue)
        } else {
            Ok(NextSocketAction::Suspend)
        }
    }

    fn on_eof(&mut self, cx: &mut WarpCx<'_>) -> NextSocketAction {
        if let (Some(warp_id), Body::UntilClose) = (self.warp_id, self.body) {
            cx.res_end(warp_id);
            self.body = Body::Done;
        }
        NextSocketAction::Close
    }
}
