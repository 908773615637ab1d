//! Minimal HTTP/1.x codec pieces for the inbound and upstream handlers.
use bytes::{BufMut, Bytes, BytesMut};
use http::{
    header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE},
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version,
};
use moorage_core::error::ProtocolError;

mod inbound;
mod warp;

pub use inbound::H1Handler;
pub use warp::H1Warp;

/// httparse needs the header array preallocated.
pub const MAX_HEADERS_NUM: usize = 128;
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

pub const PROTOCOL: &str = "http/1.1";

/// Hop-by-hop headers never forwarded between connections.
const HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_header(name: &HeaderName) -> bool {
    HOP_HEADERS.contains(&name.as_str())
}

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

fn version_of(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, ProtocolError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| ProtocolError::new(format!("invalid header name {:?}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| ProtocolError::new(format!("invalid value for header {name}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Parses a request head. Returns the head length and the head once complete.
pub(crate) fn parse_request(buf: &[u8]) -> Result<Option<(usize, RequestHead)>, ProtocolError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
    let mut req = httparse::Request::new(&mut raw);
    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD_SIZE => {
            return Err(ProtocolError::new("request head too large"));
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProtocolError::new(format!("malformed request head: {e}"))),
    };
    let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())
        .map_err(|_| ProtocolError::new("invalid method"))?;
    let uri = req
        .path
        .unwrap_or_default()
        .parse::<Uri>()
        .map_err(|_| ProtocolError::new("invalid request target"))?;
    let head = RequestHead {
        method,
        uri,
        version: version_of(req.version),
        headers: header_map(req.headers)?,
    };
    Ok(Some((len, head)))
}

/// Parses a response head. Returns the head length and the head once complete.
pub(crate) fn parse_response(buf: &[u8]) -> Result<Option<(usize, ResponseHead)>, ProtocolError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
    let mut res = httparse::Response::new(&mut raw);
    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD_SIZE => {
            return Err(ProtocolError::new("response head too large"));
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProtocolError::new(format!("malformed response head: {e}"))),
    };
    let status = res
        .code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| ProtocolError::new("invalid status code"))?;
    let head = ResponseHead {
        status,
        version: version_of(res.version),
        headers: header_map(res.headers)?,
    };
    Ok(Some((len, head)))
}

/// Declared body length. Repeated headers must agree.
pub(crate) fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ProtocolError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| ProtocolError::new("invalid Content-Length"))?;
        match length {
            Some(prev) if prev != parsed => {
                return Err(ProtocolError::new("conflicting Content-Length headers"));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
    headers.contains_key(TRANSFER_ENCODING)
}

fn has_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Whether the client lets the connection persist after this request.
pub(crate) fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    match version {
        Version::HTTP_10 => has_token(headers, "keep-alive"),
        _ => !has_token(headers, "close"),
    }
}

/// Protocols a request offers to switch to, in its order of preference. Empty
/// unless `Connection` names the `Upgrade` header.
pub(crate) fn upgrade_offers(headers: &HeaderMap) -> Vec<&str> {
    if !has_token(headers, "upgrade") {
        return Vec::new();
    }
    headers
        .get_all(UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

pub(crate) fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
}

pub(crate) fn put_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
}

/// A complete response written outside of any tour.
pub(crate) fn plain_response(status: StatusCode, body: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + body.len());
    buf.put_slice(status_line(status).as_bytes());
    buf.put_slice(
        format!(
            "content-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        )
        .as_bytes(),
    );
    buf.put_slice(body.as_bytes());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_then_complete_request() {
        assert!(parse_request(b"GET /a HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
        let raw = b"POST /a?b=1 HTTP/1.0\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc";
        let (len, head) = parse_request(raw).unwrap().unwrap();
        assert_eq!(&raw[len..], b"abc");
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.uri.path(), "/a");
        assert_eq!(head.uri.query(), Some("b=1"));
        assert_eq!(head.version, Version::HTTP_10);
        assert_eq!(content_length(&head.headers).unwrap(), Some(3));
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE));
        assert!(parse_request(&raw).is_err());
    }

    #[test]
    fn conflicting_lengths() {
        let mut headers = HeaderMap::new();
        headers.append(CONTENT_LENGTH, HeaderValue::from_static("3"));
        headers.append(CONTENT_LENGTH, HeaderValue::from_static("4"));
        assert!(content_length(&headers).is_err());
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let mut headers = HeaderMap::new();
        assert!(wants_keep_alive(Version::HTTP_11, &headers));
        assert!(!wants_keep_alive(Version::HTTP_10, &headers));
        headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
        assert!(wants_keep_alive(Version::HTTP_10, &headers));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        assert!(!wants_keep_alive(Version::HTTP_11, &headers));
    }

    #[test]
    fn upgrade_needs_connection_token() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("echo, websocket"));
        assert!(upgrade_offers(&headers).is_empty());
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert_eq!(upgrade_offers(&headers), vec!["echo", "websocket"]);
    }

    #[test]
    fn response_head() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let (len, head) = parse_response(raw).unwrap().unwrap();
        assert_eq!(len, raw.len());
        assert_eq!(head.status, StatusCode::NOT_FOUND);
    }
}
