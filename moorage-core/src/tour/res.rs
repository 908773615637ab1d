use http::{HeaderMap, StatusCode};

use super::ContentMeter;
use crate::rudder::RudderId;

#[derive(Debug)]
pub struct TourRes {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub meter: ContentMeter,
    header_sent: bool,
    ended: bool,
    /// Ended before all of its content was produced.
    truncated: bool,
    /// Rudder resumed when the client side has consumed enough of the response.
    listener: Option<RudderId>,
}

impl Default for TourRes {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            meter: ContentMeter::default(),
            header_sent: false,
            ended: false,
            truncated: false,
            listener: None,
        }
    }
}

impl TourRes {
    pub(crate) fn reset(&mut self, limit: u64) {
        self.status = StatusCode::OK;
        self.headers.clear();
        self.meter.reset(limit);
        self.header_sent = false;
        self.ended = false;
        self.truncated = false;
        self.listener = None;
    }

    #[inline]
    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    #[inline]
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// The client saw a response cut short; its connection can not carry another
    /// one.
    #[inline]
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    #[inline]
    pub fn listener(&self) -> Option<RudderId> {
        self.listener
    }

    pub(crate) fn set_listener(&mut self, listener: Option<RudderId>) {
        self.listener = listener;
    }

    pub(crate) fn mark_header_sent(&mut self) {
        self.header_sent = true;
    }

    pub(crate) fn mark_ended(&mut self) {
        self.ended = true;
    }

    pub(crate) fn mark_truncated(&mut self) {
        self.truncated = true;
    }
}
