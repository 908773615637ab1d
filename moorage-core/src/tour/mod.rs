//! Tours: pooled request/response sessions.
//!
//! A [`Tour`] correlates one logical request with the inbound ship that received
//! it. Protocols that multiplex requests over one connection look a tour back up by
//! its [`TourKey`]. Tours are leased from a per-agent [`TourStore`] and reset when
//! returned, so every mutating method takes the [`TourId`] the caller leased and
//! aborts the process when it no longer matches.
//!
//! ```text
//! Uninitialized -init-> Preparing -go-> Reading -end_req-> Running -end_res-> Ended
//!                                   \------------------->/
//! any live state -> Aborted | Zombie
//! ```
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use tracing::trace;

use crate::{
    error::HttpError,
    post::{Post, Posts, ResPiece},
    rudder::RudderId,
    ship::ShipId,
};

mod meter;
mod req;
mod res;
mod store;

pub use meter::ContentMeter;
pub use req::{Consumer, TourReq};
pub use res::TourRes;
pub use store::{StoreError, TourStore};

static NEXT_TOUR_ID: AtomicU64 = AtomicU64::new(1);

/// Lease identity of a tour. Renewed on every init, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TourId(u64);

impl TourId {
    pub const NONE: TourId = TourId(0);

    fn next() -> Self {
        TourId(NEXT_TOUR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TourId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TourKey {
    pub ship_id: ShipId,
    pub req_key: u32,
}

impl TourKey {
    pub fn new(ship_id: ShipId, req_key: u32) -> Self {
        Self { ship_id, req_key }
    }
}

impl fmt::Display for TourKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ship_id, self.req_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TourState {
    Uninitialized,
    Preparing,
    Reading,
    Running,
    Aborted,
    Ended,
    Zombie,
}

impl TourState {
    pub fn can_move_to(self, next: TourState) -> bool {
        use TourState::*;
        matches!(
            (self, next),
            (Uninitialized, Preparing)
                | (Preparing, Reading | Running | Aborted | Zombie)
                | (Reading, Running | Aborted | Zombie)
                | (Running, Ended | Aborted | Zombie)
        )
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, TourState::Aborted | TourState::Ended | TourState::Zombie)
    }
}

#[derive(Debug)]
pub struct Tour {
    id: TourId,
    key: TourKey,
    state: TourState,
    inbound: Option<RudderId>,
    pub req: TourReq,
    pub res: TourRes,
    error: Option<HttpError>,
}

impl Default for Tour {
    fn default() -> Self {
        Self::new()
    }
}

impl Tour {
    pub fn new() -> Self {
        Self {
            id: TourId::NONE,
            key: TourKey::default(),
            state: TourState::Uninitialized,
            inbound: None,
            req: TourReq::default(),
            res: TourRes::default(),
            error: None,
        }
    }

    #[inline]
    pub fn id(&self) -> TourId {
        self.id
    }

    #[inline]
    pub fn key(&self) -> TourKey {
        self.key
    }

    #[inline]
    pub fn state(&self) -> TourState {
        self.state
    }

    /// Rudder of the inbound ship that owns this tour.
    #[inline]
    pub fn inbound(&self) -> Option<RudderId> {
        self.inbound
    }

    pub fn error(&self) -> Option<&HttpError> {
        self.error.as_ref()
    }

    /// Aborts the process when `check` is not the current lease.
    #[track_caller]
    pub fn check_tour_id(&self, check: TourId) {
        if self.id != check {
            sink!(
                "tour {}: stale tour id {check}, current lease is {}",
                self.key,
                self.id
            );
        }
    }

    #[track_caller]
    fn move_to(&mut self, next: TourState) {
        if !self.state.can_move_to(next) {
            sink!(
                "tour {}: illegal transition {:?} -> {:?}",
                self.key,
                self.state,
                next
            );
        }
        trace!(tour = %self.key, id = %self.id, from = ?self.state, to = ?next, "tour transition");
        self.state = next;
    }

    /// Response operations on a tour the client side no longer waits for are
    /// swallowed.
    #[inline]
    fn detached(&self) -> bool {
        matches!(self.state, TourState::Aborted | TourState::Zombie)
    }

    pub(crate) fn init(&mut self, key: TourKey, inbound: RudderId, limit: u64) -> TourId {
        self.move_to(TourState::Preparing);
        self.id = TourId::next();
        self.key = key;
        self.inbound = Some(inbound);
        self.req.reset(limit);
        self.res.reset(limit);
        self.error = None;
        self.id
    }

    pub(crate) fn reset(&mut self) {
        self.id = TourId::NONE;
        self.key = TourKey::default();
        self.state = TourState::Uninitialized;
        self.inbound = None;
        self.req.reset(0);
        self.res.reset(0);
        self.error = None;
    }

    /// The request head is complete. Hands the tour to a docker through an arrive
    /// post.
    pub fn go(&mut self, check: TourId, posts: &mut Posts) {
        self.check_tour_id(check);
        if self.req.content_length > 0 {
            self.move_to(TourState::Reading);
        } else {
            self.move_to(TourState::Running);
            self.req.mark_ended();
        }
        posts.push_back(Post::Arrive {
            tour: self.key,
            check,
        });
    }

    /// Returns whether the request meter accepts more content.
    pub fn req_post_content(
        &mut self,
        check: TourId,
        data: Bytes,
        posts: &mut Posts,
    ) -> Result<bool, HttpError> {
        self.check_tour_id(check);
        if self.state != TourState::Reading {
            sink!(
                "tour {}: request content posted in state {:?}",
                self.key,
                self.state
            );
        }
        if self.req.meter.posted() + data.len() as u64 > self.req.content_length {
            return Err(HttpError::bad_request(
                "request content exceeds Content-Length",
            ));
        }
        Ok(self.req.post(data, self.key, check, posts))
    }

    pub fn req_end_content(&mut self, check: TourId, posts: &mut Posts) -> Result<(), HttpError> {
        self.check_tour_id(check);
        if self.state != TourState::Reading {
            sink!(
                "tour {}: request content ended in state {:?}",
                self.key,
                self.state
            );
        }
        if self.req.meter.posted() != self.req.content_length {
            return Err(HttpError::bad_request(format!(
                "request content ended after {} of {} bytes",
                self.req.meter.posted(),
                self.req.content_length
            )));
        }
        self.move_to(TourState::Running);
        self.req.mark_ended();
        if let Consumer::Ship(_) = self.req.consumer() {
            posts.push_back(Post::ReqEnd {
                tour: self.key,
                check,
            });
        }
        Ok(())
    }

    pub fn req_set_consumer(&mut self, check: TourId, consumer: Consumer, posts: &mut Posts) {
        self.check_tour_id(check);
        if self.req.set_consumer(consumer, self.key, check, posts) {
            self.resume_inbound(posts);
        }
    }

    pub fn req_consumed(&mut self, check: TourId, len: usize, posts: &mut Posts) {
        self.check_tour_id(check);
        if self.req.meter.consume(len) {
            self.resume_inbound(posts);
        }
    }

    fn resume_inbound(&self, posts: &mut Posts) {
        if let Some(rudder) = self.inbound {
            posts.push_back(Post::Resume { rudder });
        }
    }

    pub fn res_set_listener(&mut self, check: TourId, listener: Option<RudderId>) {
        self.check_tour_id(check);
        self.res.set_listener(listener);
    }

    pub fn res_send_headers(&mut self, check: TourId, posts: &mut Posts) {
        self.check_tour_id(check);
        if self.detached() {
            return;
        }
        if self.res.header_sent() {
            sink!("tour {}: response headers sent twice", self.key);
        }
        self.res.mark_header_sent();
        self.deliver(ResPiece::Headers, posts);
    }

    /// Returns whether the response meter accepts more content.
    pub fn res_send_content(&mut self, check: TourId, data: Bytes, posts: &mut Posts) -> bool {
        self.check_tour_id(check);
        if self.detached() {
            return true;
        }
        if !self.res.header_sent() || self.res.ended() {
            sink!(
                "tour {}: response content outside of headers and end",
                self.key
            );
        }
        if data.is_empty() {
            return self.res.meter.available();
        }
        let available = self.res.meter.post(data.len());
        self.deliver(ResPiece::Content(data), posts);
        available
    }

    pub fn res_end_content(&mut self, check: TourId, posts: &mut Posts) {
        self.check_tour_id(check);
        if self.detached() || self.res.ended() {
            return;
        }
        if !self.res.header_sent() {
            sink!("tour {}: response ended before headers", self.key);
        }
        // the response may finish while request content is still arriving
        if self.state == TourState::Reading {
            self.move_to(TourState::Running);
        }
        self.move_to(TourState::Ended);
        self.res.mark_ended();
        self.deliver(ResPiece::End, posts);
    }

    /// Ends a response whose backend failed after the headers went out.
    pub fn res_cut_content(&mut self, check: TourId, posts: &mut Posts) {
        self.check_tour_id(check);
        if self.detached() || self.res.ended() {
            return;
        }
        self.res.mark_truncated();
        self.res_end_content(check, posts);
    }

    pub fn res_consumed(&mut self, check: TourId, len: usize, posts: &mut Posts) {
        self.check_tour_id(check);
        if self.res.meter.consume(len) {
            if let Some(rudder) = self.res.listener() {
                posts.push_back(Post::Resume { rudder });
            }
        }
    }

    /// Answers the tour with an error response. The agent builds the response so the
    /// port's trouble table can substitute it.
    pub fn res_send_error(&mut self, check: TourId, error: HttpError, posts: &mut Posts) {
        self.check_tour_id(check);
        if self.detached() || self.res.ended() {
            return;
        }
        self.error = Some(error.clone());
        posts.push_back(Post::Fail {
            tour: self.key,
            check,
            error,
        });
    }

    pub fn abort(&mut self, check: TourId) {
        self.check_tour_id(check);
        if !self.state.is_terminal() {
            self.move_to(TourState::Aborted);
        }
    }

    /// Detaches the tour from its client side while a backend still holds it.
    pub fn zombify(&mut self, check: TourId) {
        self.check_tour_id(check);
        self.move_to(TourState::Zombie);
    }

    fn deliver(&self, piece: ResPiece, posts: &mut Posts) {
        posts.push_back(Post::Deliver {
            tour: self.key,
            check: self.id,
            piece,
        });
    }
}
