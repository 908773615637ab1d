//! Agent-local work items.
//!
//! A ship callback only ever mutates its own ship and the deck it is handed. Effects
//! on another ship (a backend delivering response bytes to the client connection, a
//! flushed write resuming a paused reader) are queued as [`Post`]s and run by the
//! agent right after the callback returns, in FIFO order.
use std::collections::VecDeque;

use bytes::Bytes;

use crate::{
    error::HttpError,
    rudder::RudderId,
    tour::{TourId, TourKey},
};

pub type Posts = VecDeque<Post>;

#[derive(Debug)]
pub enum ResPiece {
    Headers,
    Content(Bytes),
    End,
}

#[derive(Debug)]
pub enum Post {
    /// The tour left PREPARING and must be handed to a docker.
    Arrive { tour: TourKey, check: TourId },
    /// Response data for the client side of the tour.
    Deliver {
        tour: TourKey,
        check: TourId,
        piece: ResPiece,
    },
    /// Answer the tour with an error response, trouble substitution included.
    Fail {
        tour: TourKey,
        check: TourId,
        error: HttpError,
    },
    /// The protocol handler flushed the end of the response.
    TourEnded { tour: TourKey, check: TourId },
    /// Request content for the backend consuming the tour.
    ReqContent {
        tour: TourKey,
        check: TourId,
        data: Bytes,
    },
    ReqEnd { tour: TourKey, check: TourId },
    ReqConsumed {
        tour: TourKey,
        check: TourId,
        len: usize,
    },
    ResConsumed {
        tour: TourKey,
        check: TourId,
        len: usize,
    },
    /// Re-arm reading on a rudder paused by backpressure.
    Resume { rudder: RudderId },
    /// The client side is gone; the backend must stop working for the tour.
    Abandon {
        tour: TourKey,
        check: TourId,
        backend: RudderId,
    },
    Close { rudder: RudderId },
}
