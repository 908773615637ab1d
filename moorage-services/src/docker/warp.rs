use std::net::SocketAddr;

use moorage_core::{
    agent::{Docker, Harbor},
    error::HttpError,
    ship::WarpShip,
    tour::{TourId, TourKey},
    transporter::Timeouts,
};
use tracing::debug;

use crate::h1::H1Warp;

/// Forwards requests to an upstream HTTP server, one connection per request.
#[derive(Debug, Clone)]
pub struct WarpDocker {
    upstream: SocketAddr,
    timeouts: Timeouts,
}

impl WarpDocker {
    pub fn new(upstream: SocketAddr, timeout_sec: u64) -> Self {
        Self {
            upstream,
            timeouts: Timeouts::new(timeout_sec, timeout_sec),
        }
    }
}

impl Docker for WarpDocker {
    fn arrive(&self, harbor: &mut Harbor, tour: TourKey, check: TourId) -> Result<(), HttpError> {
        if !harbor.deck.tours.is_live(tour, check) {
            return Ok(());
        }
        let rudder = WarpShip::sail(
            harbor,
            Box::new(H1Warp::new()),
            self.upstream,
            self.timeouts,
            tour,
            check,
        )
        .map_err(|e| HttpError::service_unavailable(format!("upstream {}: {e}", self.upstream)))?;
        debug!(tour = %tour, rudder = %rudder, upstream = %self.upstream, "tour warped upstream");
        Ok(())
    }
}
