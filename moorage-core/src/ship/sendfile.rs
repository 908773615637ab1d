use std::{fs::File, io};

use bytes::Bytes;
use tracing::debug;

use super::{NextSocketAction, Ship, ShipMeta};
use crate::{
    agent::{Deck, Harbor},
    error::{ProtocolError, ShipError},
    rudder::{Rudder, RudderId},
    tour::{TourId, TourKey},
    transporter::Timeouts,
};

/// Streams a file into the response of one tour.
///
/// Reading stops whenever the client side has too much unconsumed content and
/// resumes when the tour's response meter drains.
pub struct SendFileShip {
    pub(crate) meta: ShipMeta,
    tour: Option<(TourKey, TourId)>,
}

impl SendFileShip {
    pub fn new(meta: ShipMeta, tour: TourKey, check: TourId) -> Self {
        Self {
            meta,
            tour: Some((tour, check)),
        }
    }

    /// Moors a ship on `file` and starts streaming. The response headers must have
    /// been sent already.
    pub fn sail(
        harbor: &mut Harbor,
        file: File,
        timeouts: Timeouts,
        tour: TourKey,
        check: TourId,
    ) -> io::Result<RudderId> {
        harbor.try_launch(Rudder::reader(file), timeouts, |meta, deck| {
            let ship = SendFileShip::new(meta, tour, check);
            let rudder = ship.meta.rudder();
            if let Some(t) = deck.tours.checked_mut(tour, check) {
                t.res_set_listener(check, Some(rudder));
            }
            deck.mux.req_read(rudder)?;
            Ok(Ship::SendFile(ship))
        })
    }

    pub(crate) fn notify_read(
        &mut self,
        buf: &[u8],
        deck: &mut Deck,
    ) -> Result<NextSocketAction, ShipError> {
        let Some((key, check)) = self.tour else {
            return Ok(NextSocketAction::Close);
        };
        let Some(tour) = deck.tours.checked_mut(key, check) else {
            self.tour = None;
            return Ok(NextSocketAction::Close);
        };
        if tour.res_send_content(check, Bytes::copy_from_slice(buf), &mut deck.posts) {
            Ok(NextSocketAction::Continue)
        } else {
            Ok(NextSocketAction::Suspend)
        }
    }

    pub(crate) fn notify_eof(&mut self, deck: &mut Deck) -> NextSocketAction {
        self.finish(deck, true);
        NextSocketAction::Close
    }

    pub(crate) fn notify_error(&mut self, err: &io::Error, deck: &mut Deck) {
        debug!(ship = %self.meta.ship_id, "file read failed: {err}");
        self.finish(deck, false);
    }

    pub(crate) fn notify_protocol_error(
        &mut self,
        _err: &ProtocolError,
        _deck: &mut Deck,
    ) -> io::Result<bool> {
        Ok(true)
    }

    pub(crate) fn notify_close(&mut self, deck: &mut Deck) {
        self.finish(deck, false);
    }

    pub(crate) fn abandon(&mut self, tour: TourKey) -> NextSocketAction {
        match self.tour {
            Some((key, _)) if key == tour => {
                self.tour = None;
                NextSocketAction::Close
            }
            _ => NextSocketAction::Continue,
        }
    }

    fn finish(&mut self, deck: &mut Deck, complete: bool) {
        let Some((key, check)) = self.tour.take() else {
            return;
        };
        if let Some(tour) = deck.tours.checked_mut(key, check) {
            tour.res_set_listener(check, None);
            if complete {
                tour.res_end_content(check, &mut deck.posts);
            } else {
                tour.res_cut_content(check, &mut deck.posts);
            }
        }
    }
}
