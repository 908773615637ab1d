use std::{io, rc::Rc};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::{NextSocketAction, ShipId, ShipMeta};
use crate::{
    agent::{Deck, Port},
    error::{HttpError, ProtocolError, ShipError},
    post::{Post, ResPiece},
    rudder::RudderId,
    tour::{Consumer, StoreError, Tour, TourId, TourKey, TourState},
    transporter::Wire,
};

/// Serializes responses of tours onto the client connection.
pub trait TourHandler {
    fn send_headers(&mut self, tour: &Tour, wire: &mut Wire<'_>) -> io::Result<()>;

    /// `done` must ride on the last write produced for `buf`.
    fn send_content(
        &mut self,
        tour: &Tour,
        buf: Bytes,
        done: Option<Post>,
        wire: &mut Wire<'_>,
    ) -> io::Result<()>;

    /// `done` must ride on the last write of the response, even an empty one.
    /// `keep_alive` is false when the request content was not read to its end or
    /// the response was cut short.
    fn send_end(
        &mut self,
        tour: &Tour,
        keep_alive: bool,
        done: Option<Post>,
        wire: &mut Wire<'_>,
    ) -> io::Result<()>;

    /// Returns whether the connection must be closed.
    fn on_protocol_error(&mut self, err: &ProtocolError, wire: &mut Wire<'_>) -> io::Result<bool>;
}

/// Decodes requests arriving on an inbound connection.
pub trait ProtocolHandler: TourHandler {
    fn protocol(&self) -> &'static str;

    /// Returning [`ShipError::Upgrade`] hands the connection to the port's handler
    /// for that protocol.
    fn on_read(
        &mut self,
        buf: &[u8],
        cx: &mut InboundCx<'_>,
    ) -> Result<NextSocketAction, ShipError>;

    fn on_eof(&mut self, _cx: &mut InboundCx<'_>) -> NextSocketAction {
        NextSocketAction::Close
    }

    /// The response of `tour` was flushed and the tour went back to the store.
    fn on_tour_ended(&mut self, tour: TourKey, cx: &mut InboundCx<'_>) -> NextSocketAction;

    /// Prepares a pooled handler for a new connection.
    fn reset(&mut self);
}

/// What a protocol handler may touch while decoding.
pub struct InboundCx<'a> {
    meta: &'a mut ShipMeta,
    port: &'a dyn Port,
    tours: &'a mut Vec<(TourKey, TourId)>,
    deck: &'a mut Deck,
}

impl InboundCx<'_> {
    #[inline]
    pub fn ship_id(&self) -> ShipId {
        self.meta.ship_id
    }

    #[inline]
    pub fn rudder(&self) -> RudderId {
        self.meta.rudder()
    }

    pub fn keeping(&self) -> bool {
        self.meta.keeping
    }

    pub fn set_keeping(&mut self, keeping: bool) {
        self.meta.keeping = keeping;
    }

    /// Whether the port lets this connection switch to `protocol`.
    pub fn can_upgrade(&self, protocol: &str) -> bool {
        self.port.upgrades_to(protocol)
    }

    pub fn active_tours(&self) -> usize {
        self.tours.len()
    }

    /// Leases a tour for request `req_key` of this connection.
    pub fn rent_tour(&mut self, req_key: u32) -> Result<(TourKey, TourId), StoreError> {
        let key = TourKey::new(self.meta.ship_id, req_key);
        let check = self.deck.tours.rent(key, self.meta.rudder())?;
        self.tours.push((key, check));
        self.meta.keeping = false;
        Ok((key, check))
    }

    /// State of `key` while it is still leased under `check`.
    pub fn tour_state(&self, key: TourKey, check: TourId) -> Option<TourState> {
        self.deck
            .tours
            .get(key)
            .filter(|t| t.id() == check)
            .map(Tour::state)
    }

    #[track_caller]
    pub fn tour_mut(&mut self, key: TourKey, check: TourId) -> &mut Tour {
        match self.deck.tours.checked_mut(key, check) {
            Some(tour) => tour,
            None => sink!("tour {key} is not leased"),
        }
    }

    pub fn go(&mut self, key: TourKey, check: TourId) {
        let deck = &mut *self.deck;
        match deck.tours.checked_mut(key, check) {
            Some(tour) => tour.go(check, &mut deck.posts),
            None => sink!("tour {key} is not leased"),
        }
    }

    /// Returns whether more request content is welcome.
    pub fn post_req_content(
        &mut self,
        key: TourKey,
        check: TourId,
        data: Bytes,
    ) -> Result<bool, HttpError> {
        let deck = &mut *self.deck;
        match deck.tours.checked_mut(key, check) {
            Some(tour) => tour.req_post_content(check, data, &mut deck.posts),
            None => sink!("tour {key} is not leased"),
        }
    }

    pub fn end_req_content(&mut self, key: TourKey, check: TourId) -> Result<(), HttpError> {
        let deck = &mut *self.deck;
        match deck.tours.checked_mut(key, check) {
            Some(tour) => tour.req_end_content(check, &mut deck.posts),
            None => sink!("tour {key} is not leased"),
        }
    }

    /// Answers the tour with an error response.
    pub fn fail(&mut self, key: TourKey, check: TourId, error: HttpError) {
        let deck = &mut *self.deck;
        if let Some(tour) = deck.tours.checked_mut(key, check) {
            if tour.req.consumer() == Consumer::Pending {
                tour.req_set_consumer(check, Consumer::Discard, &mut deck.posts);
            }
            tour.res_send_error(check, error, &mut deck.posts);
        }
    }

    pub fn wire(&mut self) -> Wire<'_> {
        self.meta.transporter.wire(&mut self.deck.mux)
    }
}

/// A client connection and the tours it carries.
pub struct InboundShip {
    pub(crate) meta: ShipMeta,
    port: Rc<dyn Port>,
    handler: Box<dyn ProtocolHandler>,
    tours: Vec<(TourKey, TourId)>,
    /// Close once the last tour returns.
    need_end: bool,
    /// The handler came from [`Port::upgrade_handler`].
    upgraded: bool,
}

impl InboundShip {
    pub fn new(meta: ShipMeta, port: Rc<dyn Port>) -> Self {
        let handler = port.new_handler();
        Self {
            meta,
            port,
            handler,
            tours: Vec::new(),
            need_end: false,
            upgraded: false,
        }
    }

    pub(crate) fn reuse(&mut self, meta: ShipMeta, port: Rc<dyn Port>) {
        self.meta = meta;
        if Rc::ptr_eq(&self.port, &port) && !self.upgraded {
            self.handler.reset();
        } else {
            self.handler = port.new_handler();
            self.port = port;
        }
        self.tours.clear();
        self.need_end = false;
        self.upgraded = false;
    }

    pub fn port(&self) -> &Rc<dyn Port> {
        &self.port
    }

    pub fn tours(&self) -> &[(TourKey, TourId)] {
        &self.tours
    }

    #[inline]
    pub fn need_end(&self) -> bool {
        self.need_end
    }

    fn split<'a>(&'a mut self, deck: &'a mut Deck) -> (&'a mut dyn ProtocolHandler, InboundCx<'a>) {
        let InboundShip {
            meta,
            port,
            handler,
            tours,
            ..
        } = self;
        let port = &**port;
        (handler.as_mut(), InboundCx { meta, port, tours, deck })
    }

    pub(crate) fn notify_handshake_done(
        &mut self,
        protocol: &str,
        _deck: &mut Deck,
    ) -> io::Result<NextSocketAction> {
        trace!(
            ship = %self.meta.ship_id,
            transport = protocol,
            handler = self.handler.protocol(),
            "inbound handshake done"
        );
        self.meta.keeping = true;
        Ok(NextSocketAction::Read)
    }

    pub(crate) fn notify_read(
        &mut self,
        buf: &[u8],
        deck: &mut Deck,
    ) -> Result<NextSocketAction, ShipError> {
        let (handler, mut cx) = self.split(deck);
        handler.on_read(buf, &mut cx)
    }

    pub(crate) fn notify_eof(&mut self, deck: &mut Deck) -> NextSocketAction {
        let (handler, mut cx) = self.split(deck);
        let action = handler.on_eof(&mut cx);
        if action == NextSocketAction::Close && !self.tours.is_empty() {
            debug!(ship = %self.meta.ship_id, tours = self.tours.len(), "client finished sending, waiting for tours");
            self.need_end = true;
            return NextSocketAction::Suspend;
        }
        action
    }

    pub(crate) fn notify_error(&mut self, err: &io::Error, _deck: &mut Deck) {
        debug!(ship = %self.meta.ship_id, "inbound connection error: {err}");
    }

    pub(crate) fn notify_protocol_error(
        &mut self,
        err: &ProtocolError,
        deck: &mut Deck,
    ) -> io::Result<bool> {
        warn!(ship = %self.meta.ship_id, "{err}");
        let mut wire = self.meta.transporter.wire(&mut deck.mux);
        self.handler.on_protocol_error(err, &mut wire)
    }

    /// Tours still served by a backend turn into zombies the backend is told to
    /// abandon; the others are aborted and returned.
    pub(crate) fn notify_close(&mut self, deck: &mut Deck) {
        for (key, check) in self.tours.drain(..) {
            let Some(tour) = deck.tours.checked_mut(key, check) else {
                continue;
            };
            let backend = tour.res.listener().or(match tour.req.consumer() {
                Consumer::Ship(rudder) => Some(rudder),
                _ => None,
            });
            match backend {
                Some(backend) if tour.state() != TourState::Ended => {
                    tour.zombify(check);
                    deck.posts.push_back(Post::Abandon {
                        tour: key,
                        check,
                        backend,
                    });
                }
                _ => {
                    tour.abort(check);
                    deck.tours.return_tour(key);
                }
            }
        }
        self.need_end = false;
    }

    pub(crate) fn check_timeout(&self, duration_sec: u64) -> bool {
        self.meta
            .transporter
            .check_timeout(duration_sec, self.meta.keeping && self.tours.is_empty())
    }

    /// Hands the connection to the port's handler for `protocol`, feeding it the
    /// bytes the old handler read past the switch.
    pub(crate) fn upgrade(&mut self, protocol: &str, rest: &[u8], deck: &mut Deck) -> Option<NextSocketAction> {
        let handler = self.port.upgrade_handler(protocol)?;
        debug!(ship = %self.meta.ship_id, from = self.handler.protocol(), to = protocol, "protocol upgraded");
        self.handler = handler;
        self.upgraded = true;
        self.meta.keeping = false;
        if rest.is_empty() {
            return Some(NextSocketAction::Read);
        }
        let ship_id = self.meta.ship_id;
        let (handler, mut cx) = self.split(deck);
        match handler.on_read(rest, &mut cx) {
            Ok(action) => Some(action),
            Err(err) => {
                debug!(ship = %ship_id, "upgraded handler refused its first bytes: {err}");
                Some(NextSocketAction::Close)
            }
        }
    }

    /// Writes one piece of a tour's response.
    pub(crate) fn deliver(&mut self, key: TourKey, check: TourId, piece: ResPiece, deck: &mut Deck) {
        let Some(tour) = deck.tours.get(key) else {
            return;
        };
        tour.check_tour_id(check);
        let mut wire = self.meta.transporter.wire(&mut deck.mux);
        let (res, lost) = match piece {
            ResPiece::Headers => (self.handler.send_headers(tour, &mut wire), None),
            ResPiece::Content(buf) => {
                let len = buf.len();
                let done = Post::ResConsumed { tour: key, check, len };
                let res = self.handler.send_content(tour, buf, Some(done), &mut wire);
                (res, Some(Post::ResConsumed { tour: key, check, len }))
            }
            ResPiece::End => {
                let keep_alive = tour.req.ended() && !tour.res.truncated();
                let done = Post::TourEnded { tour: key, check };
                let res = self.handler.send_end(tour, keep_alive, Some(done), &mut wire);
                (res, Some(Post::TourEnded { tour: key, check }))
            }
        };
        if let Err(err) = res {
            warn!(ship = %self.meta.ship_id, tour = %key, "response write refused: {err}");
            // the refused write never completes, so its completion runs now
            if let Some(post) = lost {
                deck.posts.push_back(post);
            }
        }
    }

    /// Takes back a tour whose response was flushed.
    pub(crate) fn return_tour(&mut self, key: TourKey, check: TourId, deck: &mut Deck) -> NextSocketAction {
        let Some(pos) = self.tours.iter().position(|(k, _)| *k == key) else {
            return NextSocketAction::Continue;
        };
        self.tours.remove(pos);
        if let Some(tour) = deck.tours.get(key) {
            tour.check_tour_id(check);
        }
        deck.tours.return_tour(key);
        let (handler, mut cx) = self.split(deck);
        let action = handler.on_tour_ended(key, &mut cx);
        if self.need_end && self.tours.is_empty() {
            return NextSocketAction::Close;
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent::{Docker, Harbor},
        letter::{Postbox, Recipient},
        multiplexer::JobMultiplexer,
        rudder::Rudder,
        ship::Ship,
        tour::TourStore,
        transporter::Timeouts,
    };

    /// Writes every piece straight to the wire.
    struct Plain;

    impl TourHandler for Plain {
        fn send_headers(&mut self, _: &Tour, wire: &mut Wire<'_>) -> io::Result<()> {
            wire.req_write(Bytes::from_static(b"head"), "head", None)
        }

        fn send_content(&mut self, _: &Tour, buf: Bytes, done: Option<Post>, wire: &mut Wire<'_>) -> io::Result<()> {
            wire.req_write(buf, "content", done)
        }

        fn send_end(&mut self, _: &Tour, _: bool, done: Option<Post>, wire: &mut Wire<'_>) -> io::Result<()> {
            wire.req_write(Bytes::new(), "end", done)
        }

        fn on_protocol_error(&mut self, _: &ProtocolError, _: &mut Wire<'_>) -> io::Result<bool> {
            Ok(true)
        }
    }

    impl ProtocolHandler for Plain {
        fn protocol(&self) -> &'static str {
            "plain"
        }

        fn on_read(&mut self, _: &[u8], _: &mut InboundCx<'_>) -> Result<NextSocketAction, ShipError> {
            Ok(NextSocketAction::Continue)
        }

        fn on_tour_ended(&mut self, _: TourKey, _: &mut InboundCx<'_>) -> NextSocketAction {
            NextSocketAction::Continue
        }

        fn reset(&mut self) {}
    }

    struct PlainPort;

    impl Port for PlainPort {
        fn name(&self) -> &str {
            "plain"
        }

        fn new_handler(&self) -> Box<dyn ProtocolHandler> {
            Box::new(Plain)
        }

        fn find_docker(&self, _: &str) -> Option<Rc<dyn Docker>> {
            None
        }

        fn timeouts(&self) -> Timeouts {
            Timeouts::new(30, 5)
        }
    }

    #[test]
    fn refused_writes_still_complete() {
        let recipient = Recipient::new();
        let mux = JobMultiplexer::new(Postbox::new(recipient.wakeup_handle()), 8, 1024);
        let mut harbor = Harbor::new(Deck::new(90_300, mux, TourStore::new(2, 1024)));
        let port: Rc<dyn Port> = Rc::new(PlainPort);
        // a pending rudder has nothing to write to
        let rudder = harbor.launch(Rudder::Pending, port.timeouts(), |meta| {
            Ship::Inbound(InboundShip::new(meta, port.clone()))
        });
        let ship_id = harbor.ship(rudder).unwrap().meta().ship_id;
        let key = TourKey::new(ship_id, 0);
        let check = harbor.deck.tours.rent(key, rudder).unwrap();

        harbor.with_ship(rudder, |ship, deck| {
            let Ship::Inbound(ship) = ship else {
                panic!("expected an inbound ship");
            };
            ship.deliver(key, check, ResPiece::Headers, deck);
            ship.deliver(key, check, ResPiece::Content(Bytes::from_static(b"body")), deck);
            ship.deliver(key, check, ResPiece::End, deck);
        });
        let posts: Vec<Post> = harbor.deck.posts.drain(..).collect();
        assert!(
            matches!(
                posts.as_slice(),
                [Post::ResConsumed { len: 4, .. }, Post::TourEnded { tour, .. }] if *tour == key
            ),
            "{posts:?}"
        );
    }
}
