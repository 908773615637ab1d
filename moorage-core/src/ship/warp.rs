use std::{collections::BTreeMap, io, net::SocketAddr};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::{debug, trace};

use super::{NextSocketAction, Ship, ShipMeta};
use crate::{
    agent::{Deck, Harbor},
    error::{HttpError, ProtocolError, ShipError},
    post::Post,
    rudder::{Rudder, RudderId},
    tour::{Consumer, Tour, TourId, TourKey},
    transporter::Timeouts,
};

/// Upstream protocol spoken by a [`WarpShip`].
pub trait WarpHandler {
    fn protocol(&self) -> &'static str;

    /// Writes the request head of the tour mapped to `warp_id`.
    fn start_warp(&mut self, warp_id: u32, cx: &mut WarpCx<'_>) -> io::Result<()>;

    /// `done` must ride on the last write produced for `data`.
    fn send_req_content(
        &mut self,
        warp_id: u32,
        data: Bytes,
        done: Option<Post>,
        cx: &mut WarpCx<'_>,
    ) -> io::Result<()>;

    fn end_req_content(&mut self, warp_id: u32, cx: &mut WarpCx<'_>) -> io::Result<()>;

    fn on_read(&mut self, buf: &[u8], cx: &mut WarpCx<'_>) -> Result<NextSocketAction, ShipError>;

    /// The upstream closed. Tours still mapped afterwards are failed by the ship.
    fn on_eof(&mut self, _cx: &mut WarpCx<'_>) -> NextSocketAction {
        NextSocketAction::Close
    }
}

/// What a warp handler may touch: the ship's wire and the tours it serves.
pub struct WarpCx<'a> {
    meta: &'a mut ShipMeta,
    tours: &'a mut BTreeMap<u32, (TourKey, TourId)>,
    connected: bool,
    held: &'a mut Vec<(Bytes, Option<Post>)>,
    deck: &'a mut Deck,
}

impl WarpCx<'_> {
    #[inline]
    pub fn rudder(&self) -> RudderId {
        self.meta.rudder()
    }

    /// Writes to the upstream, or holds the buffer until the connect completes.
    pub fn write(&mut self, buf: Bytes, done: Option<Post>) -> io::Result<()> {
        if self.connected {
            self.meta
                .transporter
                .req_write(&mut self.deck.mux, buf, "warp", done)
        } else {
            self.held.push((buf, done));
            Ok(())
        }
    }

    pub fn warp_ids(&self) -> Vec<u32> {
        self.tours.keys().copied().collect()
    }

    pub fn tour(&self, warp_id: u32) -> Option<&Tour> {
        let (key, check) = self.tours.get(&warp_id)?;
        self.deck.tours.get(*key).filter(|t| t.id() == *check)
    }

    pub fn tour_mut(&mut self, warp_id: u32) -> Option<&mut Tour> {
        let (key, check) = *self.tours.get(&warp_id)?;
        self.deck.tours.checked_mut(key, check)
    }

    pub fn res_send_headers(&mut self, warp_id: u32, status: StatusCode, headers: HeaderMap) {
        let Some(&(key, check)) = self.tours.get(&warp_id) else {
            return;
        };
        let deck = &mut *self.deck;
        if let Some(tour) = deck.tours.checked_mut(key, check) {
            tour.res.status = status;
            tour.res.headers = headers;
            tour.res_send_headers(check, &mut deck.posts);
        }
    }

    /// Returns whether the client side accepts more content.
    pub fn res_send_content(&mut self, warp_id: u32, data: Bytes) -> bool {
        let Some(&(key, check)) = self.tours.get(&warp_id) else {
            return true;
        };
        let deck = &mut *self.deck;
        match deck.tours.checked_mut(key, check) {
            Some(tour) => tour.res_send_content(check, data, &mut deck.posts),
            None => true,
        }
    }

    /// Ends the response and unmaps the tour.
    pub fn res_end(&mut self, warp_id: u32) {
        let Some((key, check)) = self.tours.remove(&warp_id) else {
            return;
        };
        let deck = &mut *self.deck;
        if let Some(tour) = deck.tours.checked_mut(key, check) {
            tour.res_set_listener(check, None);
            tour.res_end_content(check, &mut deck.posts);
        }
    }

    /// Fails the response and unmaps the tour.
    pub fn res_fail(&mut self, warp_id: u32, error: HttpError) {
        let Some((key, check)) = self.tours.remove(&warp_id) else {
            return;
        };
        fail_tour(self.deck, key, check, error);
    }
}

fn fail_tour(deck: &mut Deck, key: TourKey, check: TourId, error: HttpError) {
    let Some(tour) = deck.tours.checked_mut(key, check) else {
        return;
    };
    tour.res_set_listener(check, None);
    if tour.res.header_sent() {
        tour.res_cut_content(check, &mut deck.posts);
    } else {
        tour.res_send_error(check, error, &mut deck.posts);
    }
}

/// An outbound connection forwarding tours to an upstream server.
pub struct WarpShip {
    pub(crate) meta: ShipMeta,
    handler: Box<dyn WarpHandler>,
    upstream: SocketAddr,
    tours: BTreeMap<u32, (TourKey, TourId)>,
    connected: bool,
    /// Writes issued before the connect completed.
    held: Vec<(Bytes, Option<Post>)>,
    next_warp_id: u32,
}

impl WarpShip {
    pub fn new(meta: ShipMeta, handler: Box<dyn WarpHandler>, upstream: SocketAddr) -> Self {
        Self {
            meta,
            handler,
            upstream,
            tours: BTreeMap::new(),
            connected: false,
            held: Vec::new(),
            next_warp_id: 1,
        }
    }

    /// Moors a warp ship for `tour` and starts connecting to `upstream`.
    pub fn sail(
        harbor: &mut Harbor,
        handler: Box<dyn WarpHandler>,
        upstream: SocketAddr,
        timeouts: Timeouts,
        tour: TourKey,
        check: TourId,
    ) -> io::Result<RudderId> {
        harbor.try_launch(Rudder::Pending, timeouts, |meta, deck| {
            let mut ship = WarpShip::new(meta, handler, upstream);
            ship.start_tour(tour, check, deck)?;
            ship.connect(deck)?;
            Ok(Ship::Warp(ship))
        })
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    pub fn mapped(&self) -> usize {
        self.tours.len()
    }

    fn cx<'a>(&'a mut self, deck: &'a mut Deck) -> (&'a mut dyn WarpHandler, WarpCx<'a>) {
        let WarpShip {
            meta,
            handler,
            tours,
            connected,
            held,
            ..
        } = self;
        (
            handler.as_mut(),
            WarpCx {
                meta,
                tours,
                connected: *connected,
                held,
                deck,
            },
        )
    }

    /// Takes over the request content and the response of `tour`.
    pub fn start_tour(&mut self, tour: TourKey, check: TourId, deck: &mut Deck) -> io::Result<u32> {
        let warp_id = self.next_warp_id;
        self.next_warp_id += 1;
        self.tours.insert(warp_id, (tour, check));
        let rudder = self.meta.rudder();
        if let Some(t) = deck.tours.checked_mut(tour, check) {
            t.res_set_listener(check, Some(rudder));
            t.req_set_consumer(check, Consumer::Ship(rudder), &mut deck.posts);
        }
        trace!(ship = %self.meta.ship_id, warp_id, tour = %tour, "tour warped");
        let (handler, mut cx) = self.cx(deck);
        handler.start_warp(warp_id, &mut cx)?;
        Ok(warp_id)
    }

    pub fn connect(&mut self, deck: &mut Deck) -> io::Result<()> {
        debug!(ship = %self.meta.ship_id, upstream = %self.upstream, protocol = self.handler.protocol(), "connecting upstream");
        self.meta.transporter.req_connect(&mut deck.mux, self.upstream)
    }

    fn warp_id_of(&self, tour: TourKey) -> Option<u32> {
        self.tours
            .iter()
            .find(|(_, (key, _))| *key == tour)
            .map(|(id, _)| *id)
    }

    pub(crate) fn notify_connect(&mut self, deck: &mut Deck) -> io::Result<NextSocketAction> {
        self.connected = true;
        for (buf, done) in self.held.drain(..) {
            self.meta
                .transporter
                .req_write(&mut deck.mux, buf, "warp", done)?;
        }
        Ok(NextSocketAction::Read)
    }

    pub(crate) fn notify_read(
        &mut self,
        buf: &[u8],
        deck: &mut Deck,
    ) -> Result<NextSocketAction, ShipError> {
        let (handler, mut cx) = self.cx(deck);
        let action = handler.on_read(buf, &mut cx)?;
        if self.tours.is_empty() {
            return Ok(NextSocketAction::Close);
        }
        Ok(action)
    }

    pub(crate) fn notify_eof(&mut self, deck: &mut Deck) -> NextSocketAction {
        let (handler, mut cx) = self.cx(deck);
        handler.on_eof(&mut cx);
        self.fail_all(deck, "upstream closed the connection");
        NextSocketAction::Close
    }

    pub(crate) fn notify_error(&mut self, err: &io::Error, deck: &mut Deck) {
        debug!(ship = %self.meta.ship_id, upstream = %self.upstream, "upstream failed: {err}");
        self.fail_all(deck, "upstream failed");
    }

    pub(crate) fn notify_protocol_error(
        &mut self,
        err: &ProtocolError,
        deck: &mut Deck,
    ) -> io::Result<bool> {
        debug!(ship = %self.meta.ship_id, upstream = %self.upstream, "{err}");
        self.fail_all(deck, "invalid upstream response");
        Ok(true)
    }

    pub(crate) fn notify_close(&mut self, deck: &mut Deck) {
        self.fail_all(deck, "upstream connection closed");
    }

    /// Answers every mapped tour with 503, or cuts it short when its headers already
    /// went out, and clears the map.
    fn fail_all(&mut self, deck: &mut Deck, reason: &str) {
        for (_, (key, check)) in std::mem::take(&mut self.tours) {
            fail_tour(deck, key, check, HttpError::service_unavailable(reason));
        }
        self.held.clear();
    }

    pub(crate) fn on_req_content(
        &mut self,
        tour: TourKey,
        check: TourId,
        data: Bytes,
        deck: &mut Deck,
    ) -> NextSocketAction {
        let len = data.len();
        let sent = match self.warp_id_of(tour) {
            Some(warp_id) => {
                let done = Post::ReqConsumed { tour, check, len };
                let (handler, mut cx) = self.cx(deck);
                handler.send_req_content(warp_id, data, Some(done), &mut cx)
            }
            None => Err(io::ErrorKind::NotFound.into()),
        };
        if let Err(e) = sent {
            trace!(ship = %self.meta.ship_id, tour = %tour, "request content dropped: {e}");
            if let Some(t) = deck.tours.checked_mut(tour, check) {
                t.req_consumed(check, len, &mut deck.posts);
            }
        }
        NextSocketAction::Continue
    }

    pub(crate) fn on_req_end(&mut self, tour: TourKey, _check: TourId, deck: &mut Deck) -> NextSocketAction {
        let Some(warp_id) = self.warp_id_of(tour) else {
            return NextSocketAction::Continue;
        };
        let (handler, mut cx) = self.cx(deck);
        match handler.end_req_content(warp_id, &mut cx) {
            Ok(()) => NextSocketAction::Continue,
            Err(e) => {
                debug!(ship = %self.meta.ship_id, tour = %tour, "ending request failed: {e}");
                NextSocketAction::Close
            }
        }
    }

    pub(crate) fn abandon(&mut self, tour: TourKey) -> NextSocketAction {
        let Some(warp_id) = self.warp_id_of(tour) else {
            return NextSocketAction::Continue;
        };
        self.tours.remove(&warp_id);
        debug!(ship = %self.meta.ship_id, tour = %tour, "tour abandoned");
        if self.tours.is_empty() {
            NextSocketAction::Close
        } else {
            NextSocketAction::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        letter::{Postbox, Recipient},
        multiplexer::JobMultiplexer,
        post::ResPiece,
        tour::{TourState, TourStore},
        transporter::Transporter,
        ship::ShipId,
    };

    struct Silent;

    impl WarpHandler for Silent {
        fn protocol(&self) -> &'static str {
            "test"
        }

        fn start_warp(&mut self, _warp_id: u32, cx: &mut WarpCx<'_>) -> io::Result<()> {
            cx.write(Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n"), None)
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
            Ok(())
        }

        fn on_read(&mut self, _buf: &[u8], _cx: &mut WarpCx<'_>) -> Result<NextSocketAction, ShipError> {
            Ok(NextSocketAction::Continue)
        }
    }

    fn deck() -> Deck {
        let recipient = Recipient::new();
        let mux = JobMultiplexer::new(Postbox::new(recipient.wakeup_handle()), 16, 1024);
        Deck::new(0, mux, TourStore::new(4, 1024))
    }

    #[monoio::test(timer_enabled = true)]
    async fn eof_fails_every_mapped_tour() {
        let mut deck = deck();
        let inbound = deck.mux.add_rudder(Rudder::Pending);
        let backend = deck.mux.add_rudder(Rudder::Pending);
        let meta = ShipMeta::new(0, Transporter::new(backend, Timeouts::new(60, 20)));
        let mut ship = WarpShip::new(meta, Box::new(Silent), "127.0.0.1:9".parse().unwrap());

        let mut leased = Vec::new();
        for req_key in 1..=2 {
            let key = TourKey::new(ShipId(77), req_key);
            let check = deck.tours.rent(key, inbound).unwrap();
            deck.tours.get_mut(key).unwrap().go(check, &mut deck.posts);
            ship.start_tour(key, check, &mut deck).unwrap();
            leased.push((key, check));
        }
        // the second tour already started its response
        let (key, check) = leased[1];
        deck.tours.get_mut(key).unwrap().res_send_headers(check, &mut deck.posts);
        deck.posts.clear();

        assert_eq!(ship.notify_eof(&mut deck), NextSocketAction::Close);
        assert_eq!(ship.mapped(), 0);
        assert!(ship.held.is_empty());

        let posts: Vec<_> = deck.posts.drain(..).collect();
        assert!(matches!(
            &posts[0],
            Post::Fail { tour, error, .. } if *tour == leased[0].0 && error.status == StatusCode::SERVICE_UNAVAILABLE
        ));
        assert!(matches!(
            &posts[1],
            Post::Deliver { tour, piece: ResPiece::End, .. } if *tour == leased[1].0
        ));
        let cut = deck.tours.get(leased[1].0).unwrap();
        assert_eq!(cut.state(), TourState::Ended);
        assert!(cut.res.truncated());
    }

    #[monoio::test(timer_enabled = true)]
    async fn abandoning_last_tour_closes() {
        let mut deck = deck();
        let inbound = deck.mux.add_rudder(Rudder::Pending);
        let backend = deck.mux.add_rudder(Rudder::Pending);
        let meta = ShipMeta::new(0, Transporter::new(backend, Timeouts::new(60, 20)));
        let mut ship = WarpShip::new(meta, Box::new(Silent), "127.0.0.1:9".parse().unwrap());
        let key = TourKey::new(ShipId(78), 1);
        let check = deck.tours.rent(key, inbound).unwrap();
        deck.tours.get_mut(key).unwrap().go(check, &mut deck.posts);
        ship.start_tour(key, check, &mut deck).unwrap();
        assert_eq!(ship.held.len(), 1);

        assert_eq!(ship.abandon(TourKey::new(ShipId(78), 2)), NextSocketAction::Continue);
        assert_eq!(ship.abandon(key), NextSocketAction::Close);
        assert_eq!(ship.mapped(), 0);
    }
}
