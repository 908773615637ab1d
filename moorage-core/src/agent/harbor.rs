use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    io,
    rc::Rc,
    time::Instant,
};

use tracing::{debug, trace};

use super::{registry, AgentCommand, AgentId, Port};
use crate::{
    multiplexer::JobMultiplexer,
    post::{Post, Posts},
    rudder::{Rudder, RudderId},
    ship::{InboundShip, Ship, ShipMeta},
    tour::TourStore,
    transporter::{Timeouts, Transporter},
};

const INBOUND_POOL_SIZE: usize = 64;

/// Work that could not start right away, retried on catch-up.
pub type Postpone = Box<dyn FnOnce(&mut Harbor)>;

/// The part of an agent every ship callback may touch.
pub struct Deck {
    pub(crate) agent_id: AgentId,
    pub mux: JobMultiplexer,
    pub tours: TourStore,
    pub posts: Posts,
    pub(crate) catch_ups: usize,
}

impl Deck {
    pub fn new(agent_id: AgentId, mux: JobMultiplexer, tours: TourStore) -> Self {
        Self {
            agent_id,
            mux,
            tours,
            posts: Posts::new(),
            catch_ups: 0,
        }
    }

    #[inline]
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    #[inline]
    pub fn post(&mut self, post: Post) {
        self.posts.push_back(post);
    }

    /// Asks for one postponed item to be retried. With several agents the request
    /// goes to all of them, since the freed resource may be shared.
    pub fn req_catch_up(&mut self) {
        if registry::agent_count() > 1 {
            let reached = registry::broadcast(AgentCommand::CatchUp);
            trace!(agent = self.agent_id, reached, "catch-up broadcast");
        } else {
            self.catch_ups += 1;
        }
    }
}

/// The fleet of one agent: ships keyed by their rudder, plus the deck they share.
pub struct Harbor {
    pub deck: Deck,
    ships: HashMap<RudderId, Ship>,
    inbound_pool: Vec<InboundShip>,
    postpones: VecDeque<Postpone>,
}

impl Harbor {
    pub fn new(deck: Deck) -> Self {
        Self {
            deck,
            ships: HashMap::new(),
            inbound_pool: Vec::new(),
            postpones: VecDeque::new(),
        }
    }

    /// Registers `rudder` and moors the ship built by `make` on it.
    pub fn launch<F>(&mut self, rudder: Rudder, timeouts: Timeouts, make: F) -> RudderId
    where
        F: FnOnce(ShipMeta) -> Ship,
    {
        match self.try_launch::<_, Infallible>(rudder, timeouts, |meta, _| Ok(make(meta))) {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }

    /// Like [`Harbor::launch`], for ships that issue requests while being built. On
    /// failure the rudder is closed again.
    pub fn try_launch<F, E>(&mut self, rudder: Rudder, timeouts: Timeouts, make: F) -> Result<RudderId, E>
    where
        F: FnOnce(ShipMeta, &mut Deck) -> Result<Ship, E>,
    {
        let id = self.deck.mux.add_rudder(rudder);
        let meta = ShipMeta::new(self.deck.agent_id, Transporter::new(id, timeouts));
        match make(meta, &mut self.deck) {
            Ok(ship) => {
                debug!(agent = self.deck.agent_id, rudder = %id, ship = %ship.meta().ship_id, kind = ship.kind(), "ship launched");
                self.ships.insert(id, ship);
                Ok(id)
            }
            Err(e) => {
                self.deck.mux.req_abort(id);
                Err(e)
            }
        }
    }

    pub(crate) fn launch_inbound(&mut self, rudder: Rudder, port: Rc<dyn Port>) -> RudderId {
        let timeouts = port.timeouts();
        let pooled = self.inbound_pool.pop();
        self.launch(rudder, timeouts, move |meta| {
            Ship::Inbound(match pooled {
                Some(mut ship) => {
                    ship.reuse(meta, port);
                    ship
                }
                None => InboundShip::new(meta, port),
            })
        })
    }

    pub fn ship(&self, id: RudderId) -> Option<&Ship> {
        self.ships.get(&id)
    }

    /// Runs `f` with the ship on `id` and the deck borrowed side by side.
    pub fn with_ship<R>(&mut self, id: RudderId, f: impl FnOnce(&mut Ship, &mut Deck) -> R) -> Option<R> {
        let ship = self.ships.get_mut(&id)?;
        Some(f(ship, &mut self.deck))
    }

    pub(crate) fn remove_ship(&mut self, id: RudderId) -> Option<Ship> {
        self.ships.remove(&id)
    }

    pub(crate) fn recycle(&mut self, ship: Ship) {
        if let Ship::Inbound(ship) = ship {
            if self.inbound_pool.len() < INBOUND_POOL_SIZE {
                self.inbound_pool.push(ship);
            }
        }
    }

    /// Forcibly closes every connection idle beyond the limit its ship applies.
    /// Returns how many were closed.
    pub fn close_timeout_sockets(&mut self, now: Instant) -> usize {
        let mut closed = 0;
        for (id, idle) in self.deck.mux.idle_rudders(now) {
            let Some(ship) = self.ships.get_mut(&id) else {
                continue;
            };
            if !ship.check_timeout(idle) {
                continue;
            }
            debug!(agent = self.deck.agent_id, rudder = %id, kind = ship.kind(), idle, "connection timed out");
            let err = io::Error::new(io::ErrorKind::TimedOut, format!("idle for {idle}s"));
            ship.notify_error(&err, &mut self.deck);
            self.deck.mux.req_abort(id);
            closed += 1;
        }
        closed
    }

    pub fn add_postpone(&mut self, item: Postpone) {
        self.postpones.push_back(item);
    }

    pub fn postponed(&self) -> usize {
        self.postpones.len()
    }

    /// Runs the oldest postponed item. Returns false when none was waiting.
    pub fn catch_up(&mut self) -> bool {
        match self.postpones.pop_front() {
            Some(item) => {
                item(self);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::letter::{Postbox, Recipient};

    fn harbor() -> Harbor {
        let recipient = Recipient::new();
        let mux = JobMultiplexer::new(Postbox::new(recipient.wakeup_handle()), 8, 1024);
        Harbor::new(Deck::new(90_200, mux, TourStore::new(4, 1024)))
    }

    #[test]
    fn catch_up_runs_oldest_postponed_first() {
        let mut harbor = harbor();
        let ran = Rc::new(RefCell::new(Vec::new()));
        for n in 0..2 {
            let ran = ran.clone();
            harbor.add_postpone(Box::new(move |_: &mut Harbor| ran.borrow_mut().push(n)));
        }
        assert_eq!(harbor.postponed(), 2);
        assert!(harbor.catch_up());
        assert_eq!(*ran.borrow(), vec![0]);

        // an item still short of its resource goes back to the end of the queue
        let retry = ran.clone();
        harbor.add_postpone(Box::new(move |harbor: &mut Harbor| {
            let ran = retry.clone();
            harbor.add_postpone(Box::new(move |_: &mut Harbor| ran.borrow_mut().push(3)));
            retry.borrow_mut().push(2);
        }));
        assert!(harbor.catch_up());
        assert!(harbor.catch_up());
        assert_eq!(harbor.postponed(), 1);
        assert!(harbor.catch_up());
        assert_eq!(*ran.borrow(), vec![0, 1, 2, 3]);
        assert!(!harbor.catch_up());
    }
}
