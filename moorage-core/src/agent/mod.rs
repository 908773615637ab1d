//! The grand agent: one event loop per worker thread.
//!
//! An agent owns a [`JobMultiplexer`], a [`TourStore`] and the ships moored in its
//! [`Harbor`]. It blocks on its [`Recipient`] until letters arrive, dispatches them
//! one at a time to the ship owning the rudder, then runs the posts the callback
//! queued. Timers ring when the select timeout elapses. Nothing in here is shared
//! with other threads except the command channel behind [`AgentHandle`].
use std::{
    collections::HashMap,
    fs::File,
    rc::Rc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
    HeaderValue, StatusCode,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::AgentConfig,
    error::{AnyResult, HttpError, Sink},
    letter::{IoOp, Letter, Postbox, Recipient},
    multiplexer::{Admission, JobMultiplexer},
    post::Post,
    rudder::{AcceptedAddr, AcceptedStream, Listener, ReadSide, Rudder, RudderId, WriteSide},
    ship::{NextSocketAction, SendFileShip, Ship},
    tour::{Consumer, TourId, TourKey, TourStore},
    transporter,
};

mod harbor;
mod launcher;
mod port;
pub mod registry;

pub use harbor::{Deck, Harbor, Postpone};
pub use launcher::AgentLauncher;
pub use port::{Docker, LifecycleListener, Port, TimerHandler, Trouble};

pub type AgentId = usize;

/// Control messages other threads may send an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCommand {
    /// Stop accepting, close gracefully, exit once every rudder is gone.
    Shutdown,
    /// Exit right away.
    Abort,
    /// Retry one postponed item.
    CatchUp,
}

/// Thread-safe handle to a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    id: AgentId,
    tx: UnboundedSender<AgentCommand>,
}

impl AgentHandle {
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Returns false when the agent is gone.
    pub fn send(&self, cmd: AgentCommand) -> bool {
        self.tx.unbounded_send(cmd).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.send(AgentCommand::Shutdown)
    }

    pub fn abort(&self) -> bool {
        self.send(AgentCommand::Abort)
    }
}

/// Socket-level consequences of a [`NextSocketAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Plan {
    read: bool,
    cancel_read: bool,
    close: bool,
}

fn plan(action: NextSocketAction, read_completed: bool) -> Plan {
    match action {
        NextSocketAction::Continue => Plan {
            read: read_completed,
            ..Plan::default()
        },
        NextSocketAction::Read => Plan {
            read: true,
            ..Plan::default()
        },
        NextSocketAction::Write | NextSocketAction::Suspend => Plan {
            cancel_read: true,
            ..Plan::default()
        },
        NextSocketAction::Close => Plan {
            cancel_read: true,
            close: true,
            ..Plan::default()
        },
    }
}

/// Closes connections idle beyond their limit; always the first timer to ring.
struct TimeoutSweep;

impl TimerHandler for TimeoutSweep {
    fn on_ring(&mut self, harbor: &mut Harbor) {
        let closed = harbor.close_timeout_sockets(Instant::now());
        if closed > 0 {
            debug!(agent = harbor.deck.agent_id(), closed, "idle connections closed");
        }
    }
}

pub struct GrandAgent {
    id: AgentId,
    harbor: Harbor,
    recipient: Recipient,
    postbox: Postbox,
    /// Listening rudders and the port each one serves.
    ports: HashMap<RudderId, Rc<dyn Port>>,
    timers: Vec<Box<dyn TimerHandler>>,
    select_timeout: Duration,
    last_ring: Instant,
    handle: AgentHandle,
    commands: Option<UnboundedReceiver<AgentCommand>>,
    shutting_down: bool,
    aborted: bool,
}

impl GrandAgent {
    pub fn new(id: AgentId, config: &AgentConfig) -> Self {
        let recipient = Recipient::new();
        let postbox = Postbox::new(recipient.wakeup_handle());
        let mux = JobMultiplexer::new(postbox.clone(), config.max_ships, config.read_buffer_size);
        let tours = TourStore::new(config.max_tours, config.tour_buffer_size);
        let (tx, rx) = unbounded();
        Self {
            id,
            harbor: Harbor::new(Deck::new(id, mux, tours)),
            recipient,
            postbox,
            ports: HashMap::new(),
            timers: vec![Box::new(TimeoutSweep)],
            select_timeout: config.select_timeout(),
            last_ring: Instant::now(),
            handle: AgentHandle { id, tx },
            commands: Some(rx),
            shutting_down: false,
            aborted: false,
        }
    }

    #[inline]
    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    /// Registers a listener serving `port`. Accepting starts with [`GrandAgent::run`].
    pub fn anchor(&mut self, listener: Listener, port: Rc<dyn Port>) -> RudderId {
        let id = self.harbor.deck.mux.add_rudder(Rudder::Listener(listener));
        info!(agent = self.id, port = port.name(), rudder = %id, "port anchored");
        self.ports.insert(id, port);
        id
    }

    pub fn add_timer_handler(&mut self, handler: Box<dyn TimerHandler>) {
        self.timers.push(handler);
    }

    pub fn add_postpone(&mut self, item: Postpone) {
        self.harbor.add_postpone(item);
    }

    /// Retries the oldest postponed item.
    pub fn catch_up(&mut self) -> bool {
        let ran = self.harbor.catch_up();
        self.drain_posts();
        ran
    }

    pub fn req_catch_up(&mut self) {
        self.harbor.deck.req_catch_up();
    }

    /// Stops accepting and closes every rudder gracefully. The loop exits once the
    /// last one is gone.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        let closing = self.harbor.deck.mux.close_all();
        info!(agent = self.id, closing, "agent shutting down");
    }

    /// Exits the loop at the next turn without waiting for connections.
    pub fn abort(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        let mux = &mut self.harbor.deck.mux;
        for id in mux.ids() {
            mux.req_abort(id);
        }
        warn!(agent = self.id, "agent aborted");
    }

    pub async fn run(mut self) -> AnyResult<()> {
        registry::register(self.id, self.handle.tx.clone());
        let result = self.sail().await;
        registry::deregister(self.id);
        match &result {
            Ok(()) => info!(agent = self.id, "agent stopped"),
            Err(e) => error!(agent = self.id, "agent failed: {e}"),
        }
        result
    }

    async fn sail(&mut self) -> AnyResult<()> {
        if let Some(mut commands) = self.commands.take() {
            let postbox = self.postbox.clone();
            monoio::spawn(async move {
                while let Some(cmd) = commands.next().await {
                    postbox.post(Letter::Command(cmd));
                }
            });
        }
        self.accept_all();
        info!(agent = self.id, ports = self.ports.len(), "agent running");

        loop {
            if self.aborted {
                return Ok(());
            }
            if self.shutting_down && self.harbor.deck.mux.is_empty() {
                return Ok(());
            }
            match self.harbor.deck.mux.check_busy() {
                Some(Admission::Busy) => {
                    warn!(agent = self.id, open = self.harbor.deck.mux.len(), "agent busy, accepting paused")
                }
                Some(Admission::Free) => {
                    info!(agent = self.id, "agent free, accepting resumed");
                    self.accept_all();
                }
                None => {}
            }

            if self.postbox.pending() == 0 {
                let woken = self.recipient.receive(self.select_timeout).await;
                if !woken || self.last_ring.elapsed() >= self.select_timeout {
                    self.ring();
                }
            } else if self.last_ring.elapsed() >= self.select_timeout {
                self.ring();
            }

            while let Some(letter) = self.postbox.pop() {
                self.dispatch(letter)?;
                self.drain_posts();
            }

            while self.harbor.deck.catch_ups > 0 {
                self.harbor.deck.catch_ups -= 1;
                if !self.harbor.catch_up() {
                    self.harbor.deck.catch_ups = 0;
                }
                self.drain_posts();
            }
        }
    }

    fn accept_all(&mut self) {
        if self.shutting_down {
            return;
        }
        let mux = &mut self.harbor.deck.mux;
        for (id, port) in self.ports.iter() {
            if let Err(e) = mux.req_accept(*id) {
                warn!(agent = self.id, port = port.name(), "accept request failed: {e}");
            }
        }
    }

    fn ring(&mut self) {
        self.last_ring = Instant::now();
        trace!(agent = self.id, "ring");
        for timer in self.timers.iter_mut() {
            timer.on_ring(&mut self.harbor);
        }
        self.drain_posts();
    }

    fn dispatch(&mut self, letter: Letter) -> AnyResult<()> {
        trace!(agent = self.id, kind = letter.kind(), rudder = ?letter.rudder(), "letter");
        match letter {
            Letter::Accepted {
                rudder,
                client,
                addr,
            } => self.on_accepted(rudder, client, addr),
            Letter::Connected { rudder, stream } => self.on_connected(rudder, stream),
            Letter::Read {
                rudder,
                buf,
                reader,
            } => self.on_read(rudder, buf, reader)?,
            Letter::Wrote { rudder, n, writer } => self.on_wrote(rudder, n, writer),
            Letter::Closed { rudder } => self.on_closed(rudder),
            Letter::Error { rudder, op, err } => self.on_error(rudder, op, err),
            Letter::Command(cmd) => self.on_command(cmd),
        }
        Ok(())
    }

    fn next_action(&mut self, rudder: RudderId, action: NextSocketAction, read_completed: bool) {
        let plan = plan(action, read_completed);
        let mux = &mut self.harbor.deck.mux;
        if plan.cancel_read {
            mux.cancel_read(rudder);
        }
        if plan.read {
            if let Err(e) = mux.req_read(rudder) {
                debug!(rudder = %rudder, "read not started: {e}");
            }
        }
        if plan.close {
            mux.req_close(rudder);
        }
    }

    fn on_accepted(&mut self, listener: RudderId, client: AcceptedStream, addr: AcceptedAddr) {
        if !self.harbor.deck.mux.on_accepted(listener) || self.shutting_down {
            return;
        }
        let Some(port) = self.ports.get(&listener).cloned() else {
            return;
        };
        let transport = match &client {
            AcceptedStream::Tcp(_) => "tcp",
            #[cfg(unix)]
            AcceptedStream::Unix(_) => "unix",
        };
        let rudder = self.harbor.launch_inbound(Rudder::Stream(client), port.clone());
        debug!(agent = self.id, port = port.name(), rudder = %rudder, peer = %addr, "connection accepted");
        match self
            .harbor
            .with_ship(rudder, |ship, deck| ship.notify_handshake_done(transport, deck))
        {
            Some(Ok(action)) => self.next_action(rudder, action, false),
            Some(Err(e)) => {
                debug!(rudder = %rudder, "handshake failed: {e}");
                self.harbor.deck.mux.req_abort(rudder);
            }
            None => {}
        }

        let mux = &mut self.harbor.deck.mux;
        if mux.is_busy() {
            debug!(agent = self.id, open = mux.len(), "max ships reached, accept paused");
        } else if let Err(e) = mux.req_accept(listener) {
            warn!(agent = self.id, port = port.name(), "accept request failed: {e}");
        }
    }

    fn on_connected(&mut self, rudder: RudderId, stream: AcceptedStream) {
        if !self.harbor.deck.mux.on_connected(rudder, stream) {
            return;
        }
        match self
            .harbor
            .with_ship(rudder, |ship, deck| ship.notify_connect(deck))
        {
            Some(Ok(action)) => self.next_action(rudder, action, false),
            Some(Err(e)) => {
                self.harbor
                    .with_ship(rudder, |ship, deck| ship.notify_error(&e, deck));
                self.harbor.deck.mux.req_abort(rudder);
            }
            None => self.harbor.deck.mux.req_abort(rudder),
        }
    }

    fn on_read(&mut self, rudder: RudderId, mut buf: Vec<u8>, reader: ReadSide) -> AnyResult<()> {
        let n = buf.len();
        if !self.harbor.deck.mux.on_read(rudder, reader, n) {
            return Ok(());
        }
        let action = self.harbor.with_ship(rudder, |ship, deck| {
            if n == 0 {
                ship.notify_eof(deck)
            } else {
                transporter::on_read(ship, &buf, deck)
            }
        });
        let Some(action) = action else {
            return Err(Sink(format!("rudder {rudder}: read completed without a ship")).into());
        };
        buf.clear();
        self.harbor.deck.mux.recycle_buf(rudder, buf);
        self.next_action(rudder, action, n > 0);
        Ok(())
    }

    fn on_wrote(&mut self, rudder: RudderId, n: usize, writer: WriteSide) {
        if let Some(done) = self.harbor.deck.mux.on_wrote(rudder, n, writer) {
            self.harbor.deck.posts.push_back(done);
        }
    }

    fn on_closed(&mut self, rudder: RudderId) {
        match self.harbor.deck.mux.on_closed(rudder) {
            None => {}
            Some(true) => {
                if let Some(port) = self.ports.remove(&rudder) {
                    info!(agent = self.id, port = port.name(), "port closed");
                }
            }
            Some(false) => {
                if let Some(mut ship) = self.harbor.remove_ship(rudder) {
                    ship.notify_close(&mut self.harbor.deck);
                    self.harbor.recycle(ship);
                }
            }
        }
    }

    fn on_error(&mut self, rudder: RudderId, op: IoOp, err: std::io::Error) {
        if !self.harbor.deck.mux.on_error(rudder, op) {
            trace!(rudder = %rudder, ?op, "error on closing rudder swallowed: {err}");
            return;
        }
        if let Some(port) = self.ports.get(&rudder) {
            warn!(agent = self.id, port = port.name(), "accept failed: {err}");
            let mux = &mut self.harbor.deck.mux;
            if !self.shutting_down && !mux.is_busy() {
                if let Err(e) = mux.req_accept(rudder) {
                    warn!(agent = self.id, "accept request failed: {e}");
                }
            }
            return;
        }
        debug!(rudder = %rudder, ?op, "i/o failed: {err}");
        self.harbor
            .with_ship(rudder, |ship, deck| ship.notify_error(&err, deck));
        self.harbor.deck.mux.req_abort(rudder);
    }

    fn on_command(&mut self, cmd: AgentCommand) {
        debug!(agent = self.id, ?cmd, "command received");
        match cmd {
            AgentCommand::Shutdown => self.shutdown(),
            AgentCommand::Abort => self.abort(),
            AgentCommand::CatchUp => self.harbor.deck.catch_ups += 1,
        }
    }

    fn drain_posts(&mut self) {
        while let Some(post) = self.harbor.deck.posts.pop_front() {
            self.run_post(post);
        }
    }

    fn run_post(&mut self, post: Post) {
        match post {
            Post::Arrive { tour, check } => self.arrive(tour, check),
            Post::Deliver { tour, check, piece } => {
                let Some(inbound) = self.harbor.deck.tours.get(tour).and_then(|t| t.inbound())
                else {
                    return;
                };
                self.harbor.with_ship(inbound, |ship, deck| {
                    if let Ship::Inbound(s) = ship {
                        s.deliver(tour, check, piece, deck);
                    }
                });
            }
            Post::Fail { tour, check, error } => self.fail(tour, check, error),
            Post::TourEnded { tour, check } => {
                let Some(inbound) = self.harbor.deck.tours.get(tour).and_then(|t| t.inbound())
                else {
                    return;
                };
                let action = self.harbor.with_ship(inbound, |ship, deck| match ship {
                    Ship::Inbound(s) => s.return_tour(tour, check, deck),
                    _ => NextSocketAction::Continue,
                });
                if let Some(action) = action {
                    self.next_action(inbound, action, false);
                }
            }
            Post::ReqContent { tour, check, data } => {
                let len = data.len();
                let Some(consumer) = self.consumer_of(tour, check) else {
                    return;
                };
                match self
                    .harbor
                    .with_ship(consumer, |ship, deck| ship.on_req_content(tour, check, data, deck))
                {
                    Some(action) => self.next_action(consumer, action, false),
                    None => {
                        let deck = &mut self.harbor.deck;
                        if let Some(t) = deck.tours.checked_mut(tour, check) {
                            t.req_consumed(check, len, &mut deck.posts);
                        }
                    }
                }
            }
            Post::ReqEnd { tour, check } => {
                let Some(consumer) = self.consumer_of(tour, check) else {
                    return;
                };
                if let Some(action) = self
                    .harbor
                    .with_ship(consumer, |ship, deck| ship.on_req_end(tour, check, deck))
                {
                    self.next_action(consumer, action, false);
                }
            }
            Post::ReqConsumed { tour, check, len } => {
                let deck = &mut self.harbor.deck;
                if let Some(t) = deck.tours.checked_mut(tour, check) {
                    t.req_consumed(check, len, &mut deck.posts);
                }
            }
            Post::ResConsumed { tour, check, len } => {
                let deck = &mut self.harbor.deck;
                if let Some(t) = deck.tours.checked_mut(tour, check) {
                    t.res_consumed(check, len, &mut deck.posts);
                }
            }
            Post::Resume { rudder } => {
                match self.harbor.ship(rudder) {
                    None => return,
                    Some(Ship::Inbound(s)) if s.need_end() => return,
                    Some(_) => {}
                }
                if let Err(e) = self.harbor.deck.mux.req_read(rudder) {
                    trace!(rudder = %rudder, "resume skipped: {e}");
                }
            }
            Post::Abandon {
                tour,
                check,
                backend,
            } => {
                if let Some(action) = self.harbor.with_ship(backend, |ship, _| ship.abandon(tour)) {
                    self.next_action(backend, action, false);
                }
                let tours = &mut self.harbor.deck.tours;
                if tours.checked_mut(tour, check).is_some() {
                    tours.return_tour(tour);
                }
            }
            Post::Close { rudder } => self.harbor.deck.mux.req_close(rudder),
        }
    }

    fn consumer_of(&mut self, tour: TourKey, check: TourId) -> Option<RudderId> {
        match self.harbor.deck.tours.checked_mut(tour, check)?.req.consumer() {
            Consumer::Ship(rudder) => Some(rudder),
            _ => None,
        }
    }

    fn inbound_port(&self, tour: TourKey) -> Option<Rc<dyn Port>> {
        let inbound = self.harbor.deck.tours.get(tour)?.inbound()?;
        match self.harbor.ship(inbound)? {
            Ship::Inbound(s) => Some(s.port().clone()),
            _ => None,
        }
    }

    /// Routes a tour whose request head is complete to the docker serving its path.
    fn arrive(&mut self, tour: TourKey, check: TourId) {
        let path = match self.harbor.deck.tours.checked_mut(tour, check) {
            Some(t) if !t.state().is_terminal() => t.req.uri.path().to_owned(),
            _ => return,
        };
        let Some(port) = self.inbound_port(tour) else {
            return;
        };
        let res = match port.find_docker(&path) {
            Some(docker) => docker.arrive(&mut self.harbor, tour, check),
            None => Err(HttpError::not_found(format!("no docker for {path}"))),
        };
        if let Err(err) = res {
            debug!(tour = %tour, "docker refused tour: {err}");
            let deck = &mut self.harbor.deck;
            if let Some(t) = deck.tours.checked_mut(tour, check) {
                t.res_send_error(check, err, &mut deck.posts);
            }
        }
    }

    /// Answers a tour with an error response, substituted by the port's trouble
    /// table when it has an entry for the status.
    fn fail(&mut self, tour: TourKey, check: TourId, error: HttpError) {
        let port = self.inbound_port(tour);
        let deck = &mut self.harbor.deck;
        let Some(t) = deck.tours.checked_mut(tour, check) else {
            return;
        };
        if t.state().is_terminal() {
            return;
        }
        if t.req.consumer() == Consumer::Pending {
            t.req_set_consumer(check, Consumer::Discard, &mut deck.posts);
        }
        if t.res.header_sent() {
            // too late for another status line
            t.res_cut_content(check, &mut deck.posts);
            return;
        }

        let trouble = port.as_ref().and_then(|p| p.trouble(error.status).cloned());
        let body = match trouble {
            Some(Trouble::Reroute(location)) => match HeaderValue::from_str(&location) {
                Ok(location) => {
                    t.res.status = StatusCode::FOUND;
                    t.res.headers.insert(LOCATION, location);
                    t.res.headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
                    t.res_send_headers(check, &mut deck.posts);
                    t.res_end_content(check, &mut deck.posts);
                    return;
                }
                Err(_) => {
                    warn!(tour = %tour, "invalid reroute location {location:?}");
                    default_error_body(&error)
                }
            },
            Some(Trouble::Guide(path)) => {
                match File::open(&path).and_then(|f| f.metadata().map(|m| (f, m.len()))) {
                    Ok((file, len)) => {
                        t.res.status = error.status;
                        t.res.headers.insert(
                            CONTENT_TYPE,
                            HeaderValue::from_static("text/html; charset=utf-8"),
                        );
                        t.res.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                        t.res_send_headers(check, &mut deck.posts);
                        let timeouts = port
                            .as_ref()
                            .map(|p| p.timeouts())
                            .unwrap_or_else(|| transporter::Timeouts::new(60, 60));
                        if let Err(e) = SendFileShip::sail(&mut self.harbor, file, timeouts, tour, check) {
                            warn!(tour = %tour, "guide {} not served: {e}", path.display());
                            let deck = &mut self.harbor.deck;
                            if let Some(t) = deck.tours.checked_mut(tour, check) {
                                t.res_cut_content(check, &mut deck.posts);
                            }
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(tour = %tour, "guide {} unavailable: {e}", path.display());
                        default_error_body(&error)
                    }
                }
            }
            Some(Trouble::Text(text)) => text,
            None => default_error_body(&error),
        };

        t.res.status = error.status;
        t.res.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        t.res
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        t.res_send_headers(check, &mut deck.posts);
        t.res_send_content(check, Bytes::from(body), &mut deck.posts);
        t.res_end_content(check, &mut deck.posts);
    }
}

fn default_error_body(error: &HttpError) -> String {
    format!("{error}\n")
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io, net::SocketAddr};

    use monoio::{
        io::{AsyncReadRent, AsyncWriteRentExt},
        net::TcpStream,
    };

    use super::*;
    use crate::{
        error::{ProtocolError, ShipError},
        rudder::ListenerBuilder,
        ship::{InboundCx, ProtocolHandler, ShipId, TourHandler},
        tour::Tour,
        transporter::{Timeouts, Wire},
    };

    type Seen = Rc<RefCell<Vec<ShipId>>>;

    /// Answers every read with the id of the ship serving it.
    struct Echo {
        seen: Seen,
    }

    impl TourHandler for Echo {
        fn send_headers(&mut self, _: &Tour, _: &mut Wire<'_>) -> io::Result<()> {
            Ok(())
        }

        fn send_content(&mut self, _: &Tour, _: Bytes, _: Option<Post>, _: &mut Wire<'_>) -> io::Result<()> {
            Ok(())
        }

        fn send_end(&mut self, _: &Tour, _: bool, _: Option<Post>, _: &mut Wire<'_>) -> io::Result<()> {
            Ok(())
        }

        fn on_protocol_error(&mut self, _: &ProtocolError, _: &mut Wire<'_>) -> io::Result<bool> {
            Ok(true)
        }
    }

    impl ProtocolHandler for Echo {
        fn protocol(&self) -> &'static str {
            "echo"
        }

        fn on_read(&mut self, _: &[u8], cx: &mut InboundCx<'_>) -> Result<NextSocketAction, ShipError> {
            self.seen.borrow_mut().push(cx.ship_id());
            let reply = Bytes::from(format!("{}\n", cx.ship_id()));
            cx.wire().req_write(reply, "echo", None)?;
            Ok(NextSocketAction::Continue)
        }

        fn on_tour_ended(&mut self, _: TourKey, _: &mut InboundCx<'_>) -> NextSocketAction {
            NextSocketAction::Continue
        }

        fn reset(&mut self) {}
    }

    struct EchoPort {
        seen: Seen,
        timeouts: Timeouts,
    }

    impl Port for EchoPort {
        fn name(&self) -> &str {
            "echo"
        }

        fn new_handler(&self) -> Box<dyn ProtocolHandler> {
            Box::new(Echo {
                seen: self.seen.clone(),
            })
        }

        fn find_docker(&self, _: &str) -> Option<Rc<dyn Docker>> {
            None
        }

        fn timeouts(&self) -> Timeouts {
            self.timeouts
        }
    }

    fn echo_agent(id: AgentId, config: &AgentConfig, timeouts: Timeouts) -> (GrandAgent, SocketAddr, Seen) {
        let mut agent = GrandAgent::new(id, config);
        let listener = ListenerBuilder::bind_tcp("127.0.0.1:0".parse().unwrap(), Default::default())
            .unwrap()
            .build()
            .unwrap();
        let addr = match &listener {
            Listener::Tcp(l) => l.local_addr().unwrap(),
            #[cfg(unix)]
            Listener::Unix(_) => unreachable!(),
        };
        let seen = Seen::default();
        let port = EchoPort {
            seen: seen.clone(),
            timeouts,
        };
        agent.anchor(listener, Rc::new(port));
        (agent, addr, seen)
    }

    async fn ask(stream: &mut TcpStream) -> String {
        let (res, _) = stream.write_all(b"?".to_vec()).await;
        res.unwrap();
        let (res, buf) = stream.read(Vec::with_capacity(64)).await;
        assert!(res.unwrap() > 0, "connection closed before answering");
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn continue_rearms_only_completed_reads() {
        assert_eq!(
            plan(NextSocketAction::Continue, true),
            Plan {
                read: true,
                ..Plan::default()
            }
        );
        assert_eq!(plan(NextSocketAction::Continue, false), Plan::default());
    }

    #[test]
    fn actions_map_to_socket_requests() {
        assert!(plan(NextSocketAction::Read, false).read);
        for action in [NextSocketAction::Write, NextSocketAction::Suspend] {
            let p = plan(action, true);
            assert!(p.cancel_read && !p.read && !p.close);
        }
        let p = plan(NextSocketAction::Close, true);
        assert!(p.cancel_read && p.close && !p.read);
    }

    #[test]
    fn default_body_names_status() {
        let body = default_error_body(&HttpError::not_found("no docker for /x"));
        assert!(body.starts_with("404 Not Found"));
        assert!(body.contains("/x"));
    }

    #[monoio::test(timer_enabled = true)]
    async fn shutdown_without_rudders_exits() {
        let mut agent = GrandAgent::new(90_100, &AgentConfig::default());
        agent.shutdown();
        agent.run().await.unwrap();
        assert!(!registry::agent_ids().contains(&90_100));
    }

    #[monoio::test(timer_enabled = true)]
    async fn each_connection_gets_its_own_ship() {
        let (agent, addr, seen) = echo_agent(90_101, &AgentConfig::default(), Timeouts::new(30, 5));
        let handle = agent.handle();
        let running = monoio::spawn(agent.run());

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        let from_second = ask(&mut second).await;
        let from_first = ask(&mut first).await;
        assert_ne!(from_first, from_second);
        // a second read lands on the same ship
        assert_eq!(ask(&mut first).await, from_first);
        {
            let seen = seen.borrow();
            assert_eq!(seen.len(), 3);
            assert_ne!(seen[0], seen[1]);
            assert_eq!(seen[1], seen[2]);
        }

        drop(first);
        drop(second);
        handle.shutdown();
        running.await.unwrap();
    }

    #[monoio::test(timer_enabled = true)]
    async fn accepting_pauses_while_busy() {
        let config = AgentConfig {
            max_ships: 1,
            ..Default::default()
        };
        let (agent, addr, seen) = echo_agent(90_102, &config, Timeouts::new(30, 5));
        let handle = agent.handle();
        let running = monoio::spawn(agent.run());

        let mut first = TcpStream::connect(addr).await.unwrap();
        ask(&mut first).await;
        // the kernel completes the handshake, the agent does not accept it
        let mut second = TcpStream::connect(addr).await.unwrap();
        let (res, _) = second.write_all(b"?".to_vec()).await;
        res.unwrap();
        let waited = monoio::time::timeout(Duration::from_millis(300), second.read(Vec::with_capacity(64))).await;
        assert!(waited.is_err(), "served while busy");
        assert_eq!(seen.borrow().len(), 1);

        drop(first);
        let (res, buf) = monoio::time::timeout(Duration::from_secs(5), second.read(Vec::with_capacity(64)))
            .await
            .expect("not served once free");
        assert!(res.unwrap() > 0);
        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(String::from_utf8(buf).unwrap(), format!("{}\n", seen.borrow()[1]));

        drop(second);
        handle.shutdown();
        running.await.unwrap();
    }

    #[monoio::test(timer_enabled = true)]
    async fn idle_connections_are_swept() {
        let config = AgentConfig {
            select_timeout_sec: 1,
            ..Default::default()
        };
        let (agent, addr, _) = echo_agent(90_103, &config, Timeouts::new(1, 1));
        let handle = agent.handle();
        let running = monoio::spawn(agent.run());

        let mut idle = TcpStream::connect(addr).await.unwrap();
        ask(&mut idle).await;
        let (res, _) = monoio::time::timeout(Duration::from_secs(5), idle.read(Vec::with_capacity(8)))
            .await
            .expect("idle connection kept open");
        assert!(matches!(res, Ok(0) | Err(_)));

        handle.shutdown();
        running.await.unwrap();
    }
}
