use std::{path::PathBuf, rc::Rc};

use http::StatusCode;

use super::{AgentId, Harbor};
use crate::{
    error::HttpError,
    ship::ProtocolHandler,
    tour::{TourId, TourKey},
    transporter::Timeouts,
};

/// A configured listening endpoint: the protocol its connections speak and the
/// dockers its requests are routed to. One instance lives on each agent.
pub trait Port {
    fn name(&self) -> &str;

    fn new_handler(&self) -> Box<dyn ProtocolHandler>;

    /// Whether a connection may switch to `protocol`.
    fn upgrades_to(&self, _protocol: &str) -> bool {
        false
    }

    /// Handler taking over a connection that asked to switch to `protocol`.
    fn upgrade_handler(&self, _protocol: &str) -> Option<Box<dyn ProtocolHandler>> {
        None
    }

    fn find_docker(&self, path: &str) -> Option<Rc<dyn Docker>>;

    /// Substitute response for an error status.
    fn trouble(&self, _status: StatusCode) -> Option<&Trouble> {
        None
    }

    fn timeouts(&self) -> Timeouts;
}

/// Serves tours whose request head is complete.
pub trait Docker {
    /// Takes charge of the tour. An error is answered to the client.
    fn arrive(&self, harbor: &mut Harbor, tour: TourKey, check: TourId) -> Result<(), HttpError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trouble {
    /// Serve this file as the error body.
    Guide(PathBuf),
    /// Replace the error body with this text.
    Text(String),
    /// Redirect the client.
    Reroute(String),
}

/// Called on every ring of the agent, after the idle connection sweep.
pub trait TimerHandler {
    fn on_ring(&mut self, harbor: &mut Harbor);
}

/// Observes agents joining and leaving the registry.
pub trait LifecycleListener: Send + Sync {
    fn on_start(&self, _agent: AgentId) {}

    fn on_shutdown(&self, agent: AgentId);
}
