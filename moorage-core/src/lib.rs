#[macro_use]
pub mod error;
pub use error::{AnyError, AnyResult};

pub mod agent;
pub mod config;
pub mod letter;
pub mod multiplexer;
pub mod post;
pub mod rudder;
pub mod runtime;
pub mod ship;
pub mod tour;
pub mod transporter;

pub use agent::{AgentHandle, AgentLauncher, GrandAgent};
