//! HTTP/1 protocol handling, dockers and ports for moorage agents.
use std::rc::Rc;

use anyhow::Context;
use moorage_core::{
    config::{AgentConfig, Config, DockerConfig, PortConfig},
    rudder::ListenerBuilder,
    AnyResult, GrandAgent,
};
use tracing::debug;

pub mod docker;
pub mod h1;
pub mod port;

pub use port::HttpPort;

use crate::docker::{CgiSlots, Reaper};

/// A configured port bound once at startup.
struct PortPlan {
    name: String,
    config: PortConfig,
    listener: ListenerBuilder,
    /// Shared CGI slots, one entry per route.
    slots: Vec<Option<CgiSlots>>,
}

/// Everything agents share: bound listeners and the process-wide CGI limits.
///
/// Built on the main thread, then anchored on each agent from the launcher's setup
/// closure.
pub struct Mooring {
    agent: AgentConfig,
    ports: Vec<PortPlan>,
}

impl Mooring {
    pub fn prepare(config: &Config) -> AnyResult<Self> {
        let mut names: Vec<&String> = config.ports.keys().collect();
        names.sort();
        let mut ports = Vec::with_capacity(names.len());
        for name in names {
            let port = &config.ports[name];
            let listener = ListenerBuilder::try_from(port.listener.clone())
                .with_context(|| format!("port {name}: listener not bound"))?;
            let slots = port
                .routes
                .iter()
                .map(|route| match route.docker {
                    DockerConfig::Cgi { max_processes, .. } => Some(CgiSlots::new(max_processes)),
                    _ => None,
                })
                .collect();
            ports.push(PortPlan {
                name: name.clone(),
                config: port.clone(),
                listener,
                slots,
            });
        }
        Ok(Self {
            agent: config.agent.clone(),
            ports,
        })
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Anchors every port on `agent` and registers the CGI reaper with it.
    pub fn anchor(&self, agent: &mut GrandAgent) -> AnyResult<()> {
        debug!(agent = agent.id(), ports = self.ports.len(), "anchoring ports");
        let reaper = Reaper::new();
        agent.add_timer_handler(Box::new(reaper.clone()));
        for plan in &self.ports {
            let port = HttpPort::from_config(&plan.name, &plan.config, &self.agent, &plan.slots, &reaper)?;
            let listener = plan
                .listener
                .build()
                .with_context(|| format!("port {}: listener not built", plan.name))?;
            agent.anchor(listener, Rc::new(port));
        }
        Ok(())
    }
}
