use std::{collections::HashMap, path::PathBuf, rc::Rc};

use anyhow::{anyhow, bail};
use http::StatusCode;
use moorage_core::{
    agent::{Docker, Port, Trouble},
    config::{AgentConfig, DockerConfig, PortConfig, ProtocolKind, TroubleConfig, TroubleMethod},
    ship::ProtocolHandler,
    transporter::Timeouts,
    AnyResult,
};

use crate::{
    docker::{CgiDocker, CgiSlots, FileDocker, Reaper, WarpDocker},
    h1::H1Handler,
};

/// An HTTP listening endpoint: a path router over dockers plus the trouble table
/// used to dress up error responses.
pub struct HttpPort {
    name: String,
    protocol: ProtocolKind,
    router: matchit::Router<Rc<dyn Docker>>,
    troubles: HashMap<StatusCode, Trouble>,
    /// Handler factories by lowercase protocol name.
    upgrades: HashMap<String, Rc<dyn Fn() -> Box<dyn ProtocolHandler>>>,
    timeouts: Timeouts,
}

impl HttpPort {
    pub fn new(name: impl Into<String>, timeouts: Timeouts) -> Self {
        Self {
            name: name.into(),
            protocol: ProtocolKind::H1,
            router: matchit::Router::new(),
            troubles: HashMap::new(),
            upgrades: HashMap::new(),
            timeouts,
        }
    }

    /// Routes requests whose path matches `path` (matchit syntax) to `docker`.
    pub fn route(&mut self, path: &str, docker: Rc<dyn Docker>) -> AnyResult<()> {
        self.router
            .insert(path, docker)
            .map_err(|e| anyhow!("port {}: route {path}: {e}", self.name))
    }

    pub fn add_trouble(&mut self, status: StatusCode, trouble: Trouble) {
        self.troubles.insert(status, trouble);
    }

    /// Lets connections switch to `protocol`, served by handlers from `factory`.
    pub fn add_upgrade(
        &mut self,
        protocol: &str,
        factory: impl Fn() -> Box<dyn ProtocolHandler> + 'static,
    ) {
        self.upgrades
            .insert(protocol.to_ascii_lowercase(), Rc::new(factory));
    }

    /// Builds the port of one agent. `slots` holds the shared CGI slots of each
    /// route, in route order.
    pub fn from_config(
        name: &str,
        config: &PortConfig,
        agent: &AgentConfig,
        slots: &[Option<CgiSlots>],
        reaper: &Reaper,
    ) -> AnyResult<Self> {
        let timeouts = Timeouts::new(
            config.socket_timeout_sec.unwrap_or(agent.socket_timeout_sec),
            config
                .keep_alive_timeout_sec
                .unwrap_or(agent.keep_alive_timeout_sec),
        );
        let mut port = HttpPort::new(name, timeouts);
        port.protocol = config.protocol;
        for (i, route) in config.routes.iter().enumerate() {
            let docker: Rc<dyn Docker> = match &route.docker {
                DockerConfig::File { root } => Rc::new(FileDocker::new(root.clone(), timeouts)),
                DockerConfig::Warp {
                    upstream,
                    timeout_sec,
                } => Rc::new(WarpDocker::new(*upstream, *timeout_sec)),
                DockerConfig::Cgi {
                    root,
                    max_processes,
                    timeout_sec,
                } => {
                    let slots = slots
                        .get(i)
                        .cloned()
                        .flatten()
                        .unwrap_or_else(|| CgiSlots::new(*max_processes));
                    Rc::new(CgiDocker::new(root.clone(), slots, *timeout_sec, reaper.clone()))
                }
            };
            port.route(&route.path, docker)?;
        }
        for trouble in &config.troubles {
            let (status, trouble) = trouble_from_config(trouble)?;
            port.add_trouble(status, trouble);
        }
        Ok(port)
    }
}

fn trouble_from_config(config: &TroubleConfig) -> AnyResult<(StatusCode, Trouble)> {
    let Ok(status) = StatusCode::from_u16(config.status) else {
        bail!("invalid trouble status {}", config.status);
    };
    let trouble = match config.method {
        TroubleMethod::Guide => Trouble::Guide(PathBuf::from(&config.target)),
        TroubleMethod::Text => Trouble::Text(config.target.clone()),
        TroubleMethod::Reroute => Trouble::Reroute(config.target.clone()),
    };
    Ok((status, trouble))
}

impl Port for HttpPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_handler(&self) -> Box<dyn ProtocolHandler> {
        match self.protocol {
            ProtocolKind::H1 => Box::new(H1Handler::new()),
        }
    }

    fn upgrades_to(&self, protocol: &str) -> bool {
        self.upgrades.contains_key(&protocol.to_ascii_lowercase())
    }

    fn upgrade_handler(&self, protocol: &str) -> Option<Box<dyn ProtocolHandler>> {
        self.upgrades
            .get(&protocol.to_ascii_lowercase())
            .map(|factory| factory())
    }

    fn find_docker(&self, path: &str) -> Option<Rc<dyn Docker>> {
        self.router.at(path).ok().map(|m| m.value.clone())
    }

    fn trouble(&self, status: StatusCode) -> Option<&Trouble> {
        self.troubles.get(&status)
    }

    fn timeouts(&self) -> Timeouts {
        self.timeouts
    }
}

#[cfg(test)]
mod tests {
    use moorage_core::{
        agent::Harbor,
        error::HttpError,
        tour::{TourId, TourKey},
    };

    use super::*;

    struct Nop;

    impl Docker for Nop {
        fn arrive(&self, _: &mut Harbor, _: TourKey, _: TourId) -> Result<(), HttpError> {
            Ok(())
        }
    }

    #[test]
    fn routes_by_path() {
        let mut port = HttpPort::new("web", Timeouts::new(30, 5));
        port.route("/static/{*rest}", Rc::new(Nop)).unwrap();
        port.route("/", Rc::new(Nop)).unwrap();
        assert!(port.find_docker("/static/a/b.css").is_some());
        assert!(port.find_docker("/").is_some());
        assert!(port.find_docker("/other").is_none());
        assert!(port.route("/", Rc::new(Nop)).is_err());
    }

    #[test]
    fn trouble_table() {
        let config = TroubleConfig {
            status: 404,
            method: TroubleMethod::Reroute,
            target: "/missing.html".to_owned(),
        };
        let (status, trouble) = trouble_from_config(&config).unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(trouble, Trouble::Reroute("/missing.html".to_owned()));

        let bad = TroubleConfig {
            status: 42,
            ..config
        };
        assert!(trouble_from_config(&bad).is_err());
    }
}
