use std::{
    io,
    panic::{self, AssertUnwindSafe},
    process,
    sync::Arc,
    thread::JoinHandle,
};

use monoio::{blocking::DefaultThreadPool, utils::bind_to_cpu_set};
use tracing::{error, warn};

use super::{AgentId, GrandAgent};
use crate::{
    config::{AgentConfig, RuntimeConfig},
    error::AnyResult,
    runtime::RuntimeWrapper,
};

/// Starts one agent per worker thread.
///
/// Each thread builds its own runtime, runs the setup closure on a fresh
/// [`GrandAgent`] to anchor ports and timers, then drives the agent until it stops.
/// An agent that fails or panics takes the whole process down: its state may be
/// corrupt and the other agents share ports with it.
pub struct AgentLauncher {
    runtime_config: RuntimeConfig,
    agent_config: AgentConfig,
    thread_pool: Option<Box<DefaultThreadPool>>,
}

impl AgentLauncher {
    pub fn new(runtime_config: RuntimeConfig, agent_config: AgentConfig) -> Self {
        let thread_pool = (runtime_config.blocking_threads > 0)
            .then(|| Box::new(DefaultThreadPool::new(runtime_config.blocking_threads)));
        Self {
            runtime_config,
            agent_config,
            thread_pool,
        }
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }

    pub fn launch<F>(&self, setup: F) -> io::Result<Vec<JoinHandle<()>>>
    where
        F: Fn(&mut GrandAgent) -> AnyResult<()> + Send + Sync + 'static,
    {
        let cores = if self.runtime_config.cpu_affinity {
            std::thread::available_parallelism().ok()
        } else {
            None
        };
        let setup = Arc::new(setup);
        let runtime_config = Arc::new(self.runtime_config.clone());
        let agent_config = Arc::new(self.agent_config.clone());

        (0..self.runtime_config.worker_threads)
            .map(|agent_id| {
                let setup = setup.clone();
                let runtime_config = runtime_config.clone();
                let agent_config = agent_config.clone();
                let thread_pool = self.thread_pool.clone();
                std::thread::Builder::new()
                    .name(format!("moorage-agent-{agent_id}"))
                    .spawn(move || {
                        if let Some(cores) = cores {
                            let core = agent_id % cores;
                            if let Err(e) = bind_to_cpu_set([core]) {
                                warn!("bind agent {agent_id} to core {core} failed: {e}");
                            }
                        }
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            run_agent(
                                agent_id,
                                &runtime_config,
                                &agent_config,
                                thread_pool,
                                setup.as_ref(),
                            )
                        }));
                        match outcome {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                error!(agent = agent_id, "agent terminated: {e:#}");
                                process::exit(1);
                            }
                            Err(_) => {
                                error!(agent = agent_id, "agent panicked");
                                process::exit(1);
                            }
                        }
                    })
            })
            .collect()
    }
}

fn run_agent<F>(
    agent_id: AgentId,
    runtime_config: &RuntimeConfig,
    agent_config: &AgentConfig,
    thread_pool: Option<Box<DefaultThreadPool>>,
    setup: &F,
) -> AnyResult<()>
where
    F: Fn(&mut GrandAgent) -> AnyResult<()>,
{
    let mut runtime = RuntimeWrapper::new(runtime_config, thread_pool)?;
    runtime.block_on(async move {
        let mut agent = GrandAgent::new(agent_id, agent_config);
        setup(&mut agent)?;
        agent.run().await
    })
}
