//! Process-wide directory of running agents.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};

use futures_channel::mpsc::UnboundedSender;
use tracing::debug;

use super::{AgentCommand, AgentId, LifecycleListener};

#[derive(Default)]
struct Registry {
    agents: BTreeMap<AgentId, UnboundedSender<AgentCommand>>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

fn registry() -> MutexGuard<'static, Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn register(id: AgentId, commands: UnboundedSender<AgentCommand>) {
    let listeners = {
        let mut registry = registry();
        registry.agents.insert(id, commands);
        registry.listeners.clone()
    };
    debug!(agent = id, "agent registered");
    for listener in listeners {
        listener.on_start(id);
    }
}

pub(crate) fn deregister(id: AgentId) {
    let listeners = {
        let mut registry = registry();
        if registry.agents.remove(&id).is_none() {
            return;
        }
        registry.listeners.clone()
    };
    debug!(agent = id, "agent deregistered");
    for listener in listeners {
        listener.on_shutdown(id);
    }
}

pub fn add_lifecycle_listener(listener: Arc<dyn LifecycleListener>) {
    registry().listeners.push(listener);
}

pub fn agent_count() -> usize {
    registry().agents.len()
}

pub fn agent_ids() -> Vec<AgentId> {
    registry().agents.keys().copied().collect()
}

/// Sends `cmd` to one agent. Returns false when it is not running.
pub fn send(id: AgentId, cmd: AgentCommand) -> bool {
    registry()
        .agents
        .get(&id)
        .map(|tx| tx.unbounded_send(cmd).is_ok())
        .unwrap_or(false)
}

/// Sends `cmd` to every agent. Returns how many were reached.
pub fn broadcast(cmd: AgentCommand) -> usize {
    registry()
        .agents
        .values()
        .filter(|tx| tx.unbounded_send(cmd).is_ok())
        .count()
}

pub fn shutdown_all() -> usize {
    broadcast(AgentCommand::Shutdown)
}

pub fn abort_all() -> usize {
    broadcast(AgentCommand::Abort)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_channel::mpsc::unbounded;
    use futures_util::StreamExt;

    use super::*;

    struct Counting(AtomicUsize);

    impl LifecycleListener for Counting {
        fn on_shutdown(&self, _agent: AgentId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[monoio::test]
    async fn commands_reach_registered_agent() {
        let id = 90_001;
        let (tx, mut rx) = unbounded();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        add_lifecycle_listener(counting.clone());

        register(id, tx);
        assert!(agent_ids().contains(&id));
        assert!(send(id, AgentCommand::CatchUp));
        assert_eq!(rx.next().await, Some(AgentCommand::CatchUp));

        deregister(id);
        deregister(id);
        assert!(!send(id, AgentCommand::Shutdown));
        assert!(counting.0.load(Ordering::SeqCst) >= 1);
    }
}
