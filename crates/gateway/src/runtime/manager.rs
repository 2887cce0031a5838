//! Agent manager: pool + streaming state + active-client registry.
//!
//! The registry tracks which client is currently generating for each
//! task so interruption can reach it. Interrupting a room does NOT
//! evict pooled clients — their runtime sessions stay reusable for the
//! next turn.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use ag_domain::TaskIdentifier;
use ag_runtime::{RuntimeClient, RuntimeFactory};

use super::pool::ClientPool;
use super::streaming::StreamingState;

pub struct AgentManager {
    pub pool: ClientPool,
    pub streaming: StreamingState,
    active_clients: Mutex<HashMap<TaskIdentifier, Arc<dyn RuntimeClient>>>,
}

impl AgentManager {
    pub fn new(factory: Arc<dyn RuntimeFactory>) -> Self {
        Self {
            pool: ClientPool::new(factory),
            streaming: StreamingState::new(),
            active_clients: Mutex::new(HashMap::new()),
        }
    }

    /// Register the client driving a task's in-flight generation.
    pub fn register_active(&self, task: TaskIdentifier, client: Arc<dyn RuntimeClient>) {
        self.active_clients.lock().insert(task, client);
    }

    pub fn deregister_active(&self, task: TaskIdentifier) {
        self.active_clients.lock().remove(&task);
    }

    /// Agent ids currently generating in a room, sorted.
    pub fn chatting_agents(&self, room_id: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .active_clients
            .lock()
            .keys()
            .filter(|task| task.room_id == room_id)
            .map(|task| task.agent_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Interrupt every active generation in a room. Errors are logged
    /// and skipped; completed entries are deregistered.
    pub async fn interrupt_room(&self, room_id: i64) {
        let targets: Vec<(TaskIdentifier, Arc<dyn RuntimeClient>)> = {
            let active = self.active_clients.lock();
            active
                .iter()
                .filter(|(task, _)| task.room_id == room_id)
                .map(|(task, client)| (*task, client.clone()))
                .collect()
        };
        for (task, client) in targets {
            if let Err(e) = client.interrupt().await {
                tracing::warn!(task = %task, error = %e, "interrupt failed");
            }
            self.active_clients.lock().remove(&task);
        }
    }

    /// Interrupt every active generation across all rooms.
    pub async fn interrupt_all(&self) {
        let targets: Vec<(TaskIdentifier, Arc<dyn RuntimeClient>)> = {
            let active = self.active_clients.lock();
            active
                .iter()
                .map(|(task, client)| (*task, client.clone()))
                .collect()
        };
        for (task, client) in targets {
            if let Err(e) = client.interrupt().await {
                tracing::warn!(task = %task, error = %e, "interrupt failed");
            }
            self.active_clients.lock().remove(&task);
        }
    }

    /// Periodic maintenance: drop creation locks for evicted pool
    /// entries and prune finished disconnect tasks.
    pub fn cleanup_stale_resources(&self) {
        self.pool.prune_stale_locks();
        let _ = self.pool.pending_disconnects();
    }

    pub fn active_count(&self) -> usize {
        self.active_clients.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_runtime::testkit::ScriptedFactory;
    use ag_runtime::AgentOptions;

    fn manager_with_factory() -> (Arc<ScriptedFactory>, AgentManager) {
        let factory = Arc::new(ScriptedFactory::new());
        (factory.clone(), AgentManager::new(factory))
    }

    async fn checkout(
        manager: &AgentManager,
        task: TaskIdentifier,
    ) -> Arc<dyn RuntimeClient> {
        let (client, _, _) = manager
            .pool
            .get_or_create(task, &AgentOptions::default())
            .await
            .unwrap();
        manager.register_active(task, client.clone());
        client
    }

    #[tokio::test]
    async fn chatting_agents_filters_by_room() {
        let (_factory, manager) = manager_with_factory();
        checkout(&manager, TaskIdentifier::new(1, 20)).await;
        checkout(&manager, TaskIdentifier::new(1, 10)).await;
        checkout(&manager, TaskIdentifier::new(2, 30)).await;

        assert_eq!(manager.chatting_agents(1), vec![10, 20]);
        assert_eq!(manager.chatting_agents(2), vec![30]);
        assert!(manager.chatting_agents(3).is_empty());
    }

    #[tokio::test]
    async fn interrupt_room_signals_and_deregisters() {
        let (factory, manager) = manager_with_factory();
        let in_room = TaskIdentifier::new(1, 10);
        let other_room = TaskIdentifier::new(2, 20);
        checkout(&manager, in_room).await;
        checkout(&manager, other_room).await;

        manager.interrupt_room(1).await;

        assert!(factory.client_for(in_room).unwrap().was_interrupted());
        assert!(!factory.client_for(other_room).unwrap().was_interrupted());
        assert_eq!(manager.chatting_agents(1), Vec::<i64>::new());
        assert_eq!(manager.active_count(), 1);

        // Pool entries survive the interrupt.
        assert!(manager.pool.contains(in_room));
    }

    #[tokio::test]
    async fn interrupt_all_covers_every_room() {
        let (factory, manager) = manager_with_factory();
        let a = TaskIdentifier::new(1, 10);
        let b = TaskIdentifier::new(2, 20);
        checkout(&manager, a).await;
        checkout(&manager, b).await;

        manager.interrupt_all().await;
        assert!(factory.client_for(a).unwrap().was_interrupted());
        assert!(factory.client_for(b).unwrap().was_interrupted());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let (_factory, manager) = manager_with_factory();
        let task = TaskIdentifier::new(1, 10);
        checkout(&manager, task).await;
        manager.deregister_active(task);
        manager.deregister_active(task);
        assert_eq!(manager.active_count(), 0);
    }
}
