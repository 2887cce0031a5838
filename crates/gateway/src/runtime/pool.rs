//! Per-(room, agent) runtime client pool.
//!
//! A pooled client is reused while its configuration hash and resume
//! session match the requested options; otherwise it is replaced and
//! the old client is disconnected on a detached task after a short
//! grace so in-flight reads can drain. Creation runs under a per-task
//! lock so concurrent callers share one connect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use ag_domain::{Result, TaskIdentifier};
use ag_runtime::{AgentOptions, RuntimeClient, RuntimeFactory};

/// Grace before a replaced client is disconnected.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Connect attempts for transient transport failures.
const MAX_CONNECT_ATTEMPTS: usize = 3;
const CONNECT_BACKOFF_MS: [u64; 3] = [250, 500, 1000];

struct PooledClient {
    client: Arc<dyn RuntimeClient>,
    config_hash: String,
    usage_lock: Arc<tokio::sync::Mutex<()>>,
}

pub struct ClientPool {
    factory: Arc<dyn RuntimeFactory>,
    pool: Mutex<HashMap<TaskIdentifier, PooledClient>>,
    creation_locks: Mutex<HashMap<TaskIdentifier, Arc<tokio::sync::Mutex<()>>>>,
    disconnect_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientPool {
    pub fn new(factory: Arc<dyn RuntimeFactory>) -> Self {
        Self {
            factory,
            pool: Mutex::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            disconnect_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Get the pooled client for a task, creating or replacing as
    /// needed. Returns `(client, is_new, usage_lock)`; hold the usage
    /// lock for the duration of the turn — clients are not re-entrant.
    pub async fn get_or_create(
        &self,
        task: TaskIdentifier,
        options: &AgentOptions,
    ) -> Result<(Arc<dyn RuntimeClient>, bool, Arc<tokio::sync::Mutex<()>>)> {
        let config_hash = options.config_hash();

        if let Some(hit) = self.lookup(task, &config_hash, options.resume.as_deref()) {
            return Ok(hit);
        }

        // Serialize creation per task so concurrent callers share one
        // connect instead of racing.
        let creation_lock = self.creation_lock(task);
        let _guard = creation_lock.lock().await;

        // Another caller may have created it while we waited.
        if let Some(hit) = self.lookup(task, &config_hash, options.resume.as_deref()) {
            return Ok(hit);
        }

        // Stale entry: evict now, disconnect later.
        if let Some(old) = self.pool.lock().remove(&task) {
            tracing::info!(
                task = %task,
                "replacing pooled client (config or session changed)"
            );
            self.spawn_disconnect(old.client, task);
        }

        let client = self.connect_with_retries(task, options).await?;
        let usage_lock = Arc::new(tokio::sync::Mutex::new(()));
        self.pool.lock().insert(
            task,
            PooledClient {
                client: client.clone(),
                config_hash,
                usage_lock: usage_lock.clone(),
            },
        );
        Ok((client, true, usage_lock))
    }

    /// Remove a task's client and disconnect it in the background.
    pub async fn cleanup(&self, task: TaskIdentifier) {
        if let Some(entry) = self.pool.lock().remove(&task) {
            self.spawn_disconnect(entry.client, task);
        }
    }

    /// Remove every client belonging to a room.
    pub async fn cleanup_room(&self, room_id: i64) {
        let evicted: Vec<(TaskIdentifier, PooledClient)> = {
            let mut pool = self.pool.lock();
            let tasks: Vec<TaskIdentifier> = pool
                .keys()
                .filter(|task| task.room_id == room_id)
                .copied()
                .collect();
            tasks
                .into_iter()
                .filter_map(|task| pool.remove(&task).map(|entry| (task, entry)))
                .collect()
        };
        for (task, entry) in evicted {
            self.spawn_disconnect(entry.client, task);
        }
    }

    pub fn keys(&self) -> Vec<TaskIdentifier> {
        self.pool.lock().keys().copied().collect()
    }

    pub fn get_keys_for_agent(&self, agent_id: i64) -> Vec<TaskIdentifier> {
        self.pool
            .lock()
            .keys()
            .filter(|task| task.agent_id == agent_id)
            .copied()
            .collect()
    }

    pub fn contains(&self, task: TaskIdentifier) -> bool {
        self.pool.lock().contains_key(&task)
    }

    /// Unfinished background disconnect tasks (pruning finished ones).
    pub fn pending_disconnects(&self) -> usize {
        let mut tasks = self.disconnect_tasks.lock();
        tasks.retain(|handle| !handle.is_finished());
        tasks.len()
    }

    /// Drop creation locks for tasks that no longer have a pooled
    /// client. Called from the periodic cleanup sweep.
    pub fn prune_stale_locks(&self) {
        let pool = self.pool.lock();
        self.creation_locks
            .lock()
            .retain(|task, lock| pool.contains_key(task) || Arc::strong_count(lock) > 1);
    }

    /// Disconnect everything and await all background disconnects.
    pub async fn shutdown_all(&self) {
        let evicted: Vec<(TaskIdentifier, PooledClient)> =
            self.pool.lock().drain().collect();
        for (task, entry) in evicted {
            self.spawn_disconnect(entry.client, task);
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.disconnect_tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
        self.creation_locks.lock().clear();
    }

    // ── Internals ────────────────────────────────────────────────────

    fn lookup(
        &self,
        task: TaskIdentifier,
        config_hash: &str,
        resume: Option<&str>,
    ) -> Option<(Arc<dyn RuntimeClient>, bool, Arc<tokio::sync::Mutex<()>>)> {
        let pool = self.pool.lock();
        let entry = pool.get(&task)?;
        if entry.config_hash == config_hash && entry.client.resume_session().as_deref() == resume {
            Some((entry.client.clone(), false, entry.usage_lock.clone()))
        } else {
            None
        }
    }

    fn creation_lock(&self, task: TaskIdentifier) -> Arc<tokio::sync::Mutex<()>> {
        self.creation_locks
            .lock()
            .entry(task)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn connect_with_retries(
        &self,
        task: TaskIdentifier,
        options: &AgentOptions,
    ) -> Result<Arc<dyn RuntimeClient>> {
        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            let client = self.factory.create(task, options);
            match client.connect().await {
                Ok(()) => return Ok(client),
                Err(e) if e.is_transient_transport() && attempt < MAX_CONNECT_ATTEMPTS - 1 => {
                    let delay = CONNECT_BACKOFF_MS[attempt];
                    tracing::warn!(
                        task = %task,
                        attempt = attempt + 1,
                        delay_ms = delay,
                        "transport not ready, retrying connect"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("connect loop returns on the final attempt")
    }

    fn spawn_disconnect(&self, client: Arc<dyn RuntimeClient>, task: TaskIdentifier) {
        let handle = tokio::spawn(async move {
            // Grace: let in-flight reads on the old client drain.
            tokio::time::sleep(DISCONNECT_GRACE).await;
            match client.disconnect().await {
                Ok(()) => {}
                Err(e) => {
                    let message = e.to_string();
                    if message.contains("cancel scope") {
                        // Expected when the owning scope already moved on.
                        tracing::debug!(task = %task, "suppressed cancel-scope error on disconnect");
                    } else {
                        tracing::warn!(task = %task, error = %message, "background disconnect failed");
                    }
                }
            }
        });
        let mut tasks = self.disconnect_tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_runtime::testkit::ScriptedFactory;
    use std::sync::atomic::Ordering;

    fn options_with_resume(resume: Option<&str>) -> AgentOptions {
        AgentOptions {
            model: "claude-sonnet-4-5".into(),
            system_prompt: "You are Alice".into(),
            resume: resume.map(str::to_owned),
            ..Default::default()
        }
    }

    fn pool_with_factory() -> (Arc<ScriptedFactory>, ClientPool) {
        let factory = Arc::new(ScriptedFactory::new());
        let pool = ClientPool::new(factory.clone());
        (factory, pool)
    }

    #[tokio::test]
    async fn creates_then_reuses_client() {
        let (_factory, pool) = pool_with_factory();
        let task = TaskIdentifier::new(1, 2);
        let options = options_with_resume(None);

        let (client1, is_new1, lock1) = pool.get_or_create(task, &options).await.unwrap();
        let (client2, is_new2, lock2) = pool.get_or_create(task, &options).await.unwrap();

        assert!(is_new1);
        assert!(!is_new2);
        assert!(Arc::ptr_eq(&client1, &client2));
        assert!(Arc::ptr_eq(&lock1, &lock2));
    }

    #[tokio::test]
    async fn session_change_replaces_client() {
        let (factory, pool) = pool_with_factory();
        let task = TaskIdentifier::new(1, 2);

        let (client1, is_new1, _) = pool
            .get_or_create(task, &options_with_resume(None))
            .await
            .unwrap();
        let (client2, is_new2, _) = pool
            .get_or_create(task, &options_with_resume(Some("sess_123")))
            .await
            .unwrap();

        assert!(is_new1);
        assert!(is_new2);
        assert!(!Arc::ptr_eq(&client1, &client2));

        // The old client is disconnected after the 0.5 s grace.
        tokio::time::sleep(Duration::from_millis(700)).await;
        let old = factory.created_clients()[0].1.clone();
        assert_eq!(old.disconnect_count.load(Ordering::SeqCst), 1);
        assert_eq!(pool.pending_disconnects(), 0);
    }

    #[tokio::test]
    async fn config_change_replaces_client() {
        let (_factory, pool) = pool_with_factory();
        let task = TaskIdentifier::new(1, 2);

        let (_c1, _, _) = pool
            .get_or_create(task, &options_with_resume(None))
            .await
            .unwrap();

        let mut changed = options_with_resume(None);
        changed.system_prompt = "You are someone else".into();
        let (_c2, is_new, _) = pool.get_or_create(task, &changed).await.unwrap();
        assert!(is_new);
    }

    #[tokio::test]
    async fn cleanup_removes_and_disconnects() {
        let (factory, pool) = pool_with_factory();
        let task = TaskIdentifier::new(1, 2);
        pool.get_or_create(task, &options_with_resume(None))
            .await
            .unwrap();

        pool.cleanup(task).await;
        assert!(!pool.contains(task));

        tokio::time::sleep(Duration::from_millis(700)).await;
        let client = factory.client_for(task).unwrap();
        assert_eq!(client.disconnect_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_of_missing_task_is_harmless() {
        let (_factory, pool) = pool_with_factory();
        pool.cleanup(TaskIdentifier::new(9, 9)).await;
    }

    #[tokio::test]
    async fn cleanup_room_scopes_to_room() {
        let (_factory, pool) = pool_with_factory();
        let in_room1 = TaskIdentifier::new(1, 1);
        let also_room1 = TaskIdentifier::new(1, 2);
        let in_room2 = TaskIdentifier::new(2, 1);
        let options = options_with_resume(None);

        pool.get_or_create(in_room1, &options).await.unwrap();
        pool.get_or_create(also_room1, &options).await.unwrap();
        pool.get_or_create(in_room2, &options).await.unwrap();

        pool.cleanup_room(1).await;
        assert!(!pool.contains(in_room1));
        assert!(!pool.contains(also_room1));
        assert!(pool.contains(in_room2));

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(pool.pending_disconnects(), 0);
    }

    #[tokio::test]
    async fn keys_filter_by_agent() {
        let (_factory, pool) = pool_with_factory();
        let options = options_with_resume(None);
        let a = TaskIdentifier::new(1, 5);
        let b = TaskIdentifier::new(2, 5);
        let c = TaskIdentifier::new(1, 6);
        pool.get_or_create(a, &options).await.unwrap();
        pool.get_or_create(b, &options).await.unwrap();
        pool.get_or_create(c, &options).await.unwrap();

        let keys = pool.get_keys_for_agent(5);
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&a));
        assert!(keys.contains(&b));
        assert_eq!(pool.keys().len(), 3);
    }

    #[tokio::test]
    async fn concurrent_creation_shares_one_client() {
        let (factory, pool) = pool_with_factory();
        let pool = Arc::new(pool);
        let task = TaskIdentifier::new(1, 2);

        let results = futures_util::future::join_all((0..3).map(|_| {
            let pool = pool.clone();
            async move { pool.get_or_create(task, &options_with_resume(None)).await }
        }))
        .await;

        let new_count = results
            .iter()
            .filter(|r| r.as_ref().map(|(_, is_new, _)| *is_new).unwrap_or(false))
            .count();
        assert_eq!(new_count, 1);
        assert_eq!(factory.created_clients().len(), 1);
    }

    #[tokio::test]
    async fn transient_connect_errors_are_retried() {
        let (factory, pool) = pool_with_factory();
        let task = TaskIdentifier::new(1, 2);
        factory.fail_transient_connects(2, 2);

        let (_, is_new, _) = pool
            .get_or_create(task, &options_with_resume(None))
            .await
            .unwrap();
        assert!(is_new);
        // Two failed attempts plus the successful third.
        assert_eq!(factory.created_clients().len(), 3);
    }

    #[tokio::test]
    async fn retries_exhausted_propagates_error() {
        let (factory, pool) = pool_with_factory();
        let task = TaskIdentifier::new(1, 2);
        factory.fail_transient_connects(2, 10);

        let err = pool
            .get_or_create(task, &options_with_resume(None))
            .await
            .unwrap_err();
        assert!(err.is_transient_transport());
        assert!(!pool.contains(task));
        assert_eq!(factory.created_clients().len(), MAX_CONNECT_ATTEMPTS);
    }

    #[tokio::test]
    async fn non_transport_errors_fail_immediately() {
        let (factory, pool) = pool_with_factory();
        let task = TaskIdentifier::new(1, 2);
        factory.fail_connect(2, "invalid options");

        let err = pool
            .get_or_create(task, &options_with_resume(None))
            .await
            .unwrap_err();
        assert!(!err.is_transient_transport());
        assert_eq!(factory.created_clients().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_all_awaits_background_tasks() {
        let (_factory, pool) = pool_with_factory();
        let options = options_with_resume(None);
        pool.get_or_create(TaskIdentifier::new(1, 1), &options)
            .await
            .unwrap();
        pool.get_or_create(TaskIdentifier::new(1, 2), &options)
            .await
            .unwrap();

        pool.shutdown_all().await;
        assert!(pool.keys().is_empty());
        assert_eq!(pool.pending_disconnects(), 0);
    }
}
