//! Background driver for autonomous conversation rounds.
//!
//! Every tick it finds recently-active, unpaused, unfinished chat
//! rooms (TRPG world rooms are driven elsewhere) and runs one
//! autonomous round per room under a concurrency cap. Ticks never
//! overlap: the loop awaits each sweep and skips missed intervals.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use ag_domain::config::SchedulerConfig;
use ag_store::{Cache, Store};

use super::manager::AgentManager;
use super::orchestrator::Orchestrator;

pub struct BackgroundScheduler {
    store: Store,
    cache: Arc<Cache>,
    manager: Arc<AgentManager>,
    orchestrator: Arc<Orchestrator>,
    config: SchedulerConfig,
    room_semaphore: Arc<Semaphore>,
}

impl BackgroundScheduler {
    pub fn new(
        store: Store,
        cache: Arc<Cache>,
        manager: Arc<AgentManager>,
        orchestrator: Arc<Orchestrator>,
        config: SchedulerConfig,
    ) -> Self {
        let room_semaphore = Arc::new(Semaphore::new(config.max_concurrent_rooms.max(1)));
        Self {
            store,
            cache,
            manager,
            orchestrator,
            config,
            room_semaphore,
        }
    }

    /// Spawn the tick loop. The returned handle aborts it.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let tick_period = Duration::from_secs(self.config.tick_secs);
        let ticks_per_cleanup =
            (self.config.cleanup_interval_mins * 60 / self.config.tick_secs.max(1)).max(1);
        tracing::info!(
            tick_secs = self.config.tick_secs,
            cleanup_mins = self.config.cleanup_interval_mins,
            "background scheduler started"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_period);
            // A long sweep swallows the intervals it missed instead of
            // bursting to catch up.
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut tick_count: u64 = 0;
            loop {
                interval.tick().await;
                self.process_active_rooms().await;
                tick_count += 1;
                if tick_count % ticks_per_cleanup == 0 {
                    self.cleanup().await;
                }
            }
        })
    }

    /// One sweep: run an autonomous round in every eligible room.
    pub async fn process_active_rooms(&self) {
        let cutoff = chrono::Utc::now() - chrono::Duration::minutes(self.config.active_window_mins);
        let rooms = match self
            .store
            .active_rooms(cutoff, self.config.max_concurrent_rooms)
        {
            Ok(rooms) => rooms,
            Err(e) => {
                tracing::error!(error = %e, "active-room query failed");
                return;
            }
        };
        if rooms.is_empty() {
            return;
        }

        let sweeps = rooms.into_iter().map(|room| {
            let semaphore = self.room_semaphore.clone();
            let orchestrator = self.orchestrator.clone();
            let store = self.store.clone();
            async move {
                // Rooms need at least two agents to talk autonomously.
                match store.room_agent_count(room.id) {
                    Ok(count) if count >= 2 => {}
                    Ok(_) => return,
                    Err(e) => {
                        tracing::error!(room_id = room.id, error = %e, "agent count failed");
                        return;
                    }
                }
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if let Err(e) = orchestrator.process_autonomous_round(room.id).await {
                    tracing::error!(room_id = room.id, error = %e, "autonomous round failed");
                }
            }
        });
        futures_util::future::join_all(sweeps).await;
    }

    /// Periodic maintenance: expired cache entries, stale orchestrator
    /// task handles, idle pool resources.
    pub async fn cleanup(&self) {
        self.cache.cleanup_expired();
        self.cache.log_stats();
        self.orchestrator.cleanup_stale_entries();
        self.manager.cleanup_stale_resources();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_domain::config::Config;
    use ag_runtime::testkit::{skip_turn, text_turn, ScriptedFactory};
    use ag_store::records::{NewAgent, NewMessage};
    use ag_store::WriteQueue;

    use crate::runtime::events::EventBroadcaster;

    struct Harness {
        store: Store,
        scheduler: Arc<BackgroundScheduler>,
        factory: Arc<ScriptedFactory>,
    }

    fn harness() -> Harness {
        let store = Store::open_in_memory().unwrap();
        let write_queue = Arc::new(WriteQueue::new(store.clone()));
        write_queue.start();
        let cache = Arc::new(Cache::new());
        let broadcaster = Arc::new(EventBroadcaster::default());
        let factory = Arc::new(ScriptedFactory::new());
        let manager = Arc::new(AgentManager::new(factory.clone()));
        let config = Arc::new(Config::default());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            write_queue,
            cache.clone(),
            broadcaster,
            manager.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(BackgroundScheduler::new(
            store.clone(),
            cache,
            manager,
            orchestrator,
            config.scheduler.clone(),
        ));
        Harness {
            store,
            scheduler,
            factory,
        }
    }

    impl Harness {
        fn room_with_agents(&self, name: &str, agent_names: &[&str]) -> (i64, Vec<i64>) {
            let room = self.store.create_room(Some("admin"), name, None, None).unwrap();
            let mut agent_ids = Vec::new();
            for agent_name in agent_names {
                let agent = self
                    .store
                    .create_agent(&NewAgent {
                        name: format!("{name}-{agent_name}"),
                        system_prompt: "prompt".into(),
                        ..Default::default()
                    })
                    .unwrap();
                self.store.add_agent_to_room(room.id, agent.id).unwrap();
                agent_ids.push(agent.id);
            }
            // Recent activity so the room qualifies as active.
            self.store
                .create_message(&NewMessage::user(room.id, "seed"))
                .unwrap();
            (room.id, agent_ids)
        }
    }

    #[tokio::test]
    async fn sweep_runs_autonomous_round_in_active_room() {
        let h = harness();
        let (room_id, agents) = h.room_with_agents("active", &["a", "b"]);
        h.factory.script_turn(agents[0], text_turn("sess_a", &["autonomous reply"]));
        h.factory.script_turn(agents[1], skip_turn("sess_b"));
        h.factory.script_turn(agents[1], skip_turn("sess_b"));

        h.scheduler.process_active_rooms().await;
        // The round is awaited by the sweep, so messages are in place.
        let messages = h.store.get_messages(room_id).unwrap();
        assert!(messages.iter().any(|m| m.content == "autonomous reply"));
    }

    #[tokio::test]
    async fn sweep_ignores_single_agent_rooms() {
        let h = harness();
        let (room_id, agents) = h.room_with_agents("solo", &["only"]);
        let _ = agents;

        h.scheduler.process_active_rooms().await;
        let messages = h.store.get_messages(room_id).unwrap();
        assert_eq!(messages.len(), 1); // just the seed
    }

    #[tokio::test]
    async fn sweep_ignores_paused_finished_and_world_rooms() {
        let h = harness();
        let (paused, _) = h.room_with_agents("paused", &["a", "b"]);
        h.store.set_room_paused(paused, true).unwrap();
        let (finished, _) = h.room_with_agents("finished", &["a", "b"]);
        h.store.set_room_finished(finished, true).unwrap();

        h.scheduler.process_active_rooms().await;
        assert_eq!(h.store.get_messages(paused).unwrap().len(), 1);
        assert_eq!(h.store.get_messages(finished).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_ignores_idle_rooms() {
        let h = harness();
        // No seed message: create the room, then backdate nothing —
        // just use a room with no recent activity window by making the
        // room and waiting for the cutoff to exclude it is impractical
        // in a unit test, so instead verify the query path directly.
        let room = h.store.create_room(Some("admin"), "idle", None, None).unwrap();
        let cutoff = chrono::Utc::now() + chrono::Duration::minutes(1);
        let rooms = h.store.active_rooms(cutoff, 5).unwrap();
        assert!(rooms.iter().all(|r| r.id != room.id));
    }

    #[tokio::test]
    async fn cleanup_sweep_runs() {
        let h = harness();
        h.scheduler.cleanup().await;
    }
}
