//! Process-wide service container.
//!
//! `init` selects the storage backend, wires the components together, and
//! starts the retention sweeper; the returned handle must be closed via
//! `shutdown`, which stops the sweeper, ends every event stream, and
//! flushes the durable backend.

use crate::{
    config::Config,
    constants::{SWEEP_INTERVAL_SECS, TASK_RETENTION_HOURS},
    locks::LockRegistry,
    monitoring::{MetricsSnapshot, SystemMonitor},
    queue::TaskQueue,
    session::{EventBus, SessionManager},
    store::{InMemoryStateStore, SqliteStateStore, StateStore},
    tools::ToolDispatcher,
    Result,
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error, info};

pub struct Container {
    pub config: Config,
    pub store: Arc<dyn StateStore>,
    pub locks: Arc<LockRegistry>,
    pub events: Arc<EventBus>,
    pub queue: Arc<TaskQueue>,
    pub sessions: Arc<SessionManager>,
    pub tools: Arc<ToolDispatcher>,
    pub monitor: Arc<SystemMonitor>,
    memory_store: Option<Arc<InMemoryStateStore>>,
    sqlite_store: Option<Arc<SqliteStateStore>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Container {
    /// Constructs the chosen state store, wires every component, and
    /// starts the sweeper.
    pub async fn init(config: Config) -> Result<Arc<Self>> {
        let (store, memory_store, sqlite_store): (
            Arc<dyn StateStore>,
            Option<Arc<InMemoryStateStore>>,
            Option<Arc<SqliteStateStore>>,
        ) = if config.storage.use_mocks {
            info!("using in-memory state store");
            let memory = Arc::new(InMemoryStateStore::new());
            (memory.clone(), Some(memory), None)
        } else {
            let sqlite = Arc::new(SqliteStateStore::open(&config.storage.database_path).await?);
            (sqlite.clone(), None, Some(sqlite))
        };

        let events = Arc::new(EventBus::new());
        let locks = Arc::new(LockRegistry::new(
            store.clone(),
            Duration::from_millis(config.locks.lock_timeout_ms),
            Duration::from_secs(config.locks.conflict_retention_secs),
        ));
        let queue = Arc::new(TaskQueue::new(store.clone(), events.clone()));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            locks.clone(),
            events.clone(),
        ));
        let tools = Arc::new(ToolDispatcher::new(
            queue.clone(),
            locks.clone(),
            sessions.clone(),
        ));

        let container = Arc::new(Self {
            config,
            store: store.clone(),
            locks: locks.clone(),
            events,
            queue,
            sessions,
            tools,
            monitor: Arc::new(SystemMonitor::new()),
            memory_store: memory_store.clone(),
            sqlite_store,
            sweeper: Mutex::new(None),
        });

        let sweeper = tokio::spawn(sweep_loop(store, locks, memory_store));
        *container.sweeper.lock().await = Some(sweeper);

        info!("coordination container initialized");
        Ok(container)
    }

    /// Stops the sweeper, closes every event channel (ending subscriber
    /// streams), and flushes the durable backend.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        self.events.close_all().await;
        if let Some(sqlite) = &self.sqlite_store {
            sqlite.close().await;
        }
        info!("coordination container shut down");
    }

    /// Readiness: the state store answers queries.
    pub async fn ready(&self) -> bool {
        self.store.get_all_locks().await.is_ok()
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        let (total_requests, failed_requests) = self.monitor.request_counts();
        let queued_tasks = self.queue.queued_depth().await.unwrap_or(0);
        let active_locks = self
            .store
            .get_all_locks()
            .await
            .map(|locks| locks.len())
            .unwrap_or(0);
        MetricsSnapshot {
            uptime_seconds: self.monitor.uptime_seconds(),
            total_requests,
            failed_requests,
            queued_tasks,
            active_locks,
            sessions: self.sessions.session_counts().await,
            registered_agents: self.queue.registered_agent_count().await,
            events_dropped: self.events.dropped_events().await,
        }
    }
}

async fn sweep_loop(
    store: Arc<dyn StateStore>,
    locks: Arc<LockRegistry>,
    memory_store: Option<Arc<InMemoryStateStore>>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        // get_all_locks sweeps expired store locks as a side effect
        if let Err(e) = store.get_all_locks().await {
            error!("lock sweep failed: {e}");
        }
        locks.sweep().await;
        if let Some(memory) = &memory_store {
            let cutoff = chrono::Utc::now() - chrono::Duration::hours(TASK_RETENTION_HOURS);
            memory.evict_terminal_before(cutoff).await;
        }
        debug!("retention sweep completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_and_shutdown_round_trip() {
        let container = Container::init(Config::default()).await.unwrap();
        assert!(container.ready().await);

        let metrics = container.metrics().await;
        assert_eq!(metrics.queued_tasks, 0);
        assert_eq!(metrics.active_locks, 0);

        container.shutdown().await;
    }

    #[tokio::test]
    async fn sqlite_backend_initializes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.use_mocks = false;
        config.storage.database_path = dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();

        let container = Container::init(config).await.unwrap();
        assert!(container.ready().await);
        container.shutdown().await;
    }
}
