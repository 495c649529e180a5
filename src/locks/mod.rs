//! Advisory file-access registry.
//!
//! Layers multi-reader / single-writer semantics over the state store's
//! exclusive lock primitive. Write and delete locks are persisted through
//! the store; read holders live only in this registry's tables, which is
//! sufficient because reads exist solely to make exclusive grants and batch
//! pre-checks see them. Contention is recorded as [`FileConflict`] entries
//! retained for a bounded diagnostics window.

use crate::{
    models::{
        fresh_id, AgentId, ConflictResolution, ConflictType, FileAccessGrant, FileConflict,
        LockOperation,
    },
    store::StateStore,
    CoordinationError, Result,
};
use crate::error::BatchConflict;
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A single file-access request, also the unit of a batch
#[derive(Debug, Clone)]
pub struct FileAccessRequest {
    pub path: String,
    pub operation: LockOperation,
    pub agent: AgentId,
}

#[derive(Debug, Clone)]
struct ReadHolder {
    agent: AgentId,
    expires_at: DateTime<Utc>,
}

pub struct LockRegistry {
    store: Arc<dyn StateStore>,
    lock_ttl: Duration,
    conflict_retention: chrono::Duration,
    readers: Mutex<HashMap<String, Vec<ReadHolder>>>,
    conflicts: Mutex<Vec<FileConflict>>,
}

impl LockRegistry {
    pub fn new(store: Arc<dyn StateStore>, lock_ttl: Duration, conflict_retention: Duration) -> Self {
        Self {
            store,
            lock_ttl,
            conflict_retention: chrono::Duration::from_std(conflict_retention)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            readers: Mutex::new(HashMap::new()),
            conflicts: Mutex::new(Vec::new()),
        }
    }

    /// Acquire access to a path for one agent.
    ///
    /// Reads succeed while no write/delete holder exists and are tracked
    /// registry-side without a token. Write and delete require the path to
    /// have no other holder of any kind and persist a store lock. Denials
    /// record a conflict entry for later diagnostics.
    pub async fn request_file_access(
        &self,
        path: &str,
        operation: LockOperation,
        agent: AgentId,
    ) -> Result<FileAccessGrant> {
        let now = Utc::now();
        match operation {
            LockOperation::Read => {
                if let Some(lock) = self.store.is_locked(path).await? {
                    self.record_conflict(path, &[agent, lock.owner], ConflictType::SimultaneousWrite)
                        .await;
                    return Err(CoordinationError::FileAlreadyLocked {
                        path: path.to_string(),
                        locked_by: lock.owner,
                        expires_at: lock.expires_at,
                    });
                }
                let expires_at = now + self.chrono_ttl();
                let mut readers = self.readers.lock().await;
                let holders = readers.entry(path.to_string()).or_default();
                holders.retain(|h| h.expires_at > now);
                holders.push(ReadHolder { agent, expires_at });
                debug!(path = %path, agent = %agent, "read access granted");
                Ok(FileAccessGrant {
                    path: path.to_string(),
                    operation,
                    agent,
                    lock_token: None,
                    expires_at,
                })
            }
            LockOperation::Write | LockOperation::Delete => {
                if let Some(reader) = self.other_reader(path, agent, now).await {
                    let conflict_type = conflict_type_for(operation);
                    self.record_conflict(path, &[agent, reader.agent], conflict_type)
                        .await;
                    return Err(CoordinationError::FileAlreadyLocked {
                        path: path.to_string(),
                        locked_by: reader.agent,
                        expires_at: reader.expires_at,
                    });
                }
                match self
                    .store
                    .acquire_lock(path, agent, operation, self.lock_ttl)
                    .await
                {
                    Ok(lock) => Ok(FileAccessGrant {
                        path: path.to_string(),
                        operation,
                        agent,
                        lock_token: Some(lock.lock_token),
                        expires_at: lock.expires_at,
                    }),
                    Err(err @ CoordinationError::FileAlreadyLocked { .. }) => {
                        if let CoordinationError::FileAlreadyLocked { locked_by, .. } = &err {
                            self.record_conflict(
                                path,
                                &[agent, *locked_by],
                                conflict_type_for(operation),
                            )
                            .await;
                        }
                        Err(err)
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }

    /// Atomic batch acquisition: either every request is granted or none
    /// are.
    ///
    /// A pre-check scans the whole batch against current holders (and
    /// against earlier requests in the same batch) so the caller learns
    /// every offending path in one round trip. If an interleaving
    /// acquisition still defeats a grant, everything granted so far is
    /// rolled back.
    pub async fn request_batch_file_access(
        &self,
        requests: &[FileAccessRequest],
    ) -> Result<Vec<FileAccessGrant>> {
        let conflicts = self.precheck_batch(requests).await?;
        if !conflicts.is_empty() {
            for c in &conflicts {
                let mut agents = vec![requester_of(requests, &c.path, c.operation)];
                if let Some(holder) = c.locked_by {
                    agents.push(holder);
                }
                self.record_conflict(&c.path, &agents, conflict_type_for(c.operation))
                    .await;
            }
            return Err(CoordinationError::PartialGrant { conflicts });
        }

        let mut granted: Vec<FileAccessGrant> = Vec::with_capacity(requests.len());
        for request in requests {
            match self
                .request_file_access(&request.path, request.operation, request.agent)
                .await
            {
                Ok(grant) => granted.push(grant),
                Err(err) => {
                    warn!(
                        path = %request.path,
                        error = %err,
                        "batch grant failed after pre-check; rolling back {} grant(s)",
                        granted.len()
                    );
                    for grant in &granted {
                        self.release_file_access(grant).await?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(granted)
    }

    /// Idempotent release: drops any read-tracking entry for the grant and,
    /// if the grant carries a token, releases the store lock. A failed
    /// store release is logged and swallowed; release always succeeds from
    /// the caller's point of view.
    pub async fn release_file_access(&self, grant: &FileAccessGrant) -> Result<()> {
        if grant.operation == LockOperation::Read {
            let mut readers = self.readers.lock().await;
            if let Some(holders) = readers.get_mut(&grant.path) {
                holders.retain(|h| h.agent != grant.agent);
                if holders.is_empty() {
                    readers.remove(&grant.path);
                }
            }
        }
        if let Some(token) = &grant.lock_token {
            if let Err(err) = self.store.release_lock(token).await {
                warn!(path = %grant.path, error = %err, "lock release failed; treating as released");
            }
        }
        Ok(())
    }

    /// Token-only release, for callers that hold a token but not the full
    /// grant. Same idempotent contract as [`release_file_access`].
    ///
    /// [`release_file_access`]: LockRegistry::release_file_access
    pub async fn release_token(&self, token: &str) -> Result<()> {
        if let Err(err) = self.store.release_lock(token).await {
            warn!(error = %err, "lock release failed; treating as released");
        }
        Ok(())
    }

    /// Drops every holder (reads and store locks) belonging to one agent.
    pub async fn release_all_for_agent(&self, agent: AgentId) -> Result<usize> {
        let mut removed = 0usize;
        {
            let mut readers = self.readers.lock().await;
            for holders in readers.values_mut() {
                let before = holders.len();
                holders.retain(|h| h.agent != agent);
                removed += before - holders.len();
            }
            readers.retain(|_, holders| !holders.is_empty());
        }
        let released = self.store.release_all_locks_for_agent(agent).await?;
        if removed + released > 0 {
            info!(agent = %agent, reads = removed, locks = released, "mass release for agent");
        }
        Ok(removed + released)
    }

    /// Recent conflicts for a path, inside the retention window. When none
    /// are retained but the path is currently locked, returns a synthetic
    /// `simultaneous-write` entry naming the holder, so callers can still
    /// observe contention.
    pub async fn detect_conflicts(&self, path: &str) -> Result<Vec<FileConflict>> {
        let cutoff = Utc::now() - self.conflict_retention;
        let retained: Vec<FileConflict> = {
            let conflicts = self.conflicts.lock().await;
            conflicts
                .iter()
                .filter(|c| c.path == path && c.detected_at >= cutoff)
                .cloned()
                .collect()
        };
        if !retained.is_empty() {
            return Ok(retained);
        }
        if let Some(lock) = self.store.is_locked(path).await? {
            return Ok(vec![FileConflict {
                id: fresh_id("conflict"),
                path: path.to_string(),
                agents: vec![lock.owner],
                conflict_type: ConflictType::SimultaneousWrite,
                detected_at: Utc::now(),
                resolution: None,
            }]);
        }
        Ok(Vec::new())
    }

    /// All unresolved conflicts inside the retention window.
    pub async fn unresolved_conflicts(&self) -> Vec<FileConflict> {
        let cutoff = Utc::now() - self.conflict_retention;
        let conflicts = self.conflicts.lock().await;
        conflicts
            .iter()
            .filter(|c| c.resolution.is_none() && c.detected_at >= cutoff)
            .cloned()
            .collect()
    }

    /// Records a resolution on a retained conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ConflictResolution,
    ) -> Result<FileConflict> {
        let mut conflicts = self.conflicts.lock().await;
        let conflict = conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| CoordinationError::ConflictNotFound(conflict_id.to_string()))?;
        conflict.resolution = Some(resolution);
        Ok(conflict.clone())
    }

    /// Periodic maintenance: trims conflicts past retention and expired
    /// read holders. Store-side lock expiry is swept lazily by the store
    /// itself.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let cutoff = now - self.conflict_retention;
        {
            let mut conflicts = self.conflicts.lock().await;
            let before = conflicts.len();
            conflicts.retain(|c| c.detected_at >= cutoff);
            let trimmed = before - conflicts.len();
            if trimmed > 0 {
                debug!("trimmed {} conflicts past retention", trimmed);
            }
        }
        {
            let mut readers = self.readers.lock().await;
            for holders in readers.values_mut() {
                holders.retain(|h| h.expires_at > now);
            }
            readers.retain(|_, holders| !holders.is_empty());
        }
    }

    fn chrono_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lock_ttl).unwrap_or_else(|_| chrono::Duration::minutes(5))
    }

    async fn other_reader(
        &self,
        path: &str,
        agent: AgentId,
        now: DateTime<Utc>,
    ) -> Option<ReadHolder> {
        let mut readers = self.readers.lock().await;
        if let Some(holders) = readers.get_mut(path) {
            holders.retain(|h| h.expires_at > now);
            return holders.iter().find(|h| h.agent != agent).cloned();
        }
        None
    }

    async fn record_conflict(&self, path: &str, agents: &[AgentId], conflict_type: ConflictType) {
        let mut seen = HashSet::new();
        let agents: Vec<AgentId> = agents
            .iter()
            .copied()
            .filter(|a| seen.insert(*a))
            .collect();
        let conflict = FileConflict {
            id: fresh_id("conflict"),
            path: path.to_string(),
            agents,
            conflict_type,
            detected_at: Utc::now(),
            resolution: None,
        };
        debug!(path = %path, conflict = %conflict.id, "conflict recorded");
        self.conflicts.lock().await.push(conflict);
    }

    /// Simulates the batch against current holders without acquiring
    /// anything; returns every request that would be denied.
    async fn precheck_batch(&self, requests: &[FileAccessRequest]) -> Result<Vec<BatchConflict>> {
        let now = Utc::now();

        #[derive(Default)]
        struct SimHolders {
            exclusive: Option<(AgentId, DateTime<Utc>)>,
            readers: Vec<(AgentId, DateTime<Utc>)>,
        }

        let mut sim: HashMap<String, SimHolders> = HashMap::new();
        for lock in self.store.get_all_locks().await? {
            sim.entry(lock.path.clone()).or_default().exclusive =
                Some((lock.owner, lock.expires_at));
        }
        {
            let readers = self.readers.lock().await;
            for (path, holders) in readers.iter() {
                let entry = sim.entry(path.clone()).or_default();
                for h in holders.iter().filter(|h| h.expires_at > now) {
                    entry.readers.push((h.agent, h.expires_at));
                }
            }
        }

        let mut conflicts = Vec::new();
        for request in requests {
            let entry = sim.entry(request.path.clone()).or_default();
            match request.operation {
                LockOperation::Read => {
                    if let Some((holder, expires_at)) = entry.exclusive {
                        conflicts.push(BatchConflict {
                            path: request.path.clone(),
                            operation: request.operation,
                            locked_by: Some(holder),
                            expires_at: Some(expires_at),
                        });
                    } else {
                        entry.readers.push((request.agent, now + self.chrono_ttl()));
                    }
                }
                LockOperation::Write | LockOperation::Delete => {
                    let blocker = entry.exclusive.or_else(|| {
                        entry
                            .readers
                            .iter()
                            .copied()
                            .find(|(agent, _)| *agent != request.agent)
                    });
                    if let Some((holder, expires_at)) = blocker {
                        conflicts.push(BatchConflict {
                            path: request.path.clone(),
                            operation: request.operation,
                            locked_by: Some(holder),
                            expires_at: Some(expires_at),
                        });
                    } else {
                        entry.exclusive = Some((request.agent, now + self.chrono_ttl()));
                    }
                }
            }
        }
        Ok(conflicts)
    }
}

fn conflict_type_for(operation: LockOperation) -> ConflictType {
    match operation {
        LockOperation::Delete => ConflictType::EditDeleted,
        _ => ConflictType::SimultaneousWrite,
    }
}

fn requester_of(requests: &[FileAccessRequest], path: &str, operation: LockOperation) -> AgentId {
    requests
        .iter()
        .find(|r| r.path == path && r.operation == operation)
        .map(|r| r.agent)
        .unwrap_or(AgentId::User)
}
