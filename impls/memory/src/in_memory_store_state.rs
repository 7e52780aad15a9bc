// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use spike_api::ExecOutcome;
use spike_api::HolderId;
use spike_api::LeaseGrant;
use spike_api::QueuedOp;
use spike_api::Reply;
use spike_api::StoreError;
use spike_api::StoreResult;

/// Identifies one open connection to the store.
pub type SessionId = u64;

/// Counters describing what the store has been asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Every command, including lease commands.
    pub requests: u64,
    /// `try_acquire` calls, granted or not.
    pub acquire_requests: u64,
    /// `try_acquire` calls that granted the lease.
    pub lease_grants: u64,
    pub lease_renewals: u64,
    pub commits: u64,
    pub aborts: u64,
    /// DISCARDs that closed an open MULTI.
    pub discards: u64,
}

#[derive(Debug)]
struct Entry {
    value: String,
    revision: u64,
}

#[derive(Debug)]
struct Lease {
    holder: HolderId,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Session {
    // key -> revision observed at WATCH time (0 if absent)
    watched: HashMap<String, u64>,
    // Some while inside MULTI
    queued: Option<Vec<QueuedOp>>,
}

/// In-memory state of the remote store.
///
/// Every SET bumps a store-wide revision and stamps it on the key, so a WATCH
/// notices any intervening write, including one that stores the same value.
#[derive(Debug, Default)]
pub struct InMemoryStoreState {
    values: HashMap<String, Entry>,
    revision: u64,
    sessions: HashMap<SessionId, Session>,
    next_session: SessionId,
    leases: HashMap<String, Lease>,
    stats: StoreStats,
}

impl InMemoryStoreState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, key: &str) -> Option<String> {
        self.stats.requests += 1;
        self.read(key)
    }

    pub fn set(&mut self, key: &str, value: String) {
        self.stats.requests += 1;
        self.write(key, value);
    }

    fn read(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|entry| entry.value.clone())
    }

    fn write(&mut self, key: &str, value: String) {
        self.revision += 1;
        self.values.insert(
            key.to_string(),
            Entry {
                value,
                revision: self.revision,
            },
        );
    }

    fn revision_of(&self, key: &str) -> u64 {
        self.values.get(key).map_or(0, |entry| entry.revision)
    }

    pub fn open_session(&mut self) -> SessionId {
        self.next_session += 1;
        let id = self.next_session;
        self.sessions.insert(id, Session::default());
        id
    }

    /// Drops the session together with any watch set or pending transaction.
    pub fn close_session(&mut self, id: SessionId) {
        self.sessions.remove(&id);
    }

    fn session_mut(&mut self, id: SessionId) -> StoreResult<&mut Session> {
        self.stats.requests += 1;
        self.sessions
            .get_mut(&id)
            .ok_or(StoreError::ConnectionClosed)
    }

    pub fn watch(&mut self, id: SessionId, key: &str) -> StoreResult<()> {
        let revision = self.revision_of(key);
        let session = self.session_mut(id)?;
        if session.queued.is_some() {
            return Err(StoreError::Protocol(
                "WATCH inside MULTI is not allowed".to_string(),
            ));
        }
        session.watched.insert(key.to_string(), revision);
        Ok(())
    }

    pub fn unwatch(&mut self, id: SessionId) -> StoreResult<()> {
        self.session_mut(id)?.watched.clear();
        Ok(())
    }

    pub fn session_get(&mut self, id: SessionId, key: &str) -> StoreResult<Option<String>> {
        let session = self.session_mut(id)?;
        if session.queued.is_some() {
            return Err(StoreError::Protocol(
                "immediate GET inside MULTI, queue it instead".to_string(),
            ));
        }
        Ok(self.read(key))
    }

    pub fn multi(&mut self, id: SessionId) -> StoreResult<()> {
        let session = self.session_mut(id)?;
        if session.queued.is_some() {
            return Err(StoreError::Protocol(
                "MULTI calls can not be nested".to_string(),
            ));
        }
        session.queued = Some(Vec::new());
        Ok(())
    }

    pub fn queue(&mut self, id: SessionId, op: QueuedOp) -> StoreResult<()> {
        match self.session_mut(id)?.queued.as_mut() {
            Some(queued) => {
                queued.push(op);
                Ok(())
            }
            None => Err(StoreError::Protocol(
                "queued command without MULTI".to_string(),
            )),
        }
    }

    pub fn exec(&mut self, id: SessionId) -> StoreResult<ExecOutcome> {
        let session = self.session_mut(id)?;
        let queued = session
            .queued
            .take()
            .ok_or_else(|| StoreError::Protocol("EXEC without MULTI".to_string()))?;
        let watched = std::mem::take(&mut session.watched);

        let conflicted = watched
            .iter()
            .any(|(key, revision)| self.revision_of(key) != *revision);
        if conflicted {
            self.stats.aborts += 1;
            return Ok(ExecOutcome::Aborted);
        }

        let replies = queued
            .into_iter()
            .map(|op| match op {
                QueuedOp::Get { key } => self.read(&key).map_or(Reply::Nil, Reply::Value),
                QueuedOp::Set { key, value } => {
                    self.write(&key, value);
                    Reply::Ok
                }
            })
            .collect();
        self.stats.commits += 1;
        Ok(ExecOutcome::Committed(replies))
    }

    pub fn discard(&mut self, id: SessionId) -> StoreResult<()> {
        let session = self.session_mut(id)?;
        if session.queued.take().is_none() {
            return Err(StoreError::Protocol("DISCARD without MULTI".to_string()));
        }
        session.watched.clear();
        self.stats.discards += 1;
        Ok(())
    }

    pub fn try_acquire(
        &mut self,
        name: &str,
        holder: &HolderId,
        lease: Duration,
        now: Instant,
    ) -> LeaseGrant {
        self.stats.requests += 1;
        self.stats.acquire_requests += 1;
        if let Some(current) = self.leases.get(name) {
            if current.expires_at > now && current.holder != *holder {
                return LeaseGrant::Held {
                    holder: current.holder.clone(),
                    remaining: current.expires_at - now,
                };
            }
        }
        self.leases.insert(
            name.to_string(),
            Lease {
                holder: holder.clone(),
                expires_at: now + lease,
            },
        );
        self.stats.lease_grants += 1;
        LeaseGrant::Acquired
    }

    pub fn renew(&mut self, name: &str, holder: &HolderId, lease: Duration, now: Instant) -> bool {
        self.stats.requests += 1;
        match self.leases.get_mut(name) {
            Some(current) if current.holder == *holder && current.expires_at > now => {
                current.expires_at = now + lease;
                self.stats.lease_renewals += 1;
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, name: &str, holder: &HolderId, now: Instant) -> bool {
        self.stats.requests += 1;
        match self.leases.get(name) {
            Some(current) if current.holder == *holder && current.expires_at > now => {
                self.leases.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Current unexpired holder of `name`, if any.
    pub fn lease_holder(&self, name: &str, now: Instant) -> Option<HolderId> {
        self.leases
            .get(name)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.holder.clone())
    }

    /// Number of connections currently inside MULTI.
    pub fn open_transactions(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| session.queued.is_some())
            .count()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.clone()
    }
}
