use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::publish::session::{CasOutcome, PublishSession, SessionStore, SessionStoreError};

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-memory backend for tests and local development. Expiry is checked on
/// read, which is enough for the TTL semantics the sessions need.
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Entry<PublishSession>>>,
    tokens: Mutex<HashMap<String, Entry<String>>>,
    runs: Mutex<HashMap<String, Entry<String>>>,
    session_ttl: Duration,
    reads: AtomicU64,
}

impl MemorySessionStore {
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            session_ttl,
            reads: AtomicU64::new(0),
        }
    }

    /// Number of reads served (sessions and run index). Lets tests assert
    /// that unauthenticated requests never reached the store.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of combined tokens currently held, for handoff assertions.
    pub fn stashed_tokens(&self) -> usize {
        self.tokens.lock().len()
    }

    fn entry<T>(&self, value: T) -> Entry<T> {
        Entry {
            value,
            expires_at: Instant::now() + self.session_ttl,
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &PublishSession) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.lock();
        sessions.insert(session.id.clone(), self.entry(session.clone()));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PublishSession>, SessionStoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let sessions = self.sessions.lock();
        Ok(sessions
            .get(id)
            .filter(|entry| entry.live())
            .map(|entry| entry.value.clone()))
    }

    async fn compare_and_swap(
        &self,
        session: &PublishSession,
    ) -> Result<CasOutcome, SessionStoreError> {
        let mut sessions = self.sessions.lock();
        match sessions.get(&session.id).filter(|entry| entry.live()) {
            None => Ok(CasOutcome::Missing),
            Some(entry) if entry.value.revision != session.revision.wrapping_sub(1) => {
                Ok(CasOutcome::Conflict)
            }
            Some(_) => {
                sessions.insert(session.id.clone(), self.entry(session.clone()));
                Ok(CasOutcome::Written)
            }
        }
    }

    async fn put_token(&self, session_id: &str, token: &str) -> Result<(), SessionStoreError> {
        let mut tokens = self.tokens.lock();
        tokens.insert(session_id.to_string(), self.entry(token.to_string()));
        Ok(())
    }

    async fn take_token(&self, session_id: &str) -> Result<Option<String>, SessionStoreError> {
        let mut tokens = self.tokens.lock();
        Ok(tokens
            .remove(session_id)
            .filter(|entry| entry.live())
            .map(|entry| entry.value))
    }

    async fn index_run(&self, run_id: &str, session_id: &str) -> Result<(), SessionStoreError> {
        let mut runs = self.runs.lock();
        runs.insert(run_id.to_string(), self.entry(session_id.to_string()));
        Ok(())
    }

    async fn session_for_run(&self, run_id: &str) -> Result<Option<String>, SessionStoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let runs = self.runs.lock();
        Ok(runs
            .get(run_id)
            .filter(|entry| entry.live())
            .map(|entry| entry.value.clone()))
    }

    async fn ping(&self) -> Result<(), SessionStoreError> {
        Ok(())
    }
}
