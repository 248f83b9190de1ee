//! An in-memory stand-in for PostgreSQL advisory locks.
//!
//! Locks belong to sessions, are re-entrant within a session, and vanish with
//! the session, which is what the lock manager relies on.

use crate::connection::{AdvisoryKey, ConnectionProducer, LockConnection, LockMode};
use crate::error::ConnectionError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct State {
    next_session: u64,
    live: BTreeSet<u64>,
    exclusive: HashMap<AdvisoryKey, (u64, u32)>,
    shared: HashMap<AdvisoryKey, HashMap<u64, u32>>,
}

impl State {
    fn end_session(&mut self, session: u64) {
        self.live.remove(&session);
        self.exclusive.retain(|_, (holder, _)| *holder != session);
        for holders in self.shared.values_mut() {
            holders.remove(&session);
        }
        self.shared.retain(|_, holders| !holders.is_empty());
    }

    fn sessions_holding(&self, key: AdvisoryKey) -> BTreeSet<u64> {
        let mut sessions: BTreeSet<u64> = self.shared.get(&key).map(|h| h.keys().copied().collect()).unwrap_or_default();
        if let Some((holder, _)) = self.exclusive.get(&key) {
            sessions.insert(*holder);
        }
        sessions
    }

    fn try_lock(&mut self, session: u64, key: AdvisoryKey, mode: LockMode) -> bool {
        let exclusive_elsewhere = self.exclusive.get(&key).is_some_and(|(holder, _)| *holder != session);
        if exclusive_elsewhere {
            return false;
        }
        match mode {
            LockMode::Exclusive => {
                let shared_elsewhere = self
                    .shared
                    .get(&key)
                    .is_some_and(|holders| holders.keys().any(|holder| *holder != session));
                if shared_elsewhere {
                    return false;
                }
                self.exclusive.entry(key).or_insert((session, 0)).1 += 1;
            }
            LockMode::Shared => {
                *self.shared.entry(key).or_default().entry(session).or_insert(0) += 1;
            }
        }
        true
    }

    fn unlock(&mut self, session: u64, key: AdvisoryKey, mode: LockMode) -> bool {
        match mode {
            LockMode::Exclusive => match self.exclusive.get_mut(&key) {
                Some((holder, count)) if *holder == session => {
                    *count -= 1;
                    if *count == 0 {
                        self.exclusive.remove(&key);
                    }
                    true
                }
                _ => false,
            },
            LockMode::Shared => {
                let Some(holders) = self.shared.get_mut(&key) else {
                    return false;
                };
                let Some(count) = holders.get_mut(&session) else {
                    return false;
                };
                *count -= 1;
                if *count == 0 {
                    holders.remove(&session);
                }
                if holders.is_empty() {
                    self.shared.remove(&key);
                }
                true
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer(&self) -> Arc<dyn ConnectionProducer> {
        Arc::new(FakeProducer { server: self.clone() })
    }

    /// Opens a session outside any manager.
    pub fn session(&self) -> FakeConnection {
        let mut state = self.state.lock();
        state.next_session += 1;
        let id = state.next_session;
        state.live.insert(id);
        FakeConnection {
            server: self.clone(),
            session: id,
        }
    }

    pub fn is_locked(&self, key: AdvisoryKey) -> bool {
        !self.state.lock().sessions_holding(key).is_empty()
    }

    /// Number of sessions holding the lock in any mode.
    pub fn holders(&self, key: AdvisoryKey) -> usize {
        self.state.lock().sessions_holding(key).len()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Terminates every session holding the lock, as `pg_terminate_backend` would.
    pub fn kill_session_holding(&self, key: AdvisoryKey) {
        let mut state = self.state.lock();
        for session in state.sessions_holding(key) {
            state.end_session(session);
        }
    }

    pub fn kill_all_sessions(&self) {
        let mut state = self.state.lock();
        let sessions: Vec<u64> = state.live.iter().copied().collect();
        for session in sessions {
            state.end_session(session);
        }
    }

    pub fn kill_all_sessions_but_newest(&self) {
        let mut state = self.state.lock();
        let newest = state.live.last().copied();
        let sessions: Vec<u64> = state.live.iter().copied().filter(|s| Some(*s) != newest).collect();
        for session in sessions {
            state.end_session(session);
        }
    }
}

struct FakeProducer {
    server: FakeServer,
}

#[async_trait]
impl ConnectionProducer for FakeProducer {
    async fn produce(&self) -> Result<Box<dyn LockConnection>, ConnectionError> {
        Ok(Box::new(self.server.session()))
    }
}

pub struct FakeConnection {
    server: FakeServer,
    session: u64,
}

impl FakeConnection {
    fn alive(&self) -> Result<(), ConnectionError> {
        if self.server.state.lock().live.contains(&self.session) {
            Ok(())
        } else {
            Err(ConnectionError::Closed)
        }
    }

    /// Takes an exclusive lock directly, panicking if it is unavailable.
    pub fn take(&self, key: AdvisoryKey) {
        let acquired = self.server.state.lock().try_lock(self.session, key, LockMode::Exclusive);
        assert!(acquired, "{key:?} is already held");
    }

    pub fn kill(&self) {
        self.server.state.lock().end_session(self.session);
    }
}

#[async_trait]
impl LockConnection for FakeConnection {
    async fn try_advisory_lock(&mut self, key: AdvisoryKey, mode: LockMode) -> Result<bool, ConnectionError> {
        self.alive()?;
        Ok(self.server.state.lock().try_lock(self.session, key, mode))
    }

    async fn advisory_unlock(&mut self, key: AdvisoryKey, mode: LockMode) -> Result<bool, ConnectionError> {
        self.alive()?;
        Ok(self.server.state.lock().unlock(self.session, key, mode))
    }

    async fn is_valid(&mut self, _timeout: Duration) -> Result<bool, ConnectionError> {
        self.alive()?;
        Ok(true)
    }

    fn is_closed(&self) -> bool {
        self.alive().is_err()
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.kill();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locks_are_reentrant_and_die_with_the_session() {
        let server = FakeServer::new();
        let mut a = server.session();
        let mut b = server.session();
        let key = AdvisoryKey::Single(1);

        assert!(a.try_advisory_lock(key, LockMode::Exclusive).await.unwrap());
        assert!(a.try_advisory_lock(key, LockMode::Exclusive).await.unwrap());
        assert!(!b.try_advisory_lock(key, LockMode::Exclusive).await.unwrap());
        assert!(a.advisory_unlock(key, LockMode::Exclusive).await.unwrap());
        assert!(server.is_locked(key));

        a.kill();
        assert!(!server.is_locked(key));
        assert!(a.is_closed());
        assert!(b.try_advisory_lock(key, LockMode::Exclusive).await.unwrap());
        assert!(!b.advisory_unlock(AdvisoryKey::Single(2), LockMode::Exclusive).await.unwrap());
    }

    #[tokio::test]
    async fn shared_holders_block_exclusive() {
        let server = FakeServer::new();
        let mut a = server.session();
        let mut b = server.session();
        let key = AdvisoryKey::Pair(1, 1);

        assert!(a.try_advisory_lock(key, LockMode::Shared).await.unwrap());
        assert!(b.try_advisory_lock(key, LockMode::Shared).await.unwrap());
        assert!(!b.try_advisory_lock(key, LockMode::Exclusive).await.unwrap());
        assert_eq!(server.holders(key), 2);
    }
}
