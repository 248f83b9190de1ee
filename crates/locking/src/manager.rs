use crate::cell::{CellGuard, ConnectionCell};
use crate::connection::{AdvisoryKey, ConnectionProducer, LockConnection, LockMode};
use crate::error::{ConnectionError, LockError};
use configuration::LockingSettings;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Lock name that every evaluation or ingest takes shared, and that
/// destructive maintenance (schema changes, cleaning) takes exclusively.
pub const SHARED_READ_OR_EXCLUSIVE_DESTROY_NAME: i32 = 1;

/// First key of the two-key advisory locks used by the shared and exclusive families.
const SHARED_OR_EXCLUSIVE_PREFIX: i32 = 1;

/// First key of the "ingest in progress" source locks.
const SOURCE_PREFIX: i32 = 2;

/// Folds a wide identifier, such as a source id, into the lock name space.
pub fn lock_name_from_id(id: i64) -> i32 {
    (id as i32) & i32::MAX
}

/// The kinds of named lock a manager hands out. Each family has its own set
/// of held names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockFamily {
    /// `lock` / `unlock`, the single-key advisory lock on the name itself.
    Plain,
    Shared,
    Exclusive,
    /// Marks a source as being ingested.
    Source,
}

impl LockFamily {
    fn key(self, signed_name: i32) -> AdvisoryKey {
        match self {
            LockFamily::Plain => AdvisoryKey::Single(i64::from(signed_name)),
            LockFamily::Shared | LockFamily::Exclusive => {
                AdvisoryKey::Pair(SHARED_OR_EXCLUSIVE_PREFIX, signed_name)
            }
            LockFamily::Source => AdvisoryKey::Pair(SOURCE_PREFIX, signed_name),
        }
    }

    fn mode(self) -> LockMode {
        match self {
            LockFamily::Shared => LockMode::Shared,
            _ => LockMode::Exclusive,
        }
    }

    /// Source locks survive losing one of the two connections; the refresh
    /// task restores the missing half.
    fn tolerates_lost_connection(self) -> bool {
        self == LockFamily::Source
    }
}

impl fmt::Display for LockFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockFamily::Plain => "plain",
            LockFamily::Shared => "shared",
            LockFamily::Exclusive => "exclusive",
            LockFamily::Source => "source",
        })
    }
}

fn validate(name: i32) -> Result<i32, LockError> {
    if name < 1 || name == i32::MAX {
        return Err(LockError::InvalidName(name));
    }
    Ok(name)
}

/// What happened on one connection during a foreground call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    /// The connection was lost and the loss was tolerated.
    Lost,
}

struct Inner {
    producer: Arc<dyn ConnectionProducer>,
    one: ConnectionCell,
    two: ConnectionCell,
    held: parking_lot::Mutex<BTreeSet<(LockFamily, i32)>>,
    settings: LockingSettings,
}

/// Application-level named locks backed by PostgreSQL advisory locks.
///
/// Each held name is mirrored on two dedicated sessions: the name itself on
/// connection one and its negation on connection two. A background task checks
/// both sessions every refresh period and replaces a dead one, re-acquiring
/// its locks before anyone else can use it. Locks are not re-entrant: taking a
/// name this manager already holds is an error.
pub struct DatabaseLockManager {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
}

impl DatabaseLockManager {
    /// Opens both lock connections and starts the refresh task. Must be called
    /// from within a tokio runtime.
    pub async fn new(
        producer: Arc<dyn ConnectionProducer>,
        settings: LockingSettings,
    ) -> Result<Self, LockError> {
        tracing::debug!("Began construction of lock manager.");
        let one = producer.produce().await.map_err(LockError::Unavailable)?;
        let two = producer.produce().await.map_err(LockError::Unavailable)?;

        let inner = Arc::new(Inner {
            producer,
            one: ConnectionCell::new("one", one),
            two: ConnectionCell::new("two", two),
            held: parking_lot::Mutex::new(BTreeSet::new()),
            settings,
        });

        let (shutdown, signal) = watch::channel(false);
        tokio::spawn(run_refresh(Arc::clone(&inner), signal));

        tracing::debug!("Finished construction of lock manager.");
        Ok(Self { inner, shutdown })
    }

    pub async fn lock(&self, name: i32) -> Result<(), LockError> {
        self.inner.acquire(LockFamily::Plain, name).await
    }

    pub async fn unlock(&self, name: i32) -> Result<(), LockError> {
        self.inner.release(LockFamily::Plain, name).await
    }

    /// Takes a shared lock, compatible with other shared holders of the same name.
    pub async fn lock_shared(&self, name: i32) -> Result<(), LockError> {
        self.inner.acquire(LockFamily::Shared, name).await
    }

    pub async fn unlock_shared(&self, name: i32) -> Result<(), LockError> {
        self.inner.release(LockFamily::Shared, name).await
    }

    /// Takes the exclusive counterpart of a shared lock. Refused while this
    /// manager holds the shared lock of the same name.
    pub async fn lock_exclusive(&self, name: i32) -> Result<(), LockError> {
        self.inner.acquire(LockFamily::Exclusive, name).await
    }

    pub async fn unlock_exclusive(&self, name: i32) -> Result<(), LockError> {
        self.inner.release(LockFamily::Exclusive, name).await
    }

    pub async fn lock_source(&self, name: i32) -> Result<(), LockError> {
        self.inner.acquire(LockFamily::Source, name).await
    }

    pub async fn unlock_source(&self, name: i32) -> Result<(), LockError> {
        self.inner.release(LockFamily::Source, name).await
    }

    /// True when some session, this manager's or another's, holds the source
    /// lock. Probes each connection by taking and releasing the lock.
    pub async fn is_source_locked(&self, name: i32) -> Result<bool, LockError> {
        let name = validate(name)?;
        let one_locked = self.inner.probe(&self.inner.one, name).await?;
        let two_locked = self.inner.probe(&self.inner.two, -name).await?;
        Ok(one_locked || two_locked)
    }

    pub fn is_held(&self, family: LockFamily, name: i32) -> bool {
        self.inner.held.lock().contains(&(family, name))
    }

    /// Every lock this manager holds, ordered by family then name.
    pub fn held_locks(&self) -> Vec<(LockFamily, i32)> {
        self.inner.held.lock().iter().copied().collect()
    }

    /// How many times connection one and connection two have been replaced.
    pub fn generations(&self) -> (u64, u64) {
        (self.inner.one.generation(), self.inner.two.generation())
    }

    /// Runs one refresh cycle now, as the background task does every period.
    pub async fn refresh_connections(&self) -> Result<(), LockError> {
        self.inner.refresh().await
    }

    /// Stops the refresh task. The lock connections stay open; see [`close`](Self::close).
    pub fn shutdown(&self) {
        tracing::debug!("Shutting down the lock manager refresh task.");
        self.shutdown.send_replace(true);
    }

    /// Stops the refresh task, releases every lock still held and closes both
    /// connections. Failures are logged rather than returned.
    pub async fn close(&self) {
        self.shutdown();

        for (family, name) in self.held_locks() {
            if let Err(e) = self.inner.release(family, name).await {
                tracing::warn!("Unable to unlock remaining database lock {family} {name}: {e}");
            }
        }

        let leftovers = self.held_locks();
        if !leftovers.is_empty() {
            tracing::warn!("Locks were not cleaned up before closing: {leftovers:?}");
        }

        for cell in [&self.inner.one, &self.inner.two] {
            let mut guard = cell.lock().await;
            if let Err(e) = guard.connection().close().await {
                tracing::warn!("Failed to close lock connection {}: {e}", cell.label());
            }
        }
        tracing::debug!("Closed the lock manager.");
    }
}

impl Drop for DatabaseLockManager {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl fmt::Debug for DatabaseLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseLockManager")
            .field("held", &self.held_locks())
            .field("generations", &self.generations())
            .finish()
    }
}

async fn run_refresh(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let period = inner.settings.refresh_period();
    let mut timer = time::interval_at(Instant::now() + period, period);
    // A slow cycle pushes the next one back rather than bunching them up.
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(e) = inner.refresh().await {
                    tracing::warn!("Had trouble managing lock connections: {e}");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Lock connection refresh task stopped.");
}

impl Inner {
    async fn acquire(&self, family: LockFamily, name: i32) -> Result<(), LockError> {
        tracing::trace!("Began lock {family} {name}");
        let name = validate(name)?;

        if family == LockFamily::Exclusive
            && self.held.lock().contains(&(LockFamily::Shared, name))
        {
            return Err(LockError::SharedLockExists(name));
        }
        if !self.held.lock().insert((family, name)) {
            return Err(LockError::AlreadyHeld { family, name });
        }

        if let Err(e) = self.acquire_both(family, name).await {
            self.held.lock().remove(&(family, name));
            return Err(e);
        }
        tracing::trace!("Ended lock {family} {name}");
        Ok(())
    }

    async fn acquire_both(&self, family: LockFamily, name: i32) -> Result<(), LockError> {
        let first = self.acquire_on(&self.one, family, name, false).await?;
        let second = self
            .acquire_on(&self.two, family, -name, first == Outcome::Lost)
            .await;

        if let Err(e) = second {
            // Leave no orphaned physical lock behind on connection one.
            let mut guard = self.one.lock().await;
            guard.mark_released(family, name);
            if first == Outcome::Done {
                match guard.connection().advisory_unlock(family.key(name), family.mode()).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!("Connection one did not hold {family} {name} while rolling back."),
                    Err(rollback) => tracing::warn!("Could not roll back {family} {name} on connection one: {rollback}"),
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn acquire_on(
        &self,
        cell: &ConnectionCell,
        family: LockFamily,
        signed_name: i32,
        other_lost: bool,
    ) -> Result<Outcome, LockError> {
        let mut guard = cell.lock().await;
        let result = guard
            .connection()
            .try_advisory_lock(family.key(signed_name), family.mode())
            .await;
        match result {
            Ok(true) => {
                guard.mark_held(family, signed_name);
                Ok(Outcome::Done)
            }
            Ok(false) => Err(LockError::Failed {
                family,
                name: signed_name.abs(),
                connection: guard.label(),
                action: "acquire",
            }),
            Err(e) => {
                if tolerate(family, &e, other_lost) {
                    tracing::warn!("Lost connection {}, should recover soon: {e}", guard.label());
                    guard.mark_held(family, signed_name);
                    return Ok(Outcome::Lost);
                }
                Err(connection_error(&guard, signed_name, e))
            }
        }
    }

    async fn release(&self, family: LockFamily, name: i32) -> Result<(), LockError> {
        tracing::trace!("Began unlock {family} {name}");
        let name = validate(name)?;

        if !self.held.lock().contains(&(family, name)) {
            return Err(LockError::NotHeld { family, name });
        }

        let first = self.release_on(&self.one, family, name, false).await?;
        if let Err(e) = self
            .release_on(&self.two, family, -name, first == Outcome::Lost)
            .await
        {
            self.undo_first_release(family, name, first).await;
            return Err(e);
        }

        if !self.held.lock().remove(&(family, name)) {
            return Err(LockError::ConcurrentUnlock { family, name });
        }
        tracing::trace!("Ended unlock {family} {name}");
        Ok(())
    }

    async fn release_on(
        &self,
        cell: &ConnectionCell,
        family: LockFamily,
        signed_name: i32,
        other_lost: bool,
    ) -> Result<Outcome, LockError> {
        let mut guard = cell.lock().await;
        let result = guard
            .connection()
            .advisory_unlock(family.key(signed_name), family.mode())
            .await;
        match result {
            Ok(true) => {
                guard.mark_released(family, signed_name);
                Ok(Outcome::Done)
            }
            Ok(false) => Err(LockError::Failed {
                family,
                name: signed_name.abs(),
                connection: guard.label(),
                action: "release",
            }),
            Err(e) => {
                if tolerate(family, &e, other_lost) {
                    // The lost session took the lock with it.
                    tracing::warn!("Lost connection {}, should recover soon: {e}", guard.label());
                    guard.mark_released(family, signed_name);
                    return Ok(Outcome::Lost);
                }
                Err(connection_error(&guard, signed_name, e))
            }
        }
    }

    /// Puts the lock back on connection one after its release on connection
    /// two failed, so the caller can retry the unlock once refresh has repaired
    /// connection two. When connection one cannot take it back either, the
    /// lock is forgotten on both connections.
    async fn undo_first_release(&self, family: LockFamily, name: i32, first: Outcome) {
        let mut guard = self.one.lock().await;
        let restored = match first {
            // Refresh re-acquires it with the rest of connection one's locks.
            Outcome::Lost => true,
            Outcome::Done => {
                match guard.connection().try_advisory_lock(family.key(name), family.mode()).await {
                    Ok(acquired) => acquired,
                    Err(e) => {
                        tracing::warn!("Could not re-take {family} {name} on connection one: {e}");
                        false
                    }
                }
            }
        };
        if restored {
            guard.mark_held(family, name);
            return;
        }
        drop(guard);

        tracing::warn!("Gave up {family} lock {name} after a partial release.");
        self.two.lock().await.mark_released(family, -name);
        self.held.lock().remove(&(family, name));
    }

    /// True when the source lock could not be taken on this connection.
    async fn probe(&self, cell: &ConnectionCell, signed_name: i32) -> Result<bool, LockError> {
        let family = LockFamily::Source;
        let key = family.key(signed_name);
        let mut guard = cell.lock().await;

        let acquired = match guard.connection().try_advisory_lock(key, family.mode()).await {
            Ok(acquired) => acquired,
            Err(e) => return Err(connection_error(&guard, signed_name, e)),
        };
        if acquired {
            match guard.connection().advisory_unlock(key, family.mode()).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(LockError::Failed {
                        family,
                        name: signed_name.abs(),
                        connection: guard.label(),
                        action: "release",
                    });
                }
                Err(e) => return Err(connection_error(&guard, signed_name, e)),
            }
        }
        Ok(!acquired)
    }

    /// Checks both connections, replacing any that died. A connection busy
    /// with a foreground call is skipped this cycle.
    async fn refresh(&self) -> Result<(), LockError> {
        tracing::trace!("Began refreshing lock connections.");
        let mut dead = Vec::with_capacity(2);
        for cell in [&self.one, &self.two] {
            let Some(mut guard) = cell.try_lock() else {
                tracing::debug!("Yielded to another task for connection {}.", cell.label());
                continue;
            };
            if !self.is_alive(&mut guard).await {
                dead.push(guard);
            }
        }

        if dead.len() == 2 {
            tracing::warn!("Lost two lock-holding database connections at once.");
        }

        // Each connection is repaired on its own; the first failure is reported
        // once both have been tried.
        let mut first_error = None;
        for mut guard in dead {
            if let Err(e) = self.restore(&mut guard).await {
                tracing::warn!("Could not restore lock connection {}: {e}", guard.label());
                first_error.get_or_insert(e);
            }
        }
        tracing::trace!("Ended refreshing lock connections.");
        first_error.map_or(Ok(()), Err)
    }

    async fn is_alive(&self, guard: &mut CellGuard<'_>) -> bool {
        let label = guard.label();
        let connection = guard.connection();

        let valid = match connection.is_valid(self.settings.validity_timeout()).await {
            Ok(valid) => valid,
            Err(e) => {
                tracing::warn!("Connection {label} validity check did not work: {e}");
                return false;
            }
        };
        let open = !connection.is_closed();

        if !valid && open {
            if let Err(e) = connection.mark_server_log().await {
                tracing::warn!("Connection {label} could not mark the server log: {e}");
            }
        }
        valid && open
    }

    /// Opens a replacement connection, takes every lock the old one carried,
    /// then swaps it in. On failure the dead connection stays so the next
    /// cycle tries again.
    async fn restore(&self, guard: &mut CellGuard<'_>) -> Result<(), LockError> {
        let label = guard.label();
        tracing::warn!("About to restore lock connection {label}.");

        let mut fresh = self.producer.produce().await.map_err(LockError::Unavailable)?;
        for (family, signed_name) in guard.held() {
            if let Err(e) = self.reacquire(fresh.as_mut(), label, family, signed_name).await {
                if let Err(close) = fresh.close().await {
                    tracing::debug!("Could not close the abandoned replacement connection: {close}");
                }
                return Err(e);
            }
        }

        // The dead session's locks went with it.
        drop(guard.replace(fresh));
        tracing::info!("Restored lock connection {label}.");
        Ok(())
    }

    async fn reacquire(
        &self,
        connection: &mut dyn LockConnection,
        label: &'static str,
        family: LockFamily,
        signed_name: i32,
    ) -> Result<(), LockError> {
        let retries = self.settings.reacquire_retries;
        let delay = self.settings.reacquire_delay();
        let key = family.key(signed_name);

        for attempt in 0..=retries {
            let acquired = connection
                .try_advisory_lock(key, family.mode())
                .await
                .map_err(|source| LockError::Connection {
                    name: signed_name.abs(),
                    connection: label,
                    source,
                })?;
            if acquired {
                return Ok(());
            }
            if attempt < retries {
                tracing::warn!(
                    "Re-attempting to acquire {family} lock {signed_name} on connection {label} in {delay:?}."
                );
                time::sleep(delay).await;
            }
        }
        Err(LockError::Failed {
            family,
            name: signed_name.abs(),
            connection: label,
            action: "re-acquire",
        })
    }
}

fn tolerate(family: LockFamily, error: &ConnectionError, other_lost: bool) -> bool {
    family.tolerates_lost_connection() && !other_lost && error.is_recoverable()
}

fn connection_error(guard: &CellGuard<'_>, signed_name: i32, source: ConnectionError) -> LockError {
    if let Some(state) = source.sql_state() {
        tracing::warn!("Unrecoverable SQLSTATE {state} on connection {}", guard.label());
    }
    LockError::Connection {
        name: signed_name.abs(),
        connection: guard.label(),
        source,
    }
}
