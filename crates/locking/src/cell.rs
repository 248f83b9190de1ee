use crate::connection::LockConnection;
use crate::manager::LockFamily;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard};

struct Slot {
    connection: Box<dyn LockConnection>,
    /// Locks this connection is meant to carry, by family and signed name.
    held: BTreeSet<(LockFamily, i32)>,
}

/// One of the manager's two lock connections behind its own mutex.
///
/// The connection is only reachable through a [`CellGuard`], and replacing it
/// needs the guard too, so whoever swaps in a new connection restores its
/// locks before anyone else sees it. The cell also records which locks its
/// connection should hold, updated under the same mutex, which is what a
/// replacement must re-acquire.
pub struct ConnectionCell {
    label: &'static str,
    slot: Mutex<Slot>,
    generation: AtomicU64,
}

impl ConnectionCell {
    pub fn new(label: &'static str, connection: Box<dyn LockConnection>) -> Self {
        Self {
            label,
            slot: Mutex::new(Slot {
                connection,
                held: BTreeSet::new(),
            }),
            generation: AtomicU64::new(0),
        }
    }

    /// Name used in logs and errors, `"one"` or `"two"`.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Number of times the connection has been replaced.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Waits for exclusive use of the connection.
    pub async fn lock(&self) -> CellGuard<'_> {
        CellGuard {
            cell: self,
            slot: self.slot.lock().await,
        }
    }

    /// Takes the connection only if nobody is using it.
    pub fn try_lock(&self) -> Option<CellGuard<'_>> {
        self.slot.try_lock().ok().map(|slot| CellGuard { cell: self, slot })
    }
}

pub struct CellGuard<'a> {
    cell: &'a ConnectionCell,
    slot: MutexGuard<'a, Slot>,
}

impl CellGuard<'_> {
    pub fn label(&self) -> &'static str {
        self.cell.label
    }

    pub fn connection(&mut self) -> &mut dyn LockConnection {
        &mut *self.slot.connection
    }

    pub(crate) fn mark_held(&mut self, family: LockFamily, signed_name: i32) {
        self.slot.held.insert((family, signed_name));
    }

    pub(crate) fn mark_released(&mut self, family: LockFamily, signed_name: i32) {
        self.slot.held.remove(&(family, signed_name));
    }

    pub(crate) fn held(&self) -> Vec<(LockFamily, i32)> {
        self.slot.held.iter().copied().collect()
    }

    /// Swaps in a new connection and hands back the old one. The record of
    /// held locks is kept; the caller re-acquires them on the new connection.
    pub fn replace(&mut self, connection: Box<dyn LockConnection>) -> Box<dyn LockConnection> {
        let old = std::mem::replace(&mut self.slot.connection, connection);
        self.cell.generation.fetch_add(1, Ordering::AcqRel);
        old
    }
}
