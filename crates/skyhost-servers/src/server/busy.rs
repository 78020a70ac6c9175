//! Per-server activity slot
//!
//! Install, backup, restore, destroy and the start sequence are mutually
//! exclusive. Each claims the slot with a single compare-and-swap and
//! holds the returned guard until it is done; dropping the guard frees it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use skyhost_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Activity {
    Starting = 1,
    Installing = 2,
    Archiving = 3,
    Destroying = 4,
}

impl Activity {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Activity::Starting),
            2 => Some(Activity::Installing),
            3 => Some(Activity::Archiving),
            4 => Some(Activity::Destroying),
            _ => None,
        }
    }

    /// Error reported to whoever finds the slot taken by this activity
    pub fn conflict(self) -> Error {
        match self {
            Activity::Archiving => Error::BackupInProgress,
            _ => Error::ServerRunning,
        }
    }
}

#[derive(Debug, Default)]
pub struct BusySlot {
    state: AtomicU8,
}

impl BusySlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> Option<Activity> {
        Activity::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn claim(self: &Arc<Self>, activity: Activity) -> Result<BusyGuard> {
        match self
            .state
            .compare_exchange(0, activity as u8, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(BusyGuard { slot: self.clone() }),
            Err(held) => Err(Activity::from_u8(held).map_or(Error::ServerRunning, Activity::conflict)),
        }
    }
}

/// Holds the slot until dropped
#[derive(Debug)]
pub struct BusyGuard {
    slot: Arc<BusySlot>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.slot.state.store(0, Ordering::SeqCst);
    }
}
