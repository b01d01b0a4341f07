//! Host-side view of the controller's relays.
//!
//! The controller never reports relay state back, so this board is the
//! source of truth for "is it on". Each entry keeps the on/off flag and the
//! activation instant together, and the whole board sits behind one lock so
//! readers never see `on == true` without its start time.

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::device::DeviceId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayEntry {
    pub on: bool,
    /// Set iff `on`.
    pub active_since: Option<OffsetDateTime>,
}

impl RelayEntry {
    fn set(&mut self, on: bool, when: OffsetDateTime) {
        self.on = on;
        self.active_since = on.then_some(when);
    }
}

/// Consistent copy of every relay taken under a single lock acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub motor: RelayEntry,
    pub light: RelayEntry,
}

impl RelaySnapshot {
    pub fn entry(&self, device: DeviceId) -> &RelayEntry {
        match device {
            DeviceId::Motor => &self.motor,
            DeviceId::Light => &self.light,
        }
    }

    fn entry_mut(&mut self, device: DeviceId) -> &mut RelayEntry {
        match device {
            DeviceId::Motor => &mut self.motor,
            DeviceId::Light => &mut self.light,
        }
    }

    pub fn flags(&self) -> RelayFlags {
        RelayFlags {
            motor: self.motor.on,
            light: self.light.on,
        }
    }
}

/// On/off per relay, as returned to API callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayFlags {
    pub motor: bool,
    pub light: bool,
}

/// Starts with every relay off; state is not carried across restarts.
#[derive(Debug, Default)]
pub struct RelayTracker {
    board: RwLock<RelaySnapshot>,
}

impl RelayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a confirmed relay change. Turning on stamps `when` as the
    /// activation start, replacing any earlier one; turning off clears it.
    pub async fn set(&self, device: DeviceId, on: bool, when: OffsetDateTime) {
        let mut board = self.board.write().await;
        board.entry_mut(device).set(on, when);
    }

    pub async fn get(&self, device: DeviceId) -> bool {
        self.board.read().await.entry(device).on
    }

    pub async fn snapshot(&self) -> RelaySnapshot {
        *self.board.read().await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
