//! Windowed usage totals.
//!
//! Completed runs live in the usage store; a relay that is on right now has
//! no record yet, so its elapsed time is added on top. A relay that has been
//! switched off contributes only through the record the controller sends,
//! which keeps the two sources from overlapping.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::db::{window_start, UsageStore};
use crate::device::DeviceId;
use crate::relay::{RelayEntry, RelayTracker};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub motor: u64,
    pub light: u64,
}

impl UsageTotals {
    pub fn get(&self, device: DeviceId) -> u64 {
        match device {
            DeviceId::Motor => self.motor,
            DeviceId::Light => self.light,
        }
    }

    fn add(&mut self, device: DeviceId, seconds: u64) {
        let slot = match device {
            DeviceId::Motor => &mut self.motor,
            DeviceId::Light => &mut self.light,
        };
        *slot = slot.saturating_add(seconds);
    }
}

#[derive(Clone)]
pub struct TelemetryAggregator {
    store: UsageStore,
    relays: Arc<RelayTracker>,
}

impl TelemetryAggregator {
    pub fn new(store: UsageStore, relays: Arc<RelayTracker>) -> Self {
        Self { store, relays }
    }

    /// Runtime seconds per device over the trailing `window_hours`,
    /// including the still-running part of any active relay.
    pub async fn window_totals(&self, window_hours: u32) -> Result<UsageTotals> {
        self.window_totals_at(OffsetDateTime::now_utc(), window_hours)
            .await
    }

    pub(crate) async fn window_totals_at(
        &self,
        now: OffsetDateTime,
        window_hours: u32,
    ) -> Result<UsageTotals> {
        let since = window_start(now, window_hours)?;

        let mut totals = UsageTotals::default();
        for record in self.store.since(since, None).await? {
            totals.add(record.device, u64::from(record.runtime_sec));
        }

        let relays = self.relays.snapshot().await;
        for device in DeviceId::ALL {
            totals.add(device, live_seconds(relays.entry(device), since, now));
        }

        Ok(totals)
    }
}

/// Whole seconds an active relay has been on inside `[since, now]`.
fn live_seconds(entry: &RelayEntry, since: OffsetDateTime, now: OffsetDateTime) -> u64 {
    match (entry.on, entry.active_since) {
        (true, Some(start)) => {
            let from = start.max(since);
            u64::try_from((now - from).whole_seconds()).unwrap_or(0)
        }
        _ => 0,
    }
}

/// Liters pumped for `motor_sec` of runtime at a fixed flow rate.
pub fn water_liters(motor_sec: u64, flow_rate_l_per_min: f64) -> f64 {
    motor_sec as f64 / 60.0 * flow_rate_l_per_min
}

pub fn energy_kwh(seconds: u64, watt: f64) -> f64 {
    seconds as f64 * watt / 3_600_000.0
}

// ===========================================================================
// Tests
// ===========================================================================
