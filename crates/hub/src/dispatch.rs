//! Relay commands. The only code path allowed to change relay state, and it
//! does so only after the command was written to the controller.

use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::device::DeviceId;
use crate::relay::{RelayFlags, RelayTracker};
use crate::serial::ConnectionManager;
use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToggleOutcome {
    /// `false` means the command may not have reached the controller and
    /// `relay` still shows the previous state.
    pub ok: bool,
    pub relay: RelayFlags,
}

/// Rejected before anything was sent.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ToggleError {
    #[error("invalid device '{0}'")]
    UnknownDevice(String),
}

pub struct CommandDispatcher {
    conn: Arc<ConnectionManager>,
    relays: Arc<RelayTracker>,
    shared: SharedState,
    /// Held across send + state update so relay state follows the order in
    /// which commands hit the wire.
    gate: Mutex<()>,
}

impl CommandDispatcher {
    pub fn new(conn: Arc<ConnectionManager>, relays: Arc<RelayTracker>, shared: SharedState) -> Self {
        Self {
            conn,
            relays,
            shared,
            gate: Mutex::new(()),
        }
    }

    pub async fn toggle(&self, device: &str, on: bool) -> Result<ToggleOutcome, ToggleError> {
        let device = device
            .parse::<DeviceId>()
            .map_err(|e| ToggleError::UnknownDevice(e.0))?;
        Ok(self.toggle_device(device, on).await)
    }

    pub async fn toggle_device(&self, device: DeviceId, on: bool) -> ToggleOutcome {
        let _gate = self.gate.lock().await;

        if on && self.relays.get(device).await {
            debug!(%device, "already on; run clock restarts on success");
        }

        let command = device.command(on);
        let conn = Arc::clone(&self.conn);
        let wire_command = command.clone();
        let ok = match tokio::task::spawn_blocking(move || conn.send(&wire_command)).await {
            Ok(ok) => ok,
            Err(e) => {
                error!(%command, "send task failed: {e}");
                false
            }
        };

        if ok {
            self.relays.set(device, on, OffsetDateTime::now_utc()).await;
            info!(%device, on, "relay switched");
            self.shared.write().await.record_relay(device, on);
        } else {
            warn!(%device, on, "relay command not delivered; state unchanged");
            self.shared
                .write()
                .await
                .record_error(format!("{command} not delivered"));
        }

        ToggleOutcome {
            ok,
            relay: self.relays.snapshot().await.flags(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
