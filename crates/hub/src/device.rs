//! The closed set of relays wired to the controller, and the host → device
//! command encoding.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceId {
    Motor,
    Light,
}

impl DeviceId {
    pub const ALL: [DeviceId; 2] = [DeviceId::Motor, DeviceId::Light];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceId::Motor => "motor",
            DeviceId::Light => "light",
        }
    }

    /// Wire command for the controller, without the line terminator,
    /// e.g. `MOTOR_ON`.
    pub fn command(self, on: bool) -> String {
        format!(
            "{}_{}",
            self.as_str().to_ascii_uppercase(),
            if on { "ON" } else { "OFF" }
        )
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDevice(pub String);

impl FromStr for DeviceId {
    type Err = UnknownDevice;

    /// Exact, case-sensitive match: the controller only ever sends lowercase
    /// identifiers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "motor" => Ok(DeviceId::Motor),
            "light" => Ok(DeviceId::Light),
            other => Err(UnknownDevice(other.to_string())),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
