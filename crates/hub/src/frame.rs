//! Telemetry framing for the controller's serial output.
//!
//! The controller prints one flat JSON object per runtime report, e.g.
//! `{"device":"motor","runtime":42}`, but the UART is noisy: boot banners,
//! partial writes after a reset and missing line terminators are all normal.
//! Framing therefore treats whichever of `\n` or `}` shows up first as the
//! end of a candidate, and decoding is a total function that reports *why*
//! a candidate was skipped instead of failing.
//!
//! Because a `}` closes a candidate on its own, two objects glued on one
//! line (`{A}{B}\n`) both decode; only bytes after the last `}` of a line are
//! dropped. Deciding per physical line would make the result depend on where
//! the UART happened to split a read.

use serde::Deserialize;
use serde_json::Number;
use tracing::trace;

use crate::device::{DeviceId, UnknownDevice};

// ---------------------------------------------------------------------------
// Frame types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TelemetryFrame {
    pub(crate) device: DeviceId,
    pub(crate) runtime_sec: u32,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    device: String,
    runtime: Number,
}

/// Reason a candidate did not become a [`TelemetryFrame`].
#[derive(Debug, thiserror::Error)]
pub(crate) enum DecodeSkip {
    #[error("candidate lacks device/runtime markers")]
    NoMarkers,
    #[error("candidate is not a telemetry object")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("runtime {0} is not a non-negative second count")]
    InvalidRuntime(String),
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one framed candidate. Bytes before the first `{` are ignored so a
/// frame glued to line noise still decodes.
pub(crate) fn decode_candidate(candidate: &[u8]) -> Result<TelemetryFrame, DecodeSkip> {
    let text = String::from_utf8_lossy(candidate);
    let text = text.trim();

    if !(text.contains("device") && text.contains("runtime")) {
        return Err(DecodeSkip::NoMarkers);
    }

    let body = text.find('{').map_or(text, |start| &text[start..]);
    let raw: RawFrame = serde_json::from_str(body).map_err(DecodeSkip::Malformed)?;

    let device = raw
        .device
        .parse::<DeviceId>()
        .map_err(|UnknownDevice(name)| DecodeSkip::UnknownDevice(name))?;
    let runtime_sec = runtime_seconds(&raw.runtime)
        .ok_or_else(|| DecodeSkip::InvalidRuntime(raw.runtime.to_string()))?;

    Ok(TelemetryFrame {
        device,
        runtime_sec,
    })
}

/// Whole seconds from a JSON number. Fractions truncate toward zero;
/// negatives and values past `u32::MAX` are rejected.
fn runtime_seconds(n: &Number) -> Option<u32> {
    if let Some(v) = n.as_u64() {
        return u32::try_from(v).ok();
    }
    if n.as_i64().is_some() {
        return None;
    }
    let f = n.as_f64()?;
    if f.is_finite() && f >= 0.0 && f < f64::from(u32::MAX) + 1.0 {
        Some(f.trunc() as u32)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Stream framing
// ---------------------------------------------------------------------------

/// Accumulates raw serial bytes between reads and carves frames out of them.
#[derive(Debug, Default)]
pub(crate) struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return the frames that are now complete.
    ///
    /// The iterator is lazy: candidates are only cut from the buffer as it is
    /// advanced, so dropping it early leaves the rest buffered for the next
    /// call.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.buf.extend_from_slice(bytes);
        Frames { parser: self }
    }

    /// Bytes still waiting for a delimiter.
    pub(crate) fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn next_candidate(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|&b| b == b'\n' || b == b'}')?;
        // A closing brace belongs to the object; a newline is only a separator.
        let end = if self.buf[pos] == b'}' { pos + 1 } else { pos };
        let candidate = self.buf[..end].to_vec();
        self.buf.drain(..=pos);
        Some(candidate)
    }
}

pub(crate) struct Frames<'a> {
    parser: &'a mut FrameParser,
}

impl Iterator for Frames<'_> {
    type Item = TelemetryFrame;

    fn next(&mut self) -> Option<TelemetryFrame> {
        while let Some(candidate) = self.parser.next_candidate() {
            match decode_candidate(&candidate) {
                Ok(frame) => return Some(frame),
                Err(DecodeSkip::NoMarkers) => {}
                Err(skip) => trace!(
                    candidate = %String::from_utf8_lossy(&candidate),
                    "dropping telemetry candidate: {skip}"
                ),
            }
        }
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
