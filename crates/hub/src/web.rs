use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::aggregate::{energy_kwh, water_liters, TelemetryAggregator};
use crate::config::{DevicesConfig, WebConfig, MAX_WINDOW_HOURS};
use crate::db::{UsageRecord, UsageStore};
use crate::device::DeviceId;
use crate::dispatch::{CommandDispatcher, ToggleError, ToggleOutcome};
use crate::relay::{RelayFlags, RelayTracker};
use crate::serial::{ConnectionManager, LinkState};
use crate::state::{LastRuntimes, SharedState, SystemEvent};

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub conn: Arc<ConnectionManager>,
    pub relays: Arc<RelayTracker>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub aggregator: TelemetryAggregator,
    pub store: UsageStore,
    pub devices: Arc<DevicesConfig>,
    pub window_hours: u32,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/toggle", post(api_toggle))
        .route("/api/usage", get(api_usage))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
}

enum ApiError {
    Toggle(ToggleError),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<ToggleError> for ApiError {
    fn from(err: ToggleError) -> Self {
        Self::Toggle(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Toggle(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(err) => {
                error!("request failed: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (
            status,
            Json(ErrorBody {
                ok: false,
                error: message,
            }),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    frames_received: u64,
    serial: SerialStatus,
    relay: RelayFlags,
    devices: DeviceNames,
    last_runtimes: LastRuntimes,
    usage: UsageSummary,
    events: Vec<SystemEvent>,
}

#[derive(Serialize)]
struct SerialStatus {
    state: LinkState,
    port: Option<String>,
}

#[derive(Serialize)]
struct DeviceNames {
    motor: String,
    light: String,
}

#[derive(Serialize)]
struct UsageSummary {
    window_hours: u32,
    motor_sec: u64,
    light_sec: u64,
    water_liters: f64,
    energy_kwh: f64,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

async fn api_status(State(app): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let totals = app.aggregator.window_totals(app.window_hours).await?;
    let relay = app.relays.snapshot().await.flags();

    // The link mutex can be held by a blocking open; keep it off the runtime.
    let conn = Arc::clone(&app.conn);
    let serial = tokio::task::spawn_blocking(move || SerialStatus {
        state: conn.state(),
        port: conn.port_name(),
    })
    .await
    .context("serial status task failed")?;

    let energy: f64 = DeviceId::ALL
        .iter()
        .map(|&d| energy_kwh(totals.get(d), app.devices.power_watt(d)))
        .sum();

    let usage = UsageSummary {
        window_hours: app.window_hours,
        motor_sec: totals.motor,
        light_sec: totals.light,
        water_liters: round_to(
            water_liters(totals.motor, app.devices.motor.flow_rate_l_per_min),
            1,
        ),
        energy_kwh: round_to(energy, 2),
    };

    let st = app.shared.read().await;
    Ok(Json(StatusResponse {
        uptime_secs: st.uptime_secs(),
        frames_received: st.frames_received,
        serial,
        relay,
        devices: DeviceNames {
            motor: app.devices.name(DeviceId::Motor).to_string(),
            light: app.devices.name(DeviceId::Light).to_string(),
        },
        last_runtimes: st.last_runtimes,
        usage,
        events: st.recent_events(),
    }))
}

// ---------------------------------------------------------------------------
// Toggle
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ToggleRequest {
    device: String,
    #[serde(default)]
    state: bool,
}

async fn api_toggle(
    State(app): State<AppState>,
    Json(req): Json<ToggleRequest>,
) -> Result<Json<ToggleOutcome>, ApiError> {
    let outcome = app.dispatcher.toggle(&req.device, req.state).await?;
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// Usage history
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct UsageQuery {
    hours: Option<u32>,
}

async fn api_usage(
    State(app): State<AppState>,
    Query(q): Query<UsageQuery>,
) -> Result<Json<Vec<UsageRecord>>, ApiError> {
    let hours = q.hours.unwrap_or(app.window_hours);
    if hours == 0 || hours > MAX_WINDOW_HOURS {
        return Err(ApiError::BadRequest(format!(
            "hours must be in [1, {MAX_WINDOW_HOURS}], got {hours}"
        )));
    }
    Ok(Json(app.store.recent(hours).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState, web: &WebConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", web.host, web.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind web listener on {addr}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(app))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::testing::FakeDevice;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use time::OffsetDateTime;
    use tower::ServiceExt;

    async fn app_state(dev: &FakeDevice) -> AppState {
        let store = UsageStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();

        let conn = Arc::new(dev.manager());
        let relays = Arc::new(RelayTracker::new());
        let shared = SystemState::shared();
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&conn),
            Arc::clone(&relays),
            Arc::clone(&shared),
        ));

        AppState {
            shared,
            conn,
            aggregator: TelemetryAggregator::new(store.clone(), Arc::clone(&relays)),
            relays,
            dispatcher,
            store,
            devices: Arc::new(DevicesConfig::default()),
            window_hours: 24,
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn toggle_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/toggle")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    // -- /api/toggle ----------------------------------------------------------

    #[tokio::test]
    async fn toggle_switches_relay() {
        let dev = FakeDevice::new();
        let app = router(app_state(&dev).await);

        let response = app
            .oneshot(toggle_request(r#"{"device":"motor","state":true}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["relay"]["motor"], true);
        assert_eq!(json["relay"]["light"], false);
        assert_eq!(dev.written(), "MOTOR_ON\n");
    }

    #[tokio::test]
    async fn toggle_unknown_device_is_bad_request() {
        let dev = FakeDevice::new();
        let app = router(app_state(&dev).await);

        let response = app
            .oneshot(toggle_request(r#"{"device":"fan","state":true}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "invalid device 'fan'");
        assert_eq!(dev.written(), "");
    }

    #[tokio::test]
    async fn toggle_state_defaults_to_off() {
        let dev = FakeDevice::new();
        let app = router(app_state(&dev).await);

        let response = app
            .oneshot(toggle_request(r#"{"device":"light"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(dev.written(), "LIGHT_OFF\n");
    }

    #[tokio::test]
    async fn toggle_transport_failure_reports_not_ok() {
        let dev = FakeDevice::unplugged();
        let app = router(app_state(&dev).await);

        let response = app
            .oneshot(toggle_request(r#"{"device":"light","state":true}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["ok"], false);
        assert_eq!(json["relay"]["light"], false);
    }

    // -- /api/status ----------------------------------------------------------

    #[tokio::test]
    async fn status_reflects_relays_and_usage() {
        let dev = FakeDevice::new();
        let state = app_state(&dev).await;
        state
            .store
            .append(&UsageRecord {
                timestamp: OffsetDateTime::now_utc(),
                device: DeviceId::Motor,
                runtime_sec: 90,
            })
            .await
            .unwrap();
        state.shared.write().await.record_frame(DeviceId::Motor, 90);
        state.dispatcher.toggle("light", true).await.unwrap();

        let response = router(state)
            .oneshot(get_request("/api/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["relay"]["light"], true);
        assert_eq!(json["relay"]["motor"], false);
        assert_eq!(json["serial"]["state"], "open");
        assert_eq!(json["serial"]["port"], "fake0");
        assert_eq!(json["devices"]["motor"], "Bore Pump");
        assert_eq!(json["last_runtimes"]["motor"], 90);
        assert_eq!(json["frames_received"], 1);
        assert_eq!(json["usage"]["window_hours"], 24);
        assert_eq!(json["usage"]["motor_sec"], 90);
        assert_eq!(json["usage"]["water_liters"], 30.0);
        assert!(json["usage"]["light_sec"].as_u64().is_some());
        assert_eq!(json["events"][0]["kind"], "relay");
    }

    #[tokio::test]
    async fn status_on_fresh_hub() {
        let dev = FakeDevice::unplugged();
        let response = router(app_state(&dev).await)
            .oneshot(get_request("/api/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["serial"]["state"], "closed");
        assert!(json["serial"]["port"].is_null());
        assert_eq!(json["usage"]["motor_sec"], 0);
        assert_eq!(json["usage"]["energy_kwh"], 0.0);
        assert_eq!(json["events"].as_array().unwrap().len(), 0);
    }

    // -- /api/usage -----------------------------------------------------------

    #[tokio::test]
    async fn usage_lists_recent_records() {
        let dev = FakeDevice::new();
        let state = app_state(&dev).await;
        let now = OffsetDateTime::now_utc();
        for (age_h, device, secs) in [(1, DeviceId::Light, 30), (30, DeviceId::Motor, 60)] {
            state
                .store
                .append(&UsageRecord {
                    timestamp: now - time::Duration::hours(age_h),
                    device,
                    runtime_sec: secs,
                })
                .await
                .unwrap();
        }

        let response = router(state.clone())
            .oneshot(get_request("/api/usage"))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["device"], "light");
        assert_eq!(json[0]["runtime_sec"], 30);

        let response = router(state)
            .oneshot(get_request("/api/usage?hours=48"))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[1]["device"], "motor");
    }

    #[tokio::test]
    async fn usage_rejects_out_of_range_hours() {
        let dev = FakeDevice::new();
        let state = app_state(&dev).await;

        for hours in ["0", "4294967295", "8785"] {
            let response = router(state.clone())
                .oneshot(get_request(&format!("/api/usage?hours={hours}")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "hours={hours}");

            let json = body_json(response).await;
            assert_eq!(json["ok"], false);
            assert!(json["error"].as_str().unwrap().contains("hours must be in"));
        }

        let response = router(state)
            .oneshot(get_request("/api/usage?hours=8784"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
