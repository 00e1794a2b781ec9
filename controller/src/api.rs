use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use sunrise_common::{light::validate_fraction, AlarmSlot, DayOfWeek, Error};

use crate::host::AppState;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct AlarmUpdate {
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AlarmView {
    day: &'static str,
    #[serde(flatten)]
    slot: AlarmSlot,
}

#[derive(Debug, Deserialize)]
struct LightUpdate {
    on: bool,
}

#[derive(Debug, Deserialize)]
struct WakeUpLengthUpdate {
    length: String,
}

#[derive(Debug, Deserialize)]
struct BrightnessUpdate {
    #[serde(default)]
    gain: Option<f64>,
    #[serde(rename = "startBrightness", default)]
    start_brightness: Option<f64>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/schedule", get(handle_get_schedule))
        .route("/api/alarm/{day}", put(handle_put_alarm))
        .route("/api/light", put(handle_put_light))
        .route("/api/wake-up-length", put(handle_put_wake_up_length))
        .route("/api/brightness", put(handle_put_brightness))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_get_status(State(state): State<AppState>) -> Response {
    Json(state.status().await).into_response()
}

async fn handle_get_schedule(State(state): State<AppState>) -> Response {
    Json(state.schedule().await).into_response()
}

async fn handle_put_alarm(
    State(state): State<AppState>,
    Path(day): Path<String>,
    body: Result<Json<AlarmUpdate>, JsonRejection>,
) -> Response {
    let Some(day) = parse_day(&day) else {
        return error_response(StatusCode::NOT_FOUND, "Unknown day");
    };
    let Json(update) = match body {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };
    if update.time.is_none() && update.enabled.is_none() {
        return error_response(StatusCode::BAD_REQUEST, "Expected 'time' or 'enabled'");
    }

    if let Some(time) = update.time.as_deref() {
        if let Err(err) = state.set_alarm(day, time).await {
            return setter_error(err);
        }
    }
    if let Some(enabled) = update.enabled {
        state.set_alarm_enabled(day, enabled).await;
    }

    let slot = state.schedule().await[day];
    Json(AlarmView {
        day: day.name(),
        slot,
    })
    .into_response()
}

async fn handle_put_light(
    State(state): State<AppState>,
    body: Result<Json<LightUpdate>, JsonRejection>,
) -> Response {
    let Json(update) = match body {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };
    state.set_on(update.on).await;
    handle_get_status(State(state)).await
}

async fn handle_put_wake_up_length(
    State(state): State<AppState>,
    body: Result<Json<WakeUpLengthUpdate>, JsonRejection>,
) -> Response {
    let Json(update) = match body {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };
    if let Err(err) = state.set_wake_up_length(&update.length).await {
        return setter_error(err);
    }
    handle_get_status(State(state)).await
}

async fn handle_put_brightness(
    State(state): State<AppState>,
    body: Result<Json<BrightnessUpdate>, JsonRejection>,
) -> Response {
    let Json(update) = match body {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };

    // Both values are checked before either is applied.
    for value in [update.gain, update.start_brightness].into_iter().flatten() {
        if let Err(err) = validate_fraction(value) {
            return setter_error(err);
        }
    }

    if let Some(gain) = update.gain {
        if let Err(err) = state.set_brightness_gain(gain).await {
            return setter_error(err);
        }
    }
    if let Some(floor) = update.start_brightness {
        if let Err(err) = state.set_start_brightness(floor).await {
            return setter_error(err);
        }
    }
    handle_get_status(State(state)).await
}

/// Accepts a weekday name in any case or its Sunday-first index.
fn parse_day(raw: &str) -> Option<DayOfWeek> {
    match raw.parse::<usize>() {
        Ok(index) => DayOfWeek::from_index(index),
        Err(_) => DayOfWeek::from_name(raw),
    }
}

fn setter_error(err: Error) -> Response {
    match err {
        Error::HardwareFault(_) | Error::TransportFailure(_) => {
            warn!("setter failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
        _ => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

fn rejected(rejection: JsonRejection) -> Response {
    error_response(StatusCode::BAD_REQUEST, &rejection.body_text())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::host::testing;

    async fn send(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[test]
    fn transport_and_hardware_faults_are_server_errors() {
        let response = setter_error(Error::TransportFailure("queue closed".to_string()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let response = setter_error(Error::HardwareFault("pwm".to_string()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let response = setter_error(Error::InvalidBrightness(2.0));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn put_alarm_updates_the_schedule() {
        let (state, _shutdown) = testing::state();
        let app = router(state.clone());

        let (status, body) = send(
            app.clone(),
            "PUT",
            "/api/alarm/monday",
            Some(json!({ "time": "07:30", "enabled": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "day": "Monday", "enabled": true, "time": "07:30" }));

        let (status, body) = send(app, "GET", "/api/schedule", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[1], json!({ "enabled": true, "time": "07:30" }));
        assert_eq!(body[0], json!({ "enabled": false, "time": "07:00" }));
    }

    #[tokio::test]
    async fn day_index_is_accepted() {
        let (state, _shutdown) = testing::state();
        let (status, body) = send(
            router(state),
            "PUT",
            "/api/alarm/6",
            Some(json!({ "enabled": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["day"], "Saturday");
    }

    #[tokio::test]
    async fn bad_alarm_requests_are_rejected_without_changes() {
        let (state, _shutdown) = testing::state();
        let app = router(state.clone());
        let before = state.schedule().await;

        let (status, body) = send(
            app.clone(),
            "PUT",
            "/api/alarm/monday",
            Some(json!({ "time": "garbage", "enabled": true })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("garbage"));

        let (status, _) = send(
            app.clone(),
            "PUT",
            "/api/alarm/funday",
            Some(json!({ "time": "07:00" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            app.clone(),
            "PUT",
            "/api/alarm/7",
            Some(json!({ "enabled": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(app, "PUT", "/api/alarm/monday", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(state.schedule().await, before);
    }

    #[tokio::test]
    async fn malformed_json_is_a_client_error() {
        let (state, _shutdown) = testing::state();
        let request = Request::builder()
            .method("PUT")
            .uri("/api/light")
            .header("content-type", "application/json")
            .body(Body::from("{ on: yes"))
            .unwrap();

        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn put_light_switches_the_light() {
        let (state, _shutdown) = testing::state();
        let app = router(state);

        let (status, body) =
            send(app.clone(), "PUT", "/api/light", Some(json!({ "on": true }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["on"], true);
        assert_eq!(body["brightness"], 1.0);

        let (_, body) = send(app, "PUT", "/api/light", Some(json!({ "on": false }))).await;
        assert_eq!(body["on"], false);
        assert_eq!(body["phase"], "IDLE");
    }

    #[tokio::test]
    async fn wake_up_length_and_brightness_setters() {
        let (state, _shutdown) = testing::state();
        let app = router(state);

        let (status, body) = send(
            app.clone(),
            "PUT",
            "/api/wake-up-length",
            Some(json!({ "length": "1h30m" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["wakeUpLengthMin"], 90);

        let (status, _) = send(
            app.clone(),
            "PUT",
            "/api/wake-up-length",
            Some(json!({ "length": "0m" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            app.clone(),
            "PUT",
            "/api/brightness",
            Some(json!({ "gain": 0.5, "startBrightness": 0.1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["gain"], 0.5);
        assert_eq!(body["startBrightness"], 0.1);

        let (status, _) = send(
            app.clone(),
            "PUT",
            "/api/brightness",
            Some(json!({ "gain": 0.8, "startBrightness": 2.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = send(app, "GET", "/api/status", None).await;
        assert_eq!(body["gain"], 0.5);
        assert_eq!(body["timezone"], "UTC");
    }
}
