//! HTTP surface
//!
//! Inspection endpoints over the aggregate state plus browser beacon
//! intake. Beacons are decoded like broker payloads (the endpoint implies
//! the discriminator when the body omits it) and answered with 202 before
//! any downstream work beyond the sink fan-out happens.

use crate::config::Config;
use crate::engine::TrackingEngine;
use crate::events::{
    TrackingEvent, EVENT_ACTION, EVENT_CART_ADD, EVENT_CART_ENTER_CHECKOUT, EVENT_DATA_SET,
    EVENT_IMPRESSION, EVENT_ITEM_CLICK, EVENT_SUGGEST,
};
use crate::funnel::Funnel;
use crate::metrics;
use crate::sink::EventSink;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TrackingEngine>,
    pub sink: Arc<dyn EventSink>,
    pub ingest_enabled: bool,
}

pub fn router(engine: Arc<TrackingEngine>, sink: Arc<dyn EventSink>, config: &Config) -> Router {
    let state = AppState {
        engine,
        sink,
        ingest_enabled: config.ingest_http,
    };

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics::get_metrics))
        .route("/tracking/popularity", get(get_popularity))
        .route("/tracking/field-popularity", get(get_field_popularity))
        .route(
            "/tracking/field-popularity/:id",
            get(get_field_value_popularity),
        )
        .route("/tracking/queries", get(get_queries))
        .route("/tracking/no-results", get(get_no_results))
        .route("/tracking/sessions", get(get_sessions))
        .route("/tracking/session/:id", get(get_session))
        .route("/tracking/suggest", get(get_suggest))
        .route("/tracking/funnels", get(get_funnels).put(put_funnels))
        .route("/tracking/item-events", get(get_item_events))
        .route("/tracking/dataset", get(get_data_set))
        .route("/tracking/clear", get(clear))
        .route("/tracking/save", get(save))
        .route("/tracking/my/session", get(my_session))
        .route("/tracking/my/groups", get(my_groups))
        .route("/tracking/variation/:id", get(variation))
        .route("/track/click", post(track_click))
        .route("/track/impressions", post(track_impressions))
        .route("/track/action", post(track_action))
        .route("/track/cart", post(track_cart))
        .route("/track/dataset", post(track_data_set))
        .route("/track/enter-checkout", post(track_enter_checkout))
        .route("/track/suggest", post(track_suggest))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn get_popularity(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.engine.get_item_popularity())
}

async fn get_field_popularity(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.engine.get_field_popularity())
}

async fn get_field_value_popularity(
    State(app): State<AppState>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    Json(app.engine.get_field_value_popularity(id))
}

async fn get_queries(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.engine.get_queries())
}

async fn get_no_results(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.engine.get_no_result_queries())
}

async fn get_sessions(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.engine.get_sessions())
}

async fn get_session(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match app.engine.get_session(id) {
        Some(session) => Json(session).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Deserialize)]
struct SuggestParams {
    #[serde(default)]
    q: String,
}

async fn get_suggest(
    State(app): State<AppState>,
    Query(params): Query<SuggestParams>,
) -> impl IntoResponse {
    Json(app.engine.get_suggestions(&params.q))
}

async fn get_funnels(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.engine.get_funnels())
}

async fn put_funnels(
    State(app): State<AppState>,
    payload: Result<Json<Vec<Funnel>>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    match payload {
        Ok(Json(funnels)) => {
            app.engine.set_funnels(funnels);
            Json(app.engine.get_funnels()).into_response()
        }
        Err(rejection) => (StatusCode::BAD_REQUEST, rejection.body_text()).into_response(),
    }
}

async fn get_item_events(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.engine.get_item_events())
}

async fn get_data_set(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.engine.get_data_set())
}

async fn clear(State(app): State<AppState>) -> impl IntoResponse {
    app.engine.clear();
    Json(true)
}

async fn save(State(app): State<AppState>) -> StatusCode {
    app.engine.save().await;
    StatusCode::ACCEPTED
}

/// Session id from the `sid` cookie, when the browser carries one.
/// Cookie issuance belongs to the edge layer, not this service.
fn session_id_from_headers(headers: &HeaderMap) -> Option<i64> {
    let cookies = headers.get("cookie")?.to_str().ok()?;
    for pair in cookies.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix("sid=") {
            return value.parse().ok();
        }
    }
    None
}

async fn my_session(State(app): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    match session_id_from_headers(&headers).and_then(|id| app.engine.get_session(id)) {
        Some(session) => Json(session).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn my_groups(State(app): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    match session_id_from_headers(&headers).and_then(|id| app.engine.get_session_groups(id)) {
        Some(groups) => Json(groups).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn variation(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    match session_id_from_headers(&headers).and_then(|sid| app.engine.handle_variation(sid, &id)) {
        Some(bucket) => Json(bucket).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Decode a beacon body as the given event kind. The `event` field may be
/// omitted by the client since the endpoint already implies it.
fn decode_beacon(body: &[u8], event_type: u16) -> Result<TrackingEvent, String> {
    let mut value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| e.to_string())?;
    if let Some(object) = value.as_object_mut() {
        object
            .entry("event")
            .or_insert_with(|| serde_json::json!(event_type));
    }
    let payload = serde_json::to_vec(&value).map_err(|e| e.to_string())?;
    TrackingEvent::decode(&payload).map_err(|e| e.to_string())
}

async fn track(app: AppState, body: Bytes, event_type: u16) -> impl IntoResponse {
    if !app.ingest_enabled {
        return StatusCode::NOT_IMPLEMENTED.into_response();
    }
    match decode_beacon(&body, event_type) {
        Ok(event) => {
            app.sink.handle(&event).await;
            StatusCode::ACCEPTED.into_response()
        }
        Err(message) => (StatusCode::BAD_REQUEST, message).into_response(),
    }
}

async fn track_click(State(app): State<AppState>, body: Bytes) -> impl IntoResponse {
    track(app, body, EVENT_ITEM_CLICK).await
}

async fn track_impressions(State(app): State<AppState>, body: Bytes) -> impl IntoResponse {
    track(app, body, EVENT_IMPRESSION).await
}

async fn track_action(State(app): State<AppState>, body: Bytes) -> impl IntoResponse {
    track(app, body, EVENT_ACTION).await
}

async fn track_cart(State(app): State<AppState>, body: Bytes) -> impl IntoResponse {
    track(app, body, EVENT_CART_ADD).await
}

async fn track_data_set(State(app): State<AppState>, body: Bytes) -> impl IntoResponse {
    track(app, body, EVENT_DATA_SET).await
}

async fn track_enter_checkout(State(app): State<AppState>, body: Bytes) -> impl IntoResponse {
    track(app, body, EVENT_CART_ENTER_CHECKOUT).await
}

async fn track_suggest(State(app): State<AppState>, body: Bytes) -> impl IntoResponse {
    track(app, body, EVENT_SUGGEST).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", "ca=all; sid=12345; theme=dark".parse().unwrap());
        assert_eq!(session_id_from_headers(&headers), Some(12345));
    }

    #[test]
    fn test_session_id_missing_cookie() {
        let headers = HeaderMap::new();
        assert_eq!(session_id_from_headers(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("cookie", "sid=not-a-number".parse().unwrap());
        assert_eq!(session_id_from_headers(&headers), None);
    }

    #[test]
    fn test_decode_beacon_injects_discriminator() {
        let body = br#"{"session_id":4,"id":10,"position":1.5}"#;
        let event = decode_beacon(body, EVENT_ITEM_CLICK).unwrap();
        match event {
            TrackingEvent::ItemClick(click) => {
                assert_eq!(click.base.event, EVENT_ITEM_CLICK);
                assert_eq!(click.item.id, 10);
            }
            other => panic!("expected click, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_beacon_keeps_explicit_discriminator() {
        // A cart beacon may carry any cart discriminator inline.
        let body = br#"{"session_id":4,"event":13,"id":0}"#;
        let event = decode_beacon(body, EVENT_CART_ADD).unwrap();
        assert_eq!(event.base().event, crate::events::EVENT_CART_CLEAR);
    }

    #[test]
    fn test_decode_beacon_rejects_garbage() {
        assert!(decode_beacon(b"{oops", EVENT_ITEM_CLICK).is_err());
    }
}
