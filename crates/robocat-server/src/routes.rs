use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::debug;

use robocat_core::command::parse_command;
use robocat_core::ingress::EventIngress;
use robocat_core::registry::ActorRegistry;
use robocat_core::types::{Event, EventKind};

#[derive(Clone)]
pub struct AppState {
    pub ingress: Arc<EventIngress>,
    pub registry: Arc<ActorRegistry>,
    pub bot_handle: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook", post(webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn webhook(State(state): State<AppState>, Json(payload): Json<Value>) -> StatusCode {
    let events = normalize(&state.bot_handle, &payload);
    if events.is_empty() {
        debug!(
            "ignoring webhook payload of kind {:?}",
            payload.get("object_kind").and_then(|k| k.as_str())
        );
        return StatusCode::NO_CONTENT;
    }
    for event in events {
        if state.ingress.accept(&event) {
            state.registry.route(event).await;
        }
    }
    StatusCode::NO_CONTENT
}

/// Translate a raw forge hook payload into normalized engine events.
/// Payload kinds with no MR attached are dropped silently.
fn normalize(bot_handle: &str, payload: &Value) -> Vec<Event> {
    match payload.get("object_kind").and_then(|k| k.as_str()) {
        Some("merge_request") => {
            let Some(mr) = payload["object_attributes"]["iid"].as_u64() else {
                return Vec::new();
            };
            vec![Event::new(
                mr,
                EventKind::MrUpdated,
                json!({
                    "action": payload["object_attributes"]["action"],
                    "oldrev": payload["object_attributes"]["oldrev"],
                    "state": payload["object_attributes"]["state"],
                    "last_commit": payload["object_attributes"]["last_commit"]["id"],
                }),
            )]
        }
        Some("note") => {
            let Some(mr) = payload["merge_request"]["iid"].as_u64() else {
                return Vec::new();
            };
            let body = payload["object_attributes"]["note"].as_str().unwrap_or_default();
            let author = payload["user"]["username"].as_str().unwrap_or_default();
            // The bot's own notes must not feed back into the engine.
            if author == bot_handle {
                return Vec::new();
            }
            match parse_command(bot_handle, body) {
                Some(command) => vec![Event::new(
                    mr,
                    EventKind::CommandInvoked,
                    json!({
                        "verb": command.verb.as_str(),
                        "args": command.args,
                        "author": author,
                    }),
                )],
                None => vec![Event::new(
                    mr,
                    EventKind::MrNoteAdded,
                    json!({ "author": author, "note_id": payload["object_attributes"]["id"] }),
                )],
            }
        }
        Some("pipeline") => {
            let Some(mr) = payload["merge_request"]["iid"].as_u64() else {
                return Vec::new();
            };
            vec![Event::new(
                mr,
                EventKind::PipelineStateChanged,
                json!({
                    "pipeline_id": payload["object_attributes"]["id"],
                    "status": payload["object_attributes"]["status"],
                    "sha": payload["object_attributes"]["sha"],
                }),
            )]
        }
        _ => Vec::new(),
    }
}
