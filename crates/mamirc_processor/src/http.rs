//! The long-poll HTTP API that drives the web UI.
//!
//! POST-only JSON endpoints on 127.0.0.1. A client authenticates once with the web password and
//! gets a session cookie; mutating requests additionally carry the CSRF token handed out by
//! `get-state`. Password and token comparisons are constant time.

use crate::core::{ActionError, Core, Shared};
use crate::profiles::Profile;
use crate::updates;
use crate::windows::{flags, MAX_WINDOW_LINES};

use mamirc_common::now_ms;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use std::sync::Arc;
use std::time::Duration;

/// Long polls are bounded regardless of what the client asks for.
pub(crate) const MAX_WAIT_MS: u64 = 60_000;

pub(crate) struct HttpState {
    pub(crate) shared: Shared,
    pub(crate) web_password: String,
}

pub(crate) fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/get-state.json", post(get_state))
        .route("/get-updates.json", post(get_updates))
        .route("/do-actions.json", post(do_actions))
        .route("/get-profiles.json", post(get_profiles))
        .route("/get-time.json", post(get_time))
        .with_state(state)
}

pub(crate) async fn serve(state: Arc<HttpState>, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!("HTTP API listening on 127.0.0.1:{}", port);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn ct_str_eq(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn cookie_session(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookies.split(';') {
        if let Some(value) = part.trim().strip_prefix("session=") {
            return Some(value.to_owned());
        }
    }
    None
}

fn authed(core: &Core, headers: &HeaderMap) -> bool {
    match cookie_session(headers) {
        Some(got) => ct_str_eq(&got, &core.session_cookie),
        None => false,
    }
}

//
// get-state.json
//

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct GetStateReq {
    password: Option<String>,
    max_messages_per_window: Option<usize>,
}

async fn get_state(
    State(st): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(req): Json<GetStateReq>,
) -> Response {
    let core = st.shared.core.lock().unwrap();

    let has_cookie = authed(&core, &headers);
    let password_ok = req
        .password
        .as_deref()
        .map(|pw| ct_str_eq(pw, &st.web_password))
        .unwrap_or(false);
    if !has_cookie && !password_ok {
        return StatusCode::FORBIDDEN.into_response();
    }

    let max_lines = req.max_messages_per_window.unwrap_or(MAX_WINDOW_LINES);
    let body = build_state(&core, max_lines);

    if !has_cookie {
        let set_cookie = format!(
            "session={}; HttpOnly; SameSite=Strict; Path=/",
            core.session_cookie
        );
        ([(header::SET_COOKIE, set_cookie)], Json(body)).into_response()
    } else {
        Json(body).into_response()
    }
}

fn build_state(core: &Core, max_lines: usize) -> Value {
    let mut connections = serde_json::Map::new();
    for session in core.sessions.values() {
        let mut channels = serde_json::Map::new();
        for chan in session.chans.values() {
            channels.insert(
                chan.name.display().to_owned(),
                json!({
                    "members": chan.sorted_members(),
                    "topic": chan.topic,
                }),
            );
        }
        connections.insert(
            session.profile.name.clone(),
            json!({
                "currentNickname": session.current_nick,
                "channels": Value::Object(channels),
            }),
        );
    }

    let mut windows = Vec::new();
    for (key, window) in &core.windows {
        let skip = window.lines.len().saturating_sub(max_lines);
        let mut lines = Vec::new();
        // Timestamps are delta-encoded in seconds; the client accumulates them back
        let mut prev_secs: i64 = 0;
        for line in window.lines.iter().skip(skip) {
            let secs = (line.timestamp / 1000) as i64;
            let mut arr = vec![json!(line.seq), json!(line.flags), json!(secs - prev_secs)];
            prev_secs = secs;
            arr.extend(line.payload.iter().map(|p| json!(p)));
            lines.push(Value::Array(arr));
        }
        windows.push(json!([
            key.profile,
            key.party,
            {
                "lines": lines,
                "markedReadUntil": window.marked_read_until,
                "muted": window.muted,
            }
        ]));
    }

    json!({
        "csrfToken": core.csrf_token,
        "nextUpdateId": core.updates.next_id(),
        "flagsConstants": flags::constants_map(),
        "initialWindow": core.profiles.initial_window,
        "connections": Value::Object(connections),
        "windows": windows,
        "profiles": core.profiles.profiles.iter().map(|p| p.redacted()).collect::<Vec<_>>(),
    })
}

//
// get-updates.json
//

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetUpdatesReq {
    next_update_id: i64,
    #[serde(default)]
    max_wait: Option<u64>,
}

#[derive(Debug)]
pub(crate) enum PollOutcome {
    BadRange,
    Evicted,
    Updates { updates: Vec<Value>, next_id: u64 },
}

async fn get_updates(
    State(st): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(req): Json<GetUpdatesReq>,
) -> Response {
    {
        let core = st.shared.core.lock().unwrap();
        if !authed(&core, &headers) {
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let max_wait = req.max_wait.unwrap_or(0).min(MAX_WAIT_MS);
    match poll_updates(&st.shared, req.next_update_id, max_wait).await {
        PollOutcome::BadRange => StatusCode::BAD_REQUEST.into_response(),
        PollOutcome::Evicted => Json(Value::Null).into_response(),
        PollOutcome::Updates { updates, next_id } => {
            Json(json!({ "updates": updates, "nextUpdateId": next_id })).into_response()
        }
    }
}

/// The long-poll wait. The mutex is never held across the wait; the watch channel closes the
/// wake-up race (an update arriving between unlock and wait still flips `changed`).
pub(crate) async fn poll_updates(shared: &Shared, start_id: i64, max_wait_ms: u64) -> PollOutcome {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(max_wait_ms);
    let mut rcv = shared.rcv_updates.clone();
    loop {
        {
            let core = shared.core.lock().unwrap();
            match core.updates.get_since(start_id) {
                updates::Poll::BadRange => return PollOutcome::BadRange,
                updates::Poll::Evicted => return PollOutcome::Evicted,
                updates::Poll::Updates(updates) => {
                    if !updates.is_empty() || tokio::time::Instant::now() >= deadline {
                        return PollOutcome::Updates {
                            updates,
                            next_id: core.updates.next_id(),
                        };
                    }
                }
            }
        }
        match tokio::time::timeout_at(deadline, rcv.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // Feed dropped: shutting down; report what we have
                let core = shared.core.lock().unwrap();
                return match core.updates.get_since(start_id) {
                    updates::Poll::Updates(updates) => PollOutcome::Updates {
                        updates,
                        next_id: core.updates.next_id(),
                    },
                    _ => PollOutcome::Evicted,
                };
            }
            Err(_) => {
                // Deadline passed; the next loop iteration returns whatever is there
            }
        }
    }
}

//
// do-actions.json
//

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DoActionsReq {
    payload: Vec<Value>,
    csrf_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    next_update_id: Option<i64>,
}

async fn do_actions(
    State(st): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(req): Json<DoActionsReq>,
) -> Response {
    let mut core = st.shared.core.lock().unwrap();
    if !authed(&core, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    if !ct_str_eq(&req.csrf_token, &core.csrf_token) {
        return StatusCode::FORBIDDEN.into_response();
    }

    for op in &req.payload {
        if let Err(err) = apply_action(&mut core, op) {
            return Json(json!(format!("Error: {}", err))).into_response();
        }
    }
    Json(json!("OK")).into_response()
}

fn apply_action(core: &mut Core, op: &Value) -> Result<(), ActionError> {
    let arr = op.as_array().ok_or(ActionError::Malformed)?;
    let tag = arr
        .first()
        .and_then(Value::as_str)
        .ok_or(ActionError::Malformed)?;
    let str_arg = |idx: usize| {
        arr.get(idx)
            .and_then(Value::as_str)
            .ok_or(ActionError::Malformed)
    };
    let seq_arg = |idx: usize| {
        arr.get(idx)
            .and_then(Value::as_u64)
            .ok_or(ActionError::Malformed)
    };

    match tag {
        "send-line" => core.act_send_line(str_arg(1)?, str_arg(2)?),
        "mark-read" => core.act_mark_read(str_arg(1)?, str_arg(2)?, seq_arg(3)?),
        "clear-lines" => core.act_clear_lines(str_arg(1)?, str_arg(2)?, seq_arg(3)?),
        "open-window" => core.act_open_window(str_arg(1)?, str_arg(2)?),
        "close-window" => core.act_close_window(str_arg(1)?, str_arg(2)?),
        "set-initial-window" => core.act_set_initial_window(str_arg(1)?, str_arg(2)?),
        "set-profiles" => {
            let raw = arr.get(1).cloned().ok_or(ActionError::Malformed)?;
            let profiles: Vec<Profile> =
                serde_json::from_value(raw).map_err(|_| ActionError::Malformed)?;
            core.act_set_profiles(profiles)
        }
        _ => Err(ActionError::Malformed),
    }
}

//
// get-profiles.json / get-time.json
//

async fn get_profiles(State(st): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    let core = st.shared.core.lock().unwrap();
    if !authed(&core, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let profiles: Vec<Value> = core.profiles.profiles.iter().map(|p| p.redacted()).collect();
    Json(json!({ "profiles": profiles })).into_response()
}

/// Unauthenticated on purpose: the client uses it to detect clock skew before logging in.
async fn get_time() -> Json<Value> {
    Json(json!(now_ms()))
}
