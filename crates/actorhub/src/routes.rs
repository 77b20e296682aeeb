//! C9 — HTTP Surface. `axum::Router` with typed path extractors over the
//! endpoints in spec §6, wrapped (as the teacher wraps its own single
//! `fallback` handler) in `TraceLayer` + `DefaultBodyLimit`.

use crate::accounts::AccountRegistry;
use crate::activities::ActivityEngine;
use crate::auth::AuthFilter;
use crate::collections::CollectionEngine;
use crate::context::{default_context, ACTIVITY_JSON, JRD_JSON};
use crate::error::{AppError, AppResult};
use crate::http_sig::{self, KeyResolver};
use crate::net_metrics::NetMetrics;
use crate::store::ObjectStore;
use axum::{
    extract::{OriginalUri, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub objects: ObjectStore,
    pub collections: CollectionEngine,
    pub accounts: AccountRegistry,
    pub auth: AuthFilter,
    pub activities: ActivityEngine,
    pub key_resolver: KeyResolver,
    pub base_url: String,
    pub max_date_skew: Duration,
    pub metrics: Arc<NetMetrics>,
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/register", get(register_form).post(register_submit))
        .route("/.well-known/webfinger", get(webfinger))
        .route("/person/:id", get(get_person))
        .route("/person/:id/inbox", axum::routing::post(post_inbox))
        .route("/person/:id/outbox", axum::routing::post(post_outbox))
        .route("/key/:id", get(get_key))
        .route("/object/:id", get(get_object))
        .route("/orderedcollection/:id", get(get_collection))
        .route("/orderedcollectionpage/:id", get(get_collection_page))
        .layer(axum::extract::DefaultBodyLimit::max(max_body_bytes))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn activity_json(body: Value) -> Response {
    (StatusCode::OK, [("Content-Type", ACTIVITY_JSON)], Json(body)).into_response()
}

async fn root(State(state): State<AppState>) -> Response {
    activity_json(json!({
        "@context": default_context(),
        "type": "Service",
        "name": "One Page Pub",
        "id": state.base_url,
    }))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn register_form() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html><head><title>Register</title></head>
<body>
<form method="post" action="/register">
  <label>Username <input type="text" name="username"></label>
  <label>Password <input type="password" name="password"></label>
  <label>Confirm <input type="password" name="confirmation"></label>
  <button type="submit">Register</button>
</form>
</body></html>"#,
    )
}

#[derive(Deserialize)]
struct RegisterForm {
    username: String,
    password: String,
    confirmation: String,
}

async fn register_submit(
    State(state): State<AppState>,
    axum::Form(form): axum::Form<RegisterForm>,
) -> AppResult<Html<String>> {
    let reg = state
        .accounts
        .register(&form.username, &form.password, &form.confirmation)
        .await?;
    Ok(Html(format!(
        "<!DOCTYPE html><html><body><p>Account <strong>{}</strong> created.</p><p>Bearer token (save it, it is shown once): <span class=\"token\">{}</span></p></body></html>",
        reg.username, reg.token
    )))
}

#[derive(Deserialize)]
struct WebfingerQuery {
    resource: String,
}

async fn webfinger(State(state): State<AppState>, Query(q): Query<WebfingerQuery>) -> AppResult<Response> {
    let doc = state.accounts.webfinger(&q.resource).await?;
    Ok((StatusCode::OK, [("Content-Type", JRD_JSON)], Json(doc)).into_response())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn viewer_from_bearer(state: &AppState, headers: &HeaderMap) -> AppResult<Option<String>> {
    match bearer_token(headers) {
        Some(token) => match state.accounts.auth_by_token(&token).await {
            Ok(actor_id) => Ok(Some(actor_id)),
            Err(e) => {
                state.metrics.auth_failure();
                Err(e)
            }
        },
        None => Ok(None),
    }
}

async fn get_person(State(state): State<AppState>, Path(id): Path<String>, headers: HeaderMap) -> AppResult<Response> {
    let actor_id = format!("{}/person/{id}", state.base_url);
    let viewer = viewer_from_bearer(&state, &headers).await?;
    let obj = state.objects.get(&actor_id).await?.ok_or(AppError::NotFound)?;
    if !state.auth.can_read_object(&obj, viewer.as_deref()).await? {
        return Err(AppError::Forbidden("blocked".into()));
    }
    Ok(activity_json(obj))
}

async fn get_key(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Response> {
    let actor_id = format!("{}/person/{id}", state.base_url);
    let obj = state.objects.get(&actor_id).await?.ok_or(AppError::NotFound)?;
    let key = obj.get("publicKey").cloned().ok_or(AppError::NotFound)?;
    let mut key = key.as_object().cloned().ok_or(AppError::NotFound)?;
    key.insert("@context".into(), default_context());
    Ok(activity_json(Value::Object(key)))
}

async fn get_object(State(state): State<AppState>, Path(id): Path<String>, headers: HeaderMap) -> AppResult<Response> {
    let object_id = format!("{}/{}", state.base_url, id);
    let viewer = viewer_from_bearer(&state, &headers).await?;
    let obj = state.objects.get(&object_id).await?.ok_or(AppError::NotFound)?;
    if crate::store::is_tombstone_value(&obj) {
        return Err(AppError::Gone(obj));
    }
    if !state.auth.can_read_object(&obj, viewer.as_deref()).await? {
        return Err(AppError::Forbidden("not addressed to you".into()));
    }
    Ok(activity_json(obj))
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u64>,
}

async fn get_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let viewer = viewer_from_bearer(&state, &headers).await?;
    require_collection_read(&state, &id, viewer.as_deref()).await?;
    let total = state.collections.total_items(&id).await?;
    let first = state.collections.page_iri(&id, 0);
    Ok(activity_json(json!({
        "@context": default_context(),
        "id": state.collections.collection_iri(&id),
        "type": "OrderedCollection",
        "totalItems": total,
        "first": first,
    })))
}

async fn get_collection_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<PageQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let viewer = viewer_from_bearer(&state, &headers).await?;
    require_collection_read(&state, &id, viewer.as_deref()).await?;
    let page_no = q.page.unwrap_or(0);
    let page = state.collections.page(&id, page_no, viewer.as_deref(), &state.auth).await?;
    Ok(activity_json(json!({
        "@context": default_context(),
        "id": state.collections.page_iri(&id, page_no),
        "type": "OrderedCollectionPage",
        "partOf": page.part_of,
        "totalItems": page.total_items,
        "orderedItems": page.items,
        "next": page.next,
        "prev": page.prev,
    })))
}

async fn require_collection_read(state: &AppState, collection_id: &str, viewer: Option<&str>) -> AppResult<()> {
    if state.auth.can_read_collection(collection_id, viewer).await? {
        return Ok(());
    }
    match viewer {
        Some(_) => Err(AppError::Forbidden("private collection".into())),
        None => {
            state.metrics.auth_failure();
            Err(AppError::Unauthorized("private collection".into()))
        }
    }
}

async fn post_outbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> AppResult<Response> {
    let actor_id = format!("{}/person/{id}", state.base_url);
    let token = bearer_token(&headers).ok_or_else(|| {
        state.metrics.auth_failure();
        AppError::Unauthorized("missing bearer token".into())
    })?;
    let authed_actor = match state.accounts.auth_by_token(&token).await {
        Ok(actor_id) => actor_id,
        Err(e) => {
            state.metrics.auth_failure();
            return Err(e);
        }
    };
    if authed_actor != actor_id {
        return Err(AppError::Forbidden("cannot post to another actor's outbox".into()));
    }
    let payload: Value = serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(format!("invalid json: {e}")))?;
    let stored = state.activities.submit_outbox(&actor_id, payload).await?;
    Ok(activity_json(stored))
}

async fn post_inbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> AppResult<Response> {
    let actor_id = format!("{}/person/{id}", state.base_url);
    let remote_actor = verify_http_signature(&state, &uri, &headers, &body).await?;
    let payload: Value = serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(format!("invalid json: {e}")))?;
    state.activities.accept_inbox(&actor_id, &remote_actor, payload).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

/// Verifies an inbound signed request: resolves `keyId` to its owning actor,
/// checks digest/date skew, and checks the signature (built over the actual
/// request target) against the fetched key.
async fn verify_http_signature(state: &AppState, uri: &http::Uri, headers: &HeaderMap, body: &[u8]) -> AppResult<String> {
    let result = verify_http_signature_checked(state, uri, headers, body).await;
    if result.is_err() {
        state.metrics.auth_failure();
    }
    result
}

async fn verify_http_signature_checked(state: &AppState, uri: &http::Uri, headers: &HeaderMap, body: &[u8]) -> AppResult<String> {
    let sig_header = headers
        .get("Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing Signature header".into()))?;
    let parsed = http_sig::parse_signature_header(sig_header).map_err(|e| AppError::Unauthorized(format!("{e:#}")))?;

    http_sig::verify_digest(headers, body).map_err(|e| AppError::Unauthorized(format!("{e:#}")))?;
    http_sig::verify_date(headers, state.max_date_skew).map_err(|e| AppError::Unauthorized(format!("{e:#}")))?;

    let resolved = state
        .key_resolver
        .resolve_actor_for_key_id(&parsed.key_id)
        .await
        .map_err(|e| AppError::Unauthorized(format!("resolve signer key: {e:#}")))?;

    let signing_string = http_sig::build_signing_string(&http::Method::POST, uri, headers, &parsed.headers)
        .map_err(|e| AppError::Unauthorized(format!("{e:#}")))?;
    http_sig::verify_signature_rsa_sha256(&resolved.public_key_pem, &signing_string, &parsed.signature)
        .map_err(|_| AppError::Unauthorized("signature verification failed".into()))?;

    Ok(resolved.owner)
}
