//! Integration coverage of the HTTP surface end to end, driven in-process
//! with `tower::ServiceExt::oneshot` against the built `axum::Router`
//! (SPEC_FULL.md §8, invariants 1-11; invariant 12 needs two live instances
//! and is not exercised here).

use actorhub::accounts::AccountRegistry;
use actorhub::activities::ActivityEngine;
use actorhub::addressing::AddressingResolver;
use actorhub::auth::AuthFilter;
use actorhub::collections::CollectionEngine;
use actorhub::db::Db;
use actorhub::delivery::DeliveryQueue;
use actorhub::http_sig::KeyResolver;
use actorhub::net_metrics::NetMetrics;
use actorhub::routes::{self, AppState};
use actorhub::store::ObjectStore;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const BASE_URL: &str = "https://test.example";

fn test_db() -> Db {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pipeline.sqlite3");
    let db = Db::open(&path).expect("open db");
    std::mem::forget(dir);
    db
}

fn build_app() -> axum::Router {
    let db = test_db();
    let objects = ObjectStore::new(db.clone());
    let collections = CollectionEngine::new(db.clone(), BASE_URL.into(), 20);
    let accounts = AccountRegistry::new(db.clone(), BASE_URL.into());
    let addressing = AddressingResolver::new(collections.clone(), BASE_URL.into());
    let auth = AuthFilter::new(objects.clone(), collections.clone(), accounts.clone());
    let metrics = Arc::new(NetMetrics::new());
    let delivery = DeliveryQueue::new(db.clone(), metrics.clone());
    let activities = ActivityEngine::new(
        objects.clone(),
        collections.clone(),
        accounts.clone(),
        addressing,
        auth.clone(),
        delivery,
        BASE_URL.into(),
    );
    let state = AppState {
        objects,
        collections,
        accounts,
        auth,
        activities,
        key_resolver: KeyResolver::new(),
        base_url: BASE_URL.into(),
        max_date_skew: Duration::from_secs(300),
        metrics,
    };
    routes::router(state, 10 * 1024 * 1024)
}

async fn register(app: &axum::Router, username: &str) -> (String, String) {
    let body = format!("username={username}&password=hunter2&confirmation=hunter2");
    let req = Request::builder()
        .method("POST")
        .uri("/register")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let html = String::from_utf8(bytes.to_vec()).unwrap();
    let token = html
        .split("<span class=\"token\">")
        .nth(1)
        .and_then(|rest| rest.split("</span>").next())
        .expect("token span present")
        .to_string();

    // The registration HTML doesn't echo the minted actor IRI; resolve it via WebFinger.
    let wf_req = Request::builder()
        .uri(format!("/.well-known/webfinger?resource=acct:{username}@test.example"))
        .body(Body::empty())
        .unwrap();
    let wf_resp = app.clone().oneshot(wf_req).await.unwrap();
    assert_eq!(wf_resp.status(), StatusCode::OK);
    let wf_bytes = axum::body::to_bytes(wf_resp.into_body(), usize::MAX).await.unwrap();
    let wf: Value = serde_json::from_slice(&wf_bytes).unwrap();
    let href = wf["links"][0]["href"].as_str().unwrap().to_string();
    (href, token)
}

async fn post_outbox(app: &axum::Router, actor_id: &str, token: &str, activity: Value) -> (StatusCode, Value) {
    let path = actor_id.strip_prefix(BASE_URL).unwrap();
    let req = Request::builder()
        .method("POST")
        .uri(format!("{path}/outbox"))
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/activity+json")
        .body(Body::from(serde_json::to_vec(&activity).unwrap()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn get_json(app: &axum::Router, path: &str, token: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(path);
    if let Some(t) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {t}"));
    }
    let req = builder.body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn registration_flow_yields_token_and_webfinger() {
    let app = build_app();
    let (actor_id, token) = register(&app, "alice").await;
    assert!(actor_id.starts_with(BASE_URL));
    assert!(!token.is_empty());
}

fn collection_token(collection_iri: &str) -> &str {
    collection_iri.rsplit('/').next().unwrap()
}

#[tokio::test]
async fn create_note_appears_in_outbox_and_inbox() {
    let app = build_app();
    let (alice, token) = register(&app, "alice").await;

    let (status, stored) = post_outbox(&app, &alice, &token, json!({"type": "Note", "content": "hello"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["type"], "Create");

    let (status, actor) = get_json(&app, &format!("/person/{}", collection_token(&alice)), None).await;
    assert_eq!(status, StatusCode::OK);

    let outbox_iri = actor["outbox"].as_str().unwrap();
    let outbox_page_path = format!("/orderedcollectionpage/{}", collection_token(outbox_iri));
    let (status, page) = get_json(&app, &outbox_page_path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["orderedItems"][0], stored["id"]);

    let inbox_iri = actor["inbox"].as_str().unwrap();
    let inbox_page_path = format!("/orderedcollectionpage/{}", collection_token(inbox_iri));
    let (status, page) = get_json(&app, &inbox_page_path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["orderedItems"][0], stored["id"]);
}

#[tokio::test]
async fn update_preserves_id_and_applies_shallow_merge() {
    let app = build_app();
    let (alice, token) = register(&app, "alice").await;
    let (_, created) = post_outbox(
        &app,
        &alice,
        &token,
        json!({"type": "Note", "content": "hello", "contentMap": {"en": "hello"}}),
    )
    .await;
    let note_id = created["object"].as_str().unwrap().to_string();

    let (status, updated) = post_outbox(
        &app,
        &alice,
        &token,
        json!({
            "type": "Update",
            "object": {
                "id": note_id,
                "content": null,
                "contentMap": {"en": "hi", "fr": "salut"},
            }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["type"], "Update");

    let (status, note) = get_json(&app, &format!("/object{}", note_id.strip_prefix(BASE_URL).unwrap()), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(note.get("content").is_none());
    assert_eq!(note["contentMap"]["fr"], "salut");
    assert_eq!(note["id"], note_id);
}

#[tokio::test]
async fn delete_yields_tombstone_and_410() {
    let app = build_app();
    let (alice, token) = register(&app, "alice").await;
    let (_, created) = post_outbox(&app, &alice, &token, json!({"type": "Note", "content": "bye"})).await;
    let note_id = created["object"].as_str().unwrap().to_string();

    let (status, deleted) = post_outbox(&app, &alice, &token, json!({"type": "Delete", "object": note_id})).await;
    assert_eq!(status, StatusCode::OK);
    let _ = deleted;

    let (status, tomb) = get_json(&app, &format!("/object{}", note_id.strip_prefix(BASE_URL).unwrap()), None).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(tomb["type"], "Tombstone");
    assert_eq!(tomb["summaryMap"]["en"], "This object has been deleted");
}

#[tokio::test]
async fn follow_creates_edges_visible_in_collections() {
    let app = build_app();
    let (alice, alice_token) = register(&app, "alice").await;
    let (bob, _bob_token) = register(&app, "bob").await;

    let (status, _) = post_outbox(
        &app,
        &alice,
        &alice_token,
        json!({"type": "Follow", "object": bob, "to": [bob]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, bob_doc) = get_json(&app, &format!("/person/{}", collection_token(&bob)), None).await;
    let followers_iri = bob_doc["followers"].as_str().unwrap();
    let followers_page_path = format!("/orderedcollectionpage/{}", collection_token(followers_iri));
    let (status, page) = get_json(&app, &followers_page_path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(page["orderedItems"].as_array().unwrap().contains(&Value::String(alice.clone())));
}

#[tokio::test]
async fn private_activity_only_visible_to_author() {
    let app = build_app();
    let (alice, alice_token) = register(&app, "alice").await;
    let (_, _bob_token) = register(&app, "bob").await;

    let (_, created) = post_outbox(
        &app,
        &alice,
        &alice_token,
        json!({"type": "Note", "content": "just for me", "to": [alice]}),
    )
    .await;
    let note_id = created["object"].as_str().unwrap().to_string();

    let (status, _) = get_json(&app, &format!("/object{}", note_id.strip_prefix(BASE_URL).unwrap()), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = get_json(
        &app,
        &format!("/object{}", note_id.strip_prefix(BASE_URL).unwrap()),
        Some(&alice_token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn block_then_like_on_blockers_note_is_bad_request() {
    let app = build_app();
    let (alice, alice_token) = register(&app, "alice").await;
    let (bob, bob_token) = register(&app, "bob").await;

    post_outbox(&app, &alice, &alice_token, json!({"type": "Block", "object": bob})).await;

    let (_, created) = post_outbox(&app, &alice, &alice_token, json!({"type": "Note", "content": "nope"})).await;
    let note_id = created["object"].as_str().unwrap().to_string();

    let (status, _) = post_outbox(&app, &bob, &bob_token, json!({"type": "Like", "object": note_id})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = build_app();
    let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
