//! C4 — Authorization Filter. Given (viewer, object) decides readable/writable;
//! used both for single-object GETs and as the per-item predicate that
//! [`crate::collections::CollectionEngine::page`] applies while paging.

use crate::accounts::AccountRegistry;
use crate::addressing::AddressingResolver;
use crate::collections::CollectionEngine;
use crate::error::{AppError, AppResult};
use crate::store::ObjectStore;
use serde_json::Value;

#[derive(Clone)]
pub struct AuthFilter {
    objects: ObjectStore,
    collections: CollectionEngine,
    base_url: String,
    addressing: AddressingResolver,
}

impl AuthFilter {
    pub fn new(objects: ObjectStore, collections: CollectionEngine, accounts: AccountRegistry) -> Self {
        let base_url = accounts.base_url().to_string();
        let addressing = AddressingResolver::new(objects.clone(), collections.clone(), base_url.clone());
        Self { objects, collections, base_url, addressing }
    }

    /// Fetches the object at `iri` and applies the read rule. A missing object
    /// reads as unreadable rather than erroring — callers enumerating a page
    /// want failing items silently dropped, not the whole page to 404.
    pub async fn can_read_item_iri(&self, iri: &str, viewer: Option<&str>) -> AppResult<bool> {
        match self.objects.get(iri).await? {
            Some(obj) => self.can_read_object(&obj, viewer).await,
            None => Ok(false),
        }
    }

    /// Read rule for an already-fetched object `obj`, viewed by `viewer`.
    pub async fn can_read_object(&self, obj: &Value, viewer: Option<&str>) -> AppResult<bool> {
        let attributed_to = obj.get("attributedTo").and_then(Value::as_str);

        if let (Some(a), Some(v)) = (attributed_to, viewer) {
            if a == v {
                return Ok(true); // rule 1
            }
        }

        if let Some(author) = attributed_to {
            if self.is_blocked_by(author, viewer).await? {
                return Ok(false); // rule 3
            }
        }

        let audience = gather_read_audience(obj);
        let expanded = self.addressing.expand(&audience).await;
        if expanded.public {
            return Ok(true); // rule 5
        }
        if let Some(v) = viewer {
            if expanded.contains(v) {
                return Ok(true); // rule 6
            }
        }

        if attributed_to.is_none() {
            return Ok(true); // rule 7: ambient objects with no author are world-readable
        }

        Ok(false) // rule 8
    }

    /// Top-level authorization for fetching a collection or one of its pages
    /// directly (rule 2: private collections, including every actor's
    /// `blocked` collection, are readable only by their owner).
    pub async fn can_read_collection(&self, collection_id: &str, viewer: Option<&str>) -> AppResult<bool> {
        if !self.collections.is_private(collection_id).await? {
            return Ok(true);
        }
        match (self.collections.owner(collection_id).await?, viewer) {
            (Some(owner), Some(v)) if owner == v => Ok(true),
            _ => Ok(false),
        }
    }

    /// Inbox acceptance check for C7/C6: denies a delivery from `sender` into
    /// `owner`'s inbox if `owner` has blocked `sender`.
    pub async fn inbox_acceptable(&self, owner_actor: &str, sender_actor: &str) -> AppResult<bool> {
        Ok(!self.is_blocked_by(owner_actor, Some(sender_actor)).await?)
    }

    async fn is_blocked_by(&self, actor_iri: &str, viewer: Option<&str>) -> AppResult<bool> {
        let Some(viewer) = viewer else {
            return Ok(false);
        };
        let Some(actor_obj) = self.objects.get(actor_iri).await? else {
            return Ok(false);
        };
        let Some(blocked_iri) = actor_obj.get("blocked").and_then(Value::as_str) else {
            return Ok(false);
        };
        let Some(token) = self.local_collection_token(blocked_iri) else {
            return Ok(false);
        };
        self.collections.contains(&token, viewer).await.map_err(AppError::from)
    }

    fn local_collection_token(&self, iri: &str) -> Option<String> {
        let prefix = format!("{}/orderedcollection/", self.base_url.trim_end_matches('/'));
        iri.strip_prefix(&prefix).map(str::to_string)
    }
}

fn gather_read_audience(obj: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    for field in ["to", "cc", "audience"] {
        if let Some(v) = obj.get(field) {
            out.push(v.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PUBLIC;
    use crate::db::test_db;

    fn setup() -> (AuthFilter, ObjectStore, CollectionEngine, AccountRegistry) {
        let db = test_db();
        let objects = ObjectStore::new(db.clone());
        let collections = CollectionEngine::new(db.clone(), "https://a.example".into(), 20);
        let accounts = AccountRegistry::new(db, "https://a.example".into());
        let auth = AuthFilter::new(objects.clone(), collections.clone(), accounts.clone());
        (auth, objects, collections, accounts)
    }

    #[tokio::test]
    async fn author_can_always_read_own_object() {
        let (auth, objects, _c, _a) = setup();
        let obj = serde_json::json!({"id": "https://a.example/note/1", "attributedTo": "https://a.example/person/me"});
        objects.put(obj.clone()).await.unwrap();
        assert!(auth.can_read_object(&obj, Some("https://a.example/person/me")).await.unwrap());
    }

    #[tokio::test]
    async fn public_addressed_object_is_readable_by_anyone() {
        let (auth, _o, _c, _a) = setup();
        let obj = serde_json::json!({
            "id": "https://a.example/note/2",
            "attributedTo": "https://a.example/person/me",
            "to": [PUBLIC],
        });
        assert!(auth.can_read_object(&obj, None).await.unwrap());
    }

    #[tokio::test]
    async fn unaddressed_object_denies_strangers() {
        let (auth, _o, _c, _a) = setup();
        let obj = serde_json::json!({
            "id": "https://a.example/note/3",
            "attributedTo": "https://a.example/person/me",
            "to": ["https://a.example/person/friend"],
        });
        assert!(!auth.can_read_object(&obj, Some("https://a.example/person/stranger")).await.unwrap());
        assert!(auth.can_read_object(&obj, Some("https://a.example/person/friend")).await.unwrap());
    }

    #[tokio::test]
    async fn ambient_object_without_author_is_world_readable() {
        let (auth, _o, _c, _a) = setup();
        let obj = serde_json::json!({"id": "https://a.example/"});
        assert!(auth.can_read_object(&obj, None).await.unwrap());
    }

    #[tokio::test]
    async fn blocked_viewer_is_denied_even_if_addressed() {
        let (auth, objects, collections, _a) = setup();
        let blocked_id = collections.create(Some("https://a.example/person/me"), None, true).await.unwrap();
        collections.append(&blocked_id, "https://a.example/person/troll").await.unwrap();
        let actor = serde_json::json!({
            "id": "https://a.example/person/me",
            "type": "Person",
            "blocked": collections.collection_iri(&blocked_id),
        });
        objects.put(actor).await.unwrap();

        let obj = serde_json::json!({
            "id": "https://a.example/note/4",
            "attributedTo": "https://a.example/person/me",
            "to": [PUBLIC],
        });
        assert!(!auth
            .can_read_object(&obj, Some("https://a.example/person/troll"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn private_collection_readable_only_by_owner() {
        let (auth, _o, collections, _a) = setup();
        let id = collections.create(Some("https://a.example/person/me"), None, true).await.unwrap();
        assert!(auth.can_read_collection(&id, Some("https://a.example/person/me")).await.unwrap());
        assert!(!auth.can_read_collection(&id, Some("https://a.example/person/other")).await.unwrap());
        assert!(!auth.can_read_collection(&id, None).await.unwrap());
    }
}
