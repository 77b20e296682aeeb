//! C5 — Addressing Resolver. Expands `to/cc/bto/bcc/audience` into a concrete
//! set of actor IRIs, following public, followers, following, and embedded
//! collections.

use crate::collections::CollectionEngine;
use crate::context::PUBLIC;
use crate::http_retry::send_with_retry;
use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Clone)]
pub struct AddressingResolver {
    collections: CollectionEngine,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Default, Debug, Clone)]
pub struct Audience {
    pub public: bool,
    pub actors: HashSet<String>,
}

impl Audience {
    pub fn contains(&self, actor: &str) -> bool {
        self.actors.contains(actor)
    }
}

#[derive(Debug, Deserialize)]
struct RemoteDoc {
    #[serde(rename = "type", default)]
    ty: TypeField,
    #[serde(default)]
    items: Vec<Value>,
    #[serde(rename = "orderedItems", default)]
    ordered_items: Vec<Value>,
}

#[derive(Debug, Default)]
struct TypeField(Vec<String>);

impl<'de> serde::Deserialize<'de> for TypeField {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = Value::deserialize(d)?;
        let out = match v {
            Value::String(s) => vec![s],
            Value::Array(a) => a.into_iter().filter_map(|x| x.as_str().map(str::to_string)).collect(),
            _ => Vec::new(),
        };
        Ok(TypeField(out))
    }
}

impl AddressingResolver {
    pub fn new(collections: CollectionEngine, base_url: String) -> Self {
        Self {
            collections,
            base_url,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Flattens the given `to/cc/bto/bcc/audience` values (each may itself be
    /// a string or an array) into a single recipient audience.
    pub async fn expand(&self, values: &[Value]) -> Audience {
        let mut flat = Vec::new();
        for v in values {
            flatten_into(v, &mut flat);
        }

        let mut audience = Audience::default();
        for iri in flat {
            if iri == PUBLIC {
                audience.public = true;
                continue;
            }
            self.expand_one(&iri, &mut audience).await;
        }
        audience
    }

    async fn expand_one(&self, iri: &str, out: &mut Audience) {
        if let Some(token) = self.local_collection_token(iri) {
            if let Ok(items) = self.local_collection_members(&token).await {
                out.actors.extend(items);
            }
            return;
        }

        if self.is_local(iri) {
            // A local actor (or any other local object) IRI addresses that entity directly.
            out.actors.insert(iri.to_string());
            return;
        }

        match self.dereference_remote(iri).await {
            Ok(Expanded::Actor) => {
                out.actors.insert(iri.to_string());
            }
            Ok(Expanded::Collection(members)) => {
                out.actors.extend(members);
            }
            Err(_) => {
                // Remote collections/actors whose dereference fails are treated as empty.
            }
        }
    }

    fn is_local(&self, iri: &str) -> bool {
        iri.starts_with(self.base_url.trim_end_matches('/'))
    }

    fn local_collection_token(&self, iri: &str) -> Option<String> {
        let prefix = format!("{}/orderedcollection/", self.base_url.trim_end_matches('/'));
        iri.strip_prefix(&prefix).map(|s| s.to_string())
    }

    async fn local_collection_members(&self, token: &str) -> Result<Vec<String>> {
        self.collections.all_members(token).await.map_err(|e| anyhow::anyhow!("{e}"))
    }

    async fn dereference_remote(&self, iri: &str) -> Result<Expanded> {
        let resp = send_with_retry(
            || {
                self.http.get(iri).header(
                    "Accept",
                    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
                )
            },
            3,
        )
        .await?
        .error_for_status()?;
        let text = resp.text().await?;
        let doc: RemoteDoc = serde_json::from_str(&text)?;
        let is_collection = doc
            .ty
            .0
            .iter()
            .any(|t| t == "OrderedCollection" || t == "Collection" || t == "OrderedCollectionPage" || t == "CollectionPage");
        if is_collection {
            let mut members = Vec::new();
            for v in doc.items.into_iter().chain(doc.ordered_items.into_iter()) {
                if let Some(s) = v.as_str() {
                    members.push(s.to_string());
                }
            }
            Ok(Expanded::Collection(members))
        } else {
            Ok(Expanded::Actor)
        }
    }

    /// Dereferences a remote actor document once and returns its `inbox` IRI,
    /// used by C6/C7 to resolve a recipient's delivery target.
    pub async fn fetch_remote_inbox(&self, actor_iri: &str) -> Result<String> {
        let resp = send_with_retry(
            || {
                self.http.get(actor_iri).header(
                    "Accept",
                    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
                )
            },
            3,
        )
        .await?
        .error_for_status()?;
        let text = resp.text().await?;
        let v: Value = serde_json::from_str(&text)?;
        v.get("inbox")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("actor {actor_iri} missing inbox"))
    }
}

enum Expanded {
    Actor,
    Collection(Vec<String>),
}

fn flatten_into(v: &Value, out: &mut Vec<String>) {
    match v {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        Value::Object(obj) => {
            if let Some(id) = obj.get("id").and_then(Value::as_str) {
                out.push(id.to_string());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn resolver() -> AddressingResolver {
        let db = test_db();
        let collections = CollectionEngine::new(db, "https://a.example".into(), 20);
        AddressingResolver::new(collections, "https://a.example".into())
    }

    #[tokio::test]
    async fn public_iri_sets_public_flag() {
        let r = resolver();
        let a = r.expand(&[Value::String(PUBLIC.to_string())]).await;
        assert!(a.public);
        assert!(a.actors.is_empty());
    }

    #[tokio::test]
    async fn local_actor_iri_expands_to_itself() {
        let r = resolver();
        let a = r.expand(&[Value::String("https://a.example/person/abc".into())]).await;
        assert!(a.actors.contains("https://a.example/person/abc"));
    }

    #[tokio::test]
    async fn local_followers_collection_inlines_members() {
        let db = test_db();
        let collections = CollectionEngine::new(db, "https://a.example".into(), 20);
        let followers_id = collections.create(None, None, false).await.unwrap();
        collections.append(&followers_id, "https://b.example/person/1").await.unwrap();
        collections.append(&followers_id, "https://c.example/person/2").await.unwrap();

        let r = AddressingResolver::new(collections.clone(), "https://a.example".into());
        let followers_iri = collections.collection_iri(&followers_id);
        let a = r.expand(&[Value::String(followers_iri)]).await;
        assert_eq!(a.actors.len(), 2);
        assert!(a.actors.contains("https://b.example/person/1"));
    }

    #[tokio::test]
    async fn nested_arrays_are_flattened() {
        let r = resolver();
        let v = serde_json::json!([
            "https://a.example/person/x",
            ["https://a.example/person/y", "https://a.example/person/x"]
        ]);
        let a = r.expand(&[v]).await;
        assert_eq!(a.actors.len(), 2);
    }
}
