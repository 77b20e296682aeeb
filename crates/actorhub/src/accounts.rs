//! C3 — Actor Registry & Registration. Turns a username/password pair into a
//! freshly minted local actor (keypair, seven collections, bearer token) and
//! answers the WebFinger / token lookups the HTTP surface needs.

use crate::collections::CollectionEngine;
use crate::context::{ACTIVITY_JSON, AS2, SECURITY};
use crate::db::{now_ms, Db};
use crate::error::{AppError, AppResult};
use crate::ids;
use crate::keys;
use anyhow::Result;
use argon2::password_hash::{rand_core::OsRng as PhOsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rusqlite::{params, OptionalExtension};
use serde_json::{json, Value};

const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Clone)]
pub struct AccountRegistry {
    db: Db,
    base_url: String,
    objects: crate::store::ObjectStore,
    collections: CollectionEngine,
}

pub struct Registered {
    pub username: String,
    pub actor_id: String,
    pub token: String,
}

impl AccountRegistry {
    pub fn new(db: Db, base_url: String) -> Self {
        let objects = crate::store::ObjectStore::new(db.clone());
        let collections = CollectionEngine::new(db.clone(), base_url.clone(), DEFAULT_PAGE_SIZE);
        Self { db, base_url, objects, collections }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn objects(&self) -> &crate::store::ObjectStore {
        &self.objects
    }

    pub fn collections(&self) -> &CollectionEngine {
        &self.collections
    }

    /// Registers a new local actor. Generates its RSA keypair, mints its
    /// actor IRI and seven owned collections, hashes the password with
    /// `argon2`, and mints an opaque bearer token.
    pub async fn register(&self, username: &str, password: &str, confirmation: &str) -> AppResult<Registered> {
        if !valid_username(username) {
            return Err(AppError::BadRequest("username must match [A-Za-z0-9_]{1,32}".into()));
        }
        if password != confirmation {
            return Err(AppError::BadRequest("password confirmation does not match".into()));
        }
        if self.find_username(username).await?.is_some() {
            return Err(AppError::Conflict(format!("username already taken: {username}")));
        }

        let keypair = keys::generate_keypair().map_err(AppError::Internal)?;
        let actor_id = ids::mint_actor_iri(&self.base_url);

        let inbox = self.collections.create(Some(&actor_id), None, false).await?;
        let outbox = self.collections.create(Some(&actor_id), None, false).await?;
        let followers = self.collections.create(Some(&actor_id), None, false).await?;
        let following = self.collections.create(Some(&actor_id), None, false).await?;
        let liked = self.collections.create(Some(&actor_id), None, false).await?;
        let blocked = self.collections.create(Some(&actor_id), None, true).await?;

        let actor_doc = json!({
            "@context": [AS2, SECURITY],
            "id": actor_id,
            "type": "Person",
            "preferredUsername": username,
            "inbox": self.collections.collection_iri(&inbox),
            "outbox": self.collections.collection_iri(&outbox),
            "followers": self.collections.collection_iri(&followers),
            "following": self.collections.collection_iri(&following),
            "liked": self.collections.collection_iri(&liked),
            "blocked": self.collections.collection_iri(&blocked),
            "publicKey": {
                "id": format!("{actor_id}#main-key"),
                "owner": actor_id,
                "type": "Key",
                "publicKeyPem": keypair.public_key_pem,
            },
        });
        self.objects.put(actor_doc).await?;

        let password_hash = hash_password(password).map_err(AppError::Internal)?;
        let token = ids::random_token();

        let db = self.db.clone();
        let username_owned = username.to_string();
        let actor_id_owned = actor_id.clone();
        let token_owned = token.clone();
        let private_key_pem = keypair.private_key_pem.clone();
        let now = now_ms();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "INSERT INTO accounts (username, actor_id, password_hash, token, private_key_pem, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![username_owned, actor_id_owned, password_hash, token_owned, private_key_pem, now],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;

        Ok(Registered { username: username.to_string(), actor_id, token })
    }

    /// `acct:<username>@<host>` → `{rel:"self", href: actorId}`, the single
    /// link WebFinger resolution here exposes.
    pub async fn webfinger(&self, resource: &str) -> AppResult<Value> {
        let username = resource
            .strip_prefix("acct:")
            .and_then(|rest| rest.split('@').next())
            .ok_or_else(|| AppError::BadRequest("malformed resource, expected acct:user@host".into()))?;
        let actor_id = self
            .find_username(username)
            .await?
            .ok_or(AppError::NotFound)?;
        Ok(json!({
            "subject": resource,
            "links": [{
                "rel": "self",
                "type": ACTIVITY_JSON,
                "href": actor_id,
            }]
        }))
    }

    pub async fn auth_by_token(&self, token: &str) -> AppResult<String> {
        let db = self.db.clone();
        let token = token.to_string();
        let actor_id: Option<String> = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = db.connect()?;
            let v = conn
                .query_row("SELECT actor_id FROM accounts WHERE token = ?1", params![token], |r| r.get(0))
                .optional()?;
            Ok(v)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;
        actor_id.ok_or_else(|| AppError::Unauthorized("invalid bearer token".into()))
    }

    pub async fn verify_password(&self, username: &str, password: &str) -> AppResult<bool> {
        let db = self.db.clone();
        let username = username.to_string();
        let hash: Option<String> = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = db.connect()?;
            let v = conn
                .query_row("SELECT password_hash FROM accounts WHERE username = ?1", params![username], |r| r.get(0))
                .optional()?;
            Ok(v)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;
        match hash {
            Some(h) => Ok(verify_password(password, &h).is_ok()),
            None => Ok(false),
        }
    }

    pub async fn private_key_for_actor(&self, actor_id: &str) -> AppResult<Option<String>> {
        let db = self.db.clone();
        let actor_id = actor_id.to_string();
        let pem: Option<String> = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = db.connect()?;
            let v = conn
                .query_row(
                    "SELECT private_key_pem FROM accounts WHERE actor_id = ?1",
                    params![actor_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(v)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;
        Ok(pem)
    }

    async fn find_username(&self, username: &str) -> AppResult<Option<String>> {
        let db = self.db.clone();
        let username = username.to_string();
        let v: Option<String> = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = db.connect()?;
            let v = conn
                .query_row("SELECT actor_id FROM accounts WHERE username = ?1", params![username], |r| r.get(0))
                .optional()?;
            Ok(v)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;
        Ok(v)
    }
}

fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= 32
        && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut PhOsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash password: {e}"))?;
    Ok(hash.to_string())
}

fn verify_password(password: &str, stored_hash: &str) -> Result<()> {
    let parsed = PasswordHash::new(stored_hash).map_err(|e| anyhow::anyhow!("parse hash: {e}"))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|e| anyhow::anyhow!("verify password: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn registry() -> AccountRegistry {
        AccountRegistry::new(test_db(), "https://a.example".into())
    }

    #[tokio::test]
    async fn register_creates_actor_with_seven_fields() {
        let r = registry();
        let reg = r.register("alice", "hunter2", "hunter2").await.unwrap();
        let actor = r.objects().get(&reg.actor_id).await.unwrap().unwrap();
        assert_eq!(actor["type"], "Person");
        assert!(actor.get("inbox").is_some());
        assert!(actor.get("publicKey").is_some());
    }

    #[tokio::test]
    async fn register_rejects_bad_username() {
        let r = registry();
        let err = r.register("alice bob", "x", "x").await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn register_rejects_mismatched_confirmation() {
        let r = registry();
        let err = r.register("alice", "x", "y").await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn register_rejects_duplicate_username() {
        let r = registry();
        r.register("alice", "x", "x").await.unwrap();
        let err = r.register("alice", "y", "y").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn token_resolves_to_actor() {
        let r = registry();
        let reg = r.register("alice", "hunter2", "hunter2").await.unwrap();
        let actor_id = r.auth_by_token(&reg.token).await.unwrap();
        assert_eq!(actor_id, reg.actor_id);
    }

    #[tokio::test]
    async fn webfinger_resolves_registered_username() {
        let r = registry();
        let reg = r.register("alice", "hunter2", "hunter2").await.unwrap();
        let doc = r.webfinger("acct:alice@a.example").await.unwrap();
        assert_eq!(doc["links"][0]["href"], reg.actor_id);
    }

    #[tokio::test]
    async fn password_round_trips_through_argon2() {
        let r = registry();
        r.register("alice", "hunter2", "hunter2").await.unwrap();
        assert!(r.verify_password("alice", "hunter2").await.unwrap());
        assert!(!r.verify_password("alice", "wrong").await.unwrap());
    }
}
