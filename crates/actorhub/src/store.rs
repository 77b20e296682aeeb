//! C1 — Object Store. Persists ActivityStreams objects by IRI, CRUD with
//! tombstoning. Objects are kept as opaque JSON (a property bag) rather than
//! a closed Rust struct, per the "dynamic object shapes" design note.

use crate::db::{now_ms, Db};
use crate::error::AppError;
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value};

#[derive(Clone)]
pub struct ObjectStore {
    db: Db,
}

impl ObjectStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Inserts a new object keyed by its `id`. Fails `Conflict` if the id exists.
    pub async fn put(&self, obj: Value) -> Result<Value, AppError> {
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::BadRequest("object missing id".into()))?
            .to_string();
        let db = self.db.clone();
        let now = now_ms();
        let json = serde_json::to_string(&obj).map_err(|e| AppError::Internal(e.into()))?;
        tokio::task::spawn_blocking(move || -> Result<(), AppError> {
            let conn = db.connect().map_err(AppError::Internal)?;
            let existing: Option<i64> = conn
                .query_row("SELECT 1 FROM objects WHERE id = ?1", params![id], |r| r.get(0))
                .optional()
                .map_err(|e| AppError::Internal(e.into()))?;
            if existing.is_some() {
                return Err(AppError::Conflict(format!("object already exists: {id}")));
            }
            conn.execute(
                "INSERT INTO objects (id, json, created_at_ms, updated_at_ms, deleted) VALUES (?1, ?2, ?3, ?3, 0)",
                params![id, json, now],
            )
            .map_err(|e| AppError::Internal(e.into()))?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))??;
        Ok(obj)
    }

    /// Fetches the full object payload, including a Tombstone's residual body.
    pub async fn get(&self, id: &str) -> Result<Option<Value>, AppError> {
        let db = self.db.clone();
        let id = id.to_string();
        let row: Option<String> = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = db.connect()?;
            let v = conn
                .query_row("SELECT json FROM objects WHERE id = ?1", params![id], |r| r.get(0))
                .optional()?;
            Ok(v)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;

        match row {
            Some(json) => {
                let v: Value = serde_json::from_str(&json).map_err(|e| AppError::Internal(e.into()))?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    pub async fn is_tombstone(&self, id: &str) -> Result<bool, AppError> {
        match self.get(id).await? {
            Some(v) => Ok(is_tombstone_value(&v)),
            None => Ok(false),
        }
    }

    /// Shallow-merges `fields` into the stored object. Properties set to
    /// `null` are removed; other properties replace. Bumps `updated`.
    pub async fn patch(&self, id: &str, fields: Map<String, Value>) -> Result<Value, AppError> {
        let current = self.get(id).await?.ok_or(AppError::NotFound)?;
        if is_tombstone_value(&current) {
            return Err(AppError::Gone(current));
        }
        let mut obj = current.as_object().cloned().ok_or_else(|| AppError::BadRequest("stored object not a map".into()))?;
        for (k, v) in fields {
            if v.is_null() {
                obj.remove(&k);
            } else {
                obj.insert(k, v);
            }
        }
        let now = now_ms();
        obj.insert("updated".to_string(), Value::String(iso_ms(now)));
        let merged = Value::Object(obj);
        self.replace(id, &merged).await?;
        Ok(merged)
    }

    /// Transitions the object at `id` to a `Tombstone`, preserving only
    /// `id`, `published`, `formerType`, `deleted`, `updated`, `summaryMap`.
    pub async fn tombstone(&self, id: &str) -> Result<Value, AppError> {
        let current = self.get(id).await?.ok_or(AppError::NotFound)?;
        if is_tombstone_value(&current) {
            return Err(AppError::Gone(current));
        }
        let former_type = current.get("type").cloned().unwrap_or(Value::String("Object".into()));
        let published = current.get("published").cloned();
        let now = now_ms();
        let now_iso = iso_ms(now);

        let mut out = Map::new();
        out.insert("id".to_string(), Value::String(id.to_string()));
        out.insert("type".to_string(), Value::String("Tombstone".into()));
        out.insert("formerType".to_string(), former_type);
        if let Some(p) = published {
            out.insert("published".to_string(), p);
        }
        out.insert("deleted".to_string(), Value::String(now_iso.clone()));
        out.insert("updated".to_string(), Value::String(now_iso));
        out.insert(
            "summaryMap".to_string(),
            serde_json::json!({ "en": "This object has been deleted" }),
        );

        let tomb = Value::Object(out);
        self.replace(id, &tomb).await?;
        Ok(tomb)
    }

    async fn replace(&self, id: &str, obj: &Value) -> Result<(), AppError> {
        let db = self.db.clone();
        let id = id.to_string();
        let json = serde_json::to_string(obj).map_err(|e| AppError::Internal(e.into()))?;
        let now = now_ms();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "UPDATE objects SET json = ?1, updated_at_ms = ?2 WHERE id = ?3",
                params![json, now, id],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)
    }
}

pub fn is_tombstone_value(v: &Value) -> bool {
    v.get("type").and_then(Value::as_str) == Some("Tombstone")
}

pub fn iso_ms(ms: i64) -> String {
    // RFC3339 without external crate dependency, seconds resolution (AS2 timestamps are commonly second-precision).
    httpdate::fmt_http_date(std::time::UNIX_EPOCH + std::time::Duration::from_millis(ms as u64))
        .replace("GMT", "")
        .trim()
        .to_string()
}
