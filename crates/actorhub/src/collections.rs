//! C2 — Collection Engine. Append-only ordered collections with paged reads,
//! membership tests, and totals.
//!
//! Pages are virtual slices over a single ordered `collection_items` table
//! (see SPEC_FULL.md §4.2) rather than physically rotated page rows: `append`
//! and `remove` stay O(1) regardless of collection size.

use crate::auth::AuthFilter;
use crate::db::{now_ms, Db};
use crate::error::AppError;
use crate::ids;
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

#[derive(Clone)]
pub struct CollectionEngine {
    db: Db,
    base_url: String,
    page_size: u32,
}

pub struct Page {
    pub items: Vec<String>,
    pub total_items: u64,
    pub part_of: String,
    pub next: Option<String>,
    pub prev: Option<String>,
}

impl CollectionEngine {
    pub fn new(db: Db, base_url: String, page_size: u32) -> Self {
        Self { db, base_url, page_size: page_size.max(1) }
    }

    pub fn collection_iri(&self, id: &str) -> String {
        format!("{}/orderedcollection/{}", self.base_url.trim_end_matches('/'), id)
    }

    pub fn page_iri(&self, id: &str, page: u64) -> String {
        format!(
            "{}/orderedcollectionpage/{}?page={}",
            self.base_url.trim_end_matches('/'),
            id,
            page
        )
    }

    /// Creates a new collection, returning its bare id token (not the full IRI).
    pub async fn create(&self, owner: Option<&str>, name_map: Option<Value>, private: bool) -> Result<String, AppError> {
        let id = ids::random_token();
        let db = self.db.clone();
        let owner = owner.map(|s| s.to_string());
        let name_json = name_map.map(|v| v.to_string());
        let now = now_ms();
        let id2 = id.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "INSERT INTO collections (id, owner, private, name_map, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id2, owner, private as i64, name_json, now],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;
        Ok(id)
    }

    /// Idempotent by item IRI. No-op if the item is already a member.
    pub async fn append(&self, collection_id: &str, item_iri: &str) -> Result<(), AppError> {
        let db = self.db.clone();
        let collection_id = collection_id.to_string();
        let item_iri = item_iri.to_string();
        let now = now_ms();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "INSERT OR IGNORE INTO collection_items (collection_id, item_iri, created_at_ms) VALUES (?1, ?2, ?3)",
                params![collection_id, item_iri, now],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)
    }

    pub async fn remove(&self, collection_id: &str, item_iri: &str) -> Result<(), AppError> {
        let db = self.db.clone();
        let collection_id = collection_id.to_string();
        let item_iri = item_iri.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "DELETE FROM collection_items WHERE collection_id = ?1 AND item_iri = ?2",
                params![collection_id, item_iri],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)
    }

    pub async fn contains(&self, collection_id: &str, item_iri: &str) -> Result<bool, AppError> {
        let db = self.db.clone();
        let collection_id = collection_id.to_string();
        let item_iri = item_iri.to_string();
        let found: Option<i64> = tokio::task::spawn_blocking(move || -> Result<Option<i64>> {
            let conn = db.connect()?;
            let v = conn
                .query_row(
                    "SELECT 1 FROM collection_items WHERE collection_id = ?1 AND item_iri = ?2",
                    params![collection_id, item_iri],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(v)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;
        Ok(found.is_some())
    }

    pub async fn total_items(&self, collection_id: &str) -> Result<u64, AppError> {
        let db = self.db.clone();
        let collection_id = collection_id.to_string();
        let total: i64 = tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = db.connect()?;
            let v = conn.query_row(
                "SELECT COUNT(*) FROM collection_items WHERE collection_id = ?1",
                params![collection_id],
                |r| r.get(0),
            )?;
            Ok(v)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;
        Ok(total.max(0) as u64)
    }

    pub async fn is_private(&self, collection_id: &str) -> Result<bool, AppError> {
        let db = self.db.clone();
        let cid = collection_id.to_string();
        let private: Option<i64> = tokio::task::spawn_blocking(move || -> Result<Option<i64>> {
            let conn = db.connect()?;
            let v = conn
                .query_row("SELECT private FROM collections WHERE id = ?1", params![cid], |r| r.get(0))
                .optional()?;
            Ok(v)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;
        Ok(private.unwrap_or(0) != 0)
    }

    pub async fn owner(&self, collection_id: &str) -> Result<Option<String>, AppError> {
        let db = self.db.clone();
        let cid = collection_id.to_string();
        let owner: Option<String> = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = db.connect()?;
            let v = conn
                .query_row("SELECT owner FROM collections WHERE id = ?1", params![cid], |r| r.get(0))
                .optional()?;
            Ok(v)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;
        Ok(owner)
    }

    /// Returns every member IRI, unfiltered by authorization. Used by the addressing
    /// resolver when inlining a local collection — recipient expansion is not a
    /// reader-facing view, so the per-viewer auth filter in [`Self::page`] does not apply.
    pub async fn all_members(&self, collection_id: &str) -> Result<Vec<String>, AppError> {
        let db = self.db.clone();
        let cid = collection_id.to_string();
        let items: Vec<String> = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = db.connect()?;
            let mut stmt = conn.prepare(
                "SELECT item_iri FROM collection_items WHERE collection_id = ?1 ORDER BY seq DESC",
            )?;
            let rows = stmt.query_map(params![cid], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;
        Ok(items)
    }

    /// Returns the raw LIFO-ordered item IRIs for `page_no` (0-based), unfiltered by authorization.
    async fn raw_page(&self, collection_id: &str, page_no: u64) -> Result<Vec<String>, AppError> {
        let db = self.db.clone();
        let cid = collection_id.to_string();
        let limit = self.page_size as i64;
        let offset = (page_no * self.page_size as u64) as i64;
        let items: Vec<String> = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = db.connect()?;
            let mut stmt = conn.prepare(
                "SELECT item_iri FROM collection_items WHERE collection_id = ?1 ORDER BY seq DESC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(params![cid, limit, offset], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Internal)?;
        Ok(items)
    }

    /// Reads a page, applying the authorization filter per item (failing items are silently
    /// dropped), while `total_items` still reflects the whole collection (per the resolved
    /// Open Question in SPEC_FULL.md §9: unfiltered count).
    pub async fn page(
        &self,
        collection_id: &str,
        page_no: u64,
        viewer: Option<&str>,
        auth: &AuthFilter,
    ) -> Result<Page, AppError> {
        let raw = self.raw_page(collection_id, page_no).await?;
        let total = self.total_items(collection_id).await?;

        let mut items = Vec::with_capacity(raw.len());
        for iri in raw {
            if auth.can_read_item_iri(&iri, viewer).await? {
                items.push(iri);
            }
        }

        let has_more = (page_no + 1) * self.page_size as u64 < total;
        let next = if has_more {
            Some(self.page_iri(collection_id, page_no + 1))
        } else {
            None
        };
        let prev = if page_no > 0 {
            Some(self.page_iri(collection_id, page_no - 1))
        } else {
            None
        };

        Ok(Page {
            items,
            total_items: total,
            part_of: self.collection_iri(collection_id),
            next,
            prev,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountRegistry;
    use crate::store::ObjectStore;

    fn engine() -> CollectionEngine {
        CollectionEngine::new(crate::db::test_db(), "https://example.com".into(), 2)
    }

    #[tokio::test]
    async fn append_is_idempotent_and_lifo() {
        let e = engine();
        let id = e.create(None, None, false).await.unwrap();
        e.append(&id, "a").await.unwrap();
        e.append(&id, "b").await.unwrap();
        e.append(&id, "a").await.unwrap();
        assert_eq!(e.total_items(&id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn remove_preserves_other_items() {
        let e = engine();
        let id = e.create(None, None, false).await.unwrap();
        e.append(&id, "a").await.unwrap();
        e.append(&id, "b").await.unwrap();
        e.remove(&id, "a").await.unwrap();
        assert!(!e.contains(&id, "a").await.unwrap());
        assert!(e.contains(&id, "b").await.unwrap());
        assert_eq!(e.total_items(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn page_rolls_over_at_capacity() {
        let db = crate::db::test_db();
        let e = CollectionEngine::new(db.clone(), "https://example.com".into(), 2);
        let objects = ObjectStore::new(db.clone());
        let accounts = AccountRegistry::new(db.clone(), "https://example.com".into());
        let auth = AuthFilter::new(objects, e.clone(), accounts);

        let id = e.create(None, None, false).await.unwrap();
        e.append(&id, "1").await.unwrap();
        e.append(&id, "2").await.unwrap();
        e.append(&id, "3").await.unwrap();

        let first = e.page(&id, 0, None, &auth).await.unwrap();
        assert_eq!(first.items, vec!["3", "2"]);
        assert!(first.next.is_some());
        assert!(first.prev.is_none());

        let second = e.page(&id, 1, None, &auth).await.unwrap();
        assert_eq!(second.items, vec!["1"]);
        assert!(second.next.is_none());
        assert!(second.prev.is_some());
    }
}
