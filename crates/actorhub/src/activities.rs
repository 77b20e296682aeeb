//! C6 — Activity Side-Effect Engine. The dispatch table over Create/Update/
//! Delete/Follow/Add/Remove/Like/Announce/Block/Undo/IntransitiveActivity:
//! every POST to an outbox, and every activity accepted into an inbox, runs
//! through here.

use crate::accounts::AccountRegistry;
use crate::addressing::AddressingResolver;
use crate::auth::AuthFilter;
use crate::collections::CollectionEngine;
use crate::context::default_context;
use crate::db::now_ms;
use crate::delivery::DeliveryQueue;
use crate::error::{AppError, AppResult};
use crate::ids;
use crate::store::{is_tombstone_value, iso_ms, ObjectStore};
use serde_json::{Map, Value};
use tracing::info;

#[derive(Clone)]
pub struct ActivityEngine {
    objects: ObjectStore,
    collections: CollectionEngine,
    accounts: AccountRegistry,
    addressing: AddressingResolver,
    auth: AuthFilter,
    delivery: DeliveryQueue,
    base_url: String,
}

const KNOWN_ACTIVITY_TYPES: &[&str] = &[
    "Create",
    "Update",
    "Delete",
    "Follow",
    "Accept",
    "Reject",
    "Add",
    "Remove",
    "Like",
    "Announce",
    "Block",
    "Undo",
    "IntransitiveActivity",
];

impl ActivityEngine {
    pub fn new(
        objects: ObjectStore,
        collections: CollectionEngine,
        accounts: AccountRegistry,
        addressing: AddressingResolver,
        auth: AuthFilter,
        delivery: DeliveryQueue,
        base_url: String,
    ) -> Self {
        Self { objects, collections, accounts, addressing, auth, delivery, base_url }
    }

    /// Runs the full C2S outbox pipeline (spec §4.6 steps 1-8) for `actor_id`
    /// submitting `payload`.
    pub async fn submit_outbox(&self, actor_id: &str, payload: Value) -> AppResult<Value> {
        let obj = payload.as_object().cloned().ok_or_else(|| AppError::BadRequest("payload must be a JSON object".into()))?;
        let mut act = self.normalize_activity(obj)?;

        if let Some(id) = act.get("id").and_then(Value::as_str) {
            if self.objects.get(id).await?.is_some() {
                return Err(AppError::Conflict(format!("activity id already exists: {id}")));
            }
        }

        let activity_type = activity_type_of(&act);
        let fresh_id = ids::mint_object_iri(&self.base_url, &activity_type);
        let now = iso_ms(now_ms());
        act.insert("id".into(), Value::String(fresh_id.clone()));
        act.insert("actor".into(), Value::String(actor_id.to_string()));
        act.insert("published".into(), Value::String(now.clone()));
        act.insert("updated".into(), Value::String(now));

        self.materialize_embedded_object(actor_id, &mut act).await?;
        self.apply_outbound_effects(actor_id, &activity_type, &mut act).await?;

        let bto = act.remove("bto");
        let bcc = act.remove("bcc");
        let stored = Value::Object(act.clone());
        self.objects.put(stored.clone()).await?;

        let mut audience_for_delivery = Vec::new();
        for field in ["to", "cc", "audience"] {
            if let Some(v) = act.get(field) {
                audience_for_delivery.push(v.clone());
            }
        }
        if let Some(v) = bto {
            audience_for_delivery.push(v);
        }
        if let Some(v) = bcc {
            audience_for_delivery.push(v);
        }
        let expanded = self.addressing.expand(&audience_for_delivery).await;

        self.append_to_actor_collection(actor_id, "outbox", &fresh_id).await?;
        self.append_to_actor_collection(actor_id, "inbox", &fresh_id).await?;

        let blocked_target = if activity_type == "Block" {
            act.get("object").and_then(Value::as_str).map(str::to_string)
        } else {
            None
        };

        let mut remote_inboxes = Vec::new();
        for recipient in &expanded.actors {
            if recipient == actor_id {
                continue; // self-inbox already appended above
            }
            if blocked_target.as_deref() == Some(recipient.as_str()) {
                continue; // Block is never delivered to the blocked party
            }
            if self.is_local_actor(recipient) {
                if !self.auth.inbox_acceptable(recipient, actor_id).await? {
                    continue;
                }
                self.append_to_actor_collection(recipient, "inbox", &fresh_id).await?;
                self.apply_on_receipt(recipient, &stored).await?;
            } else {
                match self.addressing.fetch_remote_inbox(recipient).await {
                    Ok(inbox) => remote_inboxes.push(inbox),
                    Err(e) => tracing::warn!("could not resolve inbox for {recipient}: {e:#}"),
                }
            }
        }
        if !remote_inboxes.is_empty() {
            if let Err(e) = self.delivery.enqueue(actor_id, &remote_inboxes, &stored).await {
                tracing::warn!("enqueue delivery failed: {e:#}");
            }
        }

        info!(actor = actor_id, activity = %fresh_id, kind = %activity_type, "accepted outbox activity");
        Ok(stored)
    }

    /// Runs the S2S inbox acceptance pipeline for an activity a remote signer
    /// has delivered to `owner_actor_id`'s inbox. `remote_actor_id` is the
    /// verified signer; the activity's own `actor` field must match it.
    pub async fn accept_inbox(&self, owner_actor_id: &str, remote_actor_id: &str, payload: Value) -> AppResult<()> {
        let activity_id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::BadRequest("activity missing id".into()))?
            .to_string();
        let claimed_actor = payload.get("actor").and_then(Value::as_str).unwrap_or_default();
        if claimed_actor != remote_actor_id {
            return Err(AppError::Forbidden("activity actor does not match signer".into()));
        }

        if !self.auth.inbox_acceptable(owner_actor_id, remote_actor_id).await? {
            info!(owner = owner_actor_id, sender = remote_actor_id, "dropped inbox delivery from blocked sender");
            return Ok(());
        }

        if self.inbox_already_has(owner_actor_id, &activity_id).await? {
            return Ok(()); // at-most-once: already delivered
        }

        if self.objects.get(&activity_id).await?.is_none() {
            self.objects.put(payload.clone()).await?;
        }

        self.append_to_actor_collection(owner_actor_id, "inbox", &activity_id).await?;
        self.apply_on_receipt(owner_actor_id, &payload).await?;
        info!(owner = owner_actor_id, sender = remote_actor_id, activity = %activity_id, "accepted inbound activity");
        Ok(())
    }

    /// Step 1: wrap a bare (non-Activity) payload in a `Create`.
    fn normalize_activity(&self, obj: Map<String, Value>) -> AppResult<Map<String, Value>> {
        let ty = obj.get("type").and_then(Value::as_str);
        let is_known = ty.map(|t| KNOWN_ACTIVITY_TYPES.contains(&t)).unwrap_or(false);
        if is_known {
            return Ok(obj);
        }
        let mut wrapper = Map::new();
        wrapper.insert("type".into(), Value::String("Create".into()));
        if let Some(to) = obj.get("to") {
            wrapper.insert("to".into(), to.clone());
        }
        if let Some(cc) = obj.get("cc") {
            wrapper.insert("cc".into(), cc.clone());
        }
        if let Some(audience) = obj.get("audience") {
            wrapper.insert("audience".into(), audience.clone());
        }
        wrapper.insert("object".into(), Value::Object(obj));
        Ok(wrapper)
    }

    /// Step 3: for `Create`, mint and persist the embedded object, materializing
    /// its `replies`/`likes`/`shares` back-reference collections, and link
    /// `inReplyTo` into the parent's `replies`.
    async fn materialize_embedded_object(&self, actor_id: &str, act: &mut Map<String, Value>) -> AppResult<()> {
        if activity_type_of(act) != "Create" {
            return Ok(());
        }
        let Some(nested) = act.get("object").cloned() else {
            return Err(AppError::BadRequest("Create requires an object".into()));
        };
        let mut nested = nested.as_object().cloned().ok_or_else(|| AppError::BadRequest("Create object must be a JSON object".into()))?;

        let obj_type = nested.get("type").and_then(Value::as_str).unwrap_or("Object").to_string();
        let obj_id = ids::mint_object_iri(&self.base_url, &obj_type);
        let now = iso_ms(now_ms());
        nested.insert("id".into(), Value::String(obj_id.clone()));
        nested.insert("attributedTo".into(), Value::String(actor_id.to_string()));
        nested.insert("published".into(), Value::String(now.clone()));
        nested.insert("updated".into(), Value::String(now));
        if let Some(ctx) = nested.get("@context") {
            let _ = ctx; // keep caller-supplied context untouched if present
        } else {
            nested.insert("@context".into(), default_context());
        }

        let replies_id = self.collections.create(Some(actor_id), None, false).await?;
        let likes_id = self.collections.create(Some(actor_id), None, false).await?;
        let shares_id = self.collections.create(Some(actor_id), None, false).await?;
        nested.insert("replies".into(), Value::String(self.collections.collection_iri(&replies_id)));
        nested.insert("likes".into(), Value::String(self.collections.collection_iri(&likes_id)));
        nested.insert("shares".into(), Value::String(self.collections.collection_iri(&shares_id)));

        self.objects.put(Value::Object(nested.clone())).await?;

        if let Some(parent_iri) = nested.get("inReplyTo").and_then(Value::as_str) {
            if let Some(parent) = self.objects.get(parent_iri).await? {
                if let Some(replies_iri) = parent.get("replies").and_then(Value::as_str) {
                    if let Some(token) = self.local_collection_token(replies_iri) {
                        self.collections.append(&token, &obj_id).await?;
                    }
                }
            }
        }

        act.insert("object".into(), Value::String(obj_id));
        Ok(())
    }

    /// Step 4: dispatch effects that are the acting actor's own responsibility
    /// and apply immediately at submission time (everything except the
    /// delivery-triggered Follow/Like/Announce effects, see `apply_on_receipt`).
    async fn apply_outbound_effects(&self, actor_id: &str, activity_type: &str, act: &mut Map<String, Value>) -> AppResult<()> {
        match activity_type {
            "Create" => {}
            "Update" => {
                let object_val = act.get("object").cloned().ok_or_else(|| AppError::BadRequest("Update requires an object".into()))?;
                let mut fields = object_val
                    .as_object()
                    .cloned()
                    .ok_or_else(|| AppError::BadRequest("Update object must be a JSON object with id".into()))?;
                let object_id = fields
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AppError::BadRequest("Update object missing id".into()))?
                    .to_string();
                fields.remove("id");
                fields.remove("published"); // Update must never move the original published timestamp
                let target = self.objects.get(&object_id).await?.ok_or(AppError::NotFound)?;
                if target.get("attributedTo").and_then(Value::as_str) != Some(actor_id) {
                    return Err(AppError::Forbidden("cannot Update an object you do not own".into()));
                }
                self.objects.patch(&object_id, fields).await?;
                act.insert("object".into(), Value::String(object_id));
            }
            "Delete" => {
                let object_id = match act.get("object") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Object(m)) => m
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| AppError::BadRequest("Delete object missing id".into()))?,
                    _ => return Err(AppError::BadRequest("Delete requires object".into())),
                };
                let target = self.objects.get(&object_id).await?.ok_or(AppError::NotFound)?;
                if target.get("attributedTo").and_then(Value::as_str) != Some(actor_id) {
                    return Err(AppError::Forbidden("cannot Delete an object you do not own".into()));
                }
                self.objects.tombstone(&object_id).await?;
                act.insert("object".into(), Value::String(object_id));
            }
            "Add" => {
                let target_id = act.get("target").and_then(Value::as_str).ok_or_else(|| AppError::BadRequest("Add requires target".into()))?.to_string();
                let item = act.get("object").and_then(Value::as_str).ok_or_else(|| AppError::BadRequest("Add requires object".into()))?.to_string();
                let token = self
                    .local_collection_token(&target_id)
                    .ok_or_else(|| AppError::BadRequest("Add target must be a local collection".into()))?;
                if self.collections.owner(&token).await?.as_deref() != Some(actor_id) {
                    return Err(AppError::Forbidden("Add target not owned by actor".into()));
                }
                self.collections.append(&token, &item).await?;
            }
            "Remove" => {
                let target_id = act.get("target").and_then(Value::as_str).ok_or_else(|| AppError::BadRequest("Remove requires target".into()))?.to_string();
                let item = act.get("object").and_then(Value::as_str).ok_or_else(|| AppError::BadRequest("Remove requires object".into()))?.to_string();
                let token = self
                    .local_collection_token(&target_id)
                    .ok_or_else(|| AppError::BadRequest("Remove target must be a local collection".into()))?;
                if self.collections.owner(&token).await?.as_deref() != Some(actor_id) {
                    return Err(AppError::Forbidden("Remove target not owned by actor".into()));
                }
                self.collections.remove(&token, &item).await?;
            }
            "Like" => {
                let object_id = act.get("object").and_then(Value::as_str).ok_or_else(|| AppError::BadRequest("Like requires object".into()))?.to_string();
                if let Some(author) = self.object_author(&object_id).await? {
                    if self.author_has_blocked(&author, actor_id).await? {
                        return Err(AppError::BadRequest("cannot Like an object whose author has blocked you".into()));
                    }
                }
                let liked_token = self.local_collection_token_of_actor_field(actor_id, "liked").await?;
                if let Some(token) = liked_token {
                    self.collections.append(&token, &object_id).await?;
                }
            }
            "Announce" => {}
            "Follow" => {}
            "Block" => {
                let target_actor = act.get("object").and_then(Value::as_str).ok_or_else(|| AppError::BadRequest("Block requires object actor".into()))?.to_string();
                if let Some(token) = self.local_collection_token_of_actor_field(actor_id, "blocked").await? {
                    self.collections.append(&token, &target_actor).await?;
                }
                self.remove_follow_edge(&target_actor, actor_id).await?;
                self.remove_follow_edge(actor_id, &target_actor).await?;
            }
            "Undo" => {
                self.apply_undo(actor_id, act).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn apply_undo(&self, actor_id: &str, act: &Map<String, Value>) -> AppResult<()> {
        let undone = act.get("object").cloned().ok_or_else(|| AppError::BadRequest("Undo requires object".into()))?;
        let undone = undone.as_object().cloned().ok_or_else(|| AppError::BadRequest("Undo object must be an activity".into()))?;
        if undone.get("actor").and_then(Value::as_str) != Some(actor_id) {
            return Err(AppError::Forbidden("can only Undo your own activity".into()));
        }
        let undone_type = undone.get("type").and_then(Value::as_str).unwrap_or_default();
        match undone_type {
            "Like" => {
                let object_id = undone.get("object").and_then(Value::as_str).unwrap_or_default().to_string();
                if let Some(token) = self.local_collection_token_of_actor_field(actor_id, "liked").await? {
                    self.collections.remove(&token, &object_id).await?;
                }
                if let Some(obj) = self.objects.get(&object_id).await? {
                    if let Some(likes_iri) = obj.get("likes").and_then(Value::as_str) {
                        if let Some(token) = self.local_collection_token(likes_iri) {
                            if let Some(like_id) = undone.get("id").and_then(Value::as_str) {
                                self.collections.remove(&token, like_id).await?;
                            }
                        }
                    }
                }
            }
            "Follow" => {
                let followee = undone.get("object").and_then(Value::as_str).unwrap_or_default().to_string();
                self.remove_follow_edge(actor_id, &followee).await?;
            }
            "Block" => {
                let target_actor = undone.get("object").and_then(Value::as_str).unwrap_or_default().to_string();
                if let Some(token) = self.local_collection_token_of_actor_field(actor_id, "blocked").await? {
                    self.collections.remove(&token, &target_actor).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Effects that fire when `activity` actually lands in `owner_actor_id`'s
    /// inbox (local fanout or S2S acceptance) rather than at submission time:
    /// Follow edge creation + Accept synthesis, Like/Announce back-references.
    async fn apply_on_receipt(&self, owner_actor_id: &str, activity: &Value) -> AppResult<()> {
        let ty = activity.get("type").and_then(Value::as_str).unwrap_or_default();
        let sender = activity.get("actor").and_then(Value::as_str).unwrap_or_default().to_string();

        match ty {
            "Follow" => {
                if activity.get("object").and_then(Value::as_str) == Some(owner_actor_id) {
                    self.add_follow_edge(&sender, owner_actor_id).await?;
                    self.send_accept_follow(owner_actor_id, &sender, activity).await?;
                }
            }
            "Like" => {
                if let Some(object_id) = activity.get("object").and_then(Value::as_str) {
                    if self.object_author(object_id).await?.as_deref() == Some(owner_actor_id) {
                        if let Some(obj) = self.objects.get(object_id).await? {
                            if let Some(likes_iri) = obj.get("likes").and_then(Value::as_str) {
                                if let Some(token) = self.local_collection_token(likes_iri) {
                                    if let Some(activity_id) = activity.get("id").and_then(Value::as_str) {
                                        self.collections.append(&token, activity_id).await?;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            "Announce" => {
                if let Some(object_id) = activity.get("object").and_then(Value::as_str) {
                    if self.object_author(object_id).await?.as_deref() == Some(owner_actor_id) {
                        if let Some(obj) = self.objects.get(object_id).await? {
                            if let Some(shares_iri) = obj.get("shares").and_then(Value::as_str) {
                                if let Some(token) = self.local_collection_token(shares_iri) {
                                    if let Some(activity_id) = activity.get("id").and_then(Value::as_str) {
                                        self.collections.append(&token, activity_id).await?;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn send_accept_follow(&self, followee: &str, follower: &str, follow_activity: &Value) -> AppResult<()> {
        let accept_id = ids::mint_object_iri(&self.base_url, "Accept");
        let accept = serde_json::json!({
            "id": accept_id,
            "type": "Accept",
            "actor": followee,
            "object": follow_activity,
            "to": [follower],
            "published": iso_ms(now_ms()),
        });
        self.objects.put(accept.clone()).await?;
        self.append_to_actor_collection(followee, "outbox", &accept_id).await?;

        if self.is_local_actor(follower) {
            self.append_to_actor_collection(follower, "inbox", &accept_id).await?;
        } else if let Ok(inbox) = self.addressing.fetch_remote_inbox(follower).await {
            let _ = self.delivery.enqueue(followee, &[inbox], &accept).await;
        }
        Ok(())
    }

    async fn add_follow_edge(&self, follower: &str, followee: &str) -> AppResult<()> {
        if let Some(token) = self.local_collection_token_of_actor_field(followee, "followers").await? {
            self.collections.append(&token, follower).await?;
        }
        if let Some(token) = self.local_collection_token_of_actor_field(follower, "following").await? {
            self.collections.append(&token, followee).await?;
        }
        Ok(())
    }

    async fn remove_follow_edge(&self, follower: &str, followee: &str) -> AppResult<()> {
        if let Some(token) = self.local_collection_token_of_actor_field(followee, "followers").await? {
            self.collections.remove(&token, follower).await?;
        }
        if let Some(token) = self.local_collection_token_of_actor_field(follower, "following").await? {
            self.collections.remove(&token, followee).await?;
        }
        Ok(())
    }

    async fn object_author(&self, object_id: &str) -> AppResult<Option<String>> {
        Ok(self
            .objects
            .get(object_id)
            .await?
            .and_then(|v| v.get("attributedTo").and_then(Value::as_str).map(str::to_string)))
    }

    async fn author_has_blocked(&self, author: &str, maybe_blocked: &str) -> AppResult<bool> {
        if let Some(author_doc) = self.objects.get(author).await? {
            if let Some(blocked_iri) = author_doc.get("blocked").and_then(Value::as_str) {
                if let Some(token) = self.local_collection_token(blocked_iri) {
                    return self.collections.contains(&token, maybe_blocked).await;
                }
            }
        }
        Ok(false)
    }

    /// Only valid for local actors (needed to look up and own their collections).
    async fn local_collection_token_of_actor_field(&self, actor_id: &str, field: &str) -> AppResult<Option<String>> {
        let Some(actor) = self.objects.get(actor_id).await? else {
            return Ok(None);
        };
        let Some(iri) = actor.get(field).and_then(Value::as_str) else {
            return Ok(None);
        };
        Ok(self.local_collection_token(iri))
    }

    async fn append_to_actor_collection(&self, actor_id: &str, field: &str, item_iri: &str) -> AppResult<()> {
        if let Some(token) = self.local_collection_token_of_actor_field(actor_id, field).await? {
            self.collections.append(&token, item_iri).await?;
        }
        Ok(())
    }

    async fn inbox_already_has(&self, actor_id: &str, item_iri: &str) -> AppResult<bool> {
        match self.local_collection_token_of_actor_field(actor_id, "inbox").await? {
            Some(token) => self.collections.contains(&token, item_iri).await,
            None => Ok(false),
        }
    }

    fn is_local_actor(&self, iri: &str) -> bool {
        iri.starts_with(&format!("{}/person/", self.base_url.trim_end_matches('/')))
    }

    fn local_collection_token(&self, iri: &str) -> Option<String> {
        let prefix = format!("{}/orderedcollection/", self.base_url.trim_end_matches('/'));
        iri.strip_prefix(&prefix).map(str::to_string)
    }
}

fn activity_type_of(act: &Map<String, Value>) -> String {
    act.get("type").and_then(Value::as_str).unwrap_or("Activity").to_string()
}

pub fn is_activity_tombstone(v: &Value) -> bool {
    is_tombstone_value(v)
}
