//! Fixed JSON-LD context and well-known IRI constants.
//!
//! This server recognizes exactly one `@context` shape; it never runs a
//! general JSON-LD processor (see Non-goals).

pub const PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

pub const AS2: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY: &str = "https://w3id.org/security";
pub const BLOCKED_EXT: &str = "https://purl.archive.org/socialweb/blocked";

/// The `@context` array sent on every outgoing Actor/Collection/Activity payload.
pub fn default_context() -> serde_json::Value {
    serde_json::json!([AS2, SECURITY, BLOCKED_EXT])
}

pub const ACTIVITY_JSON: &str = "application/activity+json; charset=utf-8";
pub const JRD_JSON: &str = "application/jrd+json; charset=utf-8";
