//! C7 — Federated Delivery Queue. A durable, SQLite-backed queue of signed
//! POSTs to remote inboxes. Generalized from the teacher's `delivery_queue.rs`:
//! the P2P/relay passthrough branch is dropped, the HTTP job lifecycle,
//! polling loop and backoff math are kept.

use crate::accounts::AccountRegistry;
use crate::db::{now_ms, Db};
use crate::http_retry::send_with_retry;
use crate::http_sig;
use crate::net_metrics::NetMetrics;
use anyhow::Result;
use http::{HeaderMap, Method, Uri};
use rusqlite::params;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

const STATUS_PENDING: i64 = 0;
const STATUS_DELIVERED: i64 = 1;
const STATUS_DEAD: i64 = 2;

#[derive(Clone, Copy)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff_secs: 5,
            max_backoff_secs: 86_400,
        }
    }
}

#[derive(Clone)]
pub struct DeliveryQueue {
    db: Db,
    notify: Arc<Notify>,
    http: reqwest::Client,
    metrics: Arc<NetMetrics>,
}

struct Job {
    id: String,
    sender_actor_id: String,
    target_inbox: String,
    activity_json: Vec<u8>,
    attempt: u32,
}

impl DeliveryQueue {
    pub fn new(db: Db, metrics: Arc<NetMetrics>) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            metrics,
        }
    }

    /// Enqueues one delivery per recipient inbox. `bto`/`bcc` must already be
    /// stripped from `activity` by the caller.
    pub async fn enqueue(&self, sender_actor_id: &str, target_inboxes: &[String], activity: &Value) -> Result<()> {
        if target_inboxes.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_vec(activity)?;
        let db = self.db.clone();
        let sender = sender_actor_id.to_string();
        let targets: Vec<String> = target_inboxes.to_vec();
        let now = now_ms();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = db.connect()?;
            let tx = conn.transaction()?;
            for inbox in targets {
                let id = crate::ids::random_token();
                tx.execute(
                    "INSERT INTO delivery_jobs (id, sender_actor_id, target_inbox, activity_json, attempt, status, next_attempt_at_ms, created_at_ms) VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?5)",
                    params![id, sender, inbox, body, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await??;
        self.notify.notify_one();
        Ok(())
    }

    pub fn start_workers(&self, count: u32, accounts: AccountRegistry, settings: QueueSettings, shutdown: watch::Receiver<bool>) {
        for worker in 0..count.max(1) {
            let queue = self.clone();
            let accounts = accounts.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = queue.run_loop(worker, &accounts, settings, &mut shutdown).await {
                    warn!("delivery worker {worker} stopped: {e:#}");
                }
            });
        }
    }

    async fn run_loop(
        &self,
        worker: u32,
        accounts: &AccountRegistry,
        settings: QueueSettings,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        info!("delivery worker {worker} starting, db: {}", self.db.path().display());
        let tick = Duration::from_secs(2);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let jobs = self.fetch_due_jobs(10).await?;
            if jobs.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for job in jobs {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.deliver_one(job, accounts, settings).await {
                    warn!("delivery job error: {e:#}");
                }
            }
        }
        Ok(())
    }

    async fn fetch_due_jobs(&self, limit: u32) -> Result<Vec<Job>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Job>> {
            let conn = db.connect()?;
            let now = now_ms();
            let mut stmt = conn.prepare(
                "SELECT id, sender_actor_id, target_inbox, activity_json, attempt FROM delivery_jobs
                 WHERE status = ?1 AND next_attempt_at_ms <= ?2 ORDER BY next_attempt_at_ms ASC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![STATUS_PENDING, now, limit], |r| {
                Ok(Job {
                    id: r.get(0)?,
                    sender_actor_id: r.get(1)?,
                    target_inbox: r.get(2)?,
                    activity_json: r.get(3)?,
                    attempt: r.get(4)?,
                })
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await?
    }

    async fn deliver_one(&self, job: Job, accounts: &AccountRegistry, settings: QueueSettings) -> Result<()> {
        self.metrics.delivery_attempt();
        let attempt_no = job.attempt.saturating_add(1);

        let private_key_pem = match accounts.private_key_for_actor(&job.sender_actor_id).await? {
            Some(pem) => pem,
            None => {
                self.mark_dead(&job.id, "sender actor has no registered key").await?;
                return Ok(());
            }
        };
        let key_id = format!("{}#main-key", job.sender_actor_id);

        match self.post_signed(&job.target_inbox, &private_key_pem, &key_id, &job.activity_json).await {
            Ok(()) => {
                self.metrics.delivery_success();
                self.mark_delivered(&job.id).await?;
            }
            Err(DeliveryFailure::Permanent(msg)) => {
                self.metrics.delivery_dead();
                self.mark_dead(&job.id, &msg).await?;
            }
            Err(DeliveryFailure::Transient(msg)) => {
                if attempt_no >= settings.max_attempts {
                    self.metrics.delivery_dead();
                    self.mark_dead(&job.id, &msg).await?;
                } else {
                    let delay = next_backoff(attempt_no, settings.base_backoff_secs, settings.max_backoff_secs);
                    self.reschedule(&job.id, attempt_no, delay, &msg).await?;
                }
            }
        }
        Ok(())
    }

    async fn post_signed(&self, inbox_url: &str, private_key_pem: &str, key_id: &str, body: &[u8]) -> Result<(), DeliveryFailure> {
        let uri: Uri = inbox_url.parse().map_err(|e| DeliveryFailure::Permanent(format!("bad inbox url: {e}")))?;
        let mut headers = HeaderMap::new();
        http_sig::sign_request_rsa_sha256(
            private_key_pem,
            key_id,
            &Method::POST,
            &uri,
            &mut headers,
            body,
            &["(request-target)", "host", "date", "digest"],
        )
        .map_err(|e| DeliveryFailure::Permanent(format!("sign request: {e:#}")))?;

        let resp = send_with_retry(
            || {
                let mut req = self.http.post(inbox_url).header("Content-Type", "application/activity+json").body(body.to_vec());
                for (name, value) in headers.iter() {
                    req = req.header(name, value);
                }
                req
            },
            3,
        )
        .await
        .map_err(|e| DeliveryFailure::Transient(format!("send: {e:#}")))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            return Err(DeliveryFailure::Transient(format!("status {status}")));
        }
        Err(DeliveryFailure::Permanent(format!("status {status}")))
    }

    async fn mark_delivered(&self, id: &str) -> Result<()> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "UPDATE delivery_jobs SET status = ?2, last_error = NULL WHERE id = ?1",
                params![id, STATUS_DELIVERED],
            )?;
            Ok(())
        })
        .await?
    }

    async fn mark_dead(&self, id: &str, err: &str) -> Result<()> {
        warn!("delivery job {id} dead: {err}");
        let db = self.db.clone();
        let id = id.to_string();
        let err = err.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "UPDATE delivery_jobs SET status = ?2, last_error = ?3 WHERE id = ?1",
                params![id, STATUS_DEAD, err],
            )?;
            Ok(())
        })
        .await?
    }

    async fn reschedule(&self, id: &str, attempt: u32, delay: Duration, err: &str) -> Result<()> {
        let next = now_ms().saturating_add(delay.as_millis() as i64);
        let db = self.db.clone();
        let id = id.to_string();
        let err = err.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db.connect()?;
            conn.execute(
                "UPDATE delivery_jobs SET attempt = ?2, next_attempt_at_ms = ?3, last_error = ?4 WHERE id = ?1",
                params![id, attempt, next, err],
            )?;
            Ok(())
        })
        .await?
    }

    #[cfg(test)]
    pub async fn stats(&self) -> Result<(u64, u64, u64)> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(u64, u64, u64)> {
            let conn = db.connect()?;
            let pending: i64 = conn.query_row("SELECT COUNT(*) FROM delivery_jobs WHERE status = 0", [], |r| r.get(0))?;
            let delivered: i64 = conn.query_row("SELECT COUNT(*) FROM delivery_jobs WHERE status = 1", [], |r| r.get(0))?;
            let dead: i64 = conn.query_row("SELECT COUNT(*) FROM delivery_jobs WHERE status = 2", [], |r| r.get(0))?;
            Ok((pending as u64, delivered as u64, dead as u64))
        })
        .await?
    }
}

enum DeliveryFailure {
    Permanent(String),
    Transient(String),
}

fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let mut secs = base_secs.saturating_mul(1u64 << pow);
    if secs > max_secs {
        secs = max_secs;
    }
    let jitter_ms: u64 = {
        use rand::Rng;
        rand::thread_rng().gen_range(0..1000)
    };
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[tokio::test]
    async fn enqueue_then_fetch_due_returns_job() {
        let db = test_db();
        let q = DeliveryQueue::new(db, Arc::new(NetMetrics::new()));
        let activity = serde_json::json!({"id": "https://a.example/activity/1", "type": "Follow"});
        q.enqueue("https://a.example/person/me", &["https://b.example/person/1/inbox".to_string()], &activity)
            .await
            .unwrap();
        let jobs = q.fetch_due_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].target_inbox, "https://b.example/person/1/inbox");
    }

    #[tokio::test]
    async fn mark_dead_updates_status() {
        let db = test_db();
        let q = DeliveryQueue::new(db, Arc::new(NetMetrics::new()));
        let activity = serde_json::json!({"id": "https://a.example/activity/2", "type": "Follow"});
        q.enqueue("https://a.example/person/me", &["https://b.example/person/1/inbox".to_string()], &activity)
            .await
            .unwrap();
        let jobs = q.fetch_due_jobs(10).await.unwrap();
        q.mark_dead(&jobs[0].id, "unreachable").await.unwrap();
        let (pending, delivered, dead) = q.stats().await.unwrap();
        assert_eq!((pending, delivered, dead), (0, 0, 1));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d1 = next_backoff(1, 5, 86_400);
        let d2 = next_backoff(2, 5, 86_400);
        assert!(d2 >= d1);
        let capped = next_backoff(40, 5, 86_400);
        assert!(capped.as_secs() <= 86_401);
    }
}
