use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

/// Forwards activity records to the external audit trail.
///
/// Same contract as [`super::notify::NotifyService`]: posting happens off the
/// request path and an unreachable endpoint only produces a warning.
#[derive(Clone)]
pub struct AuditService {
    client: reqwest::Client,
    webhook: Option<Url>,
}

impl AuditService {
    pub fn new(webhook: Option<Url>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook,
        }
    }

    pub fn record(&self, org_id: &str, actor: Option<&str>, action: &'static str, detail: Value) {
        let Some(url) = self.webhook.clone() else {
            return;
        };
        let client = self.client.clone();
        let body = json!({
            "orgId": org_id,
            "actor": actor,
            "action": action,
            "detail": detail,
            "recordedAt": Utc::now(),
        });
        tokio::spawn(async move {
            match client.post(url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(action, "audit record delivered");
                }
                Ok(resp) => {
                    warn!(action, status = %resp.status(), "audit endpoint refused record");
                }
                Err(err) => {
                    warn!(action, "audit record dispatch failed: {err}");
                }
            }
        });
    }
}
