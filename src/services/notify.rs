use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

/// Pushes lifecycle events to the dispatch notification endpoint.
///
/// Delivery is best effort: the webhook is posted from a detached task and a
/// failure never bubbles into the request that triggered it.
#[derive(Clone)]
pub struct NotifyService {
    client: reqwest::Client,
    webhook: Option<Url>,
}

impl NotifyService {
    pub fn new(webhook: Option<Url>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook.is_some()
    }

    pub fn member_ready(
        &self,
        org_id: &str,
        trip_id: &str,
        trip_member_id: &str,
        driver_id: Option<&str>,
    ) {
        self.dispatch(
            "trip.member_ready",
            json!({
                "orgId": org_id,
                "tripId": trip_id,
                "tripMemberId": trip_member_id,
                "driverId": driver_id,
            }),
        );
    }

    pub fn report_submitted(&self, org_id: &str, trip_id: &str, report_path: &str) {
        self.dispatch(
            "trip.report_submitted",
            json!({
                "orgId": org_id,
                "tripId": trip_id,
                "reportPath": report_path,
            }),
        );
    }

    fn dispatch(&self, event: &'static str, payload: Value) {
        let Some(url) = self.webhook.clone() else {
            debug!(event, "notifications disabled, dropping event");
            return;
        };
        let client = self.client.clone();
        let body = json!({
            "event": event,
            "payload": payload,
            "sentAt": Utc::now(),
        });
        tokio::spawn(async move {
            match client.post(url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(event, "notification delivered");
                }
                Ok(resp) => {
                    warn!(event, status = %resp.status(), "notification endpoint refused event");
                }
                Err(err) => {
                    warn!(event, "notification dispatch failed: {err}");
                }
            }
        });
    }
}
