use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;

pub const ORG_HEADER: &str = "x-org-id";
pub const ACTOR_HEADER: &str = "x-actor-id";

/// Caller scope resolved by the upstream gateway. Authentication itself is
/// a collaborator; this service only insists that the organization is named
/// explicitly on every call instead of being inferred server-side.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub org_id: String,
    pub actor: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestScope
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let org_id = header_value(parts, ORG_HEADER)
            .ok_or_else(|| AppError::BadRequest(format!("missing {ORG_HEADER} header")))?;
        let actor = header_value(parts, ACTOR_HEADER);

        Ok(Self { org_id, actor })
    }
}

impl RequestScope {
    /// Operations that record who acted (create, cancel, no-show, review)
    /// refuse to guess.
    pub fn require_actor(&self) -> Result<&str, AppError> {
        self.actor
            .as_deref()
            .ok_or_else(|| AppError::BadRequest(format!("missing {ACTOR_HEADER} header")))
    }
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
