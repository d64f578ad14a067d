//! Minimal Canvas LMS REST client.
//!
//! Only what the server itself needs: a health probe used by `GET /health`
//! and by the `canvas_health_check` tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::service::Credentials;

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("request to Canvas failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Canvas API returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid Canvas domain: {0:?}")]
    InvalidDomain(String),
}

/// Anything that can report on the health of the downstream API.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn health_check(&self) -> Result<Value, CanvasError>;
}

#[derive(Debug, Clone)]
pub struct CanvasClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CanvasUser {
    id: Value,
    #[serde(default)]
    name: Option<String>,
}

impl CanvasClient {
    pub fn new(credentials: &Credentials) -> Result<Self, CanvasError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url(&credentials.domain)?,
            token: credentials.token.clone(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, CanvasError> {
        let url = format!("{}/api/v1/{}", self.base_url, path.trim_start_matches('/'));
        tracing::debug!(%url, "canvas request");
        let response = self.http.get(&url).bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CanvasError::Status { status, body });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl HealthProbe for CanvasClient {
    async fn health_check(&self) -> Result<Value, CanvasError> {
        let user: CanvasUser = self.get_json("users/self").await?;
        Ok(json!({
            "status": "ok",
            "user": {
                "id": user.id,
                "name": user.name,
            }
        }))
    }
}

/// Accepts `school.instructure.com`, `https://school.instructure.com/` or an
/// explicit `http://` origin.
fn base_url(domain: &str) -> Result<String, CanvasError> {
    let domain = domain.trim().trim_end_matches('/');
    if domain.is_empty() {
        return Err(CanvasError::InvalidDomain(domain.to_string()));
    }
    if domain.starts_with("https://") || domain.starts_with("http://") {
        Ok(domain.to_string())
    } else {
        Ok(format!("https://{domain}"))
    }
}
