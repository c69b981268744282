//! HTTP document index client.
//!
//! Documents are written with `PUT {base}/{index}/_doc/{id}`. The id is a UUID v5
//! of the serialized document, so a redelivered message overwrites its earlier
//! copy instead of adding a duplicate.

use crate::{Category, IndexClient, WriteFailure};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Error building an index client
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Invalid index URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Connection settings for an `HttpIndex`
#[derive(Debug, Clone)]
pub struct HttpIndexConfig {
    /// Base URL, e.g. `https://search.example.org:9200`
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpIndexConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    result: Option<String>,
}

pub struct HttpIndex {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpIndex {
    pub fn new(config: HttpIndexConfig) -> Result<Self, IndexError> {
        let base_url = config.url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(IndexError::InvalidUrl(config.url));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url,
            username: config.username,
            password: config.password,
        })
    }

    /// Deterministic document id
    pub fn document_id(document: &Value) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, document.to_string().as_bytes())
    }

    /// URL a document is written to
    pub fn document_url(&self, category: Category, document: &Value) -> String {
        format!(
            "{}/{}/_doc/{}",
            self.base_url,
            category.index(),
            Self::document_id(document)
        )
    }
}

#[async_trait]
impl IndexClient for HttpIndex {
    async fn write(&self, category: Category, document: &Value) -> Result<(), WriteFailure> {
        let url = self.document_url(category, document);
        let mut request = self.client.put(&url).json(document);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| WriteFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WriteFailure::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: WriteResponse = response
            .json()
            .await
            .map_err(|e| WriteFailure::Response(e.to_string()))?;
        match parsed.result.as_deref() {
            Some("created") | Some("updated") => {
                debug!(url = %url, "Indexed document");
                Ok(())
            }
            other => Err(WriteFailure::Rejected(other.unwrap_or("none").to_string())),
        }
    }

    fn name(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_id_is_stable() {
        let a = json!({"scope": "u", "name": "f1", "event_type": "transfer-done"});
        let b = json!({"event_type": "transfer-done", "name": "f1", "scope": "u"});
        let c = json!({"scope": "u", "name": "f2", "event_type": "transfer-done"});

        assert_eq!(HttpIndex::document_id(&a), HttpIndex::document_id(&b));
        assert_ne!(HttpIndex::document_id(&a), HttpIndex::document_id(&c));
    }

    #[test]
    fn test_document_url() {
        let index = HttpIndex::new(HttpIndexConfig {
            url: "https://search.example.org:9200/".to_string(),
            ..Default::default()
        })
        .unwrap();
        let doc = json!({"name": "f1"});
        let url = index.document_url(Category::Deletion, &doc);

        assert!(url.starts_with("https://search.example.org:9200/rucio_deletion/_doc/"));
        assert!(url.ends_with(&HttpIndex::document_id(&doc).to_string()));
    }

    #[test]
    fn test_rejects_bad_url() {
        assert!(matches!(
            HttpIndex::new(HttpIndexConfig {
                url: "search.example.org".to_string(),
                ..Default::default()
            }),
            Err(IndexError::InvalidUrl(_))
        ));
    }
}
