//! Transit Ingest
//!
//! Forwards transfer and deletion events to a document index in batches. A source
//! message is acknowledged only after its document was written; failed writes are
//! rejected so the broker redelivers them, which makes delivery at-least-once and
//! requires index writes to be idempotent.

mod http;
mod memory;
mod sink;

pub use http::{HttpIndex, HttpIndexConfig, IndexError};
pub use memory::MemoryIndex;
pub use sink::{Batch, IngestSink, IngestStats};

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// Downstream document category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Transfer,
    Deletion,
}

impl Category {
    /// Classify by event type prefix, ignoring case
    pub fn classify(event_type: &str) -> Option<Self> {
        let event_type = event_type.to_ascii_lowercase();
        if event_type.starts_with("transfer") {
            Some(Category::Transfer)
        } else if event_type.starts_with("deletion") {
            Some(Category::Deletion)
        } else {
            None
        }
    }

    /// Index the category is written to
    pub fn index(&self) -> &'static str {
        match self {
            Category::Transfer => "rucio_transfer",
            Category::Deletion => "rucio_deletion",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.index())
    }
}

/// A rejected or failed document write
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteFailure {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Index returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Index reported result {0:?}")]
    Rejected(String),

    #[error("Unreadable index response: {0}")]
    Response(String),
}

/// Destination for event documents
#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Write one document; `Ok` only if the index confirmed it
    async fn write(&self, category: Category, document: &Value) -> Result<(), WriteFailure>;

    /// Name for logs
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: IndexClient + ?Sized> IndexClient for std::sync::Arc<T> {
    async fn write(&self, category: Category, document: &Value) -> Result<(), WriteFailure> {
        (**self).write(category, document).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
