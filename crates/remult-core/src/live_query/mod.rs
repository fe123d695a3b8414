//! Live queries: standing queries whose result sets are kept current by
//! diffing every committed write against them.
//!
//! - [`LiveQuerySubscriptionServer`] runs the initial query, stores the
//!   query's state, and dispatches [`LiveQueryChange`]s to subscribers.
//! - [`LiveQueryStorage`] persists stored queries; [`InMemoryLiveQueryStorage`]
//!   and [`DataProviderLiveQueryStorage`] are provided.

pub mod emitter;
pub mod provider_storage;
pub mod server;
pub mod storage;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{converters::format_date, filter::SortEntry};

pub use emitter::{EventEmitter, ListenerId};
pub use provider_storage::DataProviderLiveQueryStorage;
pub use server::{LiveQuerySubscription, LiveQuerySubscriptionServer};
pub use storage::{InMemoryLiveQueryStorage, LiveQueryStorage};

// ============================================================================
// Stored state
// ============================================================================

/// One registered live query as kept by a [`LiveQueryStorage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredQuery {
    pub id: String,
    pub entity_key: String,
    /// Serialized [`LiveQueryState`].
    pub data: Value,
    pub last_used_iso: String,
}

/// What the server remembers about a subscription between changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveQueryState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default)]
    pub order_by: Vec<SortEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    /// Ids currently in the subscriber's result set.
    #[serde(default)]
    pub ids: Vec<Value>,
}

// ============================================================================
// Events
// ============================================================================

/// Wire event sent to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveQueryChange {
    Added {
        id: Value,
        item: Value,
    },
    Replaced {
        id: Value,
        #[serde(rename = "oldId")]
        old_id: Value,
        item: Value,
    },
    Removed {
        id: Value,
    },
}

/// Changes produced for one query by one write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveQueryMessage {
    pub query_id: String,
    pub changes: Vec<LiveQueryChange>,
}

/// A committed write, as reported by a repository.
#[derive(Debug, Clone)]
pub struct ItemChange {
    pub entity_key: String,
    pub id: Value,
    /// Id the row was stored under before the write.
    pub old_id: Value,
    pub deleted: bool,
    /// In-memory column values after the write; `None` for deletes.
    pub values: Option<Map<String, Value>>,
    /// Wire form after the write; `None` for deletes.
    pub item: Option<Value>,
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct LiveQueryOptions {
    /// Stored queries not kept alive for this long are purged.
    pub stale_after: Duration,
}

impl Default for LiveQueryOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::minutes(5),
        }
    }
}

impl LiveQueryOptions {
    /// Whether `query` was last used before the staleness window.
    pub fn is_stale(&self, query: &StoredQuery, now: DateTime<Utc>) -> bool {
        match DateTime::parse_from_rfc3339(&query.last_used_iso) {
            Ok(last_used) => last_used.with_timezone(&Utc) < now - self.stale_after,
            Err(_) => true,
        }
    }
}

pub(crate) fn now_iso() -> String {
    format_date(&Utc::now())
}
