use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::{Cursor, Document, DocumentStore, OrderBy, OrderDirection, QueryFilter, QueryRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub limit_count: usize,
    pub order_by_field: Option<String>,
    pub order_direction: OrderDirection,
    pub enable_pagination: bool,
    pub cache_time_ms: u64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit_count: 20,
            order_by_field: None,
            order_direction: OrderDirection::Desc,
            enable_pagination: false,
            cache_time_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: String,
    pub payload: Vec<T>,
    pub cached_at: u64,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh(&self, now: u64, cache_time_ms: u64) -> bool {
        now.saturating_sub(self.cached_at) < cache_time_ms
    }
}

#[derive(Debug, Clone, Default)]
pub struct PaginationState {
    pub has_more: bool,
    cursor: Option<Cursor>,
    pub is_loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Served from a fresh cache entry without touching the store.
    Cached,
    /// Read from the store; carries the page length.
    Fetched(usize),
    Skipped,
    Failed,
}

/// Deterministic key for a query shape.
pub fn cache_key(collection: &str, filters: &[QueryFilter], limit_count: usize) -> String {
    let filters = serde_json::to_string(filters).unwrap_or_default();
    format!("{}|{}|{}", collection, filters, limit_count)
}

/// One filtered, ordered view over a collection with a private TTL cache.
pub struct CachedQuery {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    collection: String,
    filters: Vec<QueryFilter>,
    options: QueryOptions,
    key: String,
    cache: HashMap<String, CacheEntry<Document>>,
    data: Vec<Document>,
    pagination: PaginationState,
    error: Option<String>,
}

impl CachedQuery {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        collection: impl Into<String>,
        filters: Vec<QueryFilter>,
        options: QueryOptions,
    ) -> Self {
        let collection = collection.into();
        let key = cache_key(&collection, &filters, options.limit_count);
        Self {
            store,
            clock,
            collection,
            filters,
            options,
            key,
            cache: HashMap::new(),
            data: Vec::new(),
            pagination: PaginationState::default(),
            error: None,
        }
    }

    pub async fn load_data(&mut self, use_cache: bool) -> LoadOutcome {
        let now = self.clock.now_ms();
        let limit = self.options.limit_count;

        if use_cache {
            if let Some(entry) = self
                .cache
                .get(&self.key)
                .filter(|e| e.is_fresh(now, self.options.cache_time_ms))
            {
                self.data = entry.payload.clone();
                self.pagination.cursor = self.data.last().map(Cursor::after);
                self.pagination.has_more = self.data.len() == limit;
                self.error = None;
                debug!(key = %self.key, "Query served from cache");
                return LoadOutcome::Cached;
            }
        }

        self.pagination.is_loading = true;
        self.error = None;
        let request = self.request(None);
        let result = self.store.query(&request).await;
        self.pagination.is_loading = false;

        match result {
            Ok(docs) => {
                let count = docs.len();
                self.cache.insert(
                    self.key.clone(),
                    CacheEntry {
                        key: self.key.clone(),
                        payload: docs.clone(),
                        cached_at: self.clock.now_ms(),
                    },
                );
                self.pagination.cursor = docs.last().map(Cursor::after);
                self.pagination.has_more = count == limit;
                self.data = docs;
                debug!(collection = %self.collection, count, "Query loaded");
                LoadOutcome::Fetched(count)
            }
            Err(e) => {
                warn!(collection = %self.collection, "Query failed: {}", e);
                self.error = Some(e.to_string());
                LoadOutcome::Failed
            }
        }
    }

    /// Appends the next page. No-op unless pagination is enabled, the last
    /// page was full, and nothing is in flight.
    pub async fn load_more(&mut self) -> LoadOutcome {
        if !self.options.enable_pagination || !self.pagination.has_more || self.pagination.is_loading {
            return LoadOutcome::Skipped;
        }
        let Some(cursor) = self.pagination.cursor.clone() else {
            return LoadOutcome::Skipped;
        };

        self.pagination.is_loading = true;
        let request = self.request(Some(cursor));
        let result = self.store.query(&request).await;
        self.pagination.is_loading = false;

        match result {
            Ok(docs) => {
                let count = docs.len();
                self.pagination.has_more = count == self.options.limit_count;
                if let Some(last) = docs.last() {
                    self.pagination.cursor = Some(Cursor::after(last));
                }
                self.data.extend(docs);
                LoadOutcome::Fetched(count)
            }
            Err(e) => {
                warn!(collection = %self.collection, "Load more failed: {}", e);
                self.error = Some(e.to_string());
                LoadOutcome::Failed
            }
        }
    }

    pub async fn refresh(&mut self) -> LoadOutcome {
        self.load_data(false).await
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Drops one entry, this query's own by default.
    pub fn invalidate_cache(&mut self, key: Option<&str>) -> bool {
        let key = key.unwrap_or(self.key.as_str());
        self.cache.remove(key).is_some()
    }

    pub fn data(&self) -> &[Document] {
        &self.data
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.pagination.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.pagination.is_loading
    }

    pub fn cache_key(&self) -> &str {
        &self.key
    }

    pub fn cached_keys(&self) -> impl Iterator<Item = &str> {
        self.cache.keys().map(String::as_str)
    }

    fn request(&self, start_after: Option<Cursor>) -> QueryRequest {
        QueryRequest {
            collection: self.collection.clone(),
            filters: self.filters.clone(),
            order_by: self.options.order_by_field.as_ref().map(|field| OrderBy {
                field: field.clone(),
                direction: self.options.order_direction,
            }),
            limit: self.options.limit_count,
            start_after,
        }
    }
}
