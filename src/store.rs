use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Store error: {code} - {message}")]
    Status { code: u16, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "array-contains")]
    ArrayContains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub field: String,
    #[serde(rename = "operator")]
    pub op: FilterOp,
    pub value: Value,
}

impl QueryFilter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Documents missing the field never match.
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.get(&self.field) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::NotEq => actual != &self.value,
            FilterOp::Lt => compare_values(Some(actual), Some(&self.value)) == Ordering::Less,
            FilterOp::Lte => compare_values(Some(actual), Some(&self.value)) != Ordering::Greater,
            FilterOp::Gt => compare_values(Some(actual), Some(&self.value)) == Ordering::Greater,
            FilterOp::Gte => compare_values(Some(actual), Some(&self.value)) != Ordering::Less,
            FilterOp::In => self
                .value
                .as_array()
                .map_or(false, |candidates| candidates.contains(actual)),
            FilterOp::ArrayContains => actual
                .as_array()
                .map_or(false, |items| items.contains(&self.value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: OrderDirection,
}

/// Position after the last document of a page. Callers only pass it back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Cursor(Document);

impl Cursor {
    pub fn after(doc: &Document) -> Self {
        Self(doc.clone())
    }

    fn document_id(&self) -> &str {
        &self.0.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRequest {
    pub collection: String,
    pub filters: Vec<QueryFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    pub limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_after: Option<Cursor>,
}

/// Read side of the external document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Applies filters, then ordering, then the cursor and limit.
    async fn query(&self, request: &QueryRequest) -> Result<Vec<Document>, StoreError>;
}

#[derive(Deserialize)]
struct QueryResponse {
    documents: Option<Vec<Document>>,
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

pub struct RestDocumentStore {
    client: Client,
    base_url: String,
}

impl RestDocumentStore {
    pub fn new(base_url: String, timeout_ms: u64) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DocumentStore for RestDocumentStore {
    async fn query(&self, request: &QueryRequest) -> Result<Vec<Document>, StoreError> {
        let response = self
            .client
            .post(format!("{}/collections/{}/query", self.base_url, request.collection))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.json::<QueryResponse>().await;

        match body {
            Ok(QueryResponse { error: Some(err), .. }) => Err(StoreError::Status {
                code: err.code,
                message: err.message,
            }),
            Ok(_) if !status.is_success() => Err(StoreError::Status {
                code: status.as_u16(),
                message: status.to_string(),
            }),
            Ok(QueryResponse { documents, .. }) => {
                documents.ok_or_else(|| StoreError::InvalidResponse("Missing documents".into()))
            }
            Err(_) if !status.is_success() => Err(StoreError::Status {
                code: status.as_u16(),
                message: status.to_string(),
            }),
            Err(e) => Err(StoreError::InvalidResponse(e.to_string())),
        }
    }
}

/// In-process store for development mode and tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    reads: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from `{"collection": [{"id": .., "fields": {..}}, ..]}`.
    pub fn from_seed(seed: &str) -> Result<Self, StoreError> {
        let collections: HashMap<String, Vec<Document>> = serde_json::from_str(seed)
            .map_err(|e| StoreError::InvalidResponse(format!("Invalid seed data: {}", e)))?;
        Ok(Self {
            collections: RwLock::new(collections),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn insert(&self, collection: &str, doc: Document) {
        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();
        docs.retain(|d| d.id != doc.id);
        docs.push(doc);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(AtomicOrdering::Relaxed)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn query(&self, request: &QueryRequest) -> Result<Vec<Document>, StoreError> {
        self.reads.fetch_add(1, AtomicOrdering::Relaxed);

        let mut matched: Vec<Document> = {
            let collections = self.collections.read();
            collections
                .get(&request.collection)
                .map(|docs| {
                    docs.iter()
                        .filter(|d| request.filters.iter().all(|f| f.matches(d)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        if let Some(order) = &request.order_by {
            matched.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.field), b.get(&order.field))
                    .then_with(|| a.id.cmp(&b.id));
                match order.direction {
                    OrderDirection::Asc => ord,
                    OrderDirection::Desc => ord.reverse(),
                }
            });
        }

        if let Some(cursor) = &request.start_after {
            if let Some(pos) = matched.iter().position(|d| d.id == cursor.document_id()) {
                matched.drain(..=pos);
            }
        }

        matched.truncate(request.limit);
        Ok(matched)
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Total order over JSON values: missing < null-like < bool < number < string.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
