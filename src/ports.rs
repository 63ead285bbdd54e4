//! External-service seams. Production code depends only on these traits;
//! the wire-level implementations (Gmail OAuth, Notion HTTP, vendor SDKs)
//! are out of scope (§1) and live outside this crate. In-memory fakes here
//! give every other module a deterministic, network-free test double.

use crate::domain::RawMessage;
use crate::error::ClassifiedError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// `list_new(query, limit) -> [RawMessage]`, filtered by the group-address
/// query contract the caller supplies verbatim.
#[async_trait]
pub trait MailSourcePort: Send + Sync {
    async fn list_new(&self, query: &str, limit: usize) -> Result<Vec<RawMessage>, ClassifiedError>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Schema {
    pub fields: Vec<String>,
    pub type_tags: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDuplicate {
    Skip,
    Update,
}

/// The four knowledge-base operations, rate-limited to 3 req/s by the
/// caller's [`crate::rate_limit::strategies::TokenBucket`].
#[async_trait]
pub trait KnowledgeBasePort: Send + Sync {
    async fn discover_schema(&self, db_id: &str, force_refresh: bool) -> Result<Schema, ClassifiedError>;
    async fn list_records(&self, db_id: &str, filter: Option<&str>, limit: Option<usize>) -> Result<Vec<Record>, ClassifiedError>;
    async fn create_record(&self, db_id: &str, payload: HashMap<String, Value>) -> Result<Record, ClassifiedError>;
    async fn upsert_record(&self, db_id: &str, key: &str, payload: HashMap<String, Value>, on_duplicate: OnDuplicate) -> Result<Record, ClassifiedError>;
}

pub struct Usage {
    pub in_tokens: u64,
    pub out_tokens: u64,
}

/// `extract(prompt, schema) -> (structured_json, usage)`; structured output
/// is required, so a parse failure is [`crate::error::ErrorClass::Permanent`]
/// for that attempt, not a vendor outage.
#[async_trait]
pub trait LlmVendorPort: Send + Sync {
    async fn extract(&self, prompt: &str, schema: &Schema) -> Result<(Value, Usage), ClassifiedError>;
}

/// `get(key) -> value | none`; callers apply the three-tier fallback
/// (service -> cache -> env file) themselves, this trait models only the
/// service tier.
#[async_trait]
pub trait SecretPort: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ClassifiedError>;
}

/// Lets `Arc<dyn Port>` stand in for a concrete implementor wherever a
/// generic caller (e.g. [`crate::cache::CachedKnowledgeBase`],
/// [`crate::cache::SecretResolver`]) is built over a trait object rather
/// than a concrete adapter type.
#[async_trait]
impl<T: MailSourcePort + ?Sized> MailSourcePort for Arc<T> {
    async fn list_new(&self, query: &str, limit: usize) -> Result<Vec<RawMessage>, ClassifiedError> {
        (**self).list_new(query, limit).await
    }
}

#[async_trait]
impl<T: KnowledgeBasePort + ?Sized> KnowledgeBasePort for Arc<T> {
    async fn discover_schema(&self, db_id: &str, force_refresh: bool) -> Result<Schema, ClassifiedError> {
        (**self).discover_schema(db_id, force_refresh).await
    }

    async fn list_records(&self, db_id: &str, filter: Option<&str>, limit: Option<usize>) -> Result<Vec<Record>, ClassifiedError> {
        (**self).list_records(db_id, filter, limit).await
    }

    async fn create_record(&self, db_id: &str, payload: HashMap<String, Value>) -> Result<Record, ClassifiedError> {
        (**self).create_record(db_id, payload).await
    }

    async fn upsert_record(&self, db_id: &str, key: &str, payload: HashMap<String, Value>, on_duplicate: OnDuplicate) -> Result<Record, ClassifiedError> {
        (**self).upsert_record(db_id, key, payload, on_duplicate).await
    }
}

#[async_trait]
impl<T: LlmVendorPort + ?Sized> LlmVendorPort for Arc<T> {
    async fn extract(&self, prompt: &str, schema: &Schema) -> Result<(Value, Usage), ClassifiedError> {
        (**self).extract(prompt, schema).await
    }
}

#[async_trait]
impl<T: SecretPort + ?Sized> SecretPort for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, ClassifiedError> {
        (**self).get(key).await
    }
}

/// In-memory mail source fake: returns a fixed, mutable queue of messages.
#[derive(Default)]
pub struct FakeMailSource {
    pub inbox: Mutex<Vec<RawMessage>>,
}

impl FakeMailSource {
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self { inbox: Mutex::new(messages) }
    }
}

#[async_trait]
impl MailSourcePort for FakeMailSource {
    async fn list_new(&self, _query: &str, limit: usize) -> Result<Vec<RawMessage>, ClassifiedError> {
        let mut inbox = self.inbox.lock().expect("fake mail source mutex poisoned");
        let n = limit.min(inbox.len());
        Ok(inbox.drain(0..n).collect())
    }
}

/// In-memory knowledge-base fake backed by a `HashMap<db_id, records>`.
#[derive(Default)]
pub struct FakeKnowledgeBase {
    pub schema: Schema,
    pub records: Mutex<HashMap<String, HashMap<String, Record>>>,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            fields: vec!["person".into(), "startup".into(), "partner".into(), "details".into(), "date".into()],
            type_tags: vec!["affiliate".into(), "portfolio".into(), "both".into(), "neither".into()],
        }
    }
}

impl FakeKnowledgeBase {
    pub fn new(schema: Schema) -> Self {
        Self { schema, records: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl KnowledgeBasePort for FakeKnowledgeBase {
    async fn discover_schema(&self, _db_id: &str, _force_refresh: bool) -> Result<Schema, ClassifiedError> {
        Ok(self.schema.clone())
    }

    async fn list_records(&self, db_id: &str, _filter: Option<&str>, _limit: Option<usize>) -> Result<Vec<Record>, ClassifiedError> {
        let records = self.records.lock().expect("fake kb mutex poisoned");
        Ok(records.get(db_id).map(|m| m.values().cloned().collect()).unwrap_or_default())
    }

    async fn create_record(&self, db_id: &str, payload: HashMap<String, Value>) -> Result<Record, ClassifiedError> {
        let id = uuid::Uuid::new_v4().to_string();
        let record = Record { id: id.clone(), fields: payload };
        let mut records = self.records.lock().expect("fake kb mutex poisoned");
        records.entry(db_id.to_string()).or_default().insert(id, record.clone());
        Ok(record)
    }

    async fn upsert_record(&self, db_id: &str, key: &str, payload: HashMap<String, Value>, on_duplicate: OnDuplicate) -> Result<Record, ClassifiedError> {
        let mut records = self.records.lock().expect("fake kb mutex poisoned");
        let table = records.entry(db_id.to_string()).or_default();
        match table.get(key) {
            Some(existing) if on_duplicate == OnDuplicate::Skip => Ok(existing.clone()),
            _ => {
                let record = Record { id: key.to_string(), fields: payload };
                table.insert(key.to_string(), record.clone());
                Ok(record)
            }
        }
    }
}

/// In-memory LLM vendor fake: returns a pre-seeded response once per call,
/// or a classified failure, in the order pushed.
pub struct FakeLlmVendor {
    pub responses: Mutex<Vec<Result<(Value, u64, u64), ClassifiedError>>>,
}

impl FakeLlmVendor {
    pub fn new(responses: Vec<Result<(Value, u64, u64), ClassifiedError>>) -> Self {
        Self { responses: Mutex::new(responses) }
    }
}

#[async_trait]
impl LlmVendorPort for FakeLlmVendor {
    async fn extract(&self, _prompt: &str, _schema: &Schema) -> Result<(Value, Usage), ClassifiedError> {
        let mut responses = self.responses.lock().expect("fake llm vendor mutex poisoned");
        if responses.is_empty() {
            return Err(ClassifiedError::permanent("fake vendor exhausted"));
        }
        match responses.remove(0) {
            Ok((value, in_tokens, out_tokens)) => Ok((value, Usage { in_tokens, out_tokens })),
            Err(e) => Err(e),
        }
    }
}

/// In-memory secret fake.
#[derive(Default)]
pub struct FakeSecretStore {
    pub values: HashMap<String, String>,
}

#[async_trait]
impl SecretPort for FakeSecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ClassifiedError> {
        Ok(self.values.get(key).cloned())
    }
}
