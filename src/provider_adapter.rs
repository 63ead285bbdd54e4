//! Uniform call surface over the three LLM vendors: each adapter owns its
//! own prompt template and per-million pricing; everything else (retries,
//! circuit breaking, health/cost/quality bookkeeping) belongs to
//! [`crate::provider_orchestrator`]. Adapters are stateless and never retry
//! themselves.

use crate::domain::{ExtractedEntities, FieldConfidence};
use crate::error::ClassifiedError;
use crate::ports::{LlmVendorPort, Schema};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct ProviderAdapter {
    pub name: &'static str,
    vendor: Arc<dyn LlmVendorPort>,
    pub price_per_million_in: f64,
    pub price_per_million_out: f64,
}

#[derive(Debug)]
pub struct AdapterUsage {
    pub in_tokens: u64,
    pub out_tokens: u64,
}

impl ProviderAdapter {
    pub fn new(name: &'static str, vendor: Arc<dyn LlmVendorPort>, price_per_million_in: f64, price_per_million_out: f64) -> Self {
        Self { name, vendor, price_per_million_in, price_per_million_out }
    }

    fn build_prompt(&self, cleaned_text: &str, context: Option<&str>) -> String {
        match context {
            Some(ctx) => format!(
                "Extract person, startup, partner, details, and date from this email. Context: {ctx}\n\n{cleaned_text}"
            ),
            None => format!("Extract person, startup, partner, details, and date from this email.\n\n{cleaned_text}"),
        }
    }

    pub async fn extract(
        &self,
        cleaned_text: &str,
        context: Option<&str>,
        schema: &Schema,
        email_id: &str,
    ) -> Result<(ExtractedEntities, AdapterUsage), ClassifiedError> {
        let prompt = self.build_prompt(cleaned_text, context);
        let (value, usage) = self.vendor.extract(&prompt, schema).await?;
        let entities = parse_entities(&value, self.name, email_id)?;
        Ok((entities, AdapterUsage { in_tokens: usage.in_tokens, out_tokens: usage.out_tokens }))
    }
}

fn opt_string(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string)
}

fn confidence(value: &Value, field: &str) -> f64 {
    value
        .get("confidence")
        .and_then(|c| c.get(field))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0)
}

/// Structured output is required (§4.6); a shape mismatch here is a
/// [`crate::error::ErrorClass::Permanent`] failure for this attempt, not a
/// vendor outage.
fn parse_entities(value: &Value, provider: &str, email_id: &str) -> Result<ExtractedEntities, ClassifiedError> {
    if !value.is_object() {
        return Err(ClassifiedError::permanent("vendor response was not a JSON object"));
    }

    let date = opt_string(value, "date").and_then(|s| chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok());

    Ok(ExtractedEntities {
        person: opt_string(value, "person"),
        startup: opt_string(value, "startup"),
        partner: opt_string(value, "partner"),
        details: opt_string(value, "details"),
        date,
        confidence: FieldConfidence {
            person: confidence(value, "person"),
            startup: confidence(value, "startup"),
            partner: confidence(value, "partner"),
            details: confidence(value, "details"),
            date: confidence(value, "date"),
        },
        provider: provider.to_string(),
        email_id: email_id.to_string(),
        extracted_at: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FakeLlmVendor, Schema};
    use serde_json::json;

    fn vendor_ok() -> Arc<dyn LlmVendorPort> {
        Arc::new(FakeLlmVendor::new(vec![Ok((
            json!({"person": "Jane Doe", "startup": "Acme", "confidence": {"person": 0.9, "startup": 0.8, "partner": 0.0, "details": 0.0, "date": 0.0}}),
            100,
            50,
        ))]))
    }

    #[tokio::test]
    async fn extracts_entities_and_usage_from_vendor_response() {
        let adapter = ProviderAdapter::new("gemini", vendor_ok(), 0.0, 0.0);
        let schema = Schema::default();
        let (entities, usage) = adapter.extract("some email body", None, &schema, "E1").await.unwrap();
        assert_eq!(entities.person.as_deref(), Some("Jane Doe"));
        assert_eq!(entities.startup.as_deref(), Some("Acme"));
        assert_eq!(entities.provider, "gemini");
        assert_eq!(usage.in_tokens, 100);
        assert_eq!(usage.out_tokens, 50);
    }

    #[tokio::test]
    async fn non_object_response_is_permanent_failure() {
        let vendor: Arc<dyn LlmVendorPort> = Arc::new(FakeLlmVendor::new(vec![Ok((json!("not an object"), 10, 10))]));
        let adapter = ProviderAdapter::new("claude", vendor, 3.0, 15.0);
        let schema = Schema::default();
        let result = adapter.extract("body", None, &schema, "E1").await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().class, crate::error::ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn vendor_failure_propagates_classification() {
        let vendor: Arc<dyn LlmVendorPort> = Arc::new(FakeLlmVendor::new(vec![Err(ClassifiedError::transient("429"))]));
        let adapter = ProviderAdapter::new("openai", vendor, 2.5, 10.0);
        let schema = Schema::default();
        let result = adapter.extract("body", None, &schema, "E1").await;
        assert_eq!(result.unwrap_err().class, crate::error::ErrorClass::Transient);
    }
}
