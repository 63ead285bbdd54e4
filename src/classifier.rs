//! Classifies an extraction: a deterministic type-tag lookup from the
//! company's affiliate/portfolio flags, plus one LLM call (via the
//! orchestrator) for intensity and a human-readable summary.
//!
//! The discovered KB schema's type tag set (§6) is passed in rather than
//! hard-coded, per the runtime-reflection -> declared-schema guidance in §9.

use crate::domain::{Classification, ClassificationHint, ExtractedEntities, Intensity};

/// What the orchestrator's single classification LLM call contributes;
/// everything else here is deterministic.
pub struct LlmClassificationInput {
    pub intensity: Intensity,
    pub intensity_confidence: f64,
    pub summary: String,
}

/// Maps `hint` onto the discovered tag set, falling back to the hint's own
/// name (case-folded) if the KB schema doesn't happen to use that spelling.
fn resolve_type_tag(hint: ClassificationHint, available_tags: &[String]) -> (String, f64) {
    let wanted = match hint {
        ClassificationHint::Affiliate => "affiliate",
        ClassificationHint::Portfolio => "portfolio",
        ClassificationHint::Both => "both",
        ClassificationHint::Neither => "neither",
    };
    match available_tags.iter().find(|tag| tag.eq_ignore_ascii_case(wanted)) {
        Some(tag) => (tag.clone(), 1.0),
        None => (wanted.to_string(), 0.5),
    }
}

fn field_preserved(value: &Option<String>, summary_lower: &str) -> bool {
    match value {
        None => true,
        Some(v) => summary_lower.contains(&v.to_lowercase()),
    }
}

pub fn classify(entities: &ExtractedEntities, hint: ClassificationHint, available_type_tags: &[String], llm: LlmClassificationInput) -> Classification {
    let (type_tag, type_confidence) = resolve_type_tag(hint, available_type_tags);
    let summary_lower = llm.summary.to_lowercase();

    let date_str = entities.date.map(|d| d.format("%Y-%m-%d").to_string());
    let key_entities_preserved = [
        field_preserved(&entities.person, &summary_lower),
        field_preserved(&entities.startup, &summary_lower),
        field_preserved(&entities.partner, &summary_lower),
        field_preserved(&entities.details, &summary_lower),
        field_preserved(&date_str, &summary_lower),
    ];

    Classification {
        type_tag,
        type_confidence,
        intensity: llm.intensity,
        intensity_confidence: llm.intensity_confidence,
        summary_word_count: llm.summary.split_whitespace().count(),
        summary: llm.summary,
        key_entities_preserved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldConfidence;

    fn entities() -> ExtractedEntities {
        ExtractedEntities {
            person: Some("Jane Doe".into()),
            startup: Some("Acme".into()),
            partner: None,
            details: Some("seed round".into()),
            date: None,
            confidence: FieldConfidence::default(),
            provider: "claude".into(),
            email_id: "E1".into(),
            extracted_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn resolves_tag_from_discovered_schema() {
        let tags = vec!["Portfolio".to_string(), "Affiliate".to_string()];
        let c = classify(
            &entities(),
            ClassificationHint::Portfolio,
            &tags,
            LlmClassificationInput { intensity: Intensity::Invest, intensity_confidence: 0.8, summary: "Jane Doe discussed a seed round for Acme.".into() },
        );
        assert_eq!(c.type_tag, "Portfolio");
        assert_eq!(c.type_confidence, 1.0);
    }

    #[test]
    fn falls_back_when_schema_lacks_expected_tag() {
        let tags = vec!["custom_tag".to_string()];
        let c = classify(
            &entities(),
            ClassificationHint::Neither,
            &tags,
            LlmClassificationInput { intensity: Intensity::Understand, intensity_confidence: 0.5, summary: "short".into() },
        );
        assert_eq!(c.type_tag, "neither");
        assert_eq!(c.type_confidence, 0.5);
    }

    #[test]
    fn key_entities_preserved_checks_summary_contents() {
        let c = classify(
            &entities(),
            ClassificationHint::Neither,
            &[],
            LlmClassificationInput { intensity: Intensity::Cooperate, intensity_confidence: 0.6, summary: "Jane Doe and Acme discussed collaboration.".into() },
        );
        assert!(c.key_entities_preserved[0], "person preserved");
        assert!(c.key_entities_preserved[1], "startup preserved");
        assert!(c.key_entities_preserved[2], "partner is None so vacuously preserved");
        assert!(!c.key_entities_preserved[3], "details text not echoed in summary");
    }
}
