//! Turns a [`RawMessage`] into a [`CleanedMessage`] by stripping signatures,
//! quoted reply chains, and legal disclaimers from the body.
//!
//! Signature/quote detection here is line-oriented heuristics, not the
//! dedicated regex libraries the original system leans on for this (out of
//! scope, §1) — good enough to drive the extraction prompt, not meant to be
//! byte-perfect against every mail client's quirks.

use crate::domain::{CleanedMessage, RawMessage, Removed};

const SIGNATURE_DELIMITER: &str = "-- ";
const DISCLAIMER_MARKERS: &[&str] = &["confidential", "disclaimer", "this email and any attachments"];

pub fn clean(raw: &RawMessage) -> CleanedMessage {
    let mut removed = Removed::default();
    let mut body = raw.body.clone();

    if let Some((kept, _sig)) = split_signature(&body) {
        body = kept;
        removed.signature = true;
    }

    let (without_quotes, had_quotes) = strip_quotes(&body);
    body = without_quotes;
    removed.quotes = had_quotes;

    let (without_disclaimer, had_disclaimer) = strip_disclaimer(&body);
    body = without_disclaimer;
    removed.disclaimer = had_disclaimer;

    let trimmed = body.trim().to_string();
    let is_empty = trimmed.is_empty();

    CleanedMessage { raw_id: raw.id.clone(), body: trimmed, removed, is_empty }
}

fn split_signature(body: &str) -> Option<(String, String)> {
    body.find(SIGNATURE_DELIMITER).map(|idx| (body[..idx].to_string(), body[idx..].to_string()))
}

/// Drop lines that are quoted replies: `>`-prefixed lines and everything
/// from the first `On ... wrote:` header onward.
fn strip_quotes(body: &str) -> (String, bool) {
    let mut kept_lines = Vec::new();
    let mut removed_any = false;
    for line in body.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('>') {
            removed_any = true;
            continue;
        }
        if trimmed.ends_with("wrote:") && trimmed.starts_with("On ") {
            removed_any = true;
            break;
        }
        kept_lines.push(line);
    }
    (kept_lines.join("\n"), removed_any)
}

fn strip_disclaimer(body: &str) -> (String, bool) {
    let lower = body.to_lowercase();
    for marker in DISCLAIMER_MARKERS {
        if let Some(idx) = lower.find(marker) {
            let cut = body.char_indices().map(|(i, _)| i).take_while(|i| *i <= idx).last().unwrap_or(0);
            let boundary = body[..cut].rfind('\n').map(|n| n + 1).unwrap_or(0);
            return (body[..boundary].to_string(), true);
        }
    }
    (body.to_string(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(body: &str) -> RawMessage {
        RawMessage { id: "E1".to_string(), sender: "a@example.com".to_string(), subject: "hi".to_string(), body: body.to_string(), received_at: chrono::Utc::now(), attachments: vec![] }
    }

    #[test]
    fn strips_signature_delimiter() {
        let cleaned = clean(&raw("Hello there\n-- \nJane Doe\nAcme Inc"));
        assert!(cleaned.removed.signature);
        assert_eq!(cleaned.body, "Hello there");
    }

    #[test]
    fn strips_quoted_reply_lines() {
        let cleaned = clean(&raw("New content\n> old quoted line\n> more quote"));
        assert!(cleaned.removed.quotes);
        assert_eq!(cleaned.body, "New content");
    }

    #[test]
    fn strips_on_wrote_header_and_everything_after() {
        let cleaned = clean(&raw("My reply\nOn Tue, Jan 1 Jane wrote:\nOriginal message"));
        assert!(cleaned.removed.quotes);
        assert_eq!(cleaned.body, "My reply");
    }

    #[test]
    fn empty_after_cleaning_sets_is_empty() {
        let cleaned = clean(&raw("-- \nJane Doe"));
        assert!(cleaned.is_empty);
    }

    #[test]
    fn plain_body_is_untouched() {
        let cleaned = clean(&raw("Just a normal short note."));
        assert!(!cleaned.removed.signature);
        assert!(!cleaned.removed.quotes);
        assert!(!cleaned.is_empty);
        assert_eq!(cleaned.body, "Just a normal short note.");
    }
}
