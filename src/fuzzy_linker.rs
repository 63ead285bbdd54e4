//! Resolves extracted company/person strings against the knowledge base.
//!
//! Jaro-Winkler is hand-rolled here rather than pulled from a crate: no
//! Jaro-Winkler implementation appears anywhere in the retrieval pack, and
//! the algorithm is small and precisely specified (§4.8), so reimplementing
//! it keeps the crate's dependency stack honest rather than reaching for an
//! unverified external one.

use crate::domain::{CompanyRecord, MatchDecision, MatchResult};

const MATCH_THRESHOLD: f64 = 0.85;
const AMBIGUOUS_THRESHOLD: f64 = 0.70;
const PREFIX_WEIGHT: f64 = 0.1;
const PREFIX_BOUND: usize = 4;

const LEGAL_SUFFIXES: &[&str] = &["inc", "corp", "corporation", "llc", "ltd", "co"];

/// Case-fold, strip punctuation/whitespace, and drop a trailing legal suffix.
/// Non-ASCII text (e.g. Korean) is preserved verbatim; only ASCII
/// punctuation and a handful of English legal suffixes are stripped.
pub fn normalize(name: &str) -> String {
    let folded: String = name.chars().filter(|c| c.is_alphanumeric() || c.is_whitespace()).map(|c| c.to_lowercase().next().unwrap_or(c)).collect();
    let mut words: Vec<&str> = folded.split_whitespace().collect();
    if let Some(last) = words.last() {
        if LEGAL_SUFFIXES.contains(last) {
            words.pop();
        }
    }
    words.join("")
}

/// Jaro similarity between two strings.
fn jaro(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let match_distance = (a.len().max(b.len()) / 2).saturating_sub(1);
    let mut a_matches = vec![false; a.len()];
    let mut b_matches = vec![false; b.len()];
    let mut matches = 0usize;

    for i in 0..a.len() {
        let start = i.saturating_sub(match_distance);
        let end = (i + match_distance + 1).min(b.len());
        for j in start..end {
            if b_matches[j] || a[i] != b[j] {
                continue;
            }
            a_matches[i] = true;
            b_matches[j] = true;
            matches += 1;
            break;
        }
    }

    if matches == 0 {
        return 0.0;
    }

    let mut transpositions = 0usize;
    let mut k = 0usize;
    for i in 0..a.len() {
        if !a_matches[i] {
            continue;
        }
        while !b_matches[k] {
            k += 1;
        }
        if a[i] != b[k] {
            transpositions += 1;
        }
        k += 1;
    }
    let transpositions = (transpositions / 2) as f64;
    let matches = matches as f64;

    (matches / a.len() as f64 + matches / b.len() as f64 + (matches - transpositions) / matches) / 3.0
}

/// Jaro-Winkler similarity: Jaro score boosted by a shared prefix, weight
/// 0.1 per character up to a 4-character bound (the conventional default).
pub fn jaro_winkler(a: &str, b: &str) -> f64 {
    let jaro_score = jaro(a, b);
    let prefix_len = a.chars().zip(b.chars()).take(PREFIX_BOUND).take_while(|(x, y)| x == y).count();
    jaro_score + prefix_len as f64 * PREFIX_WEIGHT * (1.0 - jaro_score)
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// Resolve `query` against `candidates`, applying the match/ambiguous/reject
/// thresholds. Does not write anything; callers act on the returned
/// [`MatchResult`] (auto-creating a [`CompanyRecord`] when instructed).
pub fn resolve_company(query: &str, candidates: &[CompanyRecord]) -> MatchResult {
    let normalized_query = normalize(query);

    let mut scored: Vec<(f64, &CompanyRecord)> =
        candidates.iter().map(|c| (jaro_winkler(&normalized_query, &normalize(&c.name)), c)).collect();

    scored.sort_by(|(score_a, a), (score_b, b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| normalize(&b.name).eq(&normalized_query).cmp(&normalize(&a.name).eq(&normalized_query)))
            .then_with(|| common_prefix_len(&normalize(&b.name), &normalized_query).cmp(&common_prefix_len(&normalize(&a.name), &normalized_query)))
            .then_with(|| a.name.cmp(&b.name))
    });

    match scored.first() {
        Some((similarity, best)) if *similarity >= MATCH_THRESHOLD => MatchResult {
            query: query.to_string(),
            matched_id: Some(best.id.clone()),
            matched_name: Some(best.name.clone()),
            similarity: *similarity,
            decision: MatchDecision::Match,
        },
        Some((similarity, best)) if *similarity >= AMBIGUOUS_THRESHOLD => MatchResult {
            query: query.to_string(),
            matched_id: Some(best.id.clone()),
            matched_name: Some(best.name.clone()),
            similarity: *similarity,
            decision: MatchDecision::Ambiguous,
        },
        Some((similarity, _)) => MatchResult {
            query: query.to_string(),
            matched_id: None,
            matched_name: None,
            similarity: *similarity,
            decision: MatchDecision::AutoCreate,
        },
        None => MatchResult { query: query.to_string(), matched_id: None, matched_name: None, similarity: 0.0, decision: MatchDecision::AutoCreate },
    }
}

/// Person linking uses a lower bar (0.70) and never auto-creates: below
/// threshold the raw string surfaces without a linked identifier.
pub fn resolve_person(query: &str, workspace_users: &[(String, String)]) -> Option<String> {
    workspace_users
        .iter()
        .map(|(id, name)| (jaro_winkler(&normalize(query), &normalize(name)), id))
        .filter(|(score, _)| *score >= AMBIGUOUS_THRESHOLD)
        .max_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, id)| id.clone())
}
