//! Rule-based classifier: keyword and exemplar scoring over the catalog.
//!
//! The baseline implementation when no classifier endpoint is
//! configured. Never proposes new intents.

use async_trait::async_trait;
use intake_model::{IntentCatalogEntry, UnifiedEvent};

use super::{ClassificationOutcome, Classifier};
use crate::error::Result;

pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    fn score(entry: &IntentCatalogEntry, haystack: &str) -> (u32, Vec<String>) {
        let mut hits = 0u32;
        let mut matched = Vec::new();
        for keyword in &entry.keywords {
            if !keyword.is_empty()
                && haystack.contains(&keyword.to_lowercase())
            {
                hits += 1;
                matched.push(keyword.clone());
            }
        }
        for exemplar in &entry.exemplars {
            let exemplar = exemplar.to_lowercase();
            if !exemplar.is_empty() && haystack.contains(&exemplar) {
                hits += 2;
                matched.push(exemplar);
            }
        }
        (hits, matched)
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(
        &self,
        event: &UnifiedEvent,
        catalog: &[IntentCatalogEntry],
        _pending_suggestions: &[String],
    ) -> Result<ClassificationOutcome> {
        let subject = event
            .metadata
            .get("subject")
            .map(String::as_str)
            .unwrap_or_default();
        let haystack =
            format!("{subject}\n{}", event.content).to_lowercase();

        // Catalog arrives priority-descending; the first best score wins.
        let mut best: Option<(&IntentCatalogEntry, u32, Vec<String>)> = None;
        for entry in catalog.iter().filter(|e| !e.is_fallback()) {
            let (hits, matched) = Self::score(entry, &haystack);
            if hits > 0 && best.as_ref().is_none_or(|(_, b, _)| hits > *b) {
                best = Some((entry, hits, matched));
            }
        }

        Ok(match best {
            Some((entry, hits, matched)) => ClassificationOutcome {
                matched_intent: Some(entry.name.clone()),
                confidence: (0.4 + 0.15 * f64::from(hits)).min(1.0),
                reasoning: format!(
                    "keyword match on [{}]",
                    matched.join(", ")
                ),
                new_suggestion: None,
            },
            None => ClassificationOutcome {
                matched_intent: None,
                confidence: 0.0,
                reasoning: "no keyword or exemplar match".to_owned(),
                new_suggestion: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use intake_model::{EventSource, EventType, HandlerBinding};

    fn entry(
        name: &str,
        priority: i32,
        keywords: &[&str],
    ) -> IntentCatalogEntry {
        IntentCatalogEntry {
            name: name.into(),
            label: name.into(),
            description: String::new(),
            exemplars: Vec::new(),
            keywords: keywords.iter().map(|k| (*k).to_owned()).collect(),
            priority,
            active: true,
            handler: HandlerBinding::default(),
            escalation: None,
            escalation_workflow: None,
        }
    }

    fn event(subject: &str, content: &str) -> UnifiedEvent {
        let mut event = UnifiedEvent::new(
            EventType::Email,
            EventSource::Email,
            "email:<t>",
            content,
            Utc::now(),
        );
        event.metadata.insert("subject".into(), subject.into());
        event
    }

    #[tokio::test]
    async fn matches_by_keywords_in_subject_and_body() {
        let catalog = vec![
            entry("inquiry", 10, &["rfq", "quote", "price"]),
            entry("complaint", 5, &["defect", "refund"]),
            IntentCatalogEntry::fallback(),
        ];
        let outcome = KeywordClassifier::new()
            .classify(
                &event(
                    "RFQ 100 units widget A",
                    "Please quote 100 pcs. Target price 50 USD.",
                ),
                &catalog,
                &[],
            )
            .await
            .unwrap();
        assert_eq!(outcome.matched_intent.as_deref(), Some("inquiry"));
        assert!(outcome.confidence > 0.6);
        assert!(outcome.new_suggestion.is_none());
    }

    #[tokio::test]
    async fn no_match_returns_none_not_fallback() {
        let catalog =
            vec![entry("inquiry", 10, &["rfq"]), IntentCatalogEntry::fallback()];
        let outcome = KeywordClassifier::new()
            .classify(&event("hi", "just saying hello"), &catalog, &[])
            .await
            .unwrap();
        assert_eq!(outcome.matched_intent, None);
        assert_eq!(outcome.confidence, 0.0);
    }

    #[tokio::test]
    async fn priority_breaks_score_ties() {
        let catalog = vec![
            entry("orders", 20, &["widget"]),
            entry("inquiry", 10, &["widget"]),
        ];
        let outcome = KeywordClassifier::new()
            .classify(&event("", "widget request"), &catalog, &[])
            .await
            .unwrap();
        assert_eq!(outcome.matched_intent.as_deref(), Some("orders"));
    }
}
