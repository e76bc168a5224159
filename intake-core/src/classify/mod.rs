//! Classifier port: event + intent catalog → chosen intent.
//!
//! Any implementation honoring the contract can be substituted (rules,
//! embeddings, an LLM behind HTTP). Determinism and idempotence are not
//! required; callers cache results by event row. Failures never
//! propagate: the deadline wrapper substitutes the terminal fallback.

mod http;
mod keyword;

pub use http::HttpClassifier;
pub use keyword::KeywordClassifier;

use std::time::Duration;

use async_trait::async_trait;
use intake_model::{
    FALLBACK_INTENT, HandlerBinding, IntentCatalogEntry, UnifiedEvent,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// A proposed-but-unknown intent surfaced by the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIntentProposal {
    pub name: String,
    pub label: String,
    pub description: String,
    #[serde(default)]
    pub handler_hint: HandlerBinding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOutcome {
    /// Catalog entry name, or `None` when nothing matched.
    pub matched_intent: Option<String>,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub new_suggestion: Option<NewIntentProposal>,
}

impl ClassificationOutcome {
    /// The substitute outcome for a failed or overdue classifier call.
    pub fn classifier_failed(cause: &str) -> Self {
        Self {
            matched_intent: Some(FALLBACK_INTENT.to_owned()),
            confidence: 0.0,
            reasoning: format!("classifier_failed:{cause}"),
            new_suggestion: None,
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// `catalog` holds active entries sorted by priority descending;
    /// `pending_suggestions` lists proposed intent names awaiting review
    /// so duplicates are not proposed again.
    async fn classify(
        &self,
        event: &UnifiedEvent,
        catalog: &[IntentCatalogEntry],
        pending_suggestions: &[String],
    ) -> Result<ClassificationOutcome>;
}

/// Run the classifier under a deadline. Never fails: timeouts and errors
/// collapse into the `classifier_failed` outcome.
pub async fn classify_with_deadline(
    classifier: &dyn Classifier,
    deadline: Duration,
    event: &UnifiedEvent,
    catalog: &[IntentCatalogEntry],
    pending_suggestions: &[String],
) -> ClassificationOutcome {
    match tokio::time::timeout(
        deadline,
        classifier.classify(event, catalog, pending_suggestions),
    )
    .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(event_id = %event.event_id, error = %e, "classifier failed");
            ClassificationOutcome::classifier_failed(&e.to_string())
        }
        Err(_) => {
            warn!(event_id = %event.event_id, "classifier deadline exceeded");
            ClassificationOutcome::classifier_failed("deadline_exceeded")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use intake_model::{EventSource, EventType};

    struct SlowClassifier;

    #[async_trait]
    impl Classifier for SlowClassifier {
        async fn classify(
            &self,
            _event: &UnifiedEvent,
            _catalog: &[IntentCatalogEntry],
            _pending: &[String],
        ) -> Result<ClassificationOutcome> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_substitutes_fallback() {
        let event = UnifiedEvent::new(
            EventType::Email,
            EventSource::Email,
            "email:<x>",
            "hello",
            Utc::now(),
        );
        let outcome = classify_with_deadline(
            &SlowClassifier,
            Duration::from_secs(30),
            &event,
            &[],
            &[],
        )
        .await;
        assert_eq!(outcome.matched_intent.as_deref(), Some("other"));
        assert_eq!(outcome.confidence, 0.0);
        assert!(outcome.reasoning.starts_with("classifier_failed:"));
    }
}
