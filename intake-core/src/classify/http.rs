//! HTTP classifier: delegates the decision to a configured endpoint
//! (typically an LLM gateway) speaking the port contract as JSON.

use async_trait::async_trait;
use intake_model::{IntentCatalogEntry, UnifiedEvent};
use serde::Serialize;

use super::{ClassificationOutcome, Classifier};
use crate::error::{CoreError, Result};

pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    event_id: String,
    content: &'a str,
    subject: &'a str,
    sender: &'a str,
    intents: Vec<IntentSummary<'a>>,
    pending_suggestions: &'a [String],
}

#[derive(Serialize)]
struct IntentSummary<'a> {
    name: &'a str,
    label: &'a str,
    description: &'a str,
    exemplars: &'a [String],
    keywords: &'a [String],
}

impl HttpClassifier {
    pub fn new(endpoint: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CoreError::Classifier(e.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        event: &UnifiedEvent,
        catalog: &[IntentCatalogEntry],
        pending_suggestions: &[String],
    ) -> Result<ClassificationOutcome> {
        let request = ClassifyRequest {
            event_id: event.event_id.to_string(),
            content: &event.content,
            subject: event
                .metadata
                .get("subject")
                .map(String::as_str)
                .unwrap_or_default(),
            sender: event
                .user_external_id
                .as_deref()
                .unwrap_or_default(),
            intents: catalog
                .iter()
                .map(|entry| IntentSummary {
                    name: &entry.name,
                    label: &entry.label,
                    description: &entry.description,
                    exemplars: &entry.exemplars,
                    keywords: &entry.keywords,
                })
                .collect(),
            pending_suggestions,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::Classifier(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Classifier(format!(
                "classifier endpoint returned {}",
                response.status()
            )));
        }

        let mut outcome: ClassificationOutcome = response
            .json()
            .await
            .map_err(|e| CoreError::Classifier(e.to_string()))?;
        outcome.confidence = outcome.confidence.clamp(0.0, 1.0);
        Ok(outcome)
    }
}
