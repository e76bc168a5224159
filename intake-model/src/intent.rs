//! Intent catalog entries: the classifier's label universe and the
//! escalation rules that route matched events to human approval.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved terminal fallback intent. Exactly one catalog entry carries
/// this name.
pub const FALLBACK_INTENT: &str = "other";

/// How a matched intent is handled when no escalation fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerBinding {
    /// An external agent runner attaches later by event id; the core takes
    /// no further action.
    Agent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<Value>,
    },
    /// Start the named workflow and hand the event off to it.
    Workflow {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<Value>,
    },
}

impl Default for HandlerBinding {
    fn default() -> Self {
        HandlerBinding::Agent { config: None }
    }
}

/// Escalation predicate DSL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationRule {
    Always,
    /// Fires iff the largest numeric token in the content exceeds the
    /// threshold.
    AmountGt(f64),
    /// Fires on any case-insensitive substring hit.
    Keywords(Vec<String>),
}

impl EscalationRule {
    pub fn fires(&self, content: &str) -> bool {
        match self {
            EscalationRule::Always => true,
            EscalationRule::AmountGt(threshold) => extract_amounts(content)
                .into_iter()
                .fold(None::<f64>, |max, n| {
                    Some(max.map_or(n, |m| m.max(n)))
                })
                .is_some_and(|max| max > *threshold),
            EscalationRule::Keywords(keywords) => {
                let haystack = content.to_lowercase();
                keywords
                    .iter()
                    .any(|kw| haystack.contains(&kw.to_lowercase()))
            }
        }
    }
}

static AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:,\d{3})*(?:\.\d+)?").unwrap());

/// Extract the numeric tokens of a text, thousands separators stripped.
pub fn extract_amounts(content: &str) -> Vec<f64> {
    AMOUNT_RE
        .find_iter(content)
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .collect()
}

/// One entry of the classifier's label universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentCatalogEntry {
    /// Stable identifier, unique across the catalog.
    pub name: String,
    pub label: String,
    /// Guidance text handed to the classifier.
    pub description: String,
    #[serde(default)]
    pub exemplars: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub handler: HandlerBinding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_workflow: Option<String>,
}

fn default_true() -> bool {
    true
}

impl IntentCatalogEntry {
    pub fn fallback() -> Self {
        Self {
            name: FALLBACK_INTENT.into(),
            label: "Other".into(),
            description: "Terminal fallback for unmatched events".into(),
            exemplars: Vec::new(),
            keywords: Vec::new(),
            priority: i32::MIN,
            active: true,
            handler: HandlerBinding::default(),
            escalation: None,
            escalation_workflow: None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.name == FALLBACK_INTENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_extraction() {
        assert_eq!(
            extract_amounts("Please quote 100 pcs. Target price 50 USD."),
            vec![100.0, 50.0]
        );
        assert_eq!(extract_amounts("1,250,000 units at 3.75"), vec![
            1_250_000.0,
            3.75
        ]);
        assert!(extract_amounts("no numbers here").is_empty());
    }

    #[test]
    fn amount_gt_fires_on_max_token() {
        let rule = EscalationRule::AmountGt(10_000.0);
        assert!(!rule.fires("Please quote 100 pcs. Target price 50 USD."));
        assert!(rule.fires("Target price 50000 USD total."));
        // Exactly at the threshold does not fire.
        assert!(!rule.fires("budget is 10000"));
        // No tokens at all never fires.
        assert!(!rule.fires("call me"));
    }

    #[test]
    fn keyword_rule_is_case_insensitive() {
        let rule = EscalationRule::Keywords(vec!["Urgent".into()]);
        assert!(rule.fires("this is URGENT business"));
        assert!(!rule.fires("routine matter"));
    }

    #[test]
    fn always_rule() {
        assert!(EscalationRule::Always.fires(""));
    }

    #[test]
    fn rule_serialization_shape() {
        let json = serde_json::to_value(&EscalationRule::AmountGt(10000.0))
            .unwrap();
        assert_eq!(json, serde_json::json!({"amount_gt": 10000.0}));
        let json = serde_json::to_value(&EscalationRule::Always).unwrap();
        assert_eq!(json, serde_json::json!("always"));
    }
}
