//! Intent detection: which flow, if any, should a turn start?
//!
//! Two tiers:
//!
//! 1. **Trigger phrases**: every flow's `metadata.triggers`, matched
//!    case-insensitively on word boundaries with an Aho-Corasick automaton.
//!    The longest matching phrase wins.
//! 2. **Host classifier**: an [`IntentClassifier`] receives a system
//!    instruction listing the available flows plus the user message, and
//!    answers with a flow name (bare, or as JSON), or `none`.
//!
//! The engine never does language understanding itself.

use std::sync::Arc;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::registry::FlowRegistry;

// ---------------------------------------------------------------------------
// Classifier seam
// ---------------------------------------------------------------------------

/// Host-supplied intent callback.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Answer with a flow name, a JSON object `{"flow": ..., "confidence": ...}`,
    /// or `none`.
    async fn classify(&self, system_instruction: &str, user_message: &str) -> Result<String>;
}

/// A classifier that never recognizes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClassifier;

#[async_trait]
impl IntentClassifier for NoClassifier {
    async fn classify(&self, _system_instruction: &str, _user_message: &str) -> Result<String> {
        Ok("none".into())
    }
}

// ---------------------------------------------------------------------------
// Trigger phrases
// ---------------------------------------------------------------------------

/// Trigger-phrase matcher built from a [`FlowRegistry`].
#[derive(Debug, Clone, Default)]
pub struct TriggerMatcher {
    /// (lower-cased phrase, flow id), indexed like the automaton patterns.
    phrases: Vec<(String, String)>,
    automaton: Option<AhoCorasick>,
}

impl TriggerMatcher {
    pub fn new(flows: &FlowRegistry) -> Self {
        let phrases: Vec<(String, String)> = flows
            .iter()
            .flat_map(|flow| {
                flow.metadata
                    .triggers
                    .iter()
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .map(|t| (t, flow.id.clone()))
            })
            .collect();
        if phrases.is_empty() {
            return Self::default();
        }
        let automaton = match AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(phrases.iter().map(|(p, _)| p.as_str()))
        {
            Ok(ac) => Some(ac),
            Err(e) => {
                tracing::error!(error = %e, "failed to build trigger automaton");
                None
            }
        };
        tracing::trace!(count = phrases.len(), "trigger automaton built");
        Self { phrases, automaton }
    }

    /// The flow id of the longest trigger phrase found in `text`.
    pub fn find(&self, text: &str) -> Option<&str> {
        let ac = self.automaton.as_ref()?;
        let lowered = text.to_lowercase();
        let mut best: Option<(usize, usize)> = None;
        for mat in ac.find_overlapping_iter(&lowered) {
            if !on_word_boundaries(&lowered, mat.start(), mat.end()) {
                continue;
            }
            let len = mat.end() - mat.start();
            if best.is_none_or(|(_, best_len)| len > best_len) {
                best = Some((mat.pattern().as_usize(), len));
            }
        }
        let (idx, _) = best?;
        Some(self.phrases[idx].1.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}

fn on_word_boundaries(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Where a detected intent came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentSource {
    Explicit,
    Trigger,
    Classifier,
}

/// A flow chosen for a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedIntent {
    /// Id of the registered flow.
    pub flow_id: String,
    pub source: IntentSource,
}

/// Runs both tiers against a flow registry.
#[derive(Clone)]
pub struct IntentDetector {
    flows: FlowRegistry,
    triggers: TriggerMatcher,
    classifier: Option<Arc<dyn IntentClassifier>>,
    instruction: String,
    min_confidence: f64,
}

impl std::fmt::Debug for IntentDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentDetector")
            .field("triggers", &self.triggers.phrases.len())
            .field("classifier", &self.classifier.is_some())
            .field("min_confidence", &self.min_confidence)
            .finish()
    }
}

impl IntentDetector {
    pub fn new(flows: FlowRegistry, classifier: Option<Arc<dyn IntentClassifier>>, min_confidence: f64) -> Self {
        Self {
            triggers: TriggerMatcher::new(&flows),
            instruction: system_instruction(&flows),
            flows,
            classifier,
            min_confidence,
        }
    }

    /// The system instruction handed to the classifier.
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Pick the flow for `text`, or `None`.
    ///
    /// A failing classifier is logged and treated as "no match"; it never
    /// fails the turn.
    pub async fn detect(&self, text: &str) -> Option<DetectedIntent> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if let Some(flow_id) = self.triggers.find(text) {
            debug!(flow_id, "intent matched trigger phrase");
            return Some(DetectedIntent {
                flow_id: flow_id.to_string(),
                source: IntentSource::Trigger,
            });
        }
        let classifier = self.classifier.as_ref()?;
        let reply = match classifier.classify(&self.instruction, text).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "intent classifier failed");
                return None;
            }
        };
        let (name, confidence) = parse_reply(&reply)?;
        if confidence < self.min_confidence {
            debug!(flow = %name, confidence, "classifier answer below confidence threshold");
            return None;
        }
        match self.flows.get(&name) {
            Some(flow) => {
                debug!(flow_id = %flow.id, confidence, "intent matched by classifier");
                Some(DetectedIntent {
                    flow_id: flow.id.clone(),
                    source: IntentSource::Classifier,
                })
            }
            None => {
                warn!(flow = %name, "classifier named an unknown flow");
                None
            }
        }
    }

    /// Resolve an explicit intent attached to a turn.
    pub fn explicit(&self, name: &str) -> Option<DetectedIntent> {
        self.flows.get(name).map(|flow| DetectedIntent {
            flow_id: flow.id.clone(),
            source: IntentSource::Explicit,
        })
    }
}

fn system_instruction(flows: &FlowRegistry) -> String {
    let mut out = String::from(
        "You route user messages to conversational flows. Answer ONLY with the \
         name of the single best matching flow, or with the word none if no \
         flow fits. You may instead answer with JSON: \
         {\"flow\": \"<name>\", \"confidence\": 0.0-1.0}.\n\nAvailable flows:\n",
    );
    for flow in flows.iter() {
        match &flow.metadata.description {
            Some(description) => out.push_str(&format!("- {}: {}\n", flow.display_name(), description)),
            None => out.push_str(&format!("- {}\n", flow.display_name())),
        }
    }
    out
}

/// Parse a classifier reply into `(flow name, confidence)`.
///
/// Accepts a bare name, possibly quoted, or a JSON object with a `flow`
/// (or `intent`) field, optionally inside a Markdown code fence.  `none`,
/// `null` and empty replies mean no match.
pub fn parse_reply(reply: &str) -> Option<(String, f64)> {
    let cleaned = reply.trim();
    let cleaned = cleaned.strip_prefix("```json").unwrap_or(cleaned);
    let cleaned = cleaned.strip_prefix("```").unwrap_or(cleaned);
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned);
    let cleaned = cleaned.trim();

    let (name, confidence) = if cleaned.starts_with('{') {
        let parsed: serde_json::Value = match serde_json::from_str(cleaned) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unparseable classifier reply");
                return None;
            }
        };
        let name = parsed
            .get("flow")
            .or_else(|| parsed.get("intent"))
            .and_then(|v| v.as_str())?
            .to_string();
        let confidence = parsed.get("confidence").and_then(|v| v.as_f64()).unwrap_or(1.0);
        (name, confidence)
    } else {
        (cleaned.trim_matches(['"', '\'', '.', '`']).to_string(), 1.0)
    };

    let name = name.trim();
    if name.is_empty() || name.eq_ignore_ascii_case("none") || name.eq_ignore_ascii_case("null") {
        return None;
    }
    Some((name.to_string(), confidence))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn registry() -> FlowRegistry {
        FlowRegistry::from_json(
            r#"[
                {"id": "orders", "name": "order_status", "steps": [],
                 "metadata": {"description": "Track an order", "triggers": ["order", "order status"]}},
                {"id": "billing", "steps": [], "metadata": {"triggers": ["invoice"]}}
            ]"#,
        )
        .unwrap()
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl IntentClassifier for Fixed {
        async fn classify(&self, instruction: &str, _user: &str) -> Result<String> {
            assert!(instruction.contains("order_status: Track an order"));
            Ok(self.0.to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl IntentClassifier for Failing {
        async fn classify(&self, _instruction: &str, _user: &str) -> Result<String> {
            Err(EngineError::Intent {
                reason: "backend down".into(),
            })
        }
    }

    #[test]
    fn trigger_prefers_longest_phrase_on_word_boundaries() {
        let matcher = TriggerMatcher::new(&registry());
        assert_eq!(matcher.find("What is my ORDER STATUS?"), Some("orders"));
        assert_eq!(matcher.find("send the invoice please"), Some("billing"));
        assert_eq!(matcher.find("reorder things"), None);
        assert_eq!(matcher.find("hello"), None);
    }

    #[tokio::test]
    async fn classifier_fallback() {
        let detector = IntentDetector::new(registry(), Some(Arc::new(Fixed("```json\n{\"flow\": \"billing\", \"confidence\": 0.9}\n```"))), 0.5);
        let hit = detector.detect("I need money back").await.unwrap();
        assert_eq!(hit.flow_id, "billing");
        assert_eq!(hit.source, IntentSource::Classifier);
    }

    #[tokio::test]
    async fn classifier_by_name_and_low_confidence() {
        let by_name = IntentDetector::new(registry(), Some(Arc::new(Fixed("order_status"))), 0.5);
        assert_eq!(by_name.detect("where's my stuff").await.unwrap().flow_id, "orders");

        let low = IntentDetector::new(registry(), Some(Arc::new(Fixed(r#"{"flow": "billing", "confidence": 0.2}"#))), 0.5);
        assert!(low.detect("hmm").await.is_none());
    }

    #[tokio::test]
    async fn none_unknown_and_failures_are_no_match() {
        for reply in ["none", "NONE", "", "ghost_flow"] {
            let detector = IntentDetector::new(registry(), Some(Arc::new(Fixed(reply))), 0.5);
            assert!(detector.detect("hmm").await.is_none(), "reply {reply:?}");
        }
        let failing = IntentDetector::new(registry(), Some(Arc::new(Failing)), 0.5);
        assert!(failing.detect("hmm").await.is_none());
        let without = IntentDetector::new(registry(), None, 0.5);
        assert!(without.detect("hmm").await.is_none());
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(parse_reply("\"billing\"."), Some(("billing".into(), 1.0)));
        assert_eq!(parse_reply(r#"{"intent": "x", "confidence": 0.7}"#), Some(("x".into(), 0.7)));
        assert_eq!(parse_reply(r#"{"flow": "none"}"#), None);
        assert_eq!(parse_reply("{not json"), None);
    }

    #[test]
    fn explicit_intent_resolves_name_or_id() {
        let detector = IntentDetector::new(registry(), None, 0.5);
        assert_eq!(detector.explicit("order_status").unwrap().flow_id, "orders");
        assert_eq!(detector.explicit("billing").unwrap().source, IntentSource::Explicit);
        assert!(detector.explicit("nope").is_none());
    }
}
