//! Duplicate tool-call detection.
//!
//! A signature is the lowercased tool name plus a stable digest of the input
//! JSON. serde_json maps are key-ordered, so the serialized form is already
//! canonical. Signatures live only inside one send; they are never shown to
//! the model.

use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use crate::ai::types::ToolCall;

const RECENT_TOOLS_CAP: usize = 10;

/// Deterministic digest of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolSignature(String);

impl ToolSignature {
    pub fn of(name: &str, input: &Value) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        input.to_string().hash(&mut hasher);
        Self(format!("{}:{:016x}", name.to_lowercase(), hasher.finish()))
    }
}

/// Why a call was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    /// Same signature as the immediately preceding call.
    Consecutive,
    /// Signature already used earlier this send.
    Turn,
}

/// Per-send mutable loop state. Discarded when the send resolves, cancels,
/// or fails.
#[derive(Default)]
pub struct LoopState {
    /// 0-indexed iteration.
    pub depth: usize,
    /// Records of every non-blocked execution this send.
    pub tool_calls: Vec<ToolCall>,
    seen: HashSet<ToolSignature>,
    last: Option<ToolSignature>,
    recent_names: VecDeque<String>,
}

impl LoopState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duplicate_of(&self, signature: &ToolSignature) -> Option<DuplicateKind> {
        if self.last.as_ref() == Some(signature) {
            return Some(DuplicateKind::Consecutive);
        }
        if self.seen.contains(signature) {
            return Some(DuplicateKind::Turn);
        }
        None
    }

    /// Record an executed (non-blocked) call.
    pub fn record(&mut self, signature: ToolSignature, name: &str) {
        self.seen.insert(signature.clone());
        self.last = Some(signature);
        self.recent_names.push_back(name.to_string());
        while self.recent_names.len() > RECENT_TOOLS_CAP {
            self.recent_names.pop_front();
        }
    }

    /// Short summary of recent tool names for the reflection prompt.
    pub fn recent_summary(&self) -> String {
        if self.recent_names.is_empty() {
            return "none yet".to_string();
        }
        self.recent_names
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_is_stable_across_key_order() {
        // serde_json orders map keys, so these parse to the same Value.
        let a: Value = serde_json::from_str(r#"{"path":"x","limit":5}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"limit":5,"path":"x"}"#).unwrap();
        assert_eq!(ToolSignature::of("Read", &a), ToolSignature::of("read", &b));
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(
            ToolSignature::of("read", &json!({"path": "a"})),
            ToolSignature::of("read", &json!({"path": "b"}))
        );
    }

    #[test]
    fn consecutive_duplicate_detected() {
        let mut state = LoopState::new();
        let sig = ToolSignature::of("read", &json!({"path": "x"}));
        assert!(state.duplicate_of(&sig).is_none());

        state.record(sig.clone(), "read");
        assert_eq!(state.duplicate_of(&sig), Some(DuplicateKind::Consecutive));
    }

    #[test]
    fn turn_duplicate_detected_after_intervening_call() {
        let mut state = LoopState::new();
        let first = ToolSignature::of("read", &json!({"path": "x"}));
        let second = ToolSignature::of("bash", &json!({"command": "ls"}));

        state.record(first.clone(), "read");
        state.record(second, "bash");
        assert_eq!(state.duplicate_of(&first), Some(DuplicateKind::Turn));
    }

    #[test]
    fn recent_names_are_bounded() {
        let mut state = LoopState::new();
        for i in 0..20 {
            state.record(
                ToolSignature::of("read", &json!({ "path": i })),
                "read",
            );
        }
        assert_eq!(state.recent_summary().matches("read").count(), RECENT_TOOLS_CAP);
    }
}
