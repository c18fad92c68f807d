use serde::{Deserialize, Serialize};

/// How the model classified the relationship between two chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairRelation {
    DuplicateWork,
    SequentialIteration,
    ContextualConvergence,
    Unrelated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDirection {
    Forward,
    Backward,
    Convergent,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepSide {
    First,
    Second,
    Both,
}

/// The fixed response shape requested from the json-completion capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairJudgment {
    pub relation: PairRelation,
    pub direction: MergeDirection,
    pub keep: KeepSide,
    pub reasoning: String,
    /// Synthesized content; required when the relation is convergence.
    #[serde(default)]
    pub merged_text: Option<String>,
}

impl PairJudgment {
    /// An unusable answer after retries collapses to this; the pair is
    /// recorded and skipped.
    pub fn unrelated(reason: &str) -> Self {
        Self {
            relation: PairRelation::Unrelated,
            direction: MergeDirection::Unknown,
            keep: KeepSide::Both,
            reasoning: reason.to_string(),
            merged_text: None,
        }
    }

    pub fn validate(self) -> Result<Self, String> {
        if self.relation == PairRelation::ContextualConvergence
            && self
                .merged_text
                .as_ref()
                .is_none_or(|text| text.trim().is_empty())
        {
            return Err("convergence verdict without merged_text".to_string());
        }
        Ok(self)
    }
}

pub fn judgment_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "relation": {
                "type": "string",
                "enum": ["duplicate_work", "sequential_iteration", "contextual_convergence", "unrelated"]
            },
            "direction": {
                "type": "string",
                "enum": ["forward", "backward", "convergent", "unknown"]
            },
            "keep": {
                "type": "string",
                "enum": ["first", "second", "both"]
            },
            "reasoning": { "type": "string" },
            "merged_text": { "type": ["string", "null"] }
        },
        "required": ["relation", "direction", "keep", "reasoning"],
        "additionalProperties": false
    })
}

pub const JUDGMENT_SYSTEM_MESSAGE: &str = "You compare two knowledge chunks from a \
developer's corpus and judge their relationship: duplicate_work (same content), \
sequential_iteration (one evolves the other), contextual_convergence (they should \
merge into one synthesized chunk; provide merged_text), or unrelated. Respond only \
with JSON matching the provided schema.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn judgment_round_trips_snake_case() {
        let value = serde_json::json!({
            "relation": "duplicate_work",
            "direction": "forward",
            "keep": "first",
            "reasoning": "identical text"
        });
        let judgment: PairJudgment = serde_json::from_value(value).expect("parse");
        assert_eq!(judgment.relation, PairRelation::DuplicateWork);
        assert_eq!(judgment.keep, KeepSide::First);
        assert!(judgment.merged_text.is_none());
    }

    #[test]
    fn unknown_relation_fails_to_parse() {
        let value = serde_json::json!({
            "relation": "soulmates",
            "direction": "forward",
            "keep": "first",
            "reasoning": "no"
        });
        assert!(serde_json::from_value::<PairJudgment>(value).is_err());
    }

    #[test]
    fn convergence_requires_merged_text() {
        let judgment = PairJudgment {
            relation: PairRelation::ContextualConvergence,
            direction: MergeDirection::Convergent,
            keep: KeepSide::Both,
            reasoning: "merge them".to_string(),
            merged_text: None,
        };
        assert!(judgment.validate().is_err());

        let judgment = PairJudgment {
            merged_text: Some("combined body".to_string()),
            ..PairJudgment {
                relation: PairRelation::ContextualConvergence,
                direction: MergeDirection::Convergent,
                keep: KeepSide::Both,
                reasoning: "merge them".to_string(),
                merged_text: None,
            }
        };
        assert!(judgment.validate().is_ok());
    }
}
