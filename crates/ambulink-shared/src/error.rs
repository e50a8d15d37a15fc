use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("invalid {kind} identifier '{value}'")]
    InvalidId { kind: &'static str, value: String },

    #[error("topic '{topic}': {reason}")]
    Topic { topic: String, reason: String },
}

impl ParseError {
    pub fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.into(),
        }
    }

    pub fn topic(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Topic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}
