//! Chat completions request payload.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::transcript::{Role, Transcript};

/// A numeric setting that may arrive as text (`"256"`) from config or a
/// front-end prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Number(f64),
    Text(String),
}

impl Numeric {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Numeric::Number(n) => Some(*n),
            Numeric::Text(s) => s.trim().parse::<f64>().ok(),
        }
        .filter(|n| n.is_finite())
    }

    /// Integral value, for token counts. Fractions and negatives are rejected.
    pub fn as_u32(&self) -> Option<u32> {
        let n = self.as_f64()?;
        (n.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&n)).then_some(n as u32)
    }
}

impl From<f64> for Numeric {
    fn from(value: f64) -> Self {
        Numeric::Number(value)
    }
}

impl From<u32> for Numeric {
    fn from(value: u32) -> Self {
        Numeric::Number(f64::from(value))
    }
}

impl From<&str> for Numeric {
    fn from(value: &str) -> Self {
        Numeric::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestMessage {
    pub role: Role,
    pub content: String,
}

/// Builds the wire payload for `transcript`.
///
/// Settings that do not coerce to a number are left out of the payload.
pub fn build(
    transcript: &Transcript,
    model: &str,
    temperature: Option<&Numeric>,
    max_tokens: Option<&Numeric>,
) -> ChatRequest {
    let messages = transcript
        .iter()
        .map(|turn| RequestMessage {
            role: turn.role,
            content: turn.content.clone(),
        })
        .collect();

    let temperature = temperature.and_then(|value| {
        let coerced = value.as_f64();
        if coerced.is_none() {
            warn!(?value, "Ignoring non-numeric temperature");
        }
        coerced
    });
    let max_tokens = max_tokens.and_then(|value| {
        let coerced = value.as_u32();
        if coerced.is_none() {
            warn!(?value, "Ignoring non-numeric max_tokens");
        }
        coerced
    });

    ChatRequest {
        model: model.to_string(),
        messages,
        temperature,
        max_tokens,
    }
}

impl ChatRequest {
    /// True when the first message is the system message.
    pub fn starts_with_system(&self) -> bool {
        self.messages.first().is_some_and(|m| m.role == Role::System)
    }
}
