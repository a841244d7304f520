//! Request validation limits.

use serde::Deserialize;

use crate::types::ChatRequest;
use crate::{PromptgateError, Result};

/// Shape limits checked before a request is budgeted or queued.
///
/// ```rust
/// # use promptgate::ValidationLimits;
/// let limits = ValidationLimits::new()
///     .max_prompt_chars(20_000)
///     .max_tokens(2_000);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    /// Total characters across all message contents. Default: 50,000.
    pub max_prompt_chars: usize,
    /// Upper bound on `max_tokens`. Default: 4,000.
    pub max_tokens: u32,
    /// Maximum stop sequences. Default: 4.
    pub max_stop_sequences: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_prompt_chars: 50_000,
            max_tokens: 4_000,
            max_stop_sequences: 4,
        }
    }
}

impl ValidationLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_prompt_chars(mut self, n: usize) -> Self {
        self.max_prompt_chars = n;
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn max_stop_sequences(mut self, n: usize) -> Self {
        self.max_stop_sequences = n;
        self
    }

    /// Reject requests no provider should ever see.
    pub fn check(&self, request: &ChatRequest) -> Result<()> {
        if request.messages.is_empty() {
            return invalid("at least one message is required");
        }
        if let Some(i) = request
            .messages
            .iter()
            .position(|m| m.content.trim().is_empty())
        {
            return invalid(format!("message {i} has empty content"));
        }
        let chars = request.prompt_chars();
        if chars > self.max_prompt_chars {
            return invalid(format!(
                "prompt is {chars} characters, limit is {}",
                self.max_prompt_chars
            ));
        }
        if request.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return invalid("model must not be blank");
        }

        let params = &request.params;
        if let Some(t) = params.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return invalid(format!("temperature {t} outside [0, 2]"));
        }
        if let Some(p) = params.top_p
            && !(p > 0.0 && p <= 1.0)
        {
            return invalid(format!("top_p {p} outside (0, 1]"));
        }
        if let Some(n) = params.max_tokens {
            if n == 0 {
                return invalid("max_tokens must be positive");
            }
            if n > self.max_tokens {
                return invalid(format!(
                    "max_tokens {n} exceeds limit of {}",
                    self.max_tokens
                ));
            }
        }
        for (name, value) in [
            ("frequency_penalty", params.frequency_penalty),
            ("presence_penalty", params.presence_penalty),
        ] {
            if let Some(v) = value
                && !(-2.0..=2.0).contains(&v)
            {
                return invalid(format!("{name} {v} outside [-2, 2]"));
            }
        }
        if let Some(stop) = &params.stop {
            if stop.len() > self.max_stop_sequences {
                return invalid(format!(
                    "{} stop sequences, limit is {}",
                    stop.len(),
                    self.max_stop_sequences
                ));
            }
            if stop.iter().any(String::is_empty) {
                return invalid("stop sequences must not be empty");
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Result<()> {
    Err(PromptgateError::Validation(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, SamplingParams};

    fn request() -> ChatRequest {
        ChatRequest::new(vec![Message::user("hello")])
    }

    fn rejects(limits: &ValidationLimits, request: &ChatRequest) -> bool {
        matches!(limits.check(request), Err(PromptgateError::Validation(_)))
    }

    #[test]
    fn accepts_plain_request() {
        assert!(ValidationLimits::new().check(&request()).is_ok());
    }

    #[test]
    fn rejects_empty_and_blank_prompts() {
        let limits = ValidationLimits::new();
        assert!(rejects(&limits, &ChatRequest::new(vec![])));
        assert!(rejects(
            &limits,
            &ChatRequest::new(vec![Message::system("be brief"), Message::user("  ")])
        ));
    }

    #[test]
    fn prompt_length_limit_counts_all_turns() {
        let limits = ValidationLimits::new().max_prompt_chars(8);
        let ok = ChatRequest::new(vec![Message::system("abcd"), Message::user("efgh")]);
        let long = ChatRequest::new(vec![Message::system("abcd"), Message::user("efghi")]);
        assert!(limits.check(&ok).is_ok());
        assert!(rejects(&limits, &long));
    }

    #[test]
    fn sampling_ranges() {
        let limits = ValidationLimits::new();
        assert!(limits.check(&request().temperature(2.0)).is_ok());
        assert!(rejects(&limits, &request().temperature(2.5)));
        assert!(rejects(&limits, &request().temperature(f32::NAN)));
        assert!(rejects(&limits, &request().max_tokens(0)));
        assert!(rejects(&limits, &request().max_tokens(4_001)));
        assert!(rejects(
            &limits,
            &request().params(SamplingParams::new().top_p(0.0))
        ));
        assert!(limits
            .check(&request().params(SamplingParams::new().top_p(1.0)))
            .is_ok());
    }

    #[test]
    fn stop_sequence_limits() {
        let limits = ValidationLimits::new().max_stop_sequences(2);
        let stops = |s: &[&str]| {
            request().params(SamplingParams::new().stop(s.iter().map(|s| s.to_string()).collect()))
        };
        assert!(limits.check(&stops(&["\n", "END"])).is_ok());
        assert!(rejects(&limits, &stops(&["a", "b", "c"])));
        assert!(rejects(&limits, &stops(&[""])));
    }
}
