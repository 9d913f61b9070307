//! Synthesis backend boundary.
//!
//! The governor treats synthesis as an opaque, potentially slow, potentially
//! failing call. [`Synthesizer`] is the only seam; [`EchoSynthesizer`] is a
//! deterministic implementation for demos and tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::GovernorError;

/// Output sample rate assumed by [`EchoSynthesizer`].
pub const ECHO_SAMPLE_RATE: u32 = 24_000;

/// One synthesis request as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Text to synthesize.
    pub text: String,
    /// Voice identifier.
    pub voice: String,
    /// Playback speed multiplier (1.0 = normal).
    pub speed: f32,
    /// Backend-specific options. Ordered so fingerprints are stable.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl SynthesisRequest {
    /// Create a request at normal speed with no options.
    pub fn new(text: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: voice.into(),
            speed: 1.0,
            options: BTreeMap::new(),
        }
    }

    /// Set the speed multiplier.
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    /// Add a backend option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Result of a successful synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    /// Audio samples. The governor imposes no format on these.
    pub audio: Vec<f32>,
    /// Playback duration of `audio`, used for real-time factor.
    pub output_duration: Duration,
}

impl SynthesisOutput {
    /// Approximate heap footprint, used for cache byte budgets.
    pub fn size_bytes(&self) -> usize {
        self.audio.len() * std::mem::size_of::<f32>()
    }
}

/// The external synthesis call.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via
/// `Arc<dyn Synthesizer>`.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Produce audio for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::Synthesis`] when the backend fails. The
    /// governor never retries.
    async fn synthesize(&self, request: &SynthesisRequest)
        -> Result<SynthesisOutput, GovernorError>;
}

/// Dummy synthesizer for testing.
///
/// Sleeps for `delay`, then returns silence whose duration is proportional
/// to the word count divided by speed (300 ms per word).
pub struct EchoSynthesizer {
    /// Simulated processing delay.
    pub delay: Duration,
}

impl EchoSynthesizer {
    /// Echo synthesizer with a 10 ms delay.
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
        }
    }

    /// Echo synthesizer with a custom delay.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Synthesizer for EchoSynthesizer {
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
    ) -> Result<SynthesisOutput, GovernorError> {
        tokio::time::sleep(self.delay).await;

        let words = request.text.split_whitespace().count() as f64;
        let speed = if request.speed.is_finite() && request.speed > 0.0 {
            f64::from(request.speed)
        } else {
            1.0
        };
        let seconds = words * 0.3 / speed;
        let samples = (seconds * f64::from(ECHO_SAMPLE_RATE)) as usize;

        Ok(SynthesisOutput {
            audio: vec![0.0; samples],
            output_duration: Duration::from_secs_f64(seconds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_synthesizer_duration_scales_with_words() {
        let synth = EchoSynthesizer::with_delay(Duration::ZERO);
        let out = synth
            .synthesize(&SynthesisRequest::new("one two three four", "af"))
            .await
            .expect("test: echo never fails");
        assert!((out.output_duration.as_secs_f64() - 1.2).abs() < 1e-9);
        assert!((28_799..=28_800).contains(&out.audio.len()));
    }

    #[tokio::test]
    async fn test_echo_synthesizer_empty_text_yields_zero_duration() {
        let synth = EchoSynthesizer::with_delay(Duration::ZERO);
        let out = synth
            .synthesize(&SynthesisRequest::new("", "af"))
            .await
            .expect("test: echo never fails");
        assert_eq!(out.output_duration, Duration::ZERO);
        assert!(out.audio.is_empty());
    }

    #[tokio::test]
    async fn test_echo_synthesizer_invalid_speed_treated_as_normal() {
        let synth = EchoSynthesizer::with_delay(Duration::ZERO);
        let req = SynthesisRequest::new("a b", "af").with_speed(0.0);
        let out = synth.synthesize(&req).await.expect("test: echo");
        assert!((out.output_duration.as_secs_f64() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_size_bytes_counts_f32_samples() {
        let out = SynthesisOutput {
            audio: vec![0.0; 10],
            output_duration: Duration::ZERO,
        };
        assert_eq!(out.size_bytes(), 40);
    }

    #[test]
    fn test_request_builder_sets_fields() {
        let req = SynthesisRequest::new("hi", "bf")
            .with_speed(1.5)
            .with_option("lang", "en");
        assert_eq!(req.speed, 1.5);
        assert_eq!(req.options.get("lang").map(String::as_str), Some("en"));
    }

    #[test]
    fn test_synthesizer_is_object_safe() {
        let _boxed: Box<dyn Synthesizer> = Box::new(EchoSynthesizer::new());
    }
}
