use crate::error::IngestError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::time::Duration;

/// What a document that yields no chunks counts as in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyDocumentPolicy {
    /// Reported with zero chunks and a warning, not a failure.
    #[default]
    Succeed,
    /// Marked failed at the chunking stage.
    Fail,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_batch_size: usize,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub embedding_batch_delay: Duration,
    pub upload_batch_size: usize,
    pub max_concurrent_documents: usize,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub parse_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub embed_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub upsert_timeout: Duration,
    pub embedding_retry: RetryPolicy,
    pub upload_retry: RetryPolicy,
    pub empty_documents: EmptyDocumentPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 200,
            embedding_batch_size: 50,
            embedding_batch_delay: Duration::from_secs(2),
            upload_batch_size: 500,
            max_concurrent_documents: 1,
            parse_timeout: Duration::from_secs(120),
            embed_timeout: Duration::from_secs(60),
            upsert_timeout: Duration::from_secs(60),
            embedding_retry: RetryPolicy::default(),
            upload_retry: RetryPolicy::default(),
            empty_documents: EmptyDocumentPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Converts a delay given in (possibly fractional) seconds, rejecting
    /// negative, non-finite and out-of-range values.
    pub fn delay_from_secs(seconds: f64) -> Result<Duration, IngestError> {
        Duration::try_from_secs_f64(seconds).map_err(|error| {
            IngestError::Configuration(format!(
                "delay must be a finite number of seconds >= 0, got {seconds}: {error}"
            ))
        })
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::Configuration(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IngestError::Configuration(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.embedding_batch_size == 0 {
            return Err(IngestError::Configuration(
                "embedding_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.upload_batch_size == 0 {
            return Err(IngestError::Configuration(
                "upload_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_documents == 0 {
            return Err(IngestError::Configuration(
                "max_concurrent_documents must be greater than 0".to_string(),
            ));
        }

        for (name, timeout) in [
            ("parse_timeout", self.parse_timeout),
            ("embed_timeout", self.embed_timeout),
            ("upsert_timeout", self.upsert_timeout),
        ] {
            if timeout.is_zero() {
                return Err(IngestError::Configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        for (name, policy) in [
            ("embedding_retry", &self.embedding_retry),
            ("upload_retry", &self.upload_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(IngestError::Configuration(format!(
                    "{name}.max_attempts must be at least 1"
                )));
            }
            if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
                return Err(IngestError::Configuration(format!(
                    "{name}.multiplier must be >= 1.0, got {}",
                    policy.multiplier
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_pipeline() {
        let config = PipelineConfig::default();
        assert_eq!(config.chunk_size, 1_000);
        assert_eq!(config.chunk_overlap, 200);
        assert_eq!(config.embedding_batch_size, 50);
        assert_eq!(config.embedding_batch_delay, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let config = PipelineConfig {
            chunk_size: 100,
            chunk_overlap: 100,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(IngestError::Configuration(_))
        ));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for config in [
            PipelineConfig {
                chunk_size: 0,
                chunk_overlap: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                embedding_batch_size: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                upload_batch_size: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                max_concurrent_documents: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                embed_timeout: Duration::ZERO,
                ..PipelineConfig::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn negative_delay_is_a_configuration_error() {
        assert!(PipelineConfig::delay_from_secs(-1.0).is_err());
        assert!(PipelineConfig::delay_from_secs(f64::NAN).is_err());
        assert!(PipelineConfig::delay_from_secs(f64::INFINITY).is_err());
        assert!(matches!(
            PipelineConfig::delay_from_secs(1e30),
            Err(IngestError::Configuration(_))
        ));
        assert_eq!(
            PipelineConfig::delay_from_secs(2.5).unwrap(),
            Duration::from_millis(2_500)
        );
    }
}
