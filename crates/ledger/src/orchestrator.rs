//! Paid-operation orchestration
//!
//! The single call site through which the application spends a credit:
//! validate → rate limit → reserve → provider call → store output → usage
//! record. Every failure after a successful reservation runs exactly one
//! compensating refund before the error is returned, so a user retry never
//! double-spends. Refunds go through the retrying path; a lost refund is a
//! direct financial loss.
//!
//! Exactly one `usage_debit` ledger event is produced per logical request.
//! The reservation is considered permanently spent only once the usage
//! record has committed; no refund path runs past that point.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::rate_limit::RateLimiter;
use crate::reservation::{ReservationService, ReservationToken};
use crate::usage::{NewGeneration, UsageStore};

/// Upload ceiling for sketch images.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
/// Prompt length ceiling, in characters.
pub const MAX_PROMPT_CHARS: usize = 2_000;

const ALLOWED_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp"];
const ALLOWED_ASPECT_RATIOS: &[&str] = &["1:1", "2:3", "3:2", "9:16", "16:9"];
const MIN_RESOLUTION: u32 = 256;
const MAX_RESOLUTION: u32 = 2_048;

/// A user-submitted sketch plus rendering parameters.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub image: Vec<u8>,
    pub mime_type: String,
    pub prompt: String,
    pub aspect_ratio: String,
    pub resolution: u32,
}

impl GenerationRequest {
    /// Reject bad input before the ledger is touched.
    pub fn validate(&self) -> LedgerResult<()> {
        if self.image.is_empty() {
            return Err(LedgerError::InvalidInput("empty image payload".to_string()));
        }
        if self.image.len() > MAX_IMAGE_BYTES {
            return Err(LedgerError::InvalidInput(format!(
                "image is {} bytes, limit is {MAX_IMAGE_BYTES}",
                self.image.len()
            )));
        }
        if !ALLOWED_MIME_TYPES.contains(&self.mime_type.as_str()) {
            return Err(LedgerError::InvalidInput(format!(
                "unsupported image type {:?}",
                self.mime_type
            )));
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(LedgerError::InvalidInput(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }
        if !ALLOWED_ASPECT_RATIOS.contains(&self.aspect_ratio.as_str()) {
            return Err(LedgerError::InvalidInput(format!(
                "unsupported aspect ratio {:?}",
                self.aspect_ratio
            )));
        }
        if !(MIN_RESOLUTION..=MAX_RESOLUTION).contains(&self.resolution) {
            return Err(LedgerError::InvalidInput(format!(
                "resolution {} outside {MIN_RESOLUTION}..={MAX_RESOLUTION}",
                self.resolution
            )));
        }
        Ok(())
    }
}

/// Output of a successful provider call.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// The external image-generation provider, consumed as a black box.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> LedgerResult<GeneratedImage>;
}

/// Blob storage for generated output, consumed as a black box.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn put(&self, bytes: &[u8], content_type: &str) -> LedgerResult<String>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Credits debited per generation; looked up server-side, never
    /// accepted from the caller.
    pub generation_cost: i64,
    /// Hard ceiling on the provider call.
    pub provider_timeout: Duration,
    /// Fixed-window request budget per account.
    pub requests_per_minute: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            generation_cost: 1,
            provider_timeout: Duration::from_secs(30),
            requests_per_minute: 10,
        }
    }
}

/// Result handed back to the caller once the reservation is spent.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CompletedGeneration {
    pub attempt_id: Uuid,
    pub output_url: String,
    pub balance: i64,
}

pub struct Orchestrator {
    reservations: ReservationService,
    rate_limiter: Arc<RateLimiter>,
    generator: Arc<dyn ImageGenerator>,
    media: Arc<dyn MediaStore>,
    usage: Arc<dyn UsageStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        reservations: ReservationService,
        rate_limiter: Arc<RateLimiter>,
        generator: Arc<dyn ImageGenerator>,
        media: Arc<dyn MediaStore>,
        usage: Arc<dyn UsageStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            reservations,
            rate_limiter,
            generator,
            media,
            usage,
            config,
        }
    }

    /// Run one paid generation end to end.
    pub async fn execute(
        &self,
        account_id: Uuid,
        request: GenerationRequest,
    ) -> LedgerResult<CompletedGeneration> {
        request.validate()?;

        let limit = self
            .rate_limiter
            .check(account_id, self.config.requests_per_minute)
            .await?;
        if !limit.allowed {
            return Err(LedgerError::RateLimited {
                retry_after_seconds: limit.retry_after_seconds.unwrap_or(1),
            });
        }

        // Single reserve attempt per request; never retried.
        let token = self
            .reservations
            .reserve(account_id, self.config.generation_cost)
            .await?;

        let generated =
            match tokio::time::timeout(self.config.provider_timeout, self.generator.generate(&request))
                .await
            {
                Err(_) => {
                    tracing::warn!(
                        account_id = %account_id,
                        attempt_id = %token.attempt_id,
                        timeout = ?self.config.provider_timeout,
                        "Provider call timed out, refunding reservation"
                    );
                    return self
                        .fail_refunded(&token, LedgerError::ProviderTimeout(self.config.provider_timeout))
                        .await;
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        account_id = %account_id,
                        attempt_id = %token.attempt_id,
                        error = %err,
                        "Provider call failed, refunding reservation"
                    );
                    return self.fail_refunded(&token, err).await;
                }
                Ok(Ok(image)) => image,
            };

        let output_url = match self.media.put(&generated.bytes, &generated.mime_type).await {
            Ok(url) => url,
            Err(err) => {
                // The credit must not be consumed for output the user
                // never received.
                tracing::error!(
                    account_id = %account_id,
                    attempt_id = %token.attempt_id,
                    error = %err,
                    "Storing generated output failed, refunding reservation"
                );
                let storage_err = LedgerError::StorageFailed(err.to_string());
                return self.fail_refunded(&token, storage_err).await;
            }
        };

        if let Err(err) = self
            .usage
            .record_generation(NewGeneration {
                account_id,
                attempt_id: token.attempt_id,
                output_url: output_url.clone(),
                prompt: request.prompt.clone(),
                mime_type: generated.mime_type.clone(),
                cost: token.cost,
            })
            .await
        {
            tracing::error!(
                account_id = %account_id,
                attempt_id = %token.attempt_id,
                error = %err,
                "Recording usage failed, refunding reservation"
            );
            let storage_err = LedgerError::StorageFailed(err.to_string());
            return self.fail_refunded(&token, storage_err).await;
        }

        // Reservation is now permanently spent.
        tracing::info!(
            account_id = %account_id,
            attempt_id = %token.attempt_id,
            output_url = %output_url,
            cost = token.cost,
            "Generation finalized"
        );

        Ok(CompletedGeneration {
            attempt_id: token.attempt_id,
            output_url,
            balance: token.balance_after,
        })
    }

    /// Run the compensating refund and return the original failure.
    async fn fail_refunded(
        &self,
        token: &ReservationToken,
        err: LedgerError,
    ) -> LedgerResult<CompletedGeneration> {
        // Refund failure is logged inside the retry path; the user-facing
        // error stays the one that triggered the compensation.
        let _ = self.reservations.refund_with_retry(token).await;
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            image: vec![0u8; 128],
            mime_type: "image/png".to_string(),
            prompt: "a lighthouse at dusk".to_string(),
            aspect_ratio: "1:1".to_string(),
            resolution: 1024,
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn oversized_image_rejected() {
        let mut req = request();
        req.image = vec![0u8; MAX_IMAGE_BYTES + 1];
        assert!(matches!(req.validate(), Err(LedgerError::InvalidInput(_))));
    }

    #[test]
    fn unsupported_mime_rejected() {
        let mut req = request();
        req.mime_type = "image/tiff".to_string();
        assert!(matches!(req.validate(), Err(LedgerError::InvalidInput(_))));
    }

    #[test]
    fn bad_aspect_ratio_rejected() {
        let mut req = request();
        req.aspect_ratio = "4:1".to_string();
        assert!(matches!(req.validate(), Err(LedgerError::InvalidInput(_))));
    }

    #[test]
    fn resolution_bounds_enforced() {
        let mut req = request();
        req.resolution = 255;
        assert!(req.validate().is_err());
        req.resolution = 2_049;
        assert!(req.validate().is_err());
        req.resolution = 256;
        assert!(req.validate().is_ok());
    }
}
