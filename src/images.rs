//! Image generator: personality-keyed image prompt, optional
//! reference-photo conditioning, and a small follow-up captioning call.

use crate::imagegen::{GeneratedImage, ImageGen, ImageQuality, ImageSize};
use crate::llm::{ChatMessage, Completer};
use crate::messages::UseCase;
use crate::personality::{self, Personality};
use crate::UserId;

/// Outcome of an image job: either the generated image with its caption,
/// or a structured, non-fatal failure the pipeline can post without.
#[derive(Debug, Clone)]
pub enum ImageOutcome {
    Generated { bytes: Vec<u8>, caption: String },
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct ImageJob {
    pub user_id: UserId,
    pub name: String,
    pub quality: ImageQuality,
    pub size: ImageSize,
    pub reference_photo: Option<Vec<u8>>,
}

async fn caption_for(completer: &impl Completer, name: &str, personality: Personality) -> String {
    let prompt = format!(
        "Write a short, witty caption (under 10 words) for a birthday illustration of {name} in the style of {}.",
        personality.data().description
    );
    let use_case = UseCase::ImageCaption;
    let messages = vec![ChatMessage::User(prompt)];
    match completer
        .complete(messages, use_case.max_tokens(), use_case.temperature(), use_case.reasoning_effort())
        .await
    {
        Ok(outcome) => outcome.text.trim().to_string(),
        Err(error) => {
            tracing::warn!(%error, "image caption generation failed, using fallback title");
            format!("{name}'s Birthday Celebration")
        }
    }
}

/// Runs one image job end-to-end: prompt render, generation with up to
/// 2 retries, and a captioning call. Never returns `Err` -- failures are
/// folded into [`ImageOutcome::Failed`] so a single bad image doesn't
/// abort the fan-out.
pub async fn run_image_job(
    imagegen: &impl ImageGen,
    completer: &impl Completer,
    personality: Personality,
    job: &ImageJob,
) -> ImageOutcome {
    let prompt = personality::image_prompt(personality, &job.name);
    let reference = job.reference_photo.as_deref();

    let mut last_error = String::new();
    for attempt in 0..3 {
        match imagegen.generate(&prompt, job.quality, job.size, reference).await {
            Ok(GeneratedImage { bytes, .. }) => {
                let caption = caption_for(completer, &job.name, personality).await;
                return ImageOutcome::Generated { bytes, caption };
            }
            Err(error) => {
                tracing::warn!(attempt, user_id = %job.user_id, %error, "image generation attempt failed");
                last_error = error.to_string();
            }
        }
    }

    ImageOutcome::Failed { reason: last_error }
}

/// Runs image jobs concurrently, bounded to a small worker pool to
/// protect the image API.
pub async fn run_image_fanout(
    imagegen: &(impl ImageGen + Sync),
    completer: &(impl Completer + Sync),
    personality: Personality,
    jobs: Vec<ImageJob>,
) -> Vec<(UserId, ImageOutcome)> {
    use futures::stream::{self, StreamExt};

    const MAX_CONCURRENT_IMAGE_JOBS: usize = 4;

    stream::iter(jobs)
        .map(|job| async move {
            let outcome = run_image_job(imagegen, completer, personality, &job).await;
            (job.user_id, outcome)
        })
        .buffer_unordered(MAX_CONCURRENT_IMAGE_JOBS)
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::llm::CompletionOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyImageGen {
        failures_before_success: usize,
        calls: AtomicUsize,
    }

    impl ImageGen for FlakyImageGen {
        async fn generate(
            &self,
            _prompt: &str,
            _quality: ImageQuality,
            _size: ImageSize,
            _reference_image: Option<&[u8]>,
        ) -> Result<GeneratedImage> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(crate::error::GenerationError::ImageFailed("simulated".into()).into())
            } else {
                Ok(GeneratedImage {
                    bytes: vec![1, 2, 3],
                    usage: Default::default(),
                })
            }
        }
    }

    struct StubCompleter;
    impl Completer for StubCompleter {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
            _max_tokens: u32,
            _temperature: f32,
            _reasoning_effort: Option<&str>,
        ) -> Result<CompletionOutcome> {
            Ok(CompletionOutcome { text: "A joyful moment".into(), usage: Default::default() })
        }
    }

    #[tokio::test]
    async fn recovers_after_transient_failures_within_retry_budget() {
        let imagegen = FlakyImageGen { failures_before_success: 2, calls: AtomicUsize::new(0) };
        let completer = StubCompleter;
        let job = ImageJob {
            user_id: "U1".into(),
            name: "Alex".into(),
            quality: ImageQuality::Standard,
            size: ImageSize::SQUARE,
            reference_photo: None,
        };
        let outcome = run_image_job(&imagegen, &completer, Personality::Standard, &job).await;
        assert!(matches!(outcome, ImageOutcome::Generated { .. }));
    }

    #[tokio::test]
    async fn reports_structured_failure_when_retries_exhausted() {
        let imagegen = FlakyImageGen { failures_before_success: 10, calls: AtomicUsize::new(0) };
        let completer = StubCompleter;
        let job = ImageJob {
            user_id: "U1".into(),
            name: "Alex".into(),
            quality: ImageQuality::Standard,
            size: ImageSize::SQUARE,
            reference_photo: None,
        };
        let outcome = run_image_job(&imagegen, &completer, Personality::Standard, &job).await;
        assert!(matches!(outcome, ImageOutcome::Failed { .. }));
    }
}
