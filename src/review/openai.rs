#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::path::Path;

use anyhow::{Context, Result};
use async_openai::{
    Client as OpenAIClient,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs, ResponseFormat,
    },
};
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;

use super::{FigureRequest, ReviewClient, ReviewError, ReviewRequest, ReviewScore};
use crate::config::OpenAiEnv;

/// System prompt sent with every review.
const SYSTEM_PROMPT: &str = include_str!("prompts/system.md");
/// System prompt sent with every figure.
const FIGURE_PROMPT: &str = include_str!("prompts/figure.md");
/// Completion budget for a figure description.
const FIGURE_MAX_TOKENS: u32 = 500;

/// Reviews artifacts through an OpenAI-compatible chat completion endpoint.
pub struct OpenAiReviewer {
    /// API client.
    client:      OpenAIClient<OpenAIConfig>,
    /// Model identifier.
    model:       String,
    /// Sampling temperature, if configured.
    temperature: Option<f32>,
}

impl OpenAiReviewer {
    /// Builds a reviewer from environment-derived credentials.
    pub fn new(env: &OpenAiEnv) -> Result<Self> {
        let mut config = OpenAIConfig::new().with_api_key(env.api_key());
        if let Some(base) = env.api_base() {
            config = config.with_api_base(base);
        }
        let http = reqwest::Client::builder()
            // Avoid macOS dynamic store lookups that fail in sandboxed environments.
            .no_proxy()
            .build()
            .context("Failed to construct HTTP client for the reviewer")?;

        Ok(Self {
            client:      OpenAIClient::with_config(config).with_http_client(http),
            model:       env.model().to_string(),
            temperature: env.temperature(),
        })
    }

    /// User message describing the criterion and artifact.
    fn user_prompt(request: &ReviewRequest) -> String {
        let c = &request.criterion;
        let extra = if c.extra_credit { " (extra credit)" } else { "" };
        format!(
            "{context}\n\n## Criterion to grade\n\nSection: {section}{extra}\nMaximum points: \
             {max}\nDescription: {description}\n\n## Student artifact\n\n{artifact}\n",
            context = request.context,
            section = c.section_name(),
            max = c.max_points,
            description = if c.description.is_empty() { "(none)" } else { c.description.as_str() },
            artifact = request.artifact_text,
        )
    }
}

/// MIME type for an image file, by extension.
fn image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => "image/jpeg",
    }
}

/// Inline `data:` URL carrying the image bytes.
fn image_data_url(path: &Path, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        image_mime(path),
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Sorts provider errors into retryable and final kinds.
fn classify(err: OpenAIError) -> ReviewError {
    match err {
        OpenAIError::Reqwest(e) => {
            if e.status().is_some_and(|s| s.as_u16() == 429) {
                ReviewError::RateLimited(e.to_string())
            } else if e.status().is_some_and(|s| s.as_u16() == 401 || s.as_u16() == 403) {
                ReviewError::Rejected(e.to_string())
            } else {
                ReviewError::Provider(e.to_string())
            }
        }
        OpenAIError::ApiError(api) => {
            let message = api.message.to_lowercase();
            let code = api.code.clone().unwrap_or_default().to_lowercase();
            if message.contains("rate limit") || code.contains("rate_limit") {
                ReviewError::RateLimited(api.message)
            } else if code.contains("invalid_api_key") || message.contains("incorrect api key") {
                ReviewError::Rejected(api.message)
            } else {
                ReviewError::Provider(api.message)
            }
        }
        OpenAIError::JSONDeserialize(e) => ReviewError::Malformed(e.to_string()),
        OpenAIError::InvalidArgument(msg) => ReviewError::Rejected(msg),
        other => ReviewError::Provider(other.to_string()),
    }
}

/// Expected response body.
#[derive(Deserialize)]
struct ReviewPayload {
    /// Points awarded.
    awarded:    f64,
    /// Feedback text.
    feedback:   String,
    /// Optional confidence.
    #[serde(default)]
    confidence: Option<f64>,
}

/// Parses the model's JSON verdict, tolerating a surrounding code fence.
pub fn parse_review_json(content: &str) -> Result<(f64, String, Option<f64>), ReviewError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let payload: ReviewPayload =
        serde_json::from_str(body).map_err(|e| ReviewError::Malformed(e.to_string()))?;
    if payload.feedback.trim().is_empty() {
        return Err(ReviewError::Malformed("empty feedback".into()));
    }
    Ok((payload.awarded, payload.feedback, payload.confidence))
}

#[async_trait]
impl ReviewClient for OpenAiReviewer {
    async fn score(&self, request: &ReviewRequest) -> Result<ReviewScore, ReviewError> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SYSTEM_PROMPT)
                .build()
                .map_err(classify)?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(Self::user_prompt(request))
                .build()
                .map_err(classify)?
                .into(),
        ];

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(messages)
            .response_format(ResponseFormat::JsonObject);
        if let Some(t) = self.temperature {
            args.temperature(t);
        }
        let chat_request = args.build().map_err(classify)?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(classify)?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ReviewError::Malformed("response has no content".into()))?;

        let (awarded, feedback, confidence) = parse_review_json(&content)?;
        Ok(ReviewScore {
            awarded,
            feedback,
            confidence,
            model: response.model,
            raw_response: content,
        })
    }

    async fn describe_figure(&self, request: &FigureRequest) -> Result<String, ReviewError> {
        let bytes = tokio::fs::read(&request.path).await.map_err(|e| {
            ReviewError::Rejected(format!("could not read {}: {e}", request.path.display()))
        })?;

        let prompt = if request.caption.trim().is_empty() {
            "Please describe this figure.".to_string()
        } else {
            format!("Please describe this figure. Its caption is: {}", request.caption)
        };
        let image = ImageUrlArgs::default()
            .url(image_data_url(&request.path, &bytes))
            .detail(ImageDetail::Auto)
            .build()
            .map_err(classify)?;

        let parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(prompt)
                .build()
                .map_err(classify)?
                .into(),
            ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(image)
                .build()
                .map_err(classify)?
                .into(),
        ];
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(FIGURE_PROMPT)
                .build()
                .map_err(classify)?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(parts)
                .build()
                .map_err(classify)?
                .into(),
        ];

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .max_completion_tokens(FIGURE_MAX_TOKENS)
            .build()
            .map_err(classify)?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(classify)?;

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ReviewError::Malformed("figure description is empty".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let (awarded, feedback, confidence) =
            parse_review_json("```json\n{\"awarded\": 8, \"feedback\": \"Good work\"}\n```")
                .expect("valid payload");
        assert_eq!(awarded, 8.0);
        assert_eq!(feedback, "Good work");
        assert_eq!(confidence, None);
    }

    #[test]
    fn figures_are_inlined_as_data_urls() {
        let url = image_data_url(Path::new("plots/Age.PNG"), b"abc");
        assert_eq!(url, "data:image/png;base64,YWJj");
        assert!(image_data_url(Path::new("scan.jpg"), b"").starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn rejects_non_conforming_payloads() {
        assert!(matches!(
            parse_review_json("I would give this an 8/10"),
            Err(ReviewError::Malformed(_))
        ));
        assert!(matches!(
            parse_review_json("{\"score\": 8, \"feedback\": \"x\"}"),
            Err(ReviewError::Malformed(_))
        ));
        assert!(matches!(
            parse_review_json("{\"awarded\": 8, \"feedback\": \"  \"}"),
            Err(ReviewError::Malformed(_))
        ));
    }
}
