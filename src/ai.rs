//! LLM access for question generation.
//!
//! The runner only needs raw JSON text back from the model; parsing and
//! validation happen in later stages so each stage can fail on its own.
//! API keys and source text are never logged.

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::OpenAiConfig;
use crate::generation::GenerationError;
use crate::models::{GeneratedQuestion, QuestionType, SourceType, StartGenerationRequest};

/// Extracted source text handed to the model is capped at this many chars.
pub const MAX_SOURCE_EXCERPT_CHARS: usize = 12_000;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("OpenAI API key is not configured.")]
    NotConfigured,
    #[error("OpenAI API Error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Failed to generate questions using OpenAI: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("OpenAI returned an empty response.")]
    EmptyResponse,
}

#[derive(Debug, Clone)]
pub struct PromptInput {
    pub request: StartGenerationRequest,
    /// Text extracted from an uploaded PDF, when one was referenced.
    pub source_excerpt: Option<String>,
}

pub trait AiQuestionClient: Send + Sync {
    fn generate_questions_json(&self, input: &PromptInput) -> BoxFuture<'static, Result<String, AiError>>;
}

const SYSTEM_PROMPT: &str = r#"You are an expert AI assistant that generates high-quality quiz and poll questions. Your task is to create questions based on the user's provided source content and guidelines.

You MUST adhere to the following rules:
1.  Your entire response MUST be a single, valid JSON object.
2.  The root of this JSON object MUST have a single key named "questions".
3.  The value of the "questions" key MUST be an array of question objects.
4.  Each question object MUST have the properties "id", "type", "questionText", "options", "points", "difficulty", "qualityScore" and "explanation".
5.  "id" must be a unique UUID string for each question.
6.  "type" must be one of: "radio", "checkbox", "true_false", "ranking", "rating", "fill_blank", "short_text", "matching", "essay".
7.  "questionText" is the main text of the question.
8.  "options" is an array of objects with "id" (a unique UUID), "text" and "isCorrect" (boolean). Matching questions also carry a "match" property with the paired text.
9.  "points" is a non-negative integer.
10. "difficulty" must be one of "Easy", "Medium" or "Hard".
11. "qualityScore" is your confidence in the question, an integer from 0 to 100.
12. "explanation" is a brief rationale for the correct answer.

Do not include any text, markdown, or explanations outside of the main JSON object.
"#;

pub fn user_prompt(input: &PromptInput) -> String {
    let request = &input.request;
    let source_info = match (request.source_type, request.source_text.as_deref(), input.source_excerpt.as_deref()) {
        (SourceType::Text, Some(text), _) => format!("Source Content (Text):\n---\n{}\n---", text),
        (SourceType::Pdf, _, Some(excerpt)) => {
            let excerpt: String = excerpt.chars().take(MAX_SOURCE_EXCERPT_CHARS).collect();
            format!("Source Content (extracted from PDF):\n---\n{}\n---", excerpt)
        }
        (source, _, _) => format!(
            "Source Content: The user has provided a {} file. Please generate questions based on the general topic implied by the request.",
            source.as_str()
        ),
    };

    let question_requests = request
        .question_types
        .iter()
        .map(|qt| format!("- {} question(s) of type \"{}\"", qt.quantity, qt.id))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Please generate questions based on the following requirements:\n\n\
         ## Generation Guidelines\n\
         - Target Audience: {:?}\n\
         - Language: {}\n\
         - Tone: {:?}\n\n\
         ## Source Information\n{}\n\n\
         ## Requested Questions\n{}\n\n\
         Remember to follow all rules from the system prompt and provide your response as a single, valid JSON object with a \"questions\" key.\n",
        request.guidelines.target_audience,
        request.guidelines.language,
        request.guidelines.tone,
        source_info,
        question_requests,
    )
}

#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(cfg: &OpenAiConfig) -> Result<Self, AiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
        })
    }

    #[instrument(level = "info", skip(self, system, user), fields(model = %self.model, prompt_len = user.len()))]
    async fn chat_json(&self, system: &str, user: &str) -> Result<String, AiError> {
        let api_key = self.api_key.as_deref().ok_or(AiError::NotConfigured)?;
        let url = format!("{}/chat/completions", self.base_url);
        let req = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessageReq { role: "system", content: system },
                ChatMessageReq { role: "user", content: user },
            ],
            temperature: self.temperature,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let res = self
            .client
            .post(&url)
            .header(USER_AGENT, "quizgen-backend/0.1")
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", api_key))
            .json(&req)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            let message = extract_openai_error(&body).unwrap_or(body);
            warn!(status, "openai request rejected");
            return Err(AiError::Api { status, message });
        }

        let body: ChatCompletionResponse = res.json().await?;
        if let Some(usage) = &body.usage {
            info!(
                prompt_tokens = ?usage.prompt_tokens,
                completion_tokens = ?usage.completion_tokens,
                total_tokens = ?usage.total_tokens,
                "openai usage"
            );
        }
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(AiError::EmptyResponse)
    }
}

impl AiQuestionClient for OpenAiClient {
    fn generate_questions_json(&self, input: &PromptInput) -> BoxFuture<'static, Result<String, AiError>> {
        let this = self.clone();
        let user = user_prompt(input);
        Box::pin(async move { this.chat_json(SYSTEM_PROMPT, &user).await })
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageReq<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessageReq<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResp,
}

#[derive(Deserialize)]
struct ChatMessageResp {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    total_tokens: Option<u32>,
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Wrapper {
        error: Inner,
    }
    #[derive(Deserialize)]
    struct Inner {
        message: String,
    }
    serde_json::from_str::<Wrapper>(body).ok().map(|w| w.error.message)
}

/// Offline client used when no API key is configured and in tests. Produces
/// questions of exactly the requested types and quantities.
#[derive(Clone)]
pub struct MockAiClient;

impl MockAiClient {
    fn question(q_type: QuestionType, n: u32, topic: &str) -> Value {
        let opt = |text: &str, is_correct: bool| json!({"text": text, "isCorrect": is_correct});
        let options = match q_type {
            QuestionType::SingleChoice => vec![opt("Option A", true), opt("Option B", false), opt("Option C", false)],
            QuestionType::MultipleChoice => vec![opt("Option A", true), opt("Option B", true), opt("Option C", false)],
            QuestionType::TrueFalse => vec![opt("True", true), opt("False", false)],
            QuestionType::Ranking => vec![opt("First", false), opt("Second", false), opt("Third", false)],
            QuestionType::Rating => (1..=5).map(|i| opt(&i.to_string(), false)).collect(),
            QuestionType::FillInTheBlank => vec![opt("answer", true)],
            QuestionType::Matching => vec![
                json!({"text": "Term 1", "isCorrect": false, "match": "Definition 1"}),
                json!({"text": "Term 2", "isCorrect": false, "match": "Definition 2"}),
            ],
            QuestionType::ShortText | QuestionType::Essay => Vec::new(),
        };
        json!({
            "type": q_type,
            "questionText": format!("{} question {} about {}", q_type, n, topic),
            "options": options,
            "points": 1,
            "difficulty": "Medium",
            "qualityScore": 75,
            "explanation": "Generated offline."
        })
    }
}

impl AiQuestionClient for MockAiClient {
    fn generate_questions_json(&self, input: &PromptInput) -> BoxFuture<'static, Result<String, AiError>> {
        let topic: String = input
            .request
            .source_text
            .as_deref()
            .or(input.source_excerpt.as_deref())
            .unwrap_or("the provided material")
            .chars()
            .take(40)
            .collect();
        let questions: Vec<Value> = input
            .request
            .question_types
            .iter()
            .flat_map(|qt| (1..=qt.quantity).map(move |n| (qt.id, n)))
            .map(|(q_type, n)| Self::question(q_type, n, &topic))
            .collect();
        let payload = json!({ "questions": questions }).to_string();
        Box::pin(async move { Ok(payload) })
    }
}

static FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json)?\s*(.*?)\s*```$").expect("fence pattern compiles"));

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    FENCED
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed)
}

fn fill_missing_id(obj: &mut serde_json::Map<String, Value>) {
    let missing = obj
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().is_empty())
        .unwrap_or(true);
    if missing {
        obj.insert("id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
    }
}

/// Turns raw model output into typed questions: strips markdown fences,
/// requires a `questions` array, assigns UUIDs the model left out and checks
/// the result against the bundled JSON schema.
pub fn parse_generated_questions(
    raw: &str,
    validator: &jsonschema::Validator,
) -> Result<Vec<GeneratedQuestion>, GenerationError> {
    let cleaned = strip_fences(raw);
    let mut value: Value = serde_json::from_str(cleaned)
        .map_err(|e| GenerationError::MalformedOutput(format!("response is not valid JSON ({})", e)))?;

    let questions = value
        .get_mut("questions")
        .and_then(|q| q.as_array_mut())
        .ok_or_else(|| GenerationError::MalformedOutput("it did not contain a 'questions' array".into()))?;

    for question in questions.iter_mut() {
        let Some(obj) = question.as_object_mut() else { continue; };
        fill_missing_id(obj);
        if let Some(options) = obj.get_mut("options").and_then(|o| o.as_array_mut()) {
            for option in options.iter_mut().filter_map(|o| o.as_object_mut()) {
                fill_missing_id(option);
            }
        }
    }

    if !validator.is_valid(&value) {
        let issues: Vec<String> = validator
            .iter_errors(&value)
            .take(3)
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect();
        return Err(GenerationError::MalformedOutput(issues.join("; ")));
    }

    #[derive(Deserialize)]
    struct Envelope {
        questions: Vec<GeneratedQuestion>,
    }
    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|e| GenerationError::MalformedOutput(format!("cannot decode questions ({})", e)))?;
    Ok(envelope.questions)
}
