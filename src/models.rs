use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use validator::Validate;

use crate::catalog::{self, CorrectRule};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum QuestionType {
    #[serde(rename = "radio")]
    SingleChoice,
    #[serde(rename = "checkbox")]
    MultipleChoice,
    #[serde(rename = "true_false")]
    TrueFalse,
    #[serde(rename = "ranking")]
    Ranking,
    #[serde(rename = "rating")]
    Rating,
    #[serde(rename = "fill_blank")]
    FillInTheBlank,
    #[serde(rename = "short_text")]
    ShortText,
    #[serde(rename = "matching")]
    Matching,
    #[serde(rename = "essay")]
    Essay,
}

impl QuestionType {
    pub const ALL: [QuestionType; 9] = [
        QuestionType::SingleChoice,
        QuestionType::MultipleChoice,
        QuestionType::TrueFalse,
        QuestionType::Ranking,
        QuestionType::Rating,
        QuestionType::FillInTheBlank,
        QuestionType::ShortText,
        QuestionType::Matching,
        QuestionType::Essay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::SingleChoice => "radio",
            QuestionType::MultipleChoice => "checkbox",
            QuestionType::TrueFalse => "true_false",
            QuestionType::Ranking => "ranking",
            QuestionType::Rating => "rating",
            QuestionType::FillInTheBlank => "fill_blank",
            QuestionType::ShortText => "short_text",
            QuestionType::Matching => "matching",
            QuestionType::Essay => "essay",
        }
    }
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationStatus::Completed | GenerationStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Text,
    Image,
    Pdf,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [SourceType::Text, SourceType::Image, SourceType::Pdf];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Text => "text",
            SourceType::Image => "image",
            SourceType::Pdf => "pdf",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TargetAudience {
    Beginner,
    Intermediate,
    Expert,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Tone {
    Formal,
    Informal,
    Humorous,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Guidelines {
    pub target_audience: TargetAudience,
    #[validate(length(min = 1, message = "Language must be a non-empty string."))]
    pub language: String,
    pub tone: Tone,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QuestionTypeRequest {
    pub id: QuestionType,
    #[validate(range(min = 1, message = "Quantity must be a positive integer."))]
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartGenerationRequest {
    #[validate(length(min = 1, message = "Must select at least one question type."))]
    #[validate(nested)]
    pub question_types: Vec<QuestionTypeRequest>,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 20, max = 5000, message = "Source text must be between 20 and 5000 characters."))]
    pub source_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_id: Option<String>,
    #[validate(nested)]
    pub guidelines: Guidelines,
}

impl StartGenerationRequest {
    pub fn requested_count(&self) -> u32 {
        self.question_types.iter().map(|q| q.quantity).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
    pub is_correct: bool,
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedQuestion {
    pub id: String,
    #[serde(rename = "type")]
    pub q_type: QuestionType,
    pub question_text: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    pub points: u32,
    pub difficulty: Difficulty,
    pub quality_score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
}

fn issue(field: String, text: &str) -> ValidationIssue {
    ValidationIssue { field, issue: text.into() }
}

/// Checks generated questions against the per-type option rules from the
/// catalog. Structural shape is enforced earlier by the JSON schema.
pub fn validate_questions(questions: &[GeneratedQuestion]) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    if questions.is_empty() {
        issues.push(issue("questions".into(), "must contain at least one question"));
    }

    let mut question_ids = HashSet::new();
    for (i, q) in questions.iter().enumerate() {
        if !question_ids.insert(q.id.as_str()) {
            issues.push(issue(format!("questions[{i}].id"), "must be unique"));
        }
        if q.question_text.trim().is_empty() {
            issues.push(issue(format!("questions[{i}].questionText"), "must not be empty"));
        }
        if q.quality_score > 100 {
            issues.push(issue(format!("questions[{i}].qualityScore"), "must be between 0 and 100"));
        }

        let mut option_ids = HashSet::new();
        for (j, opt) in q.options.iter().enumerate() {
            if opt.text.trim().is_empty() {
                issues.push(issue(format!("questions[{i}].options[{j}].text"), "must not be empty"));
            }
            if !option_ids.insert(opt.id.as_str()) {
                issues.push(issue(format!("questions[{i}].options[{j}].id"), "must be unique"));
            }
        }

        let rules = catalog::option_rules(q.q_type);
        let count = q.options.len();
        if count < rules.min_options {
            issues.push(issue(
                format!("questions[{i}].options"),
                &format!("{} questions need at least {} options", q.q_type, rules.min_options),
            ));
        }
        if let Some(max) = rules.max_options {
            if count > max {
                issues.push(issue(
                    format!("questions[{i}].options"),
                    &format!("{} questions allow at most {} options", q.q_type, max),
                ));
            }
        }

        let correct = q.options.iter().filter(|o| o.is_correct).count();
        match rules.correct {
            CorrectRule::ExactlyOne if correct != 1 => issues.push(issue(
                format!("questions[{i}].options"),
                "must mark exactly one option as correct",
            )),
            CorrectRule::AtLeastOne if correct == 0 => issues.push(issue(
                format!("questions[{i}].options"),
                "must mark at least one option as correct",
            )),
            _ => {}
        }

        if rules.requires_match {
            for (j, opt) in q.options.iter().enumerate() {
                let missing = opt.match_text.as_deref().map(|m| m.trim().is_empty()).unwrap_or(true);
                if missing {
                    issues.push(issue(format!("questions[{i}].options[{j}].match"), "is required for matching"));
                }
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}
