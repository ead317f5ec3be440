//! Question-type catalog: display metadata, per-type credit cost and the
//! option constraints generated questions of each type must satisfy.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use crate::models::QuestionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectRule {
    Any,
    ExactlyOne,
    AtLeastOne,
}

#[derive(Debug, Clone, Copy)]
pub struct OptionRules {
    pub min_options: usize,
    pub max_options: Option<usize>,
    pub correct: CorrectRule,
    pub requires_match: bool,
}

impl OptionRules {
    const fn free() -> Self {
        Self { min_options: 0, max_options: None, correct: CorrectRule::Any, requires_match: false }
    }

    fn to_json_schema(self) -> serde_json::Value {
        let mut option_props = json!({
            "id": {"type": "string"},
            "text": {"type": "string", "minLength": 1},
            "isCorrect": {"type": "boolean"}
        });
        let mut required = vec!["text", "isCorrect"];
        if self.requires_match {
            option_props["match"] = json!({"type": "string", "minLength": 1});
            required.push("match");
        }
        let mut options = json!({
            "type": "array",
            "minItems": self.min_options,
            "items": {"type": "object", "properties": option_props, "required": required}
        });
        if let Some(max) = self.max_options {
            options["maxItems"] = json!(max);
        }
        let correct = match self.correct {
            CorrectRule::Any => "any",
            CorrectRule::ExactlyOne => "exactly_one",
            CorrectRule::AtLeastOne => "at_least_one",
        };
        json!({
            "type": "object",
            "properties": {"options": options},
            "x-correct-options": correct
        })
    }
}

pub fn option_rules(q_type: QuestionType) -> OptionRules {
    match q_type {
        QuestionType::SingleChoice => OptionRules { min_options: 2, correct: CorrectRule::ExactlyOne, ..OptionRules::free() },
        QuestionType::MultipleChoice => OptionRules { min_options: 2, correct: CorrectRule::AtLeastOne, ..OptionRules::free() },
        QuestionType::TrueFalse => OptionRules {
            min_options: 2,
            max_options: Some(2),
            correct: CorrectRule::ExactlyOne,
            requires_match: false,
        },
        QuestionType::Ranking => OptionRules { min_options: 2, ..OptionRules::free() },
        QuestionType::Matching => OptionRules { min_options: 2, requires_match: true, ..OptionRules::free() },
        QuestionType::FillInTheBlank => OptionRules { min_options: 1, correct: CorrectRule::AtLeastOne, ..OptionRules::free() },
        QuestionType::Rating | QuestionType::ShortText | QuestionType::Essay => OptionRules::free(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiQuestionType {
    pub id: &'static str,
    pub name: &'static str,
    #[serde(rename = "type")]
    pub q_type: QuestionType,
    pub description: &'static str,
    pub cost: i64,
    pub icon: &'static str,
    pub json_schema: serde_json::Value,
}

fn entry(
    id: &'static str,
    name: &'static str,
    q_type: QuestionType,
    description: &'static str,
    cost: i64,
    icon: &'static str,
) -> ApiQuestionType {
    ApiQuestionType {
        id,
        name,
        q_type,
        description,
        cost,
        icon,
        json_schema: option_rules(q_type).to_json_schema(),
    }
}

pub static QUESTION_TYPES: Lazy<Vec<ApiQuestionType>> = Lazy::new(|| {
    vec![
        entry("qt-001", "Single Choice", QuestionType::SingleChoice, "A question with multiple options where only one is correct.", 3, "Circle"),
        entry("qt-002", "Multiple Choice", QuestionType::MultipleChoice, "A question with multiple options where several can be correct.", 4, "CheckSquare"),
        entry("qt-003", "True/False", QuestionType::TrueFalse, "A statement that is either true or false.", 2, "ToggleLeft"),
        entry("qt-004", "Ranking", QuestionType::Ranking, "A question asking to order items.", 5, "BarChart3"),
        entry("qt-005", "Rating", QuestionType::Rating, "A question asking to rate something on a scale.", 2, "Star"),
        entry("qt-006", "Fill in the Blank", QuestionType::FillInTheBlank, "A sentence with a missing word to be filled in.", 3, "Edit3"),
        entry("qt-007", "Short Text", QuestionType::ShortText, "A question requiring a brief written answer.", 4, "Type"),
        entry("qt-008", "Matching", QuestionType::Matching, "Match items from two lists.", 6, "GitMerge"),
        entry("qt-009", "Essay", QuestionType::Essay, "A question requiring a long-form written answer.", 8, "FileText"),
    ]
});

pub fn lookup(q_type: QuestionType) -> Option<&'static ApiQuestionType> {
    QUESTION_TYPES.iter().find(|qt| qt.q_type == q_type)
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Selection {
    #[serde(rename = "type")]
    pub q_type: QuestionType,
    #[validate(range(min = 1, message = "Quantity must be a positive integer."))]
    pub quantity: u32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ValidateSelectionRequest {
    #[validate(length(min = 1, message = "Selections must be a non-empty array."))]
    #[validate(nested)]
    pub selections: Vec<Selection>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BreakdownLine {
    pub name: String,
    pub quantity: u32,
    pub cost: i64,
    pub subtotal: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub total_cost: i64,
    pub breakdown: Vec<BreakdownLine>,
}

pub fn price_selection<I>(selections: I) -> Quote
where
    I: IntoIterator<Item = (QuestionType, u32)>,
{
    let mut total_cost = 0;
    let breakdown = selections
        .into_iter()
        .map(|(q_type, quantity)| {
            let info = lookup(q_type);
            let cost = info.map(|qt| qt.cost).unwrap_or(0);
            let subtotal = i64::from(quantity) * cost;
            total_cost += subtotal;
            BreakdownLine {
                name: info.map(|qt| qt.name).unwrap_or("Unknown").to_string(),
                quantity,
                cost,
                subtotal,
            }
        })
        .collect();
    Quote { total_cost, breakdown }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SelectionVerdict {
    #[serde(rename_all = "camelCase")]
    Valid {
        is_valid: bool,
        total_cost: i64,
        remaining_balance: i64,
        breakdown: Vec<BreakdownLine>,
    },
    #[serde(rename_all = "camelCase")]
    Insufficient {
        is_valid: bool,
        message: String,
        total_cost: i64,
        user_balance: i64,
    },
}

pub fn judge_selection(quote: Quote, balance: i64) -> SelectionVerdict {
    if quote.total_cost > balance {
        SelectionVerdict::Insufficient {
            is_valid: false,
            message: "Insufficient credits for this selection.".into(),
            total_cost: quote.total_cost,
            user_balance: balance,
        }
    } else {
        SelectionVerdict::Valid {
            is_valid: true,
            total_cost: quote.total_cost,
            remaining_balance: balance - quote.total_cost,
            breakdown: quote.breakdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_every_type_once() {
        assert_eq!(QUESTION_TYPES.len(), QuestionType::ALL.len());
        for q_type in QuestionType::ALL {
            assert_eq!(QUESTION_TYPES.iter().filter(|qt| qt.q_type == q_type).count(), 1);
        }
        assert_eq!(lookup(QuestionType::Essay).map(|qt| qt.cost), Some(8));
        assert_eq!(lookup(QuestionType::TrueFalse).map(|qt| qt.cost), Some(2));
    }

    #[test]
    fn price_selection_sums_subtotals() {
        let quote = price_selection([
            (QuestionType::SingleChoice, 5),
            (QuestionType::Matching, 2),
        ]);
        assert_eq!(quote.total_cost, 5 * 3 + 2 * 6);
        assert_eq!(quote.breakdown[1].name, "Matching");
        assert_eq!(quote.breakdown[1].subtotal, 12);
    }

    #[test]
    fn judge_selection_reports_shortfall() {
        let quote = price_selection([(QuestionType::Essay, 3)]);
        let verdict = serde_json::to_value(judge_selection(quote.clone(), 10)).unwrap();
        assert_eq!(verdict["isValid"], false);
        assert_eq!(verdict["totalCost"], 24);
        assert_eq!(verdict["userBalance"], 10);

        let verdict = serde_json::to_value(judge_selection(quote, 30)).unwrap();
        assert_eq!(verdict["isValid"], true);
        assert_eq!(verdict["remainingBalance"], 6);
    }

    #[test]
    fn schema_fragment_reflects_rules() {
        let tf = lookup(QuestionType::TrueFalse).unwrap();
        assert_eq!(tf.json_schema["properties"]["options"]["maxItems"], 2);
        assert_eq!(tf.json_schema["x-correct-options"], "exactly_one");
        let matching = lookup(QuestionType::Matching).unwrap();
        let required = matching.json_schema["properties"]["options"]["items"]["required"].clone();
        assert!(required.as_array().unwrap().iter().any(|v| v == "match"));
    }
}
