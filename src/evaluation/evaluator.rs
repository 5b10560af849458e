use serde_json::Value;
use tracing::debug;

use crate::error::{BenchError, Result};
use crate::types::Task;

const SYSTEM_PROMPT: &str = "\
You grade answers to benchmark questions. Compare the submitted answer with the reference \
material and reply with a single JSON object and nothing else.

Scoring bands (grade is a number between 0.00 and 1.00 with two decimals):
- 1.00: the submitted answer matches the most expected answer in substance.
- 0.85 to 0.95: matches the good answer, or the most expected one with minor omissions.
- 0.65 to 0.79: satisfies the minimal pass criteria but misses important detail.
- 0.30 to 0.60: partly correct, or correct content mixed with errors.
- 0.00 to 0.29: wrong, off topic, or heading in the incorrect direction described.

Judge meaning rather than wording. Ignore style, length and formatting unless they change the \
meaning. Do not reward confident tone.

Reply format: {\"reason\": \"<one or two sentences>\", \"grade\": <number>}";

#[derive(Debug, Clone, PartialEq)]
pub struct JudgePrompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Always within [0.0, 1.0], rounded to two decimals.
    pub score: f64,
    pub rationale: String,
}

pub struct Evaluator;

impl Evaluator {
    pub fn build_prompt(task: &Task, response: &str) -> JudgePrompt {
        let user = format!(
            "Question:\n{question}\n\n\
             Most expected answer:\n{most}\n\n\
             Good answer:\n{good}\n\n\
             Minimal pass criteria:\n{pass}\n\n\
             Incorrect direction:\n{incorrect}\n\n\
             Category: {category} / {sub_category}\n\n\
             Submitted answer:\n{response}\n",
            question = task.prompt,
            most = or_none(&task.rubric.most_expected),
            good = or_none(&task.rubric.acceptable),
            pass = or_none(&task.rubric.minimal_pass),
            incorrect = or_none(&task.incorrect_direction),
            category = task.category,
            sub_category = task.sub_category,
            response = response,
        );
        JudgePrompt {
            system: SYSTEM_PROMPT.to_string(),
            user,
        }
    }

    pub fn parse_verdict(raw: &str) -> Result<Verdict> {
        let body = extract_object(raw)
            .ok_or_else(|| BenchError::JudgeParse("no JSON object in judge output".into()))?;
        let value: Value = serde_json::from_str(body)
            .map_err(|e| BenchError::JudgeParse(format!("invalid JSON: {}", e)))?;

        let grade = match value.get("grade") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| BenchError::JudgeParse("missing or non-numeric grade".into()))?;

        let rationale = match value.get("reason") {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => String::new(),
        };

        let score = normalize_score(grade)?;
        debug!(raw_grade = grade, score, "Parsed judge verdict");
        Ok(Verdict { score, rationale })
    }
}

fn or_none(s: &str) -> &str {
    if s.trim().is_empty() {
        "(none given)"
    } else {
        s
    }
}

/// Strips chat-template markers and code fences, then takes the span from the
/// first `{` to the last `}`.
fn extract_object(raw: &str) -> Option<&str> {
    let mut s = raw.trim();
    for marker in ["<start_of_turn>", "<end_of_turn>", "</start_of_turn>", "</end_of_turn>"] {
        s = s.trim_start_matches(marker).trim_end_matches(marker).trim();
    }
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

/// Maps a raw grade onto the unit interval. Grades above 1 and up to 100 are
/// read as percentages.
pub fn normalize_score(grade: f64) -> Result<f64> {
    if !grade.is_finite() || grade < 0.0 || grade > 100.0 {
        return Err(BenchError::JudgeParse(format!("grade {} out of range", grade)));
    }
    let unit = if grade > 1.0 { grade / 100.0 } else { grade };
    Ok((unit.clamp(0.0, 1.0) * 100.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;

    #[test]
    fn test_prompt_embeds_rubric_and_response() {
        let task = testkit::task("t9");
        let prompt = Evaluator::build_prompt(&task, "my answer");
        assert!(prompt.system.contains("\"grade\""));
        assert!(prompt.user.contains("question-t9"));
        assert!(prompt.user.contains("best answer for t9"));
        assert!(prompt.user.contains("close enough"));
        assert!(prompt.user.contains("partially right"));
        assert!(prompt.user.contains("anything unrelated"));
        assert!(prompt.user.contains("general / facts"));
        assert!(prompt.user.ends_with("my answer\n"));
    }

    #[test]
    fn test_prompt_marks_empty_rubric_fields() {
        let mut task = testkit::task("t1");
        task.rubric.acceptable = String::new();
        let prompt = Evaluator::build_prompt(&task, "x");
        assert!(prompt.user.contains("Good answer:\n(none given)"));
    }

    #[test]
    fn test_parse_plain_json() {
        let v = Evaluator::parse_verdict(r#"{"reason": "exact match", "grade": 1.0}"#).unwrap();
        assert_eq!(v.score, 1.0);
        assert_eq!(v.rationale, "exact match");
    }

    #[test]
    fn test_parse_fenced_json_with_markers() {
        let raw = "<start_of_turn>```json\n{\"reason\": \"mostly right\", \"grade\": 0.876}\n```<end_of_turn>";
        let v = Evaluator::parse_verdict(raw).unwrap();
        assert_eq!(v.score, 0.88);
        assert_eq!(v.rationale, "mostly right");
    }

    #[test]
    fn test_parse_json_inside_prose() {
        let raw = "Sure! Here is my verdict: {\"grade\": \"0.7\", \"reason\": \"passes\"} Hope that helps.";
        let v = Evaluator::parse_verdict(raw).unwrap();
        assert_eq!(v.score, 0.7);
    }

    #[test]
    fn test_percentage_grades_are_normalized() {
        let v = Evaluator::parse_verdict(r#"{"reason": "ok", "grade": 85}"#).unwrap();
        assert_eq!(v.score, 0.85);
        let v = Evaluator::parse_verdict(r#"{"reason": "ok", "grade": "60%"}"#).unwrap();
        assert_eq!(v.score, 0.6);
    }

    #[test]
    fn test_unparseable_outputs() {
        for raw in [
            "I think it is pretty good",
            "{not json}",
            r#"{"reason": "no grade here"}"#,
            r#"{"reason": "x", "grade": "high"}"#,
            r#"{"reason": "x", "grade": 250}"#,
            r#"{"reason": "x", "grade": -0.5}"#,
        ] {
            let err = Evaluator::parse_verdict(raw).unwrap_err();
            assert_eq!(err.code(), "judge_parse_error", "input: {}", raw);
        }
    }

    #[test]
    fn test_normalize_score_boundaries() {
        assert_eq!(normalize_score(0.0).unwrap(), 0.0);
        assert_eq!(normalize_score(1.0).unwrap(), 1.0);
        assert_eq!(normalize_score(100.0).unwrap(), 1.0);
        assert_eq!(normalize_score(0.333).unwrap(), 0.33);
        assert!(normalize_score(f64::NAN).is_err());
    }
}
