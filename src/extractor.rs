use serde::Serialize;
use serde_json::{Map, Value};

use crate::tail_str;

pub const NO_JSON_MSG: &str = "No JSON result found in logs";
pub const MISSING_SCORE_MSG: &str = "No 'score' found in script output. \
Ensure your script prints a single JSON line with a 'score' field.";

// How much raw output travels with a failure record for diagnostics.
const RESULT_TAIL_BYTES: usize = 500;

/// The submission's self-reported result: the last well-formed JSON object
/// in its output, field order preserved.
pub type ParsedRecord = Map<String, Value>;

/// Raised when no usable record can be pulled out of the captured output.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ResultError {
    pub message: String,
    /// Final bytes of the raw output, for operator debugging
    pub raw_tail: String,
}

/// How one finished run classifies, per the rule: success requires a clean
/// exit AND a numeric `score` in the record. Everything else is a failure,
/// even when parsing itself worked.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success {
        score: f64,
        /// Any additional fields the submission emitted, passed through opaquely
        extra: Map<String, Value>,
    },
    Failure {
        reason: String,
        raw_tail: String,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }
}

/// Extracts the last well-formed JSON object from mixed logs.
///
/// Submissions may print diagnostic JSON along the way; only the final
/// record is authoritative, so the scan runs from the bottom. A whole-log
/// brace slice is the fallback for records that did not land on one line.
pub fn extract_record(raw: &str) -> Result<ParsedRecord, ResultError> {
    for line in raw.lines().rev() {
        let line = line.trim();
        if line.is_empty() || !(line.starts_with('{') && line.ends_with('}')) {
            continue;
        }
        if let Ok(Value::Object(record)) = serde_json::from_str::<Value>(line) {
            return Ok(record);
        }
    }

    if let (Some(start), Some(end)) = (raw.rfind('{'), raw.rfind('}')) {
        if end > start {
            if let Ok(Value::Object(record)) = serde_json::from_str::<Value>(&raw[start..=end]) {
                return Ok(record);
            }
        }
    }

    Err(ResultError {
        message: NO_JSON_MSG.to_string(),
        raw_tail: tail_str(raw, RESULT_TAIL_BYTES).to_string(),
    })
}

/// Classifies one finished run from its exit code and captured output.
pub fn classify(exit_code: i64, raw: &str) -> RunOutcome {
    let raw_tail = tail_str(raw, RESULT_TAIL_BYTES).to_string();

    // A nonzero exit dominates whatever the process printed.
    if exit_code != 0 {
        return RunOutcome::Failure {
            reason: format!("Evaluator exited non-zero (exit code {exit_code})"),
            raw_tail,
        };
    }

    let mut record = match extract_record(raw) {
        Ok(record) => record,
        Err(e) => {
            return RunOutcome::Failure {
                reason: e.message,
                raw_tail: e.raw_tail,
            };
        }
    };

    match record.remove("score").as_ref().and_then(Value::as_f64) {
        Some(score) => RunOutcome::Success {
            score,
            extra: record,
        },
        None => {
            // A record that explains itself wins over the canned message.
            let reason = match record.get("error") {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::String(_)) | None => MISSING_SCORE_MSG.to_string(),
                Some(other) => other.to_string(),
            };
            RunOutcome::Failure { reason, raw_tail }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_last_json_line_wins() {
        let raw = "episode 1 done\n{\"score\": 1}\nepisode 2 done\n{\"score\": 2}\n";
        let record = extract_record(raw).unwrap();
        assert_eq!(record.get("score"), Some(&json!(2)));
    }

    #[test]
    fn test_malformed_tail_lines_are_skipped() {
        let raw = "{\"score\": 7}\n{not json}\n";
        let record = extract_record(raw).unwrap();
        assert_eq!(record.get("score"), Some(&json!(7)));
    }

    #[test]
    fn test_fallback_brace_slice() {
        let raw = "final result: {\"score\": 3.5} -- bye";
        let record = extract_record(raw).unwrap();
        assert_eq!(record.get("score"), Some(&json!(3.5)));
    }

    #[test]
    fn test_no_json_anywhere() {
        let raw = "Traceback (most recent call last):\n  ValueError: nope\n";
        let err = extract_record(raw).unwrap_err();
        assert_eq!(err.message, NO_JSON_MSG);
        assert!(!err.raw_tail.is_empty());
    }

    #[test]
    fn test_clean_exit_with_score_succeeds() {
        let outcome = classify(0, "{\"score\": 5, \"episodes\": 10}");
        match outcome {
            RunOutcome::Success { score, extra } => {
                assert_eq!(score, 5.0);
                assert_eq!(extra.get("episodes"), Some(&json!(10)));
            }
            RunOutcome::Failure { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn test_nonzero_exit_dominates_score() {
        let outcome = classify(1, "{\"score\": 5}");
        match outcome {
            RunOutcome::Failure { reason, .. } => assert!(reason.contains("non-zero")),
            RunOutcome::Success { .. } => panic!("nonzero exit must fail"),
        }
    }

    #[test]
    fn test_missing_score_synthesizes_message() {
        let outcome = classify(0, "{\"notes\": \"ok\"}");
        match outcome {
            RunOutcome::Failure { reason, .. } => assert_eq!(reason, MISSING_SCORE_MSG),
            RunOutcome::Success { .. } => panic!("score is required"),
        }
    }

    #[test]
    fn test_record_error_field_surfaces_verbatim() {
        let outcome = classify(0, "{\"error\": \"env CartPole-v1 not installed\"}");
        match outcome {
            RunOutcome::Failure { reason, .. } => {
                assert_eq!(reason, "env CartPole-v1 not installed");
            }
            RunOutcome::Success { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn test_non_numeric_score_is_a_failure() {
        let outcome = classify(0, "{\"score\": \"high\"}");
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_empty_output_fails_with_diag() {
        let outcome = classify(0, "");
        match outcome {
            RunOutcome::Failure { reason, .. } => assert_eq!(reason, NO_JSON_MSG),
            RunOutcome::Success { .. } => panic!("expected failure"),
        }
    }
}
