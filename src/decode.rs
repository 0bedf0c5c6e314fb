//! Strict decoding of completion-service text into typed debate records.
//!
//! Model output is prose-wrapped JSON at best. Extraction is tolerant
//! (fenced blocks, surrounding prose) but validation is not: a missing
//! field or an out-of-range probability is a `DecodeError`, which the
//! session treats exactly like a network failure.

use serde::Deserialize;

use crate::state::Confidence;

#[derive(Debug, Clone)]
pub struct DecodeError {
    pub msg: String,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error: {}", self.msg)
    }
}

impl std::error::Error for DecodeError {}

fn err(msg: impl Into<String>) -> DecodeError {
    DecodeError { msg: msg.into() }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvocateOutput {
    pub probability: f64,
    pub argument: String,
    #[serde(default)]
    pub citations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JudgeOutput {
    pub probability: f64,
    pub confidence: String,
    #[serde(default)]
    pub key_factors: Vec<String>,
    #[serde(default)]
    pub evidence_quality: String,
    pub rationale: String,
}

/// Locate the JSON object inside free text: prefer a fenced block, fall
/// back to the outermost brace pair.
fn extract_json(text: &str) -> Result<&str, DecodeError> {
    let body = if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        }
    } else {
        text
    };
    let open = body.find('{').ok_or_else(|| err("no JSON object in output"))?;
    let close = body.rfind('}').ok_or_else(|| err("unterminated JSON object"))?;
    if close < open {
        return Err(err("unterminated JSON object"));
    }
    Ok(&body[open..=close])
}

fn check_probability(p: f64) -> Result<(), DecodeError> {
    if !p.is_finite() || !(0.0..=1.0).contains(&p) {
        return Err(err(format!("probability {} outside [0,1]", p)));
    }
    Ok(())
}

pub fn decode_advocate(text: &str) -> Result<AdvocateOutput, DecodeError> {
    let json = extract_json(text)?;
    let out: AdvocateOutput =
        serde_json::from_str(json).map_err(|e| err(format!("advocate schema: {}", e)))?;
    check_probability(out.probability)?;
    if out.argument.trim().is_empty() {
        return Err(err("advocate argument empty"));
    }
    Ok(out)
}

pub fn decode_judge(text: &str) -> Result<JudgeOutput, DecodeError> {
    let json = extract_json(text)?;
    let out: JudgeOutput =
        serde_json::from_str(json).map_err(|e| err(format!("judge schema: {}", e)))?;
    check_probability(out.probability)?;
    Confidence::parse(&out.confidence)
        .ok_or_else(|| err(format!("unknown confidence label '{}'", out.confidence)))?;
    if out.rationale.trim().is_empty() {
        return Err(err("judge rationale empty"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_advocate_with_fenced_block() {
        let text = "Here is my case.\n```json\n{\"probability\": 0.7, \"argument\": \"strong precedent\", \"citations\": [\"a\"]}\n```\nDone.";
        let out = decode_advocate(text).unwrap();
        assert_eq!(out.probability, 0.7);
        assert_eq!(out.citations, vec!["a"]);
    }

    #[test]
    fn test_decode_advocate_prose_wrapped() {
        let text = "prefix {\"probability\": 0.25, \"argument\": \"base rates\"} suffix";
        assert_eq!(decode_advocate(text).unwrap().probability, 0.25);
    }

    #[test]
    fn test_decode_rejects_out_of_range_probability() {
        let text = "{\"probability\": 1.3, \"argument\": \"x\"}";
        assert!(decode_advocate(text).is_err());
        let text = "{\"probability\": -0.1, \"argument\": \"x\"}";
        assert!(decode_advocate(text).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_advocate("no json here at all").is_err());
        assert!(decode_judge("{not valid json}").is_err());
    }

    #[test]
    fn test_decode_judge_requires_known_confidence() {
        let ok = "{\"probability\": 0.6, \"confidence\": \"high\", \"rationale\": \"r\"}";
        assert_eq!(decode_judge(ok).unwrap().probability, 0.6);
        let bad = "{\"probability\": 0.6, \"confidence\": \"sure\", \"rationale\": \"r\"}";
        assert!(decode_judge(bad).is_err());
    }

    #[test]
    fn test_decode_judge_rejects_empty_rationale() {
        let text = "{\"probability\": 0.5, \"confidence\": \"low\", \"rationale\": \"  \"}";
        assert!(decode_judge(text).is_err());
    }
}
