//! Thin loaders for forecastbench-style JSON datasets. A record that
//! fails to parse is reported with its id rather than aborting the load;
//! the harness marks those questions permanently failed.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::fs;

use crate::state::{Question, Resolution};

#[derive(Debug, Deserialize)]
struct RawQuestion {
    id: String,
    question: String,
    #[serde(default)]
    background: String,
    #[serde(default)]
    resolution_criteria: String,
    freeze_datetime_value: f64,
    due_date: String,
}

#[derive(Debug, Deserialize)]
struct QuestionFile {
    questions: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawResolution {
    question_id: String,
    horizon_date: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct ResolutionFile {
    resolutions: Vec<serde_json::Value>,
}

pub struct LoadedQuestions {
    pub questions: Vec<Question>,
    pub malformed: Vec<(String, String)>,
}

pub struct LoadedResolutions {
    pub resolutions: Vec<Resolution>,
    pub malformed: Vec<(String, String)>,
}

/// Accepts plain dates and RFC3339 datetimes (date part only).
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let head = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn value_id(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("<missing id>")
        .to_string()
}

pub fn load_questions(path: &str) -> Result<LoadedQuestions> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let file: QuestionFile =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))?;

    let mut questions = Vec::new();
    let mut malformed = Vec::new();
    for value in file.questions {
        let id = value_id(&value, "id");
        match serde_json::from_value::<RawQuestion>(value) {
            Ok(rq) => match parse_date(&rq.due_date) {
                Some(due_date) => questions.push(Question {
                    id: rq.id,
                    text: rq.question,
                    background: rq.background,
                    resolution_criteria: rq.resolution_criteria,
                    freeze_value: rq.freeze_datetime_value,
                    due_date,
                }),
                None => malformed.push((rq.id, format!("unparsable due date '{}'", rq.due_date))),
            },
            Err(e) => malformed.push((id, e.to_string())),
        }
    }
    Ok(LoadedQuestions { questions, malformed })
}

pub fn load_resolutions(path: &str) -> Result<LoadedResolutions> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let file: ResolutionFile =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))?;

    let mut resolutions = Vec::new();
    let mut malformed = Vec::new();
    for value in file.resolutions {
        let id = value_id(&value, "question_id");
        match serde_json::from_value::<RawResolution>(value) {
            Ok(rr) => match parse_date(&rr.horizon_date) {
                Some(horizon_date) => resolutions.push(Resolution {
                    question_id: rr.question_id,
                    horizon_date,
                    value: rr.value,
                }),
                None => malformed
                    .push((rr.question_id, format!("unparsable horizon date '{}'", rr.horizon_date))),
            },
            Err(e) => malformed.push((id, e.to_string())),
        }
    }
    Ok(LoadedResolutions { resolutions, malformed })
}
