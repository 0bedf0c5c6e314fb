use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub fn now_ts() -> u64 {
    Utc::now().timestamp() as u64
}

#[derive(Clone, Debug)]
pub struct Config {
    pub questions_path: String,
    pub resolutions_path: String,
    pub checkpoint_path: String,
    pub sqlite_path: String,
    /// Horizon offsets in days from the question due date.
    pub horizons: Vec<u32>,
    /// Advocate rounds per side before the judge rules.
    pub debate_rounds: u32,
    /// Whole-session attempts before a horizon is recorded as missing.
    pub session_attempts: u32,
    pub searches_per_round: u32,
    pub search_soft_limit: u32,
    pub search_penalty_rate: f64,
    pub workers: usize,
    pub max_questions: Option<usize>,
    pub completion_base: String,
    pub completion_model: String,
    pub completion_key: Option<String>,
    pub search_base: String,
    pub search_key: Option<String>,
    pub http_timeout_secs: u64,
    pub max_snippets: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            questions_path: std::env::var("QUESTIONS_PATH")
                .unwrap_or_else(|_| "data/questions.json".to_string()),
            resolutions_path: std::env::var("RESOLUTIONS_PATH")
                .unwrap_or_else(|_| "data/resolutions.json".to_string()),
            checkpoint_path: std::env::var("CHECKPOINT_PATH")
                .unwrap_or_else(|_| "out/checkpoint.json".to_string()),
            sqlite_path: std::env::var("SQLITE_PATH")
                .unwrap_or_else(|_| "out/results.sqlite".to_string()),
            horizons: parse_horizons(std::env::var("HORIZONS").ok().as_deref()),
            debate_rounds: std::env::var("DEBATE_ROUNDS").ok().and_then(|v| v.parse().ok()).unwrap_or(2),
            session_attempts: std::env::var("SESSION_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(3),
            searches_per_round: std::env::var("SEARCHES_PER_ROUND").ok().and_then(|v| v.parse().ok()).unwrap_or(2),
            search_soft_limit: std::env::var("SEARCH_SOFT_LIMIT").ok().and_then(|v| v.parse().ok()).unwrap_or(6),
            search_penalty_rate: std::env::var("SEARCH_PENALTY_RATE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.01),
            workers: std::env::var("WORKERS").ok().and_then(|v| v.parse().ok())
                .unwrap_or_else(|| num_cpus::get().min(4)),
            max_questions: std::env::var("MAX_QUESTIONS").ok().and_then(|v| v.parse().ok()),
            completion_base: std::env::var("COMPLETION_BASE")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
            completion_model: std::env::var("COMPLETION_MODEL")
                .unwrap_or_else(|_| "anthropic/claude-3-haiku".to_string()),
            completion_key: std::env::var("COMPLETION_KEY").ok(),
            search_base: std::env::var("SEARCH_BASE")
                .unwrap_or_else(|_| "https://google.serper.dev".to_string()),
            search_key: std::env::var("SEARCH_KEY").ok(),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(60),
            max_snippets: std::env::var("MAX_SNIPPETS").ok().and_then(|v| v.parse().ok()).unwrap_or(8),
        }
    }
}

fn parse_horizons(raw: Option<&str>) -> Vec<u32> {
    let parsed: Vec<u32> = raw
        .unwrap_or("7,30,90,180")
        .split(',')
        .filter_map(|h| h.trim().parse().ok())
        .collect();
    if parsed.is_empty() {
        vec![7, 30, 90, 180]
    } else {
        parsed
    }
}

/// A benchmark question. Immutable once loaded.
#[derive(Clone, Debug)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub background: String,
    pub resolution_criteria: String,
    /// Market probability at freeze time, used as a sanity reference.
    pub freeze_value: f64,
    /// The date the forecast is due; doubles as the evidence cutoff.
    pub due_date: NaiveDate,
}

/// Ground-truth value for a (question, horizon date) pair. Immutable once loaded.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub question_id: String,
    pub horizon_date: NaiveDate,
    pub value: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    HighAdvocate,
    LowAdvocate,
    Judge,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::HighAdvocate => "high_advocate",
            Role::LowAdvocate => "low_advocate",
            Role::Judge => "judge",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "low" => Some(Confidence::Low),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }
}

/// One debate turn as it actually happened, kept even when the attempt
/// later fails so the session remains auditable.
#[derive(Clone, Debug, Serialize)]
pub struct RoundRecord {
    pub attempt: u32,
    pub round: u32,
    pub role: String,
    pub argument: String,
    pub citations: Vec<String>,
    pub evidence_count: u32,
    pub elapsed_ms: u64,
}

/// Ordered turn history owned by exactly one debate session.
#[derive(Clone, Debug, Default)]
pub struct DebateTranscript {
    rounds: Vec<RoundRecord>,
}

impl DebateTranscript {
    pub fn push(&mut self, record: RoundRecord) {
        self.rounds.push(record);
    }

    pub fn rounds(&self) -> &[RoundRecord] {
        &self.rounds
    }

    /// Turns visible when prompting within the given attempt. Earlier
    /// attempts are audit history, not debate context.
    pub fn visible(&self, attempt: u32) -> impl Iterator<Item = &RoundRecord> {
        self.rounds.iter().filter(move |r| r.attempt == attempt)
    }

    pub fn render(&self, attempt: u32) -> String {
        let mut out = String::new();
        for r in self.visible(attempt) {
            out.push_str(&format!("[{} round {}] {}\n", r.role, r.round, r.argument));
            if !r.citations.is_empty() {
                out.push_str(&format!("  citations: {}\n", r.citations.join("; ")));
            }
        }
        out
    }
}

/// The sole artifact of a successful debate session. Never synthesized
/// for failed sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub question_id: String,
    pub horizon_days: u32,
    pub probability: f64,
    pub confidence: String,
    pub rationale: String,
    pub evidence_count: u32,
    pub search_count: u32,
    pub cutoff_date: String,
    pub resolution_date: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_horizons_default() {
        assert_eq!(parse_horizons(None), vec![7, 30, 90, 180]);
        assert_eq!(parse_horizons(Some("garbage")), vec![7, 30, 90, 180]);
    }

    #[test]
    fn test_parse_horizons_custom() {
        assert_eq!(parse_horizons(Some("1, 14,60")), vec![1, 14, 60]);
    }

    #[test]
    fn test_confidence_parse() {
        assert_eq!(Confidence::parse(" High "), Some(Confidence::High));
        assert_eq!(Confidence::parse("medium"), Some(Confidence::Medium));
        assert_eq!(Confidence::parse("certain"), None);
    }

    #[test]
    fn test_transcript_visibility_per_attempt() {
        let mut t = DebateTranscript::default();
        for attempt in 1..=2 {
            t.push(RoundRecord {
                attempt,
                round: 1,
                role: "high_advocate".to_string(),
                argument: format!("arg-{}", attempt),
                citations: vec![],
                evidence_count: 0,
                elapsed_ms: 0,
            });
        }
        assert_eq!(t.rounds().len(), 2);
        let visible: Vec<_> = t.visible(2).collect();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].argument, "arg-2");
    }
}
