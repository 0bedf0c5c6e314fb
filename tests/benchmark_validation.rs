//! End-to-end validation of the benchmark harness: scoring arithmetic,
//! resolution matching, failure isolation, cutoff discipline, and exact
//! resume after an interrupted run.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use debatebench::completion::{CannedCompletion, Completion};
use debatebench::gateway::{EvidenceGateway, SearchProvider, Snippet};
use debatebench::harness::{run_benchmark, Report, Services};
use debatebench::state::{Config, Question, Resolution};

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn test_config(dir: &Path, horizons: Vec<u32>) -> Config {
    Config {
        questions_path: String::new(),
        resolutions_path: String::new(),
        checkpoint_path: dir.join("checkpoint.json").to_string_lossy().into_owned(),
        sqlite_path: dir.join("results.sqlite").to_string_lossy().into_owned(),
        horizons,
        debate_rounds: 1,
        session_attempts: 2,
        searches_per_round: 1,
        search_soft_limit: 10,
        search_penalty_rate: 0.01,
        workers: 2,
        max_questions: None,
        completion_base: String::new(),
        completion_model: String::new(),
        completion_key: None,
        search_base: String::new(),
        search_key: None,
        http_timeout_secs: 5,
        max_snippets: 8,
    }
}

fn question(id: &str, text: &str, due: &str) -> Question {
    Question {
        id: id.to_string(),
        text: text.to_string(),
        background: "background".to_string(),
        resolution_criteria: "resolves yes on confirmation".to_string(),
        freeze_value: 0.5,
        due_date: date(due),
    }
}

/// Records the cutoff passed with every provider call.
struct RecordingProvider {
    cutoffs: Arc<Mutex<Vec<NaiveDate>>>,
    snippets: Vec<Snippet>,
}

#[async_trait]
impl SearchProvider for RecordingProvider {
    async fn search(&self, _query: &str, not_after: NaiveDate) -> Result<Vec<Snippet>> {
        self.cutoffs.lock().unwrap().push(not_after);
        Ok(self.snippets.clone())
    }
}

/// Counts completions per question and optionally fails whenever the
/// prompt mentions a poisoned resolution date.
struct InstrumentedCompletion {
    inner: CannedCompletion,
    poison_date: Option<String>,
    calls_for_marker: Arc<AtomicU32>,
    marker: String,
}

#[async_trait]
impl Completion for InstrumentedCompletion {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        if prompt.contains(&self.marker) {
            self.calls_for_marker.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(poison) = &self.poison_date {
            if prompt.contains(poison) {
                return Err(anyhow!("simulated completion outage"));
            }
        }
        self.inner.complete(system, prompt).await
    }
}

fn services(probability: f64) -> Services {
    Services {
        gateway: Arc::new(EvidenceGateway::new(
            Box::new(RecordingProvider { cutoffs: Arc::new(Mutex::new(vec![])), snippets: vec![] }),
            8,
        )),
        completion: Arc::new(CannedCompletion::new(probability)),
    }
}

async fn run(
    cfg: &Config,
    questions: Vec<Question>,
    resolutions: Vec<Resolution>,
    services: Services,
) -> Report {
    run_benchmark(cfg, questions, vec![], resolutions, services, Arc::new(AtomicBool::new(false)))
        .await
        .expect("benchmark run")
}

#[tokio::test]
async fn test_scenario_brier_arithmetic_180_days() {
    // due 2024-07-21 + 180d = 2025-01-17, resolved 1.0, forecast 0.99
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![180]);
    let q = question("q-1", "Will the treaty be signed?", "2024-07-21");
    let r = Resolution { question_id: "q-1".to_string(), horizon_date: date("2025-01-17"), value: 1.0 };

    let report = run(&cfg, vec![q], vec![r], services(0.99)).await;
    assert_eq!(report.total_scored, 1);
    assert_eq!(report.total_excluded, 0);
    assert_eq!(report.total_failed, 0);
    let h = &report.per_horizon[0];
    assert_eq!(h.horizon_days, 180);
    assert!((h.mean_brier.unwrap() - 0.0001).abs() < 1e-12);
    assert!((report.overall_mean_brier.unwrap() - 0.0001).abs() < 1e-12);
}

#[tokio::test]
async fn test_scenario_missing_resolution_is_excluded_not_zero() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![7, 30]);
    let q = question("q-1", "Will the rover land?", "2024-07-21");
    // only the 7-day horizon has ground truth
    let r = Resolution { question_id: "q-1".to_string(), horizon_date: date("2024-07-28"), value: 0.0 };

    let report = run(&cfg, vec![q], vec![r], services(0.2)).await;
    assert_eq!(report.total_scored, 1);
    assert_eq!(report.total_excluded, 1);
    assert_eq!(report.total_attempted, 2);
    // the excluded horizon contributes nothing to the mean
    assert!((report.overall_mean_brier.unwrap() - 0.04).abs() < 1e-12);
}

#[tokio::test]
async fn test_scenario_failed_horizon_leaves_siblings_intact() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![7, 30, 90]);
    let q = question("q-1", "Will the bill pass?", "2024-07-21");
    let resolutions = vec![
        Resolution { question_id: "q-1".to_string(), horizon_date: date("2024-07-28"), value: 1.0 },
        Resolution { question_id: "q-1".to_string(), horizon_date: date("2024-08-20"), value: 1.0 },
        Resolution { question_id: "q-1".to_string(), horizon_date: date("2024-10-19"), value: 1.0 },
    ];
    // every attempt for the 30-day horizon fails; siblings are unaffected
    let services = Services {
        gateway: Arc::new(EvidenceGateway::new(
            Box::new(RecordingProvider { cutoffs: Arc::new(Mutex::new(vec![])), snippets: vec![] }),
            8,
        )),
        completion: Arc::new(InstrumentedCompletion {
            inner: CannedCompletion::new(0.9),
            poison_date: Some("2024-08-20".to_string()),
            calls_for_marker: Arc::new(AtomicU32::new(0)),
            marker: "<unused>".to_string(),
        }),
    };

    let report = run(&cfg, vec![q], resolutions, services).await;
    assert_eq!(report.total_scored, 2);
    assert_eq!(report.total_failed, 1);
    assert_eq!(report.total_excluded, 0);
    let failed = report.per_horizon.iter().find(|h| h.horizon_days == 30).unwrap();
    assert_eq!(failed.failed, 1);
    assert_eq!(failed.scored, 0);
    assert!(failed.mean_brier.is_none());
}

#[tokio::test]
async fn test_every_horizon_shares_the_due_date_cutoff() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![7, 30, 90, 180]);
    let q = question("q-1", "Will output rise?", "2024-07-21");
    let cutoffs = Arc::new(Mutex::new(vec![]));
    let services = Services {
        gateway: Arc::new(EvidenceGateway::new(
            Box::new(RecordingProvider { cutoffs: cutoffs.clone(), snippets: vec![] }),
            8,
        )),
        completion: Arc::new(CannedCompletion::new(0.5)),
    };

    let _ = run(&cfg, vec![q], vec![], services).await;
    let seen = cutoffs.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|&c| c == date("2024-07-21")));
}

#[tokio::test]
async fn test_malformed_question_fails_permanently_without_blocking_run() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![7]);
    let bad = Question { freeze_value: 7.0, ..question("q-bad", "Will it?", "2024-07-21") };
    let good = question("q-good", "Will it really?", "2024-07-21");
    let r = Resolution { question_id: "q-good".to_string(), horizon_date: date("2024-07-28"), value: 1.0 };

    let report = run(&cfg, vec![bad, good], vec![r], services(0.8)).await;
    assert_eq!(report.questions_failed, 1);
    assert_eq!(report.total_scored, 1);
    assert_eq!(report.questions_completed, 2); // failed ids count as handled
}

#[tokio::test]
async fn test_zero_matching_resolutions_still_reports() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![7]);
    let q = question("q-1", "Will anything match?", "2024-07-21");

    let report = run(&cfg, vec![q], vec![], services(0.5)).await;
    assert!(report.no_valid_scores);
    assert_eq!(report.total_excluded, 1);
    assert!(report.overall_mean_brier.is_none());
}

#[tokio::test]
async fn test_search_penalty_reported_separately_from_brier() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), vec![7]);
    cfg.search_soft_limit = 0;
    cfg.search_penalty_rate = 0.5;
    let q = question("q-1", "Will it close above?", "2024-07-28");
    let r = Resolution { question_id: "q-1".to_string(), horizon_date: date("2024-08-04"), value: 1.0 };

    let report = run(&cfg, vec![q], vec![r], services(1.0)).await;
    // 2 roles * 1 round * 1 search, all over the zero soft limit
    assert!((report.total_search_penalty - 1.0).abs() < 1e-12);
    // a perfect forecast keeps the Brier mean at zero regardless of penalty
    assert_eq!(report.overall_mean_brier.unwrap(), 0.0);
}

#[tokio::test]
async fn test_resume_matches_uninterrupted_run_exactly() {
    let q1 = || question("q-1", "Will alpha ship?", "2024-07-21");
    let q2 = || question("q-2", "Will beta ship?", "2024-07-21");
    let resolutions = || {
        vec![
            Resolution { question_id: "q-1".to_string(), horizon_date: date("2024-07-28"), value: 1.0 },
            Resolution { question_id: "q-2".to_string(), horizon_date: date("2024-07-28"), value: 0.0 },
        ]
    };

    // uninterrupted reference run
    let ref_dir = tempfile::tempdir().unwrap();
    let ref_cfg = test_config(ref_dir.path(), vec![7]);
    let reference = run(&ref_cfg, vec![q1(), q2()], resolutions(), services(0.7)).await;

    // interrupted run: first pass only processes one question
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), vec![7]);
    cfg.max_questions = Some(1);
    let first = run(&cfg, vec![q1(), q2()], resolutions(), services(0.7)).await;
    assert_eq!(first.questions_completed, 1);

    // resumed pass: q-1 must not be reprocessed
    cfg.max_questions = None;
    let q1_calls = Arc::new(AtomicU32::new(0));
    let resumed_services = Services {
        gateway: Arc::new(EvidenceGateway::new(
            Box::new(RecordingProvider { cutoffs: Arc::new(Mutex::new(vec![])), snippets: vec![] }),
            8,
        )),
        completion: Arc::new(InstrumentedCompletion {
            inner: CannedCompletion::new(0.7),
            poison_date: None,
            calls_for_marker: q1_calls.clone(),
            marker: "Will alpha ship?".to_string(),
        }),
    };
    let resumed = run(&cfg, vec![q1(), q2()], resolutions(), resumed_services).await;

    assert_eq!(q1_calls.load(Ordering::SeqCst), 0);
    assert_eq!(resumed.questions_completed, reference.questions_completed);
    assert_eq!(resumed.total_scored, reference.total_scored);
    assert_eq!(resumed.total_excluded, reference.total_excluded);
    assert_eq!(resumed.total_failed, reference.total_failed);
    assert_eq!(resumed.overall_mean_brier, reference.overall_mean_brier);
    assert_eq!(resumed.total_search_penalty, reference.total_search_penalty);
}

/// Raises the stop flag on its first call, fails every call, and counts
/// calls that begin after the flag is already set.
struct HaltingCompletion {
    stop: Arc<AtomicBool>,
    calls_after_stop: Arc<AtomicU32>,
}

#[async_trait]
impl Completion for HaltingCompletion {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        if self.stop.swap(true, Ordering::SeqCst) {
            self.calls_after_stop.fetch_add(1, Ordering::SeqCst);
        }
        Err(anyhow!("simulated outage"))
    }
}

#[tokio::test]
async fn test_stop_signal_halts_retries_and_sibling_horizons() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), vec![7, 30]);
    cfg.session_attempts = 3;
    cfg.workers = 1;
    let q = question("q-1", "Will it ship?", "2024-07-21");

    let stop = Arc::new(AtomicBool::new(false));
    let calls_after_stop = Arc::new(AtomicU32::new(0));
    let services = Services {
        gateway: Arc::new(EvidenceGateway::new(
            Box::new(RecordingProvider { cutoffs: Arc::new(Mutex::new(vec![])), snippets: vec![] }),
            8,
        )),
        completion: Arc::new(HaltingCompletion {
            stop: stop.clone(),
            calls_after_stop: calls_after_stop.clone(),
        }),
    };
    let report = run_benchmark(&cfg, vec![q], vec![], vec![], services, stop)
        .await
        .expect("benchmark run");

    // the attempt that raised the flag finishes; no retry attempt and no
    // sibling-horizon session starts afterwards
    assert_eq!(calls_after_stop.load(Ordering::SeqCst), 0);
    // the interrupted question stays incomplete so a resumed run retries it
    assert_eq!(report.questions_completed, 0);
    assert_eq!(report.total_attempted, 0);
}

#[tokio::test]
async fn test_checkpoint_persist_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    // a regular file where the checkpoint directory should be
    std::fs::write(dir.path().join("blocker"), b"x").unwrap();
    let mut cfg = test_config(dir.path(), vec![7]);
    cfg.checkpoint_path = dir
        .path()
        .join("blocker")
        .join("checkpoint.json")
        .to_string_lossy()
        .into_owned();
    let q = question("q-1", "Will it?", "2024-07-21");

    let outcome = run_benchmark(
        &cfg,
        vec![q],
        vec![],
        vec![],
        services(0.5),
        Arc::new(AtomicBool::new(false)),
    )
    .await;
    assert!(outcome.is_err());
}

#[tokio::test]
async fn test_stop_signal_prevents_new_questions() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), vec![7]);
    let questions = vec![
        question("q-1", "Will it?", "2024-07-21"),
        question("q-2", "Will it?", "2024-07-21"),
        question("q-3", "Will it?", "2024-07-21"),
    ];

    let stop = Arc::new(AtomicBool::new(true)); // stop before anything starts
    let report = run_benchmark(&cfg, questions, vec![], vec![], services(0.5), stop)
        .await
        .expect("benchmark run");
    assert_eq!(report.total_attempted, 0);
    assert!(report.no_valid_scores);
}
