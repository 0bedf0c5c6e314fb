//! Benchmark harness: drives the multi-horizon scheduler across a
//! question set with a fixed worker pool, matches forecasts to
//! resolutions, checkpoints after every question, and aggregates scores.
//!
//! Aggregation is a commutative sum over matched pairs, so cross-question
//! ordering never affects the result. The only shared mutable state is
//! the evidence cache, the checkpoint, and the result store.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::checkpoint::{Checkpoint, CheckpointFile};
use crate::completion::Completion;
use crate::debate::SessionConfig;
use crate::gateway::EvidenceGateway;
use crate::logging::{json_log, log, obj, v_num, v_str, Domain, Level};
use crate::schedule::{run_question, HorizonResult};
use crate::state::{Config, Question, Resolution};
use crate::store::{HorizonStatus, OutcomeRow, ResultStore};

pub struct Services {
    pub gateway: Arc<EvidenceGateway>,
    pub completion: Arc<dyn Completion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HorizonReport {
    pub horizon_days: u32,
    pub mean_brier: Option<f64>,
    pub scored: u64,
    pub excluded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub questions_completed: usize,
    pub questions_failed: u64,
    pub per_horizon: Vec<HorizonReport>,
    pub overall_mean_brier: Option<f64>,
    /// Explicit flag instead of a crash when zero resolutions matched.
    pub no_valid_scores: bool,
    pub total_attempted: u64,
    pub total_scored: u64,
    pub total_excluded: u64,
    pub total_failed: u64,
    /// Reported alongside, never folded into, the Brier numbers.
    pub total_search_penalty: f64,
    pub wall_secs: f64,
    pub questions_per_minute: f64,
}

fn validate_question(q: &Question) -> Result<(), String> {
    if q.id.trim().is_empty() {
        return Err("question id empty".to_string());
    }
    if q.text.trim().is_empty() {
        return Err("question text empty".to_string());
    }
    if !q.freeze_value.is_finite() || !(0.0..=1.0).contains(&q.freeze_value) {
        return Err(format!("freeze value {} outside [0,1]", q.freeze_value));
    }
    Ok(())
}

/// Exact-match resolution lookup table. Malformed resolution records
/// poison their question rather than being silently dropped.
fn index_resolutions(
    resolutions: Vec<Resolution>,
    poisoned: &mut HashMap<String, String>,
) -> HashMap<(String, NaiveDate), f64> {
    let mut index = HashMap::new();
    for r in resolutions {
        if !r.value.is_finite() || !(0.0..=1.0).contains(&r.value) {
            poisoned
                .entry(r.question_id.clone())
                .or_insert_with(|| format!("resolution value {} outside [0,1]", r.value));
            continue;
        }
        index.insert((r.question_id.clone(), r.horizon_date), r.value);
    }
    index
}

struct Shared {
    checkpoint: Mutex<Checkpoint>,
    ckpt_file: CheckpointFile,
    store: Mutex<ResultStore>,
    resolutions: HashMap<(String, NaiveDate), f64>,
    horizons: Vec<u32>,
    session_cfg: SessionConfig,
}

/// Run the benchmark. `malformed` carries ids of records the dataset
/// loader could not parse; they are marked permanently failed up front.
pub async fn run_benchmark(
    cfg: &Config,
    questions: Vec<Question>,
    malformed: Vec<(String, String)>,
    resolutions: Vec<Resolution>,
    services: Services,
    stop: Arc<AtomicBool>,
) -> Result<Report> {
    let started = Instant::now();
    let ckpt_file = CheckpointFile::new(&cfg.checkpoint_path);
    let mut checkpoint = ckpt_file.load()?;
    let resumed_from = checkpoint.completed.len();

    let mut poisoned: HashMap<String, String> = malformed.into_iter().collect();
    let resolution_index = index_resolutions(resolutions, &mut poisoned);

    // separate structurally valid questions from permanently failed ones
    let mut runnable = Vec::new();
    for q in questions {
        if let Some(reason) = poisoned.remove(&q.id) {
            mark_failed(&mut checkpoint, &q.id, &reason);
        } else if let Err(reason) = validate_question(&q) {
            mark_failed(&mut checkpoint, &q.id, &reason);
        } else if !checkpoint.is_complete(&q.id) {
            runnable.push(q);
        }
    }
    for (id, reason) in poisoned {
        // poisoned ids with no matching question record
        mark_failed(&mut checkpoint, &id, &reason);
    }
    if let Some(limit) = cfg.max_questions {
        runnable.truncate(limit);
    }
    ckpt_file.persist(&checkpoint).context("initial checkpoint flush")?;

    json_log(
        Domain::Harness,
        "run_start",
        obj(&[
            ("pending", v_num(runnable.len() as f64)),
            ("already_completed", v_num(resumed_from as f64)),
            ("workers", v_num(cfg.workers as f64)),
        ]),
    );

    let mut store = ResultStore::new(&cfg.sqlite_path)?;
    store.init()?;

    let shared = Arc::new(Shared {
        checkpoint: Mutex::new(checkpoint),
        ckpt_file,
        store: Mutex::new(store),
        resolutions: resolution_index,
        horizons: cfg.horizons.clone(),
        session_cfg: SessionConfig::from_config(cfg),
    });
    let queue: Arc<Mutex<VecDeque<Question>>> = Arc::new(Mutex::new(runnable.into()));

    let pool = cfg.workers.max(1);
    let mut handles = Vec::with_capacity(pool);
    for worker_id in 0..pool {
        let shared = shared.clone();
        let queue = queue.clone();
        let gateway = services.gateway.clone();
        let completion = services.completion.clone();
        let stop = stop.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(worker_id, shared, queue, gateway, completion, stop).await
        }));
    }

    let mut fatal: Option<anyhow::Error> = None;
    for handle in handles {
        match handle.await.context("worker panicked")? {
            Ok(()) => {}
            Err(e) => fatal = Some(fatal.unwrap_or(e)),
        }
    }
    if let Some(e) = fatal {
        // resumability can no longer be guaranteed; surface immediately
        return Err(e);
    }

    // final flush so a stop-signal shutdown leaves durable state behind
    let report = {
        let cp = shared.checkpoint.lock().expect("checkpoint lock");
        shared.ckpt_file.persist(&cp).context("final checkpoint flush")?;
        build_report(&cp, started.elapsed().as_secs_f64())
    };
    json_log(
        Domain::Harness,
        "run_done",
        obj(&[
            ("scored", v_num(report.total_scored as f64)),
            ("excluded", v_num(report.total_excluded as f64)),
            ("failed", v_num(report.total_failed as f64)),
            ("overall_mean_brier", report.overall_mean_brier.map(v_num).unwrap_or(serde_json::Value::Null)),
            ("total_search_penalty", v_num(report.total_search_penalty)),
        ]),
    );
    Ok(report)
}

fn mark_failed(checkpoint: &mut Checkpoint, id: &str, reason: &str) {
    if checkpoint.is_complete(id) {
        return;
    }
    checkpoint.completed.insert(id.to_string());
    checkpoint.questions_failed += 1;
    log(
        Level::Warn,
        Domain::Question,
        "question_failed",
        obj(&[("question_id", v_str(id)), ("reason", v_str(reason))]),
    );
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    queue: Arc<Mutex<VecDeque<Question>>>,
    gateway: Arc<EvidenceGateway>,
    completion: Arc<dyn Completion>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if stop.load(Ordering::SeqCst) {
            json_log(
                Domain::Harness,
                "worker_stopping",
                obj(&[("worker", v_num(worker_id as f64))]),
            );
            return Ok(());
        }
        let question = match queue.lock().expect("queue lock").pop_front() {
            Some(q) => q,
            None => return Ok(()),
        };
        json_log(
            Domain::Question,
            "question_start",
            obj(&[
                ("worker", v_num(worker_id as f64)),
                ("question_id", v_str(&question.id)),
                ("due_date", v_str(&question.due_date.format("%Y-%m-%d").to_string())),
            ]),
        );
        let run = run_question(
            &question,
            &shared.horizons,
            &shared.session_cfg,
            &gateway,
            completion.as_ref(),
            &stop,
        )
        .await;
        if run.interrupted {
            // leave the question incomplete so a resumed run retries it
            json_log(
                Domain::Question,
                "question_interrupted",
                obj(&[
                    ("question_id", v_str(&question.id)),
                    ("horizons_finished", v_num(run.results.len() as f64)),
                ]),
            );
            continue;
        }
        if let Err(e) = finalize_question(&shared, &question, &run.results) {
            stop.store(true, Ordering::SeqCst);
            return Err(e.context(format!("checkpointing question {}", question.id)));
        }
    }
}

/// Score one finished question and commit it: checkpoint accumulation and
/// flush under a single lock, then the analysis rows. A checkpoint flush
/// failure is fatal; a store failure is only logged.
fn finalize_question(shared: &Shared, question: &Question, results: &[HorizonResult]) -> Result<()> {
    let mut rows: Vec<OutcomeRow> = Vec::with_capacity(results.len());
    {
        let mut cp = shared.checkpoint.lock().expect("checkpoint lock");
        if cp.is_complete(&question.id) {
            return Ok(());
        }
        for r in results {
            cp.total_penalty += r.penalty;
            let tally = cp.tally_mut(r.plan.horizon_days);
            match &r.record {
                Some(record) => {
                    let key = (question.id.clone(), r.plan.resolution_date);
                    match shared.resolutions.get(&key) {
                        Some(&actual) => {
                            let brier = (record.probability - actual).powi(2);
                            tally.sum_sq_err += brier;
                            tally.scored += 1;
                            rows.push(OutcomeRow {
                                question_id: &question.id,
                                horizon_days: r.plan.horizon_days,
                                status: HorizonStatus::Scored,
                                record: Some(record),
                                brier: Some(brier),
                                actual: Some(actual),
                                reason: None,
                            });
                        }
                        None => {
                            // no resolution for this exact pair: excluded,
                            // never treated as zero error
                            tally.excluded += 1;
                            rows.push(OutcomeRow {
                                question_id: &question.id,
                                horizon_days: r.plan.horizon_days,
                                status: HorizonStatus::NoResolution,
                                record: Some(record),
                                brier: None,
                                actual: None,
                                reason: None,
                            });
                        }
                    }
                }
                None => {
                    tally.failed += 1;
                    rows.push(OutcomeRow {
                        question_id: &question.id,
                        horizon_days: r.plan.horizon_days,
                        status: HorizonStatus::Failed,
                        record: None,
                        brier: None,
                        actual: None,
                        reason: r.fail_reason.as_deref(),
                    });
                }
            }
        }
        cp.completed.insert(question.id.clone());
        shared.ckpt_file.persist(&cp)?;
    }

    for row in &rows {
        json_log(
            Domain::Question,
            "horizon_outcome",
            obj(&[
                ("question_id", v_str(row.question_id)),
                ("horizon_days", v_num(row.horizon_days as f64)),
                ("status", v_str(row.status.as_str())),
                ("brier", row.brier.map(v_num).unwrap_or(serde_json::Value::Null)),
            ]),
        );
    }
    if let Ok(mut store) = shared.store.lock() {
        if let Err(e) = store.persist_question(&rows) {
            log(
                Level::Warn,
                Domain::Harness,
                "store_write_failed",
                obj(&[("question_id", v_str(&question.id)), ("error", v_str(&e.to_string()))]),
            );
        }
    }
    Ok(())
}

fn build_report(cp: &Checkpoint, wall_secs: f64) -> Report {
    let per_horizon: Vec<HorizonReport> = cp
        .horizons
        .iter()
        .map(|(&horizon_days, t)| HorizonReport {
            horizon_days,
            mean_brier: t.mean_brier(),
            scored: t.scored,
            excluded: t.excluded,
            failed: t.failed,
        })
        .collect();
    let total_scored = cp.total_scored();
    let total_excluded = cp.total_excluded();
    let total_failed = cp.total_failed();
    let completed = cp.completed.len();
    Report {
        questions_completed: completed,
        questions_failed: cp.questions_failed,
        per_horizon,
        overall_mean_brier: cp.overall_mean_brier(),
        no_valid_scores: total_scored == 0,
        total_attempted: total_scored + total_excluded + total_failed,
        total_scored,
        total_excluded,
        total_failed,
        total_search_penalty: cp.total_penalty,
        wall_secs,
        questions_per_minute: if wall_secs > 0.0 {
            completed as f64 / (wall_secs / 60.0)
        } else {
            0.0
        },
    }
}
