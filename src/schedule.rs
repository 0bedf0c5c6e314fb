//! Multi-horizon scheduling: one debate session per horizon offset for a
//! single question, all sharing the question's due date as the evidence
//! cutoff. Horizons differ only in the resolution date they are scored
//! against, never in how much evidence they may see. Sessions are
//! independent: one failed horizon does not block its siblings.

use chrono::{Duration, NaiveDate};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::completion::Completion;
use crate::debate::{DebateSession, SessionConfig, SessionOutcome};
use crate::gateway::EvidenceGateway;
use crate::logging::{json_log, obj, v_num, v_str, Domain};
use crate::state::{ForecastRecord, Question};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HorizonPlan {
    pub horizon_days: u32,
    pub cutoff: NaiveDate,
    pub resolution_date: NaiveDate,
}

/// Fix every horizon's resolution date at schedule time. The cutoff is
/// identical across horizons by construction.
pub fn plan_horizons(question: &Question, horizons: &[u32]) -> Vec<HorizonPlan> {
    horizons
        .iter()
        .map(|&days| HorizonPlan {
            horizon_days: days,
            cutoff: question.due_date,
            resolution_date: question.due_date + Duration::days(days as i64),
        })
        .collect()
}

#[derive(Debug)]
pub struct HorizonResult {
    pub plan: HorizonPlan,
    pub record: Option<ForecastRecord>,
    pub penalty: f64,
    pub fail_reason: Option<String>,
}

/// All horizon results for one question. `interrupted` means the stop
/// flag cut the question short: the results cover only the horizons that
/// actually finished, and the question must not be marked complete.
#[derive(Debug)]
pub struct QuestionRun {
    pub results: Vec<HorizonResult>,
    pub interrupted: bool,
}

/// Run all horizons for one question, sequentially within the calling
/// worker. Returns one result per configured horizon, in order, unless
/// the stop flag is raised mid-question.
pub async fn run_question(
    question: &Question,
    horizons: &[u32],
    session_cfg: &SessionConfig,
    gateway: &EvidenceGateway,
    completion: &dyn Completion,
    stop: &AtomicBool,
) -> QuestionRun {
    let mut results = Vec::with_capacity(horizons.len());
    for plan in plan_horizons(question, horizons) {
        if stop.load(Ordering::SeqCst) {
            json_log(
                Domain::Question,
                "horizon_skipped",
                obj(&[
                    ("question_id", v_str(&question.id)),
                    ("horizon_days", v_num(plan.horizon_days as f64)),
                ]),
            );
            return QuestionRun { results, interrupted: true };
        }
        json_log(
            Domain::Question,
            "horizon_start",
            obj(&[
                ("question_id", v_str(&question.id)),
                ("horizon_days", v_num(plan.horizon_days as f64)),
                ("cutoff", v_str(&plan.cutoff.format("%Y-%m-%d").to_string())),
            ]),
        );
        let mut session = DebateSession::new(
            question,
            plan.cutoff,
            plan.horizon_days,
            plan.resolution_date,
            session_cfg.clone(),
            gateway,
            completion,
        );
        let result = match session.run(stop).await {
            SessionOutcome::Forecast { record, penalty } => HorizonResult {
                plan,
                record: Some(record),
                penalty,
                fail_reason: None,
            },
            SessionOutcome::Failed { reason, penalty } => HorizonResult {
                plan,
                record: None,
                penalty,
                fail_reason: Some(reason),
            },
            SessionOutcome::Interrupted { .. } => {
                return QuestionRun { results, interrupted: true };
            }
        };
        results.push(result);
    }
    QuestionRun { results, interrupted: false }
}
