//! Debate session state machine.
//!
//! One session turns (question, cutoff, horizon) into one calibrated
//! probability via an explicit phase sequence:
//!
//!   Init -> HighArgues(1) -> LowArgues(1) -> ... -> JudgeSynthesizes -> Done | Failed
//!
//! The retry boundary is the whole session: any completion error, decode
//! failure, or out-of-range probability restarts from Init, up to the
//! attempt cap. A session that exhausts its attempts ends in Failed and
//! produces no forecast record. It must never fall back to a default
//! probability, which would bias aggregate accuracy toward that value.
//! A raised stop flag lets the current attempt finish but starts no new
//! one; the session then reports Interrupted instead of Failed.

use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::time::sleep;

use crate::budget::SearchBudget;
use crate::completion::Completion;
use crate::decode::{decode_advocate, decode_judge, JudgeOutput};
use crate::gateway::{Evidence, EvidenceGateway};
use crate::logging::{json_log, obj, v_num, v_str, Domain};
use crate::retry::RetryPolicy;
use crate::state::{Confidence, Config, DebateTranscript, ForecastRecord, Question, Role, RoundRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    HighArgues { round: u32 },
    LowArgues { round: u32 },
    JudgeSynthesizes,
    Done,
    Failed,
}

/// Transition table. `Failed` is entered only by the session driver when
/// attempts are exhausted; the table itself never produces it.
pub fn next_phase(phase: Phase, rounds: u32) -> Phase {
    match phase {
        Phase::Init if rounds == 0 => Phase::JudgeSynthesizes,
        Phase::Init => Phase::HighArgues { round: 1 },
        Phase::HighArgues { round } => Phase::LowArgues { round },
        Phase::LowArgues { round } if round < rounds => Phase::HighArgues { round: round + 1 },
        Phase::LowArgues { .. } => Phase::JudgeSynthesizes,
        Phase::JudgeSynthesizes => Phase::Done,
        Phase::Done => Phase::Done,
        Phase::Failed => Phase::Failed,
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub rounds: u32,
    pub searches_per_round: u32,
    pub soft_limit: u32,
    pub penalty_rate: f64,
    pub backoff: RetryPolicy,
}

impl SessionConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            rounds: cfg.debate_rounds,
            searches_per_round: cfg.searches_per_round,
            soft_limit: cfg.search_soft_limit,
            penalty_rate: cfg.search_penalty_rate,
            backoff: RetryPolicy::with_attempts(cfg.session_attempts),
        }
    }
}

#[derive(Debug)]
pub enum SessionOutcome {
    Forecast { record: ForecastRecord, penalty: f64 },
    Failed { reason: String, penalty: f64 },
    /// The stop flag was raised while attempts remained. The current
    /// attempt ran to completion, no new one started, and the horizon is
    /// left unresolved so a resumed run retries it.
    Interrupted { penalty: f64 },
}

struct AttemptResult {
    judge: JudgeOutput,
    evidence_count: u32,
    search_count: u32,
    penalty: f64,
}

struct AttemptFailure {
    reason: String,
    penalty: f64,
}

pub struct DebateSession<'a> {
    question: &'a Question,
    cutoff: NaiveDate,
    horizon_days: u32,
    resolution_date: NaiveDate,
    cfg: SessionConfig,
    gateway: &'a EvidenceGateway,
    completion: &'a dyn Completion,
    pub phase: Phase,
    pub transcript: DebateTranscript,
}

impl<'a> DebateSession<'a> {
    pub fn new(
        question: &'a Question,
        cutoff: NaiveDate,
        horizon_days: u32,
        resolution_date: NaiveDate,
        cfg: SessionConfig,
        gateway: &'a EvidenceGateway,
        completion: &'a dyn Completion,
    ) -> Self {
        Self {
            question,
            cutoff,
            horizon_days,
            resolution_date,
            cfg,
            gateway,
            completion,
            phase: Phase::Init,
            transcript: DebateTranscript::default(),
        }
    }

    pub async fn run(&mut self, stop: &AtomicBool) -> SessionOutcome {
        let policy = self.cfg.backoff.clone();
        let mut last_reason = String::from("no attempt ran");
        let mut last_penalty = 0.0;

        for attempt in 1..=policy.max_attempts {
            match self.run_attempt(attempt).await {
                Ok(res) => {
                    self.phase = Phase::Done;
                    let confidence = Confidence::parse(&res.judge.confidence)
                        .map(|c| c.as_str().to_string())
                        .unwrap_or_else(|| res.judge.confidence.clone());
                    json_log(
                        Domain::Judge,
                        "session_done",
                        obj(&[
                            ("question_id", v_str(&self.question.id)),
                            ("horizon_days", v_num(self.horizon_days as f64)),
                            ("attempt", v_num(attempt as f64)),
                            ("probability", v_num(res.judge.probability)),
                            ("confidence", v_str(&confidence)),
                            ("search_count", v_num(res.search_count as f64)),
                        ]),
                    );
                    let record = ForecastRecord {
                        question_id: self.question.id.clone(),
                        horizon_days: self.horizon_days,
                        probability: res.judge.probability,
                        confidence,
                        rationale: res.judge.rationale,
                        evidence_count: res.evidence_count,
                        search_count: res.search_count,
                        cutoff_date: self.cutoff.format("%Y-%m-%d").to_string(),
                        resolution_date: self.resolution_date.format("%Y-%m-%d").to_string(),
                    };
                    return SessionOutcome::Forecast { record, penalty: res.penalty };
                }
                Err(fail) => {
                    json_log(
                        Domain::Debate,
                        "attempt_failed",
                        obj(&[
                            ("question_id", v_str(&self.question.id)),
                            ("horizon_days", v_num(self.horizon_days as f64)),
                            ("attempt", v_num(attempt as f64)),
                            ("reason", v_str(&fail.reason)),
                        ]),
                    );
                    last_reason = fail.reason;
                    last_penalty = fail.penalty;
                    if !policy.should_retry(attempt) {
                        continue;
                    }
                    if stop.load(Ordering::SeqCst) {
                        json_log(
                            Domain::Debate,
                            "session_interrupted",
                            obj(&[
                                ("question_id", v_str(&self.question.id)),
                                ("horizon_days", v_num(self.horizon_days as f64)),
                                ("after_attempt", v_num(attempt as f64)),
                            ]),
                        );
                        self.phase = Phase::Failed;
                        return SessionOutcome::Interrupted { penalty: last_penalty };
                    }
                    sleep(policy.delay_after(attempt)).await;
                }
            }
        }

        self.phase = Phase::Failed;
        SessionOutcome::Failed { reason: last_reason, penalty: last_penalty }
    }

    async fn run_attempt(&mut self, attempt: u32) -> Result<AttemptResult, AttemptFailure> {
        let mut high = SearchBudget::new(self.cfg.soft_limit, self.cfg.penalty_rate);
        let mut low = SearchBudget::new(self.cfg.soft_limit, self.cfg.penalty_rate);
        let mut evidence_count = 0u32;
        let mut phase = Phase::Init;

        loop {
            phase = next_phase(phase, self.cfg.rounds);
            match phase {
                Phase::HighArgues { round } => {
                    let fetched = self
                        .advocate_turn(attempt, round, Role::HighAdvocate, &mut high)
                        .await
                        .map_err(|reason| AttemptFailure {
                            reason,
                            penalty: high.penalty() + low.penalty(),
                        })?;
                    evidence_count += fetched;
                }
                Phase::LowArgues { round } => {
                    let fetched = self
                        .advocate_turn(attempt, round, Role::LowAdvocate, &mut low)
                        .await
                        .map_err(|reason| AttemptFailure {
                            reason,
                            penalty: high.penalty() + low.penalty(),
                        })?;
                    evidence_count += fetched;
                }
                Phase::JudgeSynthesizes => {
                    let judge = self.judge_turn(attempt).await.map_err(|reason| AttemptFailure {
                        reason,
                        penalty: high.penalty() + low.penalty(),
                    })?;
                    return Ok(AttemptResult {
                        judge,
                        evidence_count,
                        search_count: high.consumed() + low.consumed(),
                        penalty: high.penalty() + low.penalty(),
                    });
                }
                Phase::Done | Phase::Init | Phase::Failed => unreachable!("not produced mid-attempt"),
            }
        }
    }

    /// One advocate turn: search under this role's budget, argue, decode.
    /// Returns the number of snippets fetched. The raw turn is appended to
    /// the transcript before any error propagates.
    async fn advocate_turn(
        &mut self,
        attempt: u32,
        round: u32,
        role: Role,
        budget: &mut SearchBudget,
    ) -> Result<u32, String> {
        let started = Instant::now();
        let mut snippets = Vec::new();
        for query in self.queries_for(role) {
            budget.reserve();
            let Evidence { snippets: mut batch, low_quality } = self.gateway.search(&query, self.cutoff).await;
            if low_quality {
                json_log(
                    Domain::Search,
                    "low_quality_evidence",
                    obj(&[("question_id", v_str(&self.question.id)), ("role", v_str(role.as_str()))]),
                );
            }
            snippets.append(&mut batch);
        }
        let fetched = snippets.len() as u32;

        let prompt = self.advocate_prompt(attempt, role, &snippets);
        let raw = match self.completion.complete(&advocate_system(role), &prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                self.transcript.push(RoundRecord {
                    attempt,
                    round,
                    role: role.as_str().to_string(),
                    argument: format!("<completion error: {}>", e),
                    citations: vec![],
                    evidence_count: fetched,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                return Err(format!("{} completion: {}", role.as_str(), e));
            }
        };

        match decode_advocate(&raw) {
            Ok(out) => {
                self.transcript.push(RoundRecord {
                    attempt,
                    round,
                    role: role.as_str().to_string(),
                    argument: out.argument,
                    citations: out.citations,
                    evidence_count: fetched,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                Ok(fetched)
            }
            Err(e) => {
                // keep the undecodable raw text for the audit trail
                self.transcript.push(RoundRecord {
                    attempt,
                    round,
                    role: role.as_str().to_string(),
                    argument: raw,
                    citations: vec![],
                    evidence_count: fetched,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                Err(format!("{}: {}", role.as_str(), e))
            }
        }
    }

    async fn judge_turn(&mut self, attempt: u32) -> Result<JudgeOutput, String> {
        let started = Instant::now();
        let prompt = self.judge_prompt(attempt);
        let raw = match self.completion.complete(JUDGE_SYSTEM, &prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                self.transcript.push(RoundRecord {
                    attempt,
                    round: self.cfg.rounds + 1,
                    role: Role::Judge.as_str().to_string(),
                    argument: format!("<completion error: {}>", e),
                    citations: vec![],
                    evidence_count: 0,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                return Err(format!("judge completion: {}", e));
            }
        };
        let decoded = decode_judge(&raw);
        self.transcript.push(RoundRecord {
            attempt,
            round: self.cfg.rounds + 1,
            role: Role::Judge.as_str().to_string(),
            argument: raw.clone(),
            citations: vec![],
            evidence_count: 0,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        decoded.map_err(|e| format!("judge: {}", e))
    }

    fn queries_for(&self, role: Role) -> Vec<String> {
        let angle = match role {
            Role::HighAdvocate => "progress announcement confirmed",
            Role::LowAdvocate => "delay setback unlikely",
            Role::Judge => "",
        };
        let mut queries = vec![self.question.text.clone()];
        queries.push(format!("{} {}", self.question.text, angle));
        queries.truncate(self.cfg.searches_per_round as usize);
        queries
    }

    fn advocate_prompt(&self, attempt: u32, role: Role, snippets: &[crate::gateway::Snippet]) -> String {
        let stance = match role {
            Role::HighAdvocate => "Build the strongest honest case that the probability is HIGH.",
            Role::LowAdvocate => "Build the strongest honest case that the probability is LOW.",
            Role::Judge => "",
        };
        let mut evidence = String::new();
        for s in snippets {
            evidence.push_str(&format!(
                "- {} ({}, {}): {}\n",
                s.title,
                s.published.format("%Y-%m-%d"),
                s.source,
                s.text
            ));
        }
        if evidence.is_empty() {
            evidence.push_str("(no evidence available; reason from base rates)\n");
        }
        format!(
            "QUESTION: {}\nBACKGROUND: {}\nRESOLUTION CRITERIA: {}\n\
             KNOWLEDGE CUTOFF: {} (use nothing dated on or after this)\n\
             RESOLUTION DATE: {} ({} days after the due date)\n\n\
             {}\n\nEVIDENCE:\n{}\nDEBATE SO FAR:\n{}\n\
             Respond with a JSON object: {{\"probability\": <0..1>, \"argument\": <string>, \"citations\": [<source>, ...]}}",
            self.question.text,
            self.question.background,
            self.question.resolution_criteria,
            self.cutoff.format("%Y-%m-%d"),
            self.resolution_date.format("%Y-%m-%d"),
            self.horizon_days,
            stance,
            evidence,
            self.transcript.render(attempt),
        )
    }

    fn judge_prompt(&self, attempt: u32) -> String {
        format!(
            "QUESTION: {}\nRESOLUTION CRITERIA: {}\n\
             KNOWLEDGE CUTOFF: {}\nRESOLUTION DATE: {} ({} days after the due date)\n\n\
             FULL DEBATE TRANSCRIPT:\n{}\n\
             Weigh evidence quality over advocate confidence and produce the final calibrated probability.\n\
             Respond with a JSON object: {{\"probability\": <0..1>, \"confidence\": \"low|medium|high\", \
             \"key_factors\": [<string>, ...], \"evidence_quality\": <string>, \"rationale\": <string>}}",
            self.question.text,
            self.question.resolution_criteria,
            self.cutoff.format("%Y-%m-%d"),
            self.resolution_date.format("%Y-%m-%d"),
            self.horizon_days,
            self.transcript.render(attempt),
        )
    }
}

fn advocate_system(role: Role) -> String {
    match role {
        Role::HighAdvocate => {
            "You are a zealous but intellectually honest high advocate in a forecasting debate. \
             Argue for a HIGH probability while conceding genuine weaknesses."
                .to_string()
        }
        Role::LowAdvocate => {
            "You are a zealous but intellectually honest low advocate in a forecasting debate. \
             Argue for a LOW probability while conceding genuine weaknesses."
                .to_string()
        }
        Role::Judge => JUDGE_SYSTEM.to_string(),
    }
}

const JUDGE_SYSTEM: &str = "You are the debate judge, the sole arbiter of the final forecast. \
     Evaluate both advocates' evidence and output one calibrated probability. \
     Do not average their numbers; weigh evidence quality.";
