use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use debatebench::completion::{CannedCompletion, Completion, HttpCompletion};
use debatebench::dataset;
use debatebench::gateway::{EvidenceGateway, HttpSearchProvider, NullSearchProvider, SearchProvider};
use debatebench::harness::{run_benchmark, Services};
use debatebench::logging::{json_log, obj, v_num, v_str, Domain};
use debatebench::state::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    json_log(
        Domain::System,
        "startup",
        obj(&[
            ("questions_path", v_str(&cfg.questions_path)),
            ("resolutions_path", v_str(&cfg.resolutions_path)),
            ("checkpoint_path", v_str(&cfg.checkpoint_path)),
            ("workers", v_num(cfg.workers as f64)),
            ("horizons", v_str(&format!("{:?}", cfg.horizons))),
        ]),
    );

    let questions = dataset::load_questions(&cfg.questions_path)?;
    let resolutions = dataset::load_resolutions(&cfg.resolutions_path)?;
    let mut malformed = questions.malformed;
    malformed.extend(resolutions.malformed);

    // Live services when keys are configured, stubs otherwise, so a dry
    // run exercises the full pipeline without external calls.
    let provider: Box<dyn SearchProvider> = match &cfg.search_key {
        Some(key) => {
            json_log(Domain::System, "search_provider", obj(&[("status", v_str("live"))]));
            Box::new(HttpSearchProvider::new(
                cfg.search_base.clone(),
                key.clone(),
                cfg.http_timeout_secs,
                cfg.max_snippets,
            )?)
        }
        None => {
            json_log(Domain::System, "search_provider", obj(&[("status", v_str("stub"))]));
            Box::new(NullSearchProvider)
        }
    };
    let completion: Arc<dyn Completion> = match &cfg.completion_key {
        Some(key) => {
            json_log(Domain::System, "completion", obj(&[("status", v_str("live"))]));
            Arc::new(HttpCompletion::new(
                cfg.completion_base.clone(),
                cfg.completion_model.clone(),
                key.clone(),
                cfg.http_timeout_secs,
            )?)
        }
        None => {
            json_log(Domain::System, "completion", obj(&[("status", v_str("stub"))]));
            Arc::new(CannedCompletion::new(0.5))
        }
    };
    let services = Services {
        gateway: Arc::new(EvidenceGateway::new(provider, cfg.max_snippets)),
        completion,
    };

    // in-flight questions finish their current attempt, then a final
    // checkpoint flush runs before the report
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                json_log(Domain::System, "stop_requested", obj(&[]));
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let report = run_benchmark(
        &cfg,
        questions.questions,
        malformed,
        resolutions.resolutions,
        services,
        stop,
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
