use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use conveyor::canvas::{BodyItem, Signature};
use conveyor::config::Config;
use conveyor::engine::{ExecutionEngine, LocalEngine, SubmitOptions};
use conveyor::error::StepError;
use conveyor::kv::{KvStore, MemoryKv};
use conveyor::result::ResultStore;
use conveyor::runner::{
    from_fn, ExecutionContext, Params, StepRegistry, StepResult, StepRunner, TaskSpec,
};
use conveyor::schedule::{spawn_beat, Schedule, ScheduleEntry, ScheduleStore};
use conveyor::shared::SharedData;

/// Add `x` and `y`, publish the total to the shared area.
fn step_add<'a>(
    ctx: &'a ExecutionContext,
    _step_id: u32,
    params: &'a mut Params,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let x = params
            .get("x")
            .and_then(Value::as_i64)
            .ok_or(StepError::MissingParam {
                name: "x".to_string(),
            })?;
        let y = params
            .get("y")
            .and_then(Value::as_i64)
            .ok_or(StepError::MissingParam {
                name: "y".to_string(),
            })?;
        let total = x + y;
        let mut update = Params::new();
        update.insert("mul".to_string(), json!(total));
        ctx.shared().set(&ctx.job_id, update).await?;
        Ok(json!(total))
    })
}

/// Sum the `numbers` parameter, publish the total to the shared area.
fn step_sum<'a>(
    ctx: &'a ExecutionContext,
    _step_id: u32,
    params: &'a mut Params,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let numbers = params
            .get("numbers")
            .and_then(Value::as_array)
            .ok_or(StepError::MissingParam {
                name: "numbers".to_string(),
            })?;
        let total: i64 = numbers.iter().filter_map(Value::as_i64).sum();
        let mut update = Params::new();
        update.insert("res".to_string(), json!(total));
        ctx.shared().set(&ctx.job_id, update).await?;
        Ok(json!(total))
    })
}

/// Join step: pop the fan-out results off the shared stack and sum them.
fn step_merge<'a>(
    ctx: &'a ExecutionContext,
    _step_id: u32,
    _params: &'a mut Params,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let branches = ctx
            .shared()
            .stack_pop(&ctx.job_id)
            .await?
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        let total: i64 = branches.iter().filter_map(Value::as_i64).sum();
        let mut update = Params::new();
        update.insert("merged".to_string(), json!(total));
        ctx.shared().set(&ctx.job_id, update).await?;
        Ok(json!(total))
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env();

    eprintln!("⚙️  Conveyor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", config.worker_hostname);
    eprintln!("   Queue: {}", config.default_queue);
    eprintln!("   Beat: every {:?}\n", config.beat_interval);

    // ── Backing store ────────────────────────────────────────────────────
    #[cfg(feature = "redis-backend")]
    let kv: Arc<dyn KvStore> = match std::env::var("CONVEYOR_REDIS_URL") {
        Ok(url) => {
            eprintln!("   KV: redis at {url}");
            Arc::new(conveyor::kv::RedisKv::connect(&url).await?)
        }
        Err(_) => {
            eprintln!("   KV: in-memory");
            Arc::new(MemoryKv::new())
        }
    };
    #[cfg(not(feature = "redis-backend"))]
    let kv: Arc<dyn KvStore> = {
        eprintln!("   KV: in-memory");
        Arc::new(MemoryKv::new())
    };

    // ── Core wiring ──────────────────────────────────────────────────────
    let registry = Arc::new(StepRegistry::new());
    let results = Arc::new(ResultStore::new(Arc::clone(&kv), &config));
    let shared = Arc::new(SharedData::new(Arc::clone(&kv), &config));
    let runner = Arc::new(StepRunner::new(
        Arc::clone(&registry),
        Arc::clone(&results),
        Arc::clone(&shared),
        &config,
    ));
    let engine = LocalEngine::new(runner, &config);

    registry.register("add", from_fn(step_add)).await?;
    registry.register("sum", from_fn(step_sum)).await?;
    registry.register("merge", from_fn(step_merge)).await?;
    engine
        .register_task(TaskSpec::new("demo.compute").step("add").step("sum"))
        .await;
    engine
        .register_task(TaskSpec::new("demo.merge").step("merge"))
        .await;

    // ── Schedule + beat ──────────────────────────────────────────────────
    let schedule_store = Arc::new(ScheduleStore::new(Arc::clone(&kv), &config));
    schedule_store
        .write(
            ScheduleEntry::new("heartbeat", "demo.compute", Schedule::seconds(30))
                .kwarg("x", json!(1))
                .kwarg("y", json!(1))
                .kwarg("numbers", json!([1])),
        )
        .await?;
    let _beat = spawn_beat(
        Arc::clone(&schedule_store),
        Arc::clone(&engine) as Arc<dyn ExecutionEngine>,
        config.beat_interval,
    );
    eprintln!("   Schedule: {} entries\n", schedule_store.read_all().await?.len());

    // ── Single task ──────────────────────────────────────────────────────
    let params: Params =
        serde_json::from_value(json!({"x": 2, "y": 3, "numbers": [1, 2, 3]}))?;
    let task_id = engine
        .submit("demo.compute", Vec::new(), params.clone(), SubmitOptions::default())
        .await?;
    let result = results.wait(&task_id, config.poll_interval).await?;
    let record = results.get(&task_id).await?;
    eprintln!("Task {task_id} finished: result={result} state={}", record.state);
    eprintln!("Shared data: {:?}\n", shared.get(&task_id).await?);

    // ── Composite job: parallel fan-out joined by a merge unit ──────────
    let root_id = engine
        .run_job(
            "demo.batch",
            vec![
                BodyItem::Group(vec![
                    Signature::new("demo.compute")
                        .kwarg("x", json!(1))
                        .kwarg("y", json!(2))
                        .kwarg("numbers", json!([1, 2])),
                    Signature::new("demo.compute")
                        .kwarg("x", json!(10))
                        .kwarg("y", json!(20))
                        .kwarg("numbers", json!([10, 20])),
                ]),
                BodyItem::Unit(Signature::new("demo.merge")),
            ],
            Params::new(),
        )
        .await?;
    results.wait(&root_id, config.poll_interval).await?;
    let job_record = results.get(&root_id).await?;
    eprintln!(
        "Job {root_id} finished: state={} children={}",
        job_record.state,
        job_record.childs.len()
    );
    eprintln!("{}", serde_json::to_string_pretty(&job_record)?);

    Ok(())
}
