//! Integration tests for the orchestration core.
//!
//! Each test wires the full stack (in-memory KV, result store, shared
//! data area, step registry, runner, and the in-process engine) and
//! drives real jobs through it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::time::timeout;

use conveyor::canvas::{BodyItem, Signature};
use conveyor::config::Config;
use conveyor::engine::{ExecutionEngine, LocalEngine, SubmitOptions};
use conveyor::error::{Error, RemoteError, StepError};
use conveyor::kv::{KvStore, MemoryKv};
use conveyor::result::{ResultStore, TaskKind, TaskStatus};
use conveyor::runner::{
    from_fn, ExecutionContext, Params, StepRegistry, StepResult, StepRunner, TaskSpec,
};
use conveyor::schedule::{beat_tick, Schedule, ScheduleEntry, ScheduleStore};
use conveyor::shared::SharedData;

/// Maximum time any wait is allowed to take before the test is
/// considered hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

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
        Ok(json!(total))
    })
}

fn step_boom<'a>(
    _ctx: &'a ExecutionContext,
    _step_id: u32,
    _params: &'a mut Params,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async { Err(StepError::failed("boom", "intentional")) })
}

struct Stack {
    kv: Arc<dyn KvStore>,
    config: Config,
    results: Arc<ResultStore>,
    shared: Arc<SharedData>,
    engine: Arc<LocalEngine>,
}

/// Wire the full stack over an in-memory KV and register the demo steps.
async fn stack() -> Stack {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let config = Config {
        poll_interval: Duration::from_millis(10),
        ..Config::default()
    };
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

    registry.register("add", from_fn(step_add)).await.unwrap();
    registry.register("sum", from_fn(step_sum)).await.unwrap();
    registry.register("merge", from_fn(step_merge)).await.unwrap();
    registry.register("boom", from_fn(step_boom)).await.unwrap();
    engine
        .register_task(TaskSpec::new("demo.compute").step("add").step("sum"))
        .await;
    engine
        .register_task(TaskSpec::new("demo.merge").step("merge"))
        .await;
    engine
        .register_task(TaskSpec::new("demo.boom").step("boom"))
        .await;

    Stack {
        kv,
        config,
        results,
        shared,
        engine,
    }
}

#[tokio::test]
async fn task_with_two_steps_leaves_shared_data_and_result() {
    let s = stack().await;
    let params: Params =
        serde_json::from_value(json!({"x": 2, "y": 3, "numbers": [1, 2, 3]})).unwrap();

    let task_id = s
        .engine
        .submit("demo.compute", Vec::new(), params, SubmitOptions::default())
        .await
        .unwrap();
    let result = timeout(
        TEST_TIMEOUT,
        s.results.wait(&task_id, s.config.poll_interval),
    )
    .await
    .expect("wait timed out")
    .unwrap();

    // the record's result reflects the last step's return value
    assert_eq!(result, json!(6));
    let record = s.results.get(&task_id).await.unwrap();
    assert_eq!(record.state, TaskStatus::Success);
    assert_eq!(record.result, Some(json!(6)));
    assert_eq!(record.kind, Some(TaskKind::Task));

    // both steps published to the unit's shared data area
    let data = s.shared.get(&task_id).await.unwrap();
    assert_eq!(data.get("mul"), Some(&json!(5)));
    assert_eq!(data.get("res"), Some(&json!(6)));

    // the legacy-compatible record was written alongside
    let legacy = s.results.get_legacy(&task_id).await.unwrap().unwrap();
    assert_eq!(legacy.status, TaskStatus::Success);
    assert_eq!(legacy.result, Some(json!(6)));
}

#[tokio::test]
async fn composite_job_fans_out_and_joins() {
    let s = stack().await;
    let root_id = s
        .engine
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
        .await
        .unwrap();

    timeout(TEST_TIMEOUT, s.results.wait(&root_id, s.config.poll_interval))
        .await
        .expect("job timed out")
        .unwrap();

    let record = s.results.get(&root_id).await.unwrap();
    assert_eq!(record.state, TaskStatus::Success);
    assert_eq!(record.kind, Some(TaskKind::Job));
    // start bracket + two branches + merge + end bracket
    assert_eq!(record.childs.len(), 5);
    assert!(record.jobs.is_empty());
    assert!(record.trace_contains("awaiting end bracket"));
    assert!(record.trace_contains("job completed"));

    // the merge unit joined the fan-out results: the branch sums are 3
    // and 30 by the last step of each branch
    let mut merge_id = None;
    for id in &record.childs {
        let child = s.results.get(id).await.unwrap();
        if child.name.as_deref() == Some("demo.merge") {
            merge_id = Some(id.clone());
        }
    }
    let merge_id = merge_id.expect("merge child present");
    let merge_record = s.results.get(&merge_id).await.unwrap();
    assert_eq!(merge_record.result, Some(json!(33)));

    // the job's shared area was torn down at terminal state
    assert!(s.shared.get(&root_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_unit_fails_the_whole_job() {
    let s = stack().await;
    let root_id = s
        .engine
        .run_job(
            "demo.fails",
            vec![
                BodyItem::Unit(Signature::new("demo.boom")),
                BodyItem::Unit(Signature::new("demo.merge")),
            ],
            Params::new(),
        )
        .await
        .unwrap();

    let err = timeout(TEST_TIMEOUT, s.results.wait(&root_id, s.config.poll_interval))
        .await
        .expect("job timed out")
        .unwrap_err();
    assert!(matches!(err, Error::Remote(RemoteError::TaskFailed { .. })));

    let record = s.results.get(&root_id).await.unwrap();
    assert_eq!(record.state, TaskStatus::Failure);
    assert!(!record.traceback.is_empty());

    // the failing unit aborted the chain: merge never ran
    let ran_merge = {
        let mut found = false;
        for id in &record.childs {
            let child = s.results.get(id).await.unwrap();
            if child.name.as_deref() == Some("demo.merge") {
                found = true;
            }
        }
        found
    };
    assert!(!ran_merge);
}

#[tokio::test]
async fn beat_fires_due_entries_through_the_engine() {
    let s = stack().await;
    let schedule_store = ScheduleStore::new(Arc::clone(&s.kv), &s.config);
    schedule_store
        .write(
            ScheduleEntry::new("compute", "demo.compute", Schedule::seconds(1))
                .kwarg("x", json!(1))
                .kwarg("y", json!(1))
                .kwarg("numbers", json!([1])),
        )
        .await
        .unwrap();

    let engine: &dyn ExecutionEngine = s.engine.as_ref();
    beat_tick(&schedule_store, engine).await;
    let entry = schedule_store.read("compute").await.unwrap().unwrap();
    assert_eq!(entry.total_run_count, 1);
    let first_run = entry.last_run_at.unwrap();

    // not due again until the interval elapses
    beat_tick(&schedule_store, engine).await;
    assert_eq!(
        schedule_store
            .read("compute")
            .await
            .unwrap()
            .unwrap()
            .total_run_count,
        1
    );

    tokio::time::sleep(Duration::from_millis(1100)).await;
    beat_tick(&schedule_store, engine).await;
    let entry = schedule_store.read("compute").await.unwrap().unwrap();
    assert_eq!(entry.total_run_count, 2);
    assert!(entry.last_run_at.unwrap() > first_run);

    // the fired units really executed: two result records carry the
    // scheduled task's name
    tokio::time::sleep(Duration::from_millis(200)).await;
    let keys = s
        .kv
        .keys_with_prefix(&s.config.result_prefix)
        .await
        .unwrap();
    let mut fired = 0;
    for key in keys {
        let id = key.trim_start_matches(&s.config.result_prefix).to_string();
        let record = s.results.get(&id).await.unwrap();
        if record.name.as_deref() == Some("demo.compute")
            && record.state == TaskStatus::Success
        {
            fired += 1;
        }
    }
    assert_eq!(fired, 2);
}
