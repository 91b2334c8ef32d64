use anyhow::{Result, anyhow};
use irontile::testing::{
    FailingExecutor, RowExecutor, assert_rows_equal, assert_rows_unordered_equal, collect_rows,
    fetch, group_reduce, map, partition_rows, rebalance, reduce, source, source_from, zip,
};
use irontile::{
    Graph, GraphBuilder, GraphError, MissingReason, OpKey, OpKind, Planner, PlannerConfig,
    ResultStore, Runner, RunnerConfig, ShuffleFetchType, SourceRef,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn run(graph: &Graph) -> Result<irontile::RunOutput> {
    let mut planner = Planner::default();
    let plan = planner.tile(graph)?;
    Runner::default().run(&planner, &plan, &RowExecutor)
}

fn is_mapper(op: &irontile::Operator) -> bool {
    op.kind() == OpKind::ShuffleMap
}

#[test]
fn sum_of_doubled_range() -> Result<()> {
    let (graph, total) = GraphBuilder::scope(|b| {
        let src = source(b, 100)?;
        let parts = rebalance(b, &src, 4)?;
        let doubled = map(b, &parts, "double")?;
        reduce(b, &doubled, "sum")
    })?;

    let out = run(&graph)?;
    assert_eq!(out.len(), 1);
    assert_eq!(collect_rows(&out, &total)?, vec![9900]);
    Ok(())
}

#[test]
fn rebalance_preserves_row_order() -> Result<()> {
    let (graph, parts) = GraphBuilder::scope(|b| {
        let src = source_from(b, 100, 10)?;
        rebalance(b, &src, 4)
    })?;

    let out = run(&graph)?;
    let partitions = partition_rows(&out, &parts)?;
    let lengths: Vec<usize> = partitions.iter().map(Vec::len).collect();
    assert_eq!(lengths, vec![3, 3, 2, 2]);
    let expected: Vec<i64> = (100..110).collect();
    assert_rows_equal(&collect_rows(&out, &parts)?, &expected);
    Ok(())
}

#[test]
fn grouped_distinct_partitions_are_disjoint() -> Result<()> {
    let (graph, distinct) = GraphBuilder::scope(|b| {
        let src = source(b, 40)?;
        let parts = rebalance(b, &src, 4)?;
        let doubled = map(b, &parts, "double")?;
        let both = zip(b, &parts, &doubled, "add")?;
        let again = map(b, &parts, "identity")?;
        let mixed = zip(b, &both, &again, "add")?;
        group_reduce(b, &mixed, "distinct", &["value"])
    })?;

    let out = run(&graph)?;
    let partitions = partition_rows(&out, &distinct)?;
    for (i, left) in partitions.iter().enumerate() {
        for right in &partitions[i + 1..] {
            assert!(left.iter().all(|v| !right.contains(v)));
        }
    }
    let expected: Vec<i64> = (0..40).map(|i| 4 * i).collect();
    assert_rows_unordered_equal(&collect_rows(&out, &distinct)?, &expected);
    Ok(())
}

#[test]
fn misaligned_inputs_are_realigned() -> Result<()> {
    let (graph, sum) = GraphBuilder::scope(|b| {
        let src = source(b, 10)?;
        let four = rebalance(b, &src, 4)?;
        let three = rebalance(b, &src, 3)?;
        let doubled = map(b, &three, "double")?;
        zip(b, &four, &doubled, "add")
    })?;

    let out = run(&graph)?;
    let expected: Vec<i64> = (0..10).map(|i| 3 * i).collect();
    assert_rows_equal(&collect_rows(&out, &sum)?, &expected);
    assert_eq!(partition_rows(&out, &sum)?.len(), 4);
    Ok(())
}

#[test]
fn addressing_modes_agree() -> Result<()> {
    let (graph, grouped) = GraphBuilder::scope(|b| {
        let src = source(b, 30)?;
        let parts = rebalance(b, &src, 3)?;
        group_reduce(b, &parts, "sum", &["value"])
    })?;

    let mut results = Vec::new();
    for shuffle_fetch_type in [ShuffleFetchType::FetchByKey, ShuffleFetchType::FetchByIndex] {
        let mut planner = Planner::new(PlannerConfig {
            shuffle_fetch_type,
            ..PlannerConfig::default()
        });
        let plan = planner.tile(&graph)?;
        let out = Runner::default().run(&planner, &plan, &RowExecutor)?;
        results.push(partition_rows(&out, &grouped)?);
    }
    assert_eq!(results[0], results[1]);
    let total: i64 = results[0].iter().flatten().sum();
    assert_eq!(total, (0..30).sum::<i64>());
    Ok(())
}

#[test]
fn transient_mapper_failure_is_retried() -> Result<()> {
    let (graph, total) = GraphBuilder::scope(|b| {
        let src = source(b, 10)?;
        reduce(b, &src, "sum")
    })?;
    let executor = FailingExecutor::new(RowExecutor, 1, is_mapper);

    let mut planner = Planner::default();
    let plan = planner.tile(&graph)?;
    let out = Runner::default().run(&planner, &plan, &executor)?;
    assert_eq!(executor.injected(), 1);
    assert_eq!(collect_rows(&out, &total)?, vec![45]);
    Ok(())
}

#[test]
fn permanent_mapper_failure_reaches_reducers() -> Result<()> {
    let (graph, total) = GraphBuilder::scope(|b| {
        let src = source(b, 10)?;
        reduce(b, &src, "sum")
    })?;
    let executor = FailingExecutor::always(RowExecutor, is_mapper);

    let mut planner = Planner::default();
    let plan = planner.tile(&graph)?;
    let runner = Runner::default();
    let err = runner
        .run(&planner, &plan, &executor)
        .err()
        .ok_or_else(|| anyhow!("run should fail"))?;
    assert!(format!("{err:#}").contains("injected failure"));
    assert_eq!(executor.injected(), 2);

    let reducer = &plan.chunks_of(&total).ok_or_else(|| anyhow!("not tiled"))?[0];
    assert!(matches!(
        runner.store().get(reducer),
        Err(GraphError::MissingPartition {
            producer: SourceRef::Key(_),
            reason: MissingReason::ProducerFailed(_),
        })
    ));
    Ok(())
}

#[test]
fn canceled_plan_does_not_run() -> Result<()> {
    let (graph, _) = GraphBuilder::scope(|b| {
        let src = source(b, 10)?;
        rebalance(b, &src, 2)
    })?;
    let mut planner = Planner::default();
    let plan = planner.tile(&graph)?;
    let runner = Runner::default();

    let handle = runner.cancel_handle(&plan);
    handle.cancel();
    let err = runner
        .run(&planner, &plan, &RowExecutor)
        .err()
        .ok_or_else(|| anyhow!("run should fail"))?;
    assert!(matches!(
        err.downcast_ref::<GraphError>(),
        Some(GraphError::Canceled(_))
    ));
    Ok(())
}

#[test]
fn later_plan_fetches_earlier_result() -> Result<()> {
    let store = Arc::new(ResultStore::new());
    let runner = Runner::with_store(RunnerConfig::default(), Arc::clone(&store));

    let (first, doubled) = GraphBuilder::scope(|b| {
        let src = source(b, 5)?;
        map(b, &src, "double")
    })?;
    let mut planner = Planner::default();
    let plan = planner.tile(&first)?;
    runner.run(&planner, &plan, &RowExecutor)?;
    let published = plan.chunks_of(&doubled).ok_or_else(|| anyhow!("not tiled"))?[0].clone();

    let (second, incremented) = GraphBuilder::scope(|b| {
        let prior = fetch(b, &published, vec![Some(5)])?;
        map(b, &prior, "increment")
    })?;
    let plan = planner.tile(&second)?;
    let out = runner.run(&planner, &plan, &RowExecutor)?;
    assert_rows_equal(&collect_rows(&out, &incremented)?, &[1, 3, 5, 7, 9]);
    Ok(())
}

#[test]
fn fetch_of_unknown_chunk_times_out() -> Result<()> {
    let (graph, _) = GraphBuilder::scope(|b| {
        let prior = fetch(b, &OpKey::new("chunk-42"), vec![Some(3)])?;
        map(b, &prior, "double")
    })?;
    let mut planner = Planner::default();
    let plan = planner.tile(&graph)?;
    let runner = Runner::new(RunnerConfig {
        fetch_timeout_ms: Some(50),
        ..RunnerConfig::default()
    });

    let err = runner
        .run(&planner, &plan, &RowExecutor)
        .err()
        .ok_or_else(|| anyhow!("run should fail"))?;
    assert_eq!(
        err.downcast_ref::<GraphError>(),
        Some(&GraphError::NotFound(OpKey::new("chunk-42")))
    );
    Ok(())
}

#[test]
fn cancel_ends_a_pending_external_fetch() -> Result<()> {
    let (graph, _) = GraphBuilder::scope(|b| {
        let prior = fetch(b, &OpKey::new("chunk-42"), vec![Some(3)])?;
        map(b, &prior, "double")
    })?;
    let mut planner = Planner::default();
    let plan = planner.tile(&graph)?;
    let runner = Runner::new(RunnerConfig {
        fetch_timeout_ms: Some(3000),
        ..RunnerConfig::default()
    });

    let handle = runner.cancel_handle(&plan);
    let canceler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.cancel();
    });
    let started = Instant::now();
    let err = runner
        .run(&planner, &plan, &RowExecutor)
        .err()
        .ok_or_else(|| anyhow!("run should fail"))?;
    canceler.join().map_err(|_| anyhow!("canceler panicked"))?;

    assert!(matches!(
        err.downcast_ref::<GraphError>(),
        Some(GraphError::Canceled(_))
    ));
    assert!(started.elapsed() < Duration::from_millis(2000));
    Ok(())
}

#[test]
fn consumed_intermediates_are_evicted() -> Result<()> {
    let (graph, out_key) = GraphBuilder::scope(|b| {
        let src = source(b, 10)?;
        let parts = rebalance(b, &src, 4)?;
        map(b, &parts, "increment")
    })?;
    let mut planner = Planner::default();
    let plan = planner.tile(&graph)?;
    let runner = Runner::default();
    runner.run(&planner, &plan, &RowExecutor)?;

    let mapper = plan
        .chunk_graph
        .operators()
        .iter()
        .find(|op| is_mapper(op))
        .ok_or_else(|| anyhow!("no mapper"))?;
    assert!(!runner.store().contains(mapper.key()));
    for key in plan.chunks_of(&out_key).ok_or_else(|| anyhow!("not tiled"))? {
        assert!(runner.store().contains(key));
    }
    assert_eq!(runner.store().live_entries(), 4);
    Ok(())
}

#[test]
fn finished_run_leaves_no_eviction_tombstones() -> Result<()> {
    let (graph, (src, sum)) = GraphBuilder::scope(|b| {
        let src = source(b, 10)?;
        let doubled = map(b, &src, "double")?;
        let incremented = map(b, &src, "increment")?;
        let sum = zip(b, &doubled, &incremented, "add")?;
        Ok((src, sum))
    })?;
    let mut planner = Planner::default();
    let plan = planner.tile(&graph)?;
    let runner = Runner::default();
    let out = runner.run(&planner, &plan, &RowExecutor)?;

    let expected: Vec<i64> = (0..10).map(|i| 3 * i + 1).collect();
    assert_rows_equal(&collect_rows(&out, &sum)?, &expected);
    let source_chunk = &plan.chunks_of(&src).ok_or_else(|| anyhow!("not tiled"))?[0];
    assert_eq!(
        runner.store().get(source_chunk).err(),
        Some(GraphError::NotFound(source_chunk.clone()))
    );
    assert_eq!(runner.store().purge_evicted(), 0);
    Ok(())
}

#[test]
fn single_thread_runs_every_wave() -> Result<()> {
    let (graph, total) = GraphBuilder::scope(|b| {
        let src = source(b, 20)?;
        let parts = rebalance(b, &src, 5)?;
        reduce(b, &parts, "max")
    })?;
    let mut planner = Planner::default();
    let plan = planner.tile(&graph)?;
    let runner = Runner::new(RunnerConfig {
        threads: Some(1),
        ..RunnerConfig::default()
    });

    let out = runner.run(&planner, &plan, &RowExecutor)?;
    assert_eq!(collect_rows(&out, &total)?, vec![19]);
    Ok(())
}

#[test]
fn config_loads_partial_json() -> Result<()> {
    let config = RunnerConfig::from_json_str(r#"{"threads": 2}"#)?;

    assert_eq!(config.threads, Some(2));
    assert_eq!(config.fetch_timeout_ms, Some(30_000));
    assert_eq!(config.max_attempts, 2);
    assert!(RunnerConfig::from_json_str("{").is_err());
    Ok(())
}
