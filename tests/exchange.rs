use anyhow::Result;
use irontile::store::MapperAddr;
use irontile::{
    Fetch, FetchShuffle, GraphBuilder, GraphError, MissingReason, OpKey, OpKind, Operator,
    ResultStore, ShuffleFetchType, SourceRef, chunk, downcast_chunk,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn shuffle() -> OpKey {
    OpKey::new("proxy")
}

fn mapper(i: usize) -> MapperAddr {
    MapperAddr {
        shuffle: shuffle(),
        index: i,
        key: OpKey::new(format!("map-{i}")),
        n_reducers: 1,
    }
}

fn mapper_keys(n: usize) -> Vec<OpKey> {
    (0..n).map(|i| mapper(i).key).collect()
}

/// Mapper `i` sends `"m{i}->r{j}"` to reducer `j`.
fn publish_mapper(store: &ResultStore, i: usize, n_reducers: usize) -> Result<()> {
    let parts = (0..n_reducers).map(|j| chunk(format!("m{i}->r{j}"))).collect();
    let addr = MapperAddr {
        n_reducers,
        ..mapper(i)
    };
    Ok(store.publish_partitions(&addr, parts)?)
}

fn labels(parts: Vec<irontile::ChunkData>) -> Result<Vec<String>> {
    parts
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let label = downcast_chunk::<String>(p, SourceRef::MapperIndex(i))?;
            Ok(label.as_ref().clone())
        })
        .collect()
}

#[test]
fn fetch_operator_rejects_inputs_in_a_graph() -> Result<()> {
    let mut b = GraphBuilder::new();
    let src = b.add(Operator::new(OpKind::DataSource), Vec::new(), Vec::new())?;
    let fetch = Fetch::new("chunk-42").into_operator()?;

    assert!(matches!(
        b.add(fetch, vec![src], Vec::new()),
        Err(GraphError::InputArity { kind: "Fetch", .. })
    ));
    Ok(())
}

#[test]
fn fetch_placeholder_adopts_source_key() -> Result<()> {
    let op = Fetch::new("chunk-42").placeholder()?;

    assert_eq!(op.key(), &OpKey::new("chunk-42"));
    assert_eq!(Fetch::from_operator(&op)?.source_key(), &OpKey::new("chunk-42"));
    Ok(())
}

#[test]
fn fetch_survives_serialization() -> Result<()> {
    let op = Fetch::new("chunk-42").into_operator()?;
    let decoded = Operator::from_json(&op.to_json()?)?;

    assert_eq!(Fetch::from_operator(&decoded)?, Fetch::new("chunk-42"));
    Ok(())
}

#[test]
fn fetch_resolves_published_chunk() -> Result<()> {
    let store = ResultStore::new();
    store.publish(OpKey::new("chunk-42"), chunk(vec![1i64, 2, 3]));
    let fetch = Fetch::new("chunk-42");

    let data = fetch.resolve_now(&store)?;
    assert_eq!(
        *downcast_chunk::<Vec<i64>>(data, SourceRef::Key("chunk-42".into()))?,
        vec![1, 2, 3]
    );
    Ok(())
}

#[test]
fn fetch_of_unknown_key_is_not_found() {
    let store = ResultStore::new();
    let fetch = Fetch::new("chunk-43");

    assert_eq!(
        fetch.resolve_now(&store).err(),
        Some(GraphError::NotFound(OpKey::new("chunk-43")))
    );
    let deadline = Some(Instant::now() + Duration::from_millis(20));
    assert_eq!(
        fetch.resolve(&store, deadline).err(),
        Some(GraphError::NotFound(OpKey::new("chunk-43")))
    );
}

#[test]
fn fetch_wait_ends_when_a_consumer_is_canceled() -> Result<()> {
    let store = Arc::new(ResultStore::new());
    let consumer = OpKey::new("double-chunk");
    let waiter = {
        let store = Arc::clone(&store);
        let consumer = consumer.clone();
        thread::spawn(move || Fetch::new("chunk-42").resolve_for(&store, &[consumer], None))
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!waiter.is_finished());

    store.cancel([&consumer]);
    let result = waiter.join().map_err(|_| anyhow::anyhow!("waiter panicked"))?;
    assert_eq!(result.err(), Some(GraphError::Canceled(consumer)));
    Ok(())
}

#[test]
fn fetch_from_non_fetch_operator_is_a_schema_error() {
    assert!(matches!(
        Fetch::from_operator(&Operator::new(OpKind::DataSource)),
        Err(GraphError::Schema(_))
    ));
}

#[test]
fn by_key_requires_one_key_per_mapper() {
    let err = FetchShuffle::new(mapper_keys(2), 3, 2, ShuffleFetchType::FetchByKey).err();

    assert!(matches!(err, Some(GraphError::InvalidShuffle(_))));
    assert!(FetchShuffle::new(mapper_keys(3), 3, 2, ShuffleFetchType::FetchByKey).is_ok());
}

#[test]
fn by_index_accepts_no_keys_or_a_full_list() {
    assert!(FetchShuffle::new(Vec::new(), 3, 2, ShuffleFetchType::FetchByIndex).is_ok());
    assert!(FetchShuffle::new(mapper_keys(3), 3, 2, ShuffleFetchType::FetchByIndex).is_ok());
    assert!(FetchShuffle::new(mapper_keys(1), 3, 2, ShuffleFetchType::FetchByIndex).is_err());
}

#[test]
fn counts_must_be_positive() {
    assert!(FetchShuffle::by_index(0, 2).is_err());
    assert!(FetchShuffle::by_index(3, 0).is_err());
    assert!(FetchShuffle::by_key(Vec::new(), 2).is_err());
}

#[test]
fn fetch_shuffle_survives_serialization() -> Result<()> {
    let original = FetchShuffle::by_key(mapper_keys(3), 2)?;
    let op = original.clone().placeholder(shuffle())?;
    let decoded = Operator::from_json(&op.to_json()?)?;

    assert_eq!(decoded.key(), &shuffle());
    let view = FetchShuffle::from_operator(&decoded)?;
    assert_eq!(view, original);
    assert_eq!(view.n_mappers(), 3);
    assert_eq!(view.n_reducers(), 2);
    assert_eq!(view.fetch_type(), ShuffleFetchType::FetchByKey);
    Ok(())
}

#[test]
fn reducer_index_out_of_range() -> Result<()> {
    let fs = FetchShuffle::by_index(3, 2)?;

    assert!(matches!(
        fs.request(&shuffle(), 2),
        Err(GraphError::InvalidShuffle(_))
    ));
    Ok(())
}

#[test]
fn by_index_three_mappers_two_reducers() -> Result<()> {
    let store = ResultStore::new();
    for i in 0..3 {
        publish_mapper(&store, i, 2)?;
    }
    let fs = FetchShuffle::by_index(3, 2)?;

    let r0 = labels(fs.try_resolve(&store, &shuffle(), 0)?)?;
    let r1 = labels(fs.try_resolve(&store, &shuffle(), 1)?)?;
    assert_eq!(r0, vec!["m0->r0", "m1->r0", "m2->r0"]);
    assert_eq!(r1, vec!["m0->r1", "m1->r1", "m2->r1"]);
    assert_eq!(r0.len() + r1.len(), 6);
    Ok(())
}

#[test]
fn assembly_order_is_independent_of_completion_order() -> Result<()> {
    for fetch_type in [ShuffleFetchType::FetchByKey, ShuffleFetchType::FetchByIndex] {
        let store = ResultStore::new();
        for i in [2, 0, 1] {
            publish_mapper(&store, i, 2)?;
        }
        let fs = FetchShuffle::new(mapper_keys(3), 3, 2, fetch_type)?;

        let parts = labels(fs.try_resolve(&store, &shuffle(), 1)?)?;
        assert_eq!(parts, vec!["m0->r1", "m1->r1", "m2->r1"], "{fetch_type:?}");
    }
    Ok(())
}

#[test]
fn by_key_assembles_in_key_list_order() -> Result<()> {
    let store = ResultStore::new();
    for i in 0..3 {
        publish_mapper(&store, i, 1)?;
    }
    let keys = vec![mapper(2).key, mapper(0).key, mapper(1).key];
    let fs = FetchShuffle::by_key(keys, 1)?;

    let parts = labels(fs.try_resolve(&store, &shuffle(), 0)?)?;
    assert_eq!(parts, vec!["m2->r0", "m0->r0", "m1->r0"]);
    Ok(())
}

#[test]
fn incomplete_barrier_reports_progress() -> Result<()> {
    let store = ResultStore::new();
    publish_mapper(&store, 1, 2)?;
    let fs = FetchShuffle::by_index(3, 2)?;

    let err = fs.try_resolve(&store, &shuffle(), 0).err();
    assert_eq!(
        err,
        Some(GraphError::IncompleteShuffle {
            reducer: 0,
            available: 1,
            required: 3,
        })
    );
    assert!(err.is_some_and(|e| e.is_transient()));
    Ok(())
}

#[test]
fn reducer_blocks_until_last_mapper_publishes() -> Result<()> {
    let store = Arc::new(ResultStore::new());
    publish_mapper(&store, 0, 2)?;
    let fs = FetchShuffle::by_index(2, 2)?;

    let waiter = {
        let store = Arc::clone(&store);
        let fs = fs.clone();
        thread::spawn(move || fs.resolve(&store, &shuffle(), 1, None))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    publish_mapper(&store, 1, 2)?;
    let parts = waiter.join().map_err(|_| anyhow::anyhow!("waiter panicked"))??;
    assert_eq!(labels(parts)?, vec!["m0->r1", "m1->r1"]);
    Ok(())
}

#[test]
fn reducer_wait_ends_when_a_consumer_is_canceled() -> Result<()> {
    for fs in [FetchShuffle::by_index(2, 1)?, FetchShuffle::by_key(mapper_keys(2), 1)?] {
        let store = Arc::new(ResultStore::new());
        publish_mapper(&store, 0, 1)?;
        let consumer = OpKey::new("sum-chunk");
        let waiter = {
            let store = Arc::clone(&store);
            let consumer = consumer.clone();
            thread::spawn(move || fs.resolve_for(&store, &shuffle(), 0, &[consumer], None))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        store.cancel([&consumer]);
        let result = waiter.join().map_err(|_| anyhow::anyhow!("waiter panicked"))?;
        assert_eq!(result.err(), Some(GraphError::Canceled(consumer)));
    }
    Ok(())
}

#[test]
fn failed_mapper_surfaces_missing_partition() -> Result<()> {
    let store = ResultStore::new();
    publish_mapper(&store, 0, 2)?;
    store.fail_mapper(&mapper(1), "disk full");
    publish_mapper(&store, 2, 2)?;

    let by_index = FetchShuffle::by_index(3, 2)?;
    assert_eq!(
        by_index.resolve(&store, &shuffle(), 0, None).err(),
        Some(GraphError::MissingPartition {
            producer: SourceRef::MapperIndex(1),
            reason: MissingReason::ProducerFailed("disk full".into()),
        })
    );

    let by_key = FetchShuffle::by_key(mapper_keys(3), 2)?;
    assert_eq!(
        by_key.resolve(&store, &shuffle(), 1, None).err(),
        Some(GraphError::MissingPartition {
            producer: SourceRef::Key(mapper(1).key),
            reason: MissingReason::ProducerFailed("disk full".into()),
        })
    );
    Ok(())
}

#[test]
fn failure_wakes_a_blocked_reducer() -> Result<()> {
    let store = Arc::new(ResultStore::new());
    let fs = FetchShuffle::by_index(2, 1)?;
    let waiter = {
        let store = Arc::clone(&store);
        thread::spawn(move || fs.resolve(&store, &shuffle(), 0, None))
    };
    thread::sleep(Duration::from_millis(30));

    store.fail_mapper(&mapper(0), "oom");
    let result = waiter.join().map_err(|_| anyhow::anyhow!("waiter panicked"))?;
    assert!(matches!(
        result,
        Err(GraphError::MissingPartition {
            producer: SourceRef::MapperIndex(0),
            ..
        })
    ));
    Ok(())
}

#[test]
fn deadline_names_first_missing_mapper() -> Result<()> {
    let store = ResultStore::new();
    publish_mapper(&store, 0, 1)?;
    let fs = FetchShuffle::by_index(3, 1)?;

    let deadline = Some(Instant::now() + Duration::from_millis(30));
    assert_eq!(
        fs.resolve(&store, &shuffle(), 0, deadline).err(),
        Some(GraphError::MissingPartition {
            producer: SourceRef::MapperIndex(1),
            reason: MissingReason::DeadlineElapsed,
        })
    );
    Ok(())
}

#[test]
fn corrupt_partition_is_reported() -> Result<()> {
    let store = ResultStore::new();
    publish_mapper(&store, 0, 2)?;
    publish_mapper(&store, 1, 2)?;
    store.mark_corrupt(&mapper(1).key, 0, "checksum mismatch");
    let fs = FetchShuffle::by_index(2, 2)?;

    assert!(matches!(
        fs.try_resolve(&store, &shuffle(), 0),
        Err(GraphError::MissingPartition {
            producer: SourceRef::MapperIndex(1),
            reason: MissingReason::Corrupt(_),
        })
    ));
    assert_eq!(labels(fs.try_resolve(&store, &shuffle(), 1)?)?.len(), 2);
    Ok(())
}
