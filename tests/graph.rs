use anyhow::{Result, anyhow};
use irontile::testing::{map, rebalance, reduce, source, zip};
use irontile::{Graph, GraphBuilder, GraphError, OpKey, OpKind, Operator, OutputMeta};

fn diamond() -> Result<(Graph, [OpKey; 4])> {
    let (graph, keys) = GraphBuilder::scope(|b| {
        let src = source(b, 8)?;
        let left = map(b, &src, "double")?;
        let right = map(b, &src, "negate")?;
        let sum = zip(b, &left, &right, "add")?;
        Ok([src, left, right, sum])
    })?;
    Ok((graph, keys))
}

#[test]
fn builder_records_topological_order() -> Result<()> {
    let (graph, [src, left, right, sum]) = diamond()?;

    let order: Vec<&OpKey> = graph.operators().iter().map(Operator::key).collect();
    assert_eq!(order, vec![&src, &left, &right, &sum]);
    assert_eq!(graph.len(), 4);
    assert_eq!(graph.successors(&src), vec![&left, &right]);
    assert_eq!(graph.edges().len(), 4);
    Ok(())
}

#[test]
fn sources_and_sinks() -> Result<()> {
    let (graph, [src, _, _, sum]) = diamond()?;

    let sources: Vec<&OpKey> = graph.sources().map(Operator::key).collect();
    let sinks: Vec<&OpKey> = graph.sinks().into_iter().map(Operator::key).collect();
    assert_eq!(sources, vec![&src]);
    assert_eq!(sinks, vec![&sum]);
    Ok(())
}

#[test]
fn added_operators_are_sealed_and_bound() -> Result<()> {
    let (graph, keys) = diamond()?;

    for key in &keys {
        let op = graph.get(key).ok_or_else(|| anyhow!("missing {key}"))?;
        assert!(op.is_sealed());
        assert!(op.is_bound());
    }
    Ok(())
}

#[test]
fn inputs_must_already_be_registered() {
    let mut b = GraphBuilder::new();
    let op = Operator::new(OpKind::Elementwise);

    let err = b.add(op, vec![OpKey::new("nowhere")], Vec::new()).err();
    assert!(matches!(err, Some(GraphError::Graph(_))));
    assert!(b.is_empty());
}

#[test]
fn arity_is_checked_on_add() {
    let mut b = GraphBuilder::new();

    let err = b.add(Operator::new(OpKind::Reduction), Vec::new(), Vec::new()).err();
    assert!(matches!(
        err,
        Some(GraphError::InputArity { kind: "Reduction", got: 0, .. })
    ));
}

#[test]
fn duplicate_keys() -> Result<()> {
    let mut b = GraphBuilder::new();
    let key = OpKey::new("src");
    let shape = vec![OutputMeta::new(0, vec![Some(4)])];

    b.add(Operator::with_key(OpKind::DataSource, key.clone()), Vec::new(), shape.clone())?;
    b.add(Operator::with_key(OpKind::DataSource, key.clone()), Vec::new(), shape)?;
    assert_eq!(b.len(), 1);

    let different = Operator::with_key(OpKind::DataSource, key.clone()).with("source", "range:9")?;
    let err = b.add(different, Vec::new(), Vec::new()).err();
    assert_eq!(err, Some(GraphError::DuplicateKey(key)));
    Ok(())
}

#[test]
fn json_round_trip() -> Result<()> {
    let (graph, _) = diamond()?;

    let decoded = Graph::from_json(&graph.to_json()?)?;
    assert_eq!(decoded, graph);
    Ok(())
}

#[test]
fn records_decode_in_any_order() -> Result<()> {
    let (graph, [src, _, _, sum]) = diamond()?;
    let mut records = graph.to_records();
    records.reverse();

    let decoded = Graph::from_records(records)?;
    assert_eq!(decoded.len(), graph.len());
    assert_eq!(decoded.operators()[0].key(), &src);
    assert_eq!(decoded.operators()[3].key(), &sum);
    for op in graph.operators() {
        assert_eq!(decoded.get(op.key()), Some(op));
    }
    Ok(())
}

#[test]
fn dangling_records_are_rejected() -> Result<()> {
    let (graph, _) = diamond()?;
    let mut records = graph.to_records();
    records.remove(0);

    assert!(matches!(
        Graph::from_records(records),
        Err(GraphError::Graph(_))
    ));
    Ok(())
}

#[test]
fn cyclic_records_are_rejected() -> Result<()> {
    let (a, b) = (OpKey::new("a"), OpKey::new("b"));
    let mut op_a = Operator::with_key(OpKind::Elementwise, a.clone());
    op_a.bind(vec![b.clone()], Vec::new())?;
    let mut op_b = Operator::with_key(OpKind::Elementwise, b);
    op_b.bind(vec![a], Vec::new())?;

    assert!(matches!(
        Graph::from_records(vec![op_a.to_record(), op_b.to_record()]),
        Err(GraphError::Graph(_))
    ));
    Ok(())
}

#[test]
fn fingerprint_ignores_keys_but_not_structure() -> Result<()> {
    let (first, _) = diamond()?;
    let (second, _) = diamond()?;
    assert_eq!(first.fingerprint(), second.fingerprint());

    let (chain, _) = GraphBuilder::scope(|b| {
        let src = source(b, 8)?;
        let parts = rebalance(b, &src, 2)?;
        reduce(b, &parts, "sum")
    })?;
    assert_ne!(first.fingerprint(), chain.fingerprint());
    Ok(())
}
