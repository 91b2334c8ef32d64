//! Logical-graph building blocks for tests.
//!
//! Each helper creates one logical operator in `b`, wires it to its inputs and derives its
//! declared shape from theirs.

use crate::error::{GraphError, Result};
use crate::exchange::Fetch;
use crate::graph::GraphBuilder;
use crate::key::OpKey;
use crate::operator::{OpKind, Operator, OutputMeta};
use crate::tileable::Shape;

fn shape_of(b: &GraphBuilder, key: &OpKey) -> Result<Shape> {
    b.get(key)
        .and_then(|op| op.outputs().first())
        .map(|o| o.shape.clone())
        .ok_or_else(|| GraphError::Graph(format!("`{key}` is not in the builder")))
}

fn one_output(shape: Shape) -> Vec<OutputMeta> {
    vec![OutputMeta::new(0, shape)]
}

/// A source of `rows` integers `0..rows`.
///
/// # Errors
///
/// Builder errors.
pub fn source(b: &mut GraphBuilder, rows: u64) -> Result<OpKey> {
    b.add(Operator::new(OpKind::DataSource), Vec::new(), one_output(vec![Some(rows)]))
}

/// A source of `rows` integers starting at `start`.
///
/// # Errors
///
/// Builder errors.
pub fn source_from(b: &mut GraphBuilder, start: i64, rows: u64) -> Result<OpKey> {
    let op = Operator::new(OpKind::DataSource).with("source", format!("range:{start}"))?;
    b.add(op, Vec::new(), one_output(vec![Some(rows)]))
}

/// A source whose row count is not known at planning time.
///
/// # Errors
///
/// Builder errors.
pub fn unsized_source(b: &mut GraphBuilder) -> Result<OpKey> {
    b.add(Operator::new(OpKind::DataSource), Vec::new(), one_output(vec![None]))
}

/// Unary elementwise `func` over `input`.
///
/// # Errors
///
/// Builder errors.
pub fn map(b: &mut GraphBuilder, input: &OpKey, func: &str) -> Result<OpKey> {
    let shape = shape_of(b, input)?;
    let op = Operator::new(OpKind::Elementwise).with("func", func)?;
    b.add(op, vec![input.clone()], one_output(shape))
}

/// Binary elementwise `func`, shaped like `left`.
///
/// # Errors
///
/// Builder errors.
pub fn zip(b: &mut GraphBuilder, left: &OpKey, right: &OpKey, func: &str) -> Result<OpKey> {
    let shape = shape_of(b, left)?;
    let op = Operator::new(OpKind::Elementwise).with("func", func)?;
    b.add(op, vec![left.clone(), right.clone()], one_output(shape))
}

/// Repartition `input` into `n` chunks.
///
/// # Errors
///
/// Builder errors.
pub fn rebalance(b: &mut GraphBuilder, input: &OpKey, n: i32) -> Result<OpKey> {
    let shape = shape_of(b, input)?;
    let op = Operator::new(OpKind::Rebalance).with("n_partitions", n)?;
    b.add(op, vec![input.clone()], one_output(shape))
}

/// Whole-input aggregation producing one row.
///
/// # Errors
///
/// Builder errors.
pub fn reduce(b: &mut GraphBuilder, input: &OpKey, func: &str) -> Result<OpKey> {
    let op = Operator::new(OpKind::Reduction).with("func", func)?;
    b.add(op, vec![input.clone()], one_output(vec![Some(1)]))
}

/// Grouped aggregation; the output row count is unknown.
///
/// # Errors
///
/// Builder errors.
pub fn group_reduce(b: &mut GraphBuilder, input: &OpKey, func: &str, by: &[&str]) -> Result<OpKey> {
    let op = Operator::new(OpKind::Reduction)
        .with("func", func)?
        .with("by", by.to_vec())?;
    b.add(op, vec![input.clone()], one_output(vec![None]))
}

/// Logical reference to a chunk published by an earlier run.
///
/// # Errors
///
/// Builder errors.
pub fn fetch(b: &mut GraphBuilder, source_key: &OpKey, shape: Shape) -> Result<OpKey> {
    let op = Fetch::new(source_key.clone()).into_operator()?;
    b.add(op, Vec::new(), one_output(shape))
}
