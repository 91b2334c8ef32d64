//! Tiling: turning a logical, size-agnostic operator into sized chunk operators.
//!
//! Each logical [`OpKind`] has a [`Tile`] implementation, looked up through [`tiler_for`].
//! A tiler sees only metadata: the logical operator (kind, fields, declared output shape)
//! and, for each logical input, the chunk keys and chunk shapes it was tiled into
//! ([`TiledTileable`]). It never sees data.
//!
//! Tiling is deterministic. Chunk keys are derived from the logical key and the chunk's
//! role and position ([`OpKey::derive`]), and chunks are emitted in a fixed order, so
//! identical metadata always produces an identical chunk graph.
//!
//! Partitioning is along axis 0. When the partition count changes across an operator
//! (reduction, rebalance, or a binary elementwise op whose inputs are split differently),
//! the tiler emits a shuffle stage: `n_mappers` `ShuffleMap` chunks, one `ShuffleProxy`
//! joining them and `n_reducers` `ShuffleReduce` chunks reading from the proxy. Mappers and
//! reducers are never wired to each other directly.

use crate::error::{GraphError, Result};
use crate::exchange::Partitioner;
use crate::field::{FieldEnum, FieldValue};
use crate::key::OpKey;
use crate::operator::{OpKind, Operator};
use crate::planner::PlanDecision;
use tracing::debug;

/// Extent per axis; `None` where the size is not known at planning time.
pub type Shape = Vec<Option<u64>>;

/// A logical node after tiling: its chunks in partition order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TiledTileable {
    pub chunks: Vec<OpKey>,
    pub shapes: Vec<Shape>,
}

impl TiledTileable {
    #[must_use]
    pub fn n_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Row count of each chunk along axis 0.
    #[must_use]
    pub fn row_splits(&self) -> Vec<Option<u64>> {
        self.shapes
            .iter()
            .map(|s| s.first().copied().flatten())
            .collect()
    }

    /// Row counts when every chunk's size is known.
    #[must_use]
    pub fn known_rows(&self) -> Option<Vec<u64>> {
        self.row_splits().into_iter().collect()
    }
}

/// One chunk operator emitted by a tiler, with its inputs and output shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkOp {
    pub op: Operator,
    pub inputs: Vec<OpKey>,
    pub shape: Shape,
    /// Position within the chunk's own stage (partition, mapper or reducer index).
    pub index: usize,
}

/// Everything tiling one logical operator produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileOutput {
    /// Chunk operators in emission (topological) order.
    pub ops: Vec<ChunkOp>,
    pub tiled: TiledTileable,
    pub decision: Option<PlanDecision>,
}

/// Planning parameters a tiler may consult.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileContext {
    pub max_reducers: usize,
}

/// Tiling capability of one logical operator kind.
pub trait Tile: Sync {
    /// # Errors
    ///
    /// `Tiling` when the metadata does not allow a valid decomposition.
    fn tile(&self, op: &Operator, inputs: &[&TiledTileable], cx: &TileContext)
    -> Result<TileOutput>;
}

struct LeafTiler;
struct ElementwiseTiler;
struct ReductionTiler;
struct RebalanceTiler;

/// The tiler for `kind`, or `None` for kinds that never appear in a logical graph.
#[must_use]
pub fn tiler_for(kind: OpKind) -> Option<&'static dyn Tile> {
    match kind {
        OpKind::DataSource | OpKind::Fetch => Some(&LeafTiler),
        OpKind::Elementwise => Some(&ElementwiseTiler),
        OpKind::Reduction => Some(&ReductionTiler),
        OpKind::Rebalance => Some(&RebalanceTiler),
        OpKind::FetchShuffle
        | OpKind::ShuffleMap
        | OpKind::ShuffleProxy
        | OpKind::ShuffleReduce => None,
    }
}

/// Tile `op` given its tiled inputs, dispatching on its kind.
///
/// # Errors
///
/// `Tiling` for kinds without a tiler, input-count mismatches, or metadata the kind's
/// tiler rejects.
pub fn tile(op: &Operator, inputs: &[&TiledTileable], cx: &TileContext) -> Result<TileOutput> {
    let tiler = tiler_for(op.kind())
        .ok_or_else(|| GraphError::tiling(op.key(), format!("{} is not tileable", op.kind())))?;
    if inputs.len() != op.inputs().len() {
        return Err(GraphError::tiling(
            op.key(),
            format!("{} tiled inputs for {} logical inputs", inputs.len(), op.inputs().len()),
        ));
    }
    let out = tiler.tile(op, inputs, cx)?;
    debug!(
        key = %op.key(),
        kind = %op.kind(),
        chunks = out.tiled.n_chunks(),
        emitted = out.ops.len(),
        "tiled"
    );
    Ok(out)
}

fn logical_shape(op: &Operator) -> Result<Shape> {
    op.outputs()
        .first()
        .map(|o| o.shape.clone())
        .ok_or_else(|| GraphError::tiling(op.key(), "no output placeholder"))
}

/// Logical shape with axis 0 replaced by `rows`.
fn with_rows(shape: &Shape, rows: Option<u64>) -> Shape {
    let mut out = shape.clone();
    match out.first_mut() {
        Some(first) => *first = rows,
        None => out.push(rows),
    }
    out
}

/// Same-kind chunk carrying every explicitly-set field of `op`.
fn chunk_like(op: &Operator, key: OpKey) -> Result<Operator> {
    let mut chunk = Operator::with_key(op.kind(), key);
    for (name, value) in op.fields().explicit() {
        chunk.set(name, value.clone())?;
    }
    Ok(chunk)
}

fn to_i32(origin: &OpKey, n: usize) -> Result<i32> {
    i32::try_from(n).map_err(|_| GraphError::tiling(origin, format!("{n} exceeds int32")))
}

fn to_i64(origin: &OpKey, n: u64) -> Result<i64> {
    i64::try_from(n).map_err(|_| GraphError::tiling(origin, format!("{n} exceeds int64")))
}

impl Tile for LeafTiler {
    fn tile(
        &self,
        op: &Operator,
        _inputs: &[&TiledTileable],
        _cx: &TileContext,
    ) -> Result<TileOutput> {
        let shape = logical_shape(op)?;
        let key = op.key().derive("chunk", &[0]);
        let chunk = chunk_like(op, key.clone())?;
        Ok(TileOutput {
            ops: vec![ChunkOp {
                op: chunk,
                inputs: Vec::new(),
                shape: shape.clone(),
                index: 0,
            }],
            tiled: TiledTileable {
                chunks: vec![key],
                shapes: vec![shape],
            },
            decision: None,
        })
    }
}

impl Tile for ElementwiseTiler {
    fn tile(
        &self,
        op: &Operator,
        inputs: &[&TiledTileable],
        _cx: &TileContext,
    ) -> Result<TileOutput> {
        let shape = logical_shape(op)?;
        match inputs {
            [single] => pointwise(op, &shape, single, None),
            [left, right] => {
                // Equal counts with equal splits pair up, even when the splits are unknown.
                let aligned = left.n_chunks() == right.n_chunks()
                    && left.row_splits() == right.row_splits();
                if aligned {
                    return pointwise(op, &shape, left, Some(right));
                }
                align_and_pair(op, &shape, left, right)
            }
            _ => Err(GraphError::tiling(op.key(), "elementwise takes one or two inputs")),
        }
    }
}

/// One chunk per partition; partition `i` reads chunk `i` of every input.
fn pointwise(
    op: &Operator,
    shape: &Shape,
    left: &TiledTileable,
    right: Option<&TiledTileable>,
) -> Result<TileOutput> {
    let mut ops = Vec::with_capacity(left.n_chunks());
    let mut chunks = Vec::with_capacity(left.n_chunks());
    let mut shapes = Vec::with_capacity(left.n_chunks());
    for (i, input) in left.chunks.iter().enumerate() {
        let key = op.key().derive("chunk", &[i]);
        let mut inputs = vec![input.clone()];
        if let Some(r) = right {
            inputs.push(r.chunks[i].clone());
        }
        let chunk_shape = with_rows(shape, left.row_splits()[i]);
        ops.push(ChunkOp {
            op: chunk_like(op, key.clone())?,
            inputs,
            shape: chunk_shape.clone(),
            index: i,
        });
        chunks.push(key);
        shapes.push(chunk_shape);
    }
    Ok(TileOutput {
        ops,
        tiled: TiledTileable { chunks, shapes },
        decision: None,
    })
}

/// Range-shuffle `right` onto `left`'s row boundaries, then pair chunk by chunk.
fn align_and_pair(
    op: &Operator,
    shape: &Shape,
    left: &TiledTileable,
    right: &TiledTileable,
) -> Result<TileOutput> {
    let (Some(left_rows), Some(right_rows)) = (left.known_rows(), right.known_rows()) else {
        return Err(GraphError::tiling(
            op.key(),
            "cannot align inputs with unknown chunk sizes",
        ));
    };
    let (lt, rt) = (left_rows.iter().sum::<u64>(), right_rows.iter().sum::<u64>());
    if lt != rt {
        return Err(GraphError::tiling(
            op.key(),
            format!("inputs have {lt} and {rt} rows"),
        ));
    }
    let reducer_shapes = left_rows
        .iter()
        .map(|r| with_rows(&right.shapes[0], Some(*r)))
        .collect();
    let stage = ShuffleStage {
        role: "align",
        n_reducers: left.n_chunks(),
        partitioner: Partitioner::Range,
        boundaries: boundaries(op.key(), &left_rows)?,
        func: None,
        reducer_shapes,
    };
    let (mut ops, reducers) = stage.emit(op.key(), right)?;
    let aligned = TiledTileable {
        chunks: reducers,
        shapes: Vec::new(),
    };
    let mut paired = pointwise(op, shape, left, Some(&aligned))?;
    ops.append(&mut paired.ops);
    Ok(TileOutput {
        ops,
        tiled: paired.tiled,
        decision: Some(stage.decision(op.key(), right.n_chunks())),
    })
}

impl Tile for ReductionTiler {
    fn tile(
        &self,
        op: &Operator,
        inputs: &[&TiledTileable],
        cx: &TileContext,
    ) -> Result<TileOutput> {
        let shape = logical_shape(op)?;
        let [input] = inputs else {
            return Err(GraphError::tiling(op.key(), "reduction takes one input"));
        };
        let grouped = !op.fields().get_strings("by")?.is_empty();
        let n_reducers = if grouped {
            input.n_chunks().min(cx.max_reducers).max(1)
        } else {
            1
        };
        let reducer_shapes = if grouped {
            vec![with_rows(&shape, None); n_reducers]
        } else {
            vec![shape]
        };
        let stage = ShuffleStage {
            role: "reduce",
            n_reducers,
            partitioner: Partitioner::Hash,
            boundaries: Vec::new(),
            func: op.fields().get_string("func")?,
            reducer_shapes,
        };
        stage.finish(op.key(), input)
    }
}

impl Tile for RebalanceTiler {
    fn tile(
        &self,
        op: &Operator,
        inputs: &[&TiledTileable],
        _cx: &TileContext,
    ) -> Result<TileOutput> {
        let shape = logical_shape(op)?;
        let [input] = inputs else {
            return Err(GraphError::tiling(op.key(), "rebalance takes one input"));
        };
        let n = usize::try_from(op.fields().get_i32("n_partitions")?)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| GraphError::tiling(op.key(), "n_partitions must be positive"))?;
        if n == input.n_chunks() {
            return Ok(TileOutput {
                ops: Vec::new(),
                tiled: (*input).clone(),
                decision: Some(PlanDecision::PassThrough {
                    origin: op.key().clone(),
                }),
            });
        }
        let stage = match input.known_rows() {
            Some(rows) => {
                let sizes = even_split(rows.iter().sum(), n);
                ShuffleStage {
                    role: "rebalance",
                    n_reducers: n,
                    partitioner: Partitioner::Range,
                    boundaries: boundaries(op.key(), &sizes)?,
                    func: None,
                    reducer_shapes: sizes.iter().map(|r| with_rows(&shape, Some(*r))).collect(),
                }
            }
            None => ShuffleStage {
                role: "rebalance",
                n_reducers: n,
                partitioner: Partitioner::Hash,
                boundaries: Vec::new(),
                func: None,
                reducer_shapes: vec![with_rows(&shape, None); n],
            },
        };
        stage.finish(op.key(), input)
    }
}

/// `total` rows into `n` near-equal parts; earlier parts take the remainder.
fn even_split(total: u64, n: usize) -> Vec<u64> {
    let n64 = n as u64;
    (0..n64)
        .map(|i| total / n64 + u64::from(i < total % n64))
        .collect()
}

/// Prefix sums `[0, s0, s0+s1, ..., total]`.
fn boundaries(origin: &OpKey, sizes: &[u64]) -> Result<Vec<i64>> {
    let mut out = Vec::with_capacity(sizes.len() + 1);
    let mut acc = 0u64;
    out.push(0);
    for s in sizes {
        acc += s;
        out.push(to_i64(origin, acc)?);
    }
    Ok(out)
}

/// Parameters of one shuffle stage, decided by the tiler.
struct ShuffleStage {
    role: &'static str,
    n_reducers: usize,
    partitioner: Partitioner,
    boundaries: Vec<i64>,
    func: Option<String>,
    reducer_shapes: Vec<Shape>,
}

impl ShuffleStage {
    /// Emit mappers, proxy and reducers reading from `input`; returns the ops and the
    /// reducer keys in reducer order.
    fn emit(&self, origin: &OpKey, input: &TiledTileable) -> Result<(Vec<ChunkOp>, Vec<OpKey>)> {
        let proxy = origin.derive(&format!("{}-proxy", self.role), &[]);
        let n_reducers = to_i32(origin, self.n_reducers)?;
        let mut ops = Vec::with_capacity(input.n_chunks() + 1 + self.n_reducers);
        let mut mappers = Vec::with_capacity(input.n_chunks());
        let mut offset = 0u64;

        for (i, upstream) in input.chunks.iter().enumerate() {
            let key = origin.derive(&format!("{}-map", self.role), &[i]);
            let mut mapper = Operator::with_key(OpKind::ShuffleMap, key.clone())
                .with("shuffle_key", proxy.as_str())?
                .with("mapper_index", to_i32(origin, i)?)?
                .with("n_reducers", n_reducers)?
                .with("partitioner", self.partitioner.to_field())?;
            if let Some(func) = &self.func {
                mapper.set("func", func.as_str())?;
            }
            if self.partitioner == Partitioner::Range {
                mapper.set("row_offset", to_i64(origin, offset)?)?;
                mapper.set("boundaries", self.boundaries.clone())?;
            }
            let shape = input.shapes.get(i).cloned().unwrap_or_default();
            offset += shape.first().copied().flatten().unwrap_or(0);
            ops.push(ChunkOp {
                op: mapper,
                inputs: vec![upstream.clone()],
                shape,
                index: i,
            });
            mappers.push(key);
        }

        ops.push(ChunkOp {
            op: Operator::with_key(OpKind::ShuffleProxy, proxy.clone()),
            inputs: mappers,
            shape: Vec::new(),
            index: 0,
        });

        let mut reducers = Vec::with_capacity(self.n_reducers);
        for j in 0..self.n_reducers {
            let key = origin.derive(&format!("{}-reduce", self.role), &[j]);
            let mut reducer = Operator::with_key(OpKind::ShuffleReduce, key.clone())
                .with("reducer_index", to_i32(origin, j)?)?
                .with("n_reducers", n_reducers)?;
            if let Some(func) = &self.func {
                reducer.set("func", FieldValue::String(func.clone()))?;
            }
            ops.push(ChunkOp {
                op: reducer,
                inputs: vec![proxy.clone()],
                shape: self.reducer_shapes.get(j).cloned().unwrap_or_default(),
                index: j,
            });
            reducers.push(key);
        }
        Ok((ops, reducers))
    }

    fn decision(&self, origin: &OpKey, n_mappers: usize) -> PlanDecision {
        PlanDecision::InsertedShuffle {
            origin: origin.clone(),
            n_mappers,
            n_reducers: self.n_reducers,
            partitioner: self.partitioner,
        }
    }

    /// Emit the stage as the whole tiling of `origin`: reducers become its chunks.
    fn finish(&self, origin: &OpKey, input: &TiledTileable) -> Result<TileOutput> {
        let (ops, reducers) = self.emit(origin, input)?;
        Ok(TileOutput {
            ops,
            tiled: TiledTileable {
                chunks: reducers,
                shapes: self.reducer_shapes.clone(),
            },
            decision: Some(self.decision(origin, input.n_chunks())),
        })
    }
}
