//! Deterministic executors over integer rows.

use crate::error::SourceRef;
use crate::exchange::Partitioner;
use crate::operator::{OpKind, Operator};
use crate::runner::{ChunkExecutor, ChunkInput, ChunkOutput};
use crate::store::{chunk, downcast_chunk};
use anyhow::{Result, anyhow, bail};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Payload of every chunk [`RowExecutor`] produces.
pub type Rows = Vec<i64>;

/// Aggregations understood by `Reduction` and its shuffle stage.
///
/// Mappers pre-aggregate each partition locally and reducers merge the partials, so
/// `sum` over four mappers moves four numbers instead of every row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Agg {
    Sum,
    Count,
    Min,
    Max,
    Distinct,
}

impl Agg {
    fn parse(func: &str) -> Result<Self> {
        Ok(match func {
            "sum" => Self::Sum,
            "count" => Self::Count,
            "min" => Self::Min,
            "max" => Self::Max,
            "distinct" => Self::Distinct,
            other => bail!("unknown aggregation `{other}`"),
        })
    }

    fn local(self, rows: &[i64]) -> Rows {
        match self {
            Self::Sum => vec![rows.iter().sum()],
            Self::Count => vec![i64::try_from(rows.len()).unwrap_or(i64::MAX)],
            Self::Min => rows.iter().min().copied().into_iter().collect(),
            Self::Max => rows.iter().max().copied().into_iter().collect(),
            Self::Distinct => sorted_distinct(rows),
        }
    }

    fn merge(self, partials: &[i64]) -> Rows {
        match self {
            Self::Sum | Self::Count => vec![partials.iter().sum()],
            Self::Min | Self::Max | Self::Distinct => self.local(partials),
        }
    }
}

fn sorted_distinct(rows: &[i64]) -> Rows {
    let mut out = rows.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

/// Stable across processes and runs.
#[must_use]
pub fn stable_hash(value: i64) -> u64 {
    (value as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 33
}

fn rows_of(op: &Operator, input: &ChunkInput, position: usize) -> Result<Arc<Rows>> {
    let ChunkInput::Chunk(data) = input else {
        bail!("`{}` expected a single chunk at input {position}", op.key());
    };
    let producer = op
        .inputs()
        .get(position)
        .cloned()
        .unwrap_or_else(|| op.key().clone());
    Ok(downcast_chunk::<Rows>(Arc::clone(data), SourceRef::Key(producer))?)
}

/// Executes every chunk kind over `Vec<i64>` rows.
///
/// - `DataSource`: `shape[0]` consecutive integers, starting at `N` when `source` is
///   `"range:N"` and at 0 otherwise.
/// - `Elementwise`: unary `double`, `negate`, `increment` (or no `func` for identity);
///   binary `add`, `mul`.
/// - `ShuffleMap` / `ShuffleReduce`: route by range or hash; with a `func` (`sum`, `count`,
///   `min`, `max`, `distinct`) mappers pre-aggregate and reducers merge.
#[derive(Clone, Copy, Debug, Default)]
pub struct RowExecutor;

impl ChunkExecutor for RowExecutor {
    fn execute(&self, op: &Operator, inputs: &[ChunkInput]) -> Result<ChunkOutput> {
        match op.kind() {
            OpKind::DataSource => source(op),
            OpKind::Elementwise => elementwise(op, inputs),
            OpKind::ShuffleMap => map_partitions(op, inputs),
            OpKind::ShuffleReduce => reduce_partitions(op, inputs),
            kind => bail!("RowExecutor cannot execute {kind}"),
        }
    }
}

fn source(op: &Operator) -> Result<ChunkOutput> {
    let rows = op
        .outputs()
        .first()
        .and_then(|o| o.shape.first().copied().flatten())
        .ok_or_else(|| anyhow!("source `{}` has no known row count", op.key()))?;
    let start = match op.fields().get_string("source")? {
        Some(desc) => desc
            .strip_prefix("range:")
            .ok_or_else(|| anyhow!("unsupported source `{desc}`"))?
            .parse::<i64>()?,
        None => 0,
    };
    let rows: Rows = (0..i64::try_from(rows)?).map(|i| start + i).collect();
    Ok(ChunkOutput::Chunk(chunk(rows)))
}

fn elementwise(op: &Operator, inputs: &[ChunkInput]) -> Result<ChunkOutput> {
    let func = op.fields().get_string("func")?;
    let out: Rows = match inputs {
        [input] => {
            let rows = rows_of(op, input, 0)?;
            let f: fn(i64) -> i64 = match func.as_deref() {
                None | Some("identity") => |x| x,
                Some("double") => |x| x * 2,
                Some("negate") => |x| -x,
                Some("increment") => |x| x + 1,
                Some(other) => bail!("unknown unary function `{other}`"),
            };
            rows.iter().map(|&x| f(x)).collect()
        }
        [left, right] => {
            let (l, r) = (rows_of(op, left, 0)?, rows_of(op, right, 1)?);
            if l.len() != r.len() {
                bail!("`{}` pairs {} rows with {} rows", op.key(), l.len(), r.len());
            }
            let f: fn(i64, i64) -> i64 = match func.as_deref() {
                Some("add") => |a, b| a + b,
                Some("mul") => |a, b| a * b,
                other => bail!("unknown binary function `{other:?}`"),
            };
            l.iter().zip(r.iter()).map(|(&a, &b)| f(a, b)).collect()
        }
        _ => bail!("`{}` got {} inputs", op.key(), inputs.len()),
    };
    Ok(ChunkOutput::Chunk(chunk(out)))
}

fn map_partitions(op: &Operator, inputs: &[ChunkInput]) -> Result<ChunkOutput> {
    let [input] = inputs else {
        bail!("mapper `{}` got {} inputs", op.key(), inputs.len());
    };
    let rows = rows_of(op, input, 0)?;
    let fields = op.fields();
    let n = usize::try_from(fields.get_i32("n_reducers")?)?;
    let mut parts: Vec<Rows> = vec![Vec::new(); n];

    match fields.get_enum::<Partitioner>("partitioner")? {
        Partitioner::Range => {
            let offset = fields.get_i64("row_offset")?;
            let bounds = fields.get_i64s("boundaries")?;
            for (local, &value) in rows.iter().enumerate() {
                let global = offset + i64::try_from(local)?;
                let j = bounds.partition_point(|&b| b <= global).saturating_sub(1);
                parts[j.min(n - 1)].push(value);
            }
        }
        Partitioner::Hash => {
            for &value in rows.iter() {
                let j = usize::try_from(stable_hash(value) % n as u64)?;
                parts[j].push(value);
            }
        }
    }

    if let Some(func) = fields.get_string("func")? {
        let agg = Agg::parse(&func)?;
        for part in &mut parts {
            *part = agg.local(part);
        }
    }
    Ok(ChunkOutput::Partitions(parts.into_iter().map(chunk).collect()))
}

fn reduce_partitions(op: &Operator, inputs: &[ChunkInput]) -> Result<ChunkOutput> {
    let [ChunkInput::Partitions(parts)] = inputs else {
        bail!("reducer `{}` expected gathered partitions", op.key());
    };
    let mut rows = Rows::new();
    for (i, part) in parts.iter().enumerate() {
        let part = downcast_chunk::<Rows>(Arc::clone(part), SourceRef::MapperIndex(i))?;
        rows.extend(part.iter().copied());
    }
    if let Some(func) = op.fields().get_string("func")? {
        rows = Agg::parse(&func)?.merge(&rows);
    }
    Ok(ChunkOutput::Chunk(chunk(rows)))
}

/// Wraps an executor and fails operators matching a predicate.
///
/// Fails the first `failures` matching calls, then delegates; use
/// [`FailingExecutor::always`] for a permanent failure.
pub struct FailingExecutor<E> {
    inner: E,
    matches: Box<dyn Fn(&Operator) -> bool + Send + Sync>,
    remaining: AtomicUsize,
    injected: AtomicUsize,
}

impl<E: ChunkExecutor> FailingExecutor<E> {
    pub fn new(
        inner: E,
        failures: usize,
        matches: impl Fn(&Operator) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            matches: Box::new(matches),
            remaining: AtomicUsize::new(failures),
            injected: AtomicUsize::new(0),
        }
    }

    pub fn always(inner: E, matches: impl Fn(&Operator) -> bool + Send + Sync + 'static) -> Self {
        Self::new(inner, usize::MAX, matches)
    }

    /// Number of failures injected so far.
    #[must_use]
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }
}

impl<E: ChunkExecutor> ChunkExecutor for FailingExecutor<E> {
    fn execute(&self, op: &Operator, inputs: &[ChunkInput]) -> Result<ChunkOutput> {
        if (self.matches)(op)
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            self.injected.fetch_add(1, Ordering::SeqCst);
            bail!("injected failure in `{}`", op.key());
        }
        self.inner.execute(op, inputs)
    }
}
