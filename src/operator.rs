//! Computation-graph nodes.
//!
//! An [`Operator`] is a type tag ([`OpKind`]), a unique [`OpKey`], validated [`Fields`], the
//! ordered keys of its inputs and the placeholders ([`OutputMeta`]) of what it produces.
//! Operators refer to each other only through keys, never by holding another operator.
//!
//! The set of kinds is closed. Behavior that differs by kind (field schema, input arity,
//! tiling) is dispatched by matching on [`OpKind`] rather than by runtime type inspection.
//!
//! Lifecycle: construct → set fields → [`bind`](Operator::bind) inputs/outputs once →
//! sealed when a [`GraphBuilder`](crate::graph::GraphBuilder) accepts it. Sealed operators
//! are read-only, so graphs can be shared across threads without locking.

use crate::error::{GraphError, Result};
use crate::exchange::{PARTITIONER_DECL, SHUFFLE_FETCH_TYPE_DECL};
use crate::field::{FieldDecl, FieldDefault, FieldType, FieldValue, Fields, ScalarType, TaggedValue};
use crate::key::{KeyAllocator, OpKey};
use crate::tileable::Shape;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FormatResult};

/// Closed enumeration of operator kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    /// Leaf producing data from outside the graph.
    DataSource,
    /// Row-aligned transform of one input, or of two inputs paired chunk by chunk.
    Elementwise,
    /// Aggregation collapsing rows, optionally grouped by columns.
    Reduction,
    /// Repartition into a fixed number of chunks.
    Rebalance,
    /// Placeholder for one previously published result.
    Fetch,
    /// Placeholder for the partitions a reducer gathers from every mapper.
    FetchShuffle,
    /// Shuffle mapper: splits one chunk into `n_reducers` partitions.
    ShuffleMap,
    /// Shuffle barrier joining all mappers to all reducers.
    ShuffleProxy,
    /// Shuffle reducer: consumes one partition from every mapper.
    ShuffleReduce,
}

const FUNC: FieldDecl = FieldDecl::new("func", FieldType::STRING, FieldDefault::Null);

static DATA_SOURCE_FIELDS: [FieldDecl; 1] =
    [FieldDecl::new("source", FieldType::STRING, FieldDefault::Null)];

static ELEMENTWISE_FIELDS: [FieldDecl; 1] = [FUNC];

static REDUCTION_FIELDS: [FieldDecl; 3] = [
    FUNC,
    FieldDecl::new("skipna", FieldType::BOOL, FieldDefault::Bool(true)),
    FieldDecl::new(
        "by",
        FieldType::List(ScalarType::String),
        FieldDefault::EmptyList,
    ),
];

static REBALANCE_FIELDS: [FieldDecl; 1] = [FieldDecl::new(
    "n_partitions",
    FieldType::INT32,
    FieldDefault::Int32(1),
)];

static FETCH_FIELDS: [FieldDecl; 1] =
    [FieldDecl::new("source_key", FieldType::STRING, FieldDefault::Null)];

static FETCH_SHUFFLE_FIELDS: [FieldDecl; 4] = [
    FieldDecl::new(
        "source_keys",
        FieldType::List(ScalarType::String),
        FieldDefault::EmptyList,
    ),
    FieldDecl::new("n_mappers", FieldType::INT32, FieldDefault::Null),
    FieldDecl::new("n_reducers", FieldType::INT32, FieldDefault::Null),
    FieldDecl::new(
        "shuffle_fetch_type",
        FieldType::Reference(&SHUFFLE_FETCH_TYPE_DECL),
        FieldDefault::Variant("FETCH_BY_KEY"),
    ),
];

static SHUFFLE_MAP_FIELDS: [FieldDecl; 7] = [
    FUNC,
    FieldDecl::new("shuffle_key", FieldType::STRING, FieldDefault::Null),
    FieldDecl::new("mapper_index", FieldType::INT32, FieldDefault::Int32(0)),
    FieldDecl::new("n_reducers", FieldType::INT32, FieldDefault::Int32(1)),
    FieldDecl::new(
        "partitioner",
        FieldType::Reference(&PARTITIONER_DECL),
        FieldDefault::Variant("HASH"),
    ),
    FieldDecl::new("row_offset", FieldType::INT64, FieldDefault::Int64(0)),
    FieldDecl::new(
        "boundaries",
        FieldType::List(ScalarType::Int64),
        FieldDefault::EmptyList,
    ),
];

static SHUFFLE_REDUCE_FIELDS: [FieldDecl; 3] = [
    FUNC,
    FieldDecl::new("reducer_index", FieldType::INT32, FieldDefault::Int32(0)),
    FieldDecl::new("n_reducers", FieldType::INT32, FieldDefault::Int32(1)),
];

/// Accepted input counts for a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    Between(usize, usize),
    AtLeast(usize),
}

impl Arity {
    #[must_use]
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Self::Exact(e) => n == e,
            Self::Between(lo, hi) => (lo..=hi).contains(&n),
            Self::AtLeast(lo) => n >= lo,
        }
    }
}

impl Display for Arity {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::Exact(e) => write!(f, "exactly {e}"),
            Self::Between(lo, hi) => write!(f, "{lo} to {hi}"),
            Self::AtLeast(lo) => write!(f, "at least {lo}"),
        }
    }
}

impl OpKind {
    pub const ALL: [Self; 9] = [
        Self::DataSource,
        Self::Elementwise,
        Self::Reduction,
        Self::Rebalance,
        Self::Fetch,
        Self::FetchShuffle,
        Self::ShuffleMap,
        Self::ShuffleProxy,
        Self::ShuffleReduce,
    ];

    /// Operator-type tag recorded on the wire.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::DataSource => "DataSource",
            Self::Elementwise => "Elementwise",
            Self::Reduction => "Reduction",
            Self::Rebalance => "Rebalance",
            Self::Fetch => "Fetch",
            Self::FetchShuffle => "FetchShuffle",
            Self::ShuffleMap => "ShuffleMap",
            Self::ShuffleProxy => "ShuffleProxy",
            Self::ShuffleReduce => "ShuffleReduce",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    #[must_use]
    pub fn schema(self) -> &'static [FieldDecl] {
        match self {
            Self::DataSource => &DATA_SOURCE_FIELDS,
            Self::Elementwise => &ELEMENTWISE_FIELDS,
            Self::Reduction => &REDUCTION_FIELDS,
            Self::Rebalance => &REBALANCE_FIELDS,
            Self::Fetch => &FETCH_FIELDS,
            Self::FetchShuffle => &FETCH_SHUFFLE_FIELDS,
            Self::ShuffleMap => &SHUFFLE_MAP_FIELDS,
            Self::ShuffleProxy => &[],
            Self::ShuffleReduce => &SHUFFLE_REDUCE_FIELDS,
        }
    }

    #[must_use]
    pub fn arity(self) -> Arity {
        match self {
            Self::DataSource | Self::Fetch | Self::FetchShuffle => Arity::Exact(0),
            Self::Elementwise => Arity::Between(1, 2),
            Self::Reduction | Self::Rebalance | Self::ShuffleMap | Self::ShuffleReduce => {
                Arity::Exact(1)
            }
            Self::ShuffleProxy => Arity::AtLeast(1),
        }
    }

    /// `Fetch` and `FetchShuffle`.
    #[must_use]
    pub fn is_fetch(self) -> bool {
        matches!(self, Self::Fetch | Self::FetchShuffle)
    }

    /// Kinds only the tiler emits; they never appear in a logical graph.
    #[must_use]
    pub fn is_chunk_only(self) -> bool {
        matches!(
            self,
            Self::ShuffleMap | Self::ShuffleProxy | Self::ShuffleReduce
        )
    }

    fn key_prefix(self) -> String {
        self.name().to_ascii_lowercase()
    }
}

impl Display for OpKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(self.name())
    }
}

/// Placeholder for one produced output: its position in the owning tileable's partitioning
/// and its (possibly partially unknown) shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputMeta {
    pub index: usize,
    pub shape: Shape,
}

impl OutputMeta {
    #[must_use]
    pub fn new(index: usize, shape: Shape) -> Self {
        Self { index, shape }
    }
}

/// A node of a logical or physical computation graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operator {
    kind: OpKind,
    key: OpKey,
    fields: Fields,
    inputs: Vec<OpKey>,
    outputs: Vec<OutputMeta>,
    bound: bool,
}

impl Operator {
    /// Construct an operator with a freshly allocated process-unique key.
    #[must_use]
    pub fn new(kind: OpKind) -> Self {
        let key = KeyAllocator::global().allocate(&kind.key_prefix());
        Self::with_key(kind, key)
    }

    /// Construct an operator under a caller-chosen key (derived chunk keys, decoding).
    #[must_use]
    pub fn with_key(kind: OpKind, key: OpKey) -> Self {
        Self {
            kind,
            key,
            fields: Fields::new(kind.name(), kind.schema()),
            inputs: Vec::new(),
            outputs: Vec::new(),
            bound: false,
        }
    }

    /// Builder-style field write.
    ///
    /// # Errors
    ///
    /// See [`Fields::set`].
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Result<Self> {
        self.fields.set(name, value)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// See [`Fields::set`].
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        self.fields.set(name, value)
    }

    #[must_use]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    #[must_use]
    pub fn key(&self) -> &OpKey {
        &self.key
    }

    #[must_use]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    #[must_use]
    pub fn inputs(&self) -> &[OpKey] {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &[OutputMeta] {
        &self.outputs
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.fields.is_sealed()
    }

    /// Validate an input list against this kind's arity.
    ///
    /// # Errors
    ///
    /// `InputArity` naming this kind. `Fetch` and `FetchShuffle` reject any input.
    pub fn check_inputs(&self, inputs: &[OpKey]) -> Result<()> {
        let arity = self.kind.arity();
        if arity.accepts(inputs.len()) {
            Ok(())
        } else {
            Err(GraphError::InputArity {
                kind: self.kind.name(),
                expected: arity.to_string(),
                got: inputs.len(),
            })
        }
    }

    /// Record inputs and output placeholders. A second call with identical arguments is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// `InputArity` for a bad input count, `AlreadyBound` when re-bound differently.
    pub fn bind(&mut self, inputs: Vec<OpKey>, outputs: Vec<OutputMeta>) -> Result<()> {
        self.check_inputs(&inputs)?;
        if self.bound {
            return if self.inputs == inputs && self.outputs == outputs {
                Ok(())
            } else {
                Err(GraphError::AlreadyBound(self.key.clone()))
            };
        }
        self.inputs = inputs;
        self.outputs = outputs;
        self.bound = true;
        Ok(())
    }

    pub(crate) fn seal(&mut self) {
        self.fields.seal();
    }

    /// Wire form of this operator.
    #[must_use]
    pub fn to_record(&self) -> OperatorRecord {
        OperatorRecord {
            op_type: self.kind.name().to_string(),
            key: self.key.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            fields: self.fields.to_tagged(),
            bound: self.bound,
            sealed: self.is_sealed(),
        }
    }

    /// Rebuild an operator of exactly the recorded kind.
    ///
    /// # Errors
    ///
    /// `Schema` for an unknown operator type or invalid fields; `InputArity` when the
    /// recorded inputs violate the kind's arity.
    pub fn from_record(record: OperatorRecord) -> Result<Self> {
        let kind = OpKind::from_name(&record.op_type).ok_or_else(|| {
            GraphError::Schema(format!("unknown operator type `{}`", record.op_type))
        })?;
        let mut fields = Fields::from_tagged(kind.name(), kind.schema(), record.fields)?;
        let op = Self::with_key(kind, record.key);
        if record.bound || !record.inputs.is_empty() {
            op.check_inputs(&record.inputs)?;
        }
        if record.sealed {
            fields.seal();
        }
        Ok(Self {
            fields,
            inputs: record.inputs,
            outputs: record.outputs,
            bound: record.bound,
            ..op
        })
    }

    /// Encode as JSON bytes.
    ///
    /// # Errors
    ///
    /// `Schema` if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.to_record())
            .map_err(|e| GraphError::Schema(format!("encode failed: {e}")))
    }

    /// Decode from JSON bytes.
    ///
    /// # Errors
    ///
    /// `Schema` for malformed input, unknown operator or field types.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let record: OperatorRecord = serde_json::from_slice(bytes)
            .map_err(|e| GraphError::Schema(format!("malformed operator record: {e}")))?;
        Self::from_record(record)
    }

    /// Encode with the compact binary codec.
    ///
    /// # Errors
    ///
    /// `Schema` if encoding fails.
    #[cfg(feature = "compact-codec")]
    pub fn to_compact(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(&self.to_record())
            .map_err(|e| GraphError::Schema(format!("encode failed: {e}")))
    }

    /// Decode from the compact binary codec.
    ///
    /// # Errors
    ///
    /// `Schema` for malformed input, unknown operator or field types.
    #[cfg(feature = "compact-codec")]
    pub fn from_compact(bytes: &[u8]) -> Result<Self> {
        let record: OperatorRecord = postcard::from_bytes(bytes)
            .map_err(|e| GraphError::Schema(format!("malformed operator record: {e}")))?;
        Self::from_record(record)
    }
}

/// Serialized operator: type tag, key, linkage and explicitly-set fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorRecord {
    pub op_type: String,
    pub key: OpKey,
    pub inputs: Vec<OpKey>,
    pub outputs: Vec<OutputMeta>,
    pub fields: BTreeMap<String, TaggedValue>,
    pub bound: bool,
    pub sealed: bool,
}
