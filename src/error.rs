//! Error taxonomy shared by every layer of the crate.
//!
//! Errors fall into three groups:
//! - **construction/schema** failures (`Schema`, `UnknownField`, `FieldType`, `SealedField`,
//!   `InputArity`, `AlreadyBound`, `DuplicateKey`, `InvalidShuffle`) which are programmer
//!   errors and never retried;
//! - **exchange** conditions (`IncompleteShuffle`, `MissingPartition`, `NotFound`, `Canceled`)
//!   raised while resolving `Fetch`/`FetchShuffle` placeholders;
//! - **planning** failures (`Tiling`, `NonDeterministicTiling`, `Graph`).

use crate::key::OpKey;
use std::fmt::{Display, Formatter, Result as FormatResult};
use thiserror::Error;

/// Result alias used by the library modules.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Identifies the producer whose partition could not be delivered.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SourceRef {
    /// Mapper addressed by structural position (`FETCH_BY_INDEX`).
    MapperIndex(usize),
    /// Producer addressed by its operator key (`FETCH_BY_KEY` or plain `Fetch`).
    Key(OpKey),
}

impl Display for SourceRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::MapperIndex(i) => write!(f, "mapper #{i}"),
            Self::Key(k) => write!(f, "producer `{k}`"),
        }
    }
}

/// Why a partition is unavailable at reduce time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MissingReason {
    /// The producing task was marked permanently failed.
    ProducerFailed(String),
    /// The partition exists but cannot be read as expected.
    Corrupt(String),
    /// The wait deadline elapsed before the partition was published.
    DeadlineElapsed,
    /// The partition was published and later garbage-collected.
    Evicted,
}

impl Display for MissingReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::ProducerFailed(msg) => write!(f, "producer failed: {msg}"),
            Self::Corrupt(msg) => write!(f, "corrupt partition: {msg}"),
            Self::DeadlineElapsed => write!(f, "deadline elapsed"),
            Self::Evicted => write!(f, "evicted after last consumer released it"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("schema error: {0}")]
    Schema(String),

    #[error("{kind} has no field named `{field}`")]
    UnknownField { kind: &'static str, field: String },

    #[error("field `{field}` of {kind} expects {expected}, got {got}")]
    FieldType {
        kind: &'static str,
        field: &'static str,
        expected: String,
        got: String,
    },

    #[error("field `{field}` of {kind} is sealed")]
    SealedField { kind: &'static str, field: String },

    #[error("{kind} accepts {expected} input(s), got {got}")]
    InputArity {
        kind: &'static str,
        expected: String,
        got: usize,
    },

    #[error("operator `{0}` is already bound to different inputs or outputs")]
    AlreadyBound(OpKey),

    #[error("operator key `{0}` is already registered with a different operator")]
    DuplicateKey(OpKey),

    #[error("invalid shuffle: {0}")]
    InvalidShuffle(String),

    #[error("reducer {reducer} shuffle incomplete: {available}/{required} partitions available")]
    IncompleteShuffle {
        reducer: usize,
        available: usize,
        required: usize,
    },

    #[error("missing partition from {producer}: {reason}")]
    MissingPartition {
        producer: SourceRef,
        reason: MissingReason,
    },

    #[error("no published result for `{0}`")]
    NotFound(OpKey),

    #[error("canceled while waiting on `{0}`")]
    Canceled(OpKey),

    #[error("tiling failed for `{key}`: {message}")]
    Tiling { key: OpKey, message: String },

    #[error("non-deterministic tiling: fingerprint {expected} re-tiled as {actual}")]
    NonDeterministicTiling { expected: String, actual: String },

    #[error("graph error: {0}")]
    Graph(String),

    #[error("chunk `{key}` failed: {message}")]
    Execution { key: OpKey, message: String },
}

impl GraphError {
    /// Conditions the runtime is expected to re-poll with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::IncompleteShuffle { .. })
    }

    /// Conditions that must never be retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Schema(_)
                | Self::InputArity { .. }
                | Self::NonDeterministicTiling { .. }
                | Self::Canceled(_)
        )
    }

    pub(crate) fn tiling(key: &OpKey, message: impl Into<String>) -> Self {
        Self::Tiling {
            key: key.clone(),
            message: message.into(),
        }
    }
}
