//! `Fetch` and `FetchShuffle`: zero-input placeholders that resolve against the
//! [`ResultStore`] at execution time.
//!
//! - [`Fetch`] stands in for one published chunk, addressed by `source_key`.
//! - [`FetchShuffle`] stands in for the partitions one reducer gathers from every mapper of
//!   a shuffle stage. Mappers are addressed either by explicit key
//!   ([`ShuffleFetchType::FetchByKey`], assembled in `source_keys` order) or by position
//!   ([`ShuffleFetchType::FetchByIndex`], assembled in index order).
//!
//! Both are views over an [`Operator`] of the matching kind; converting to and from the
//! operator form goes through the field schema, so a placeholder survives serialization
//! unchanged. `n_mappers` and `n_reducers` are fixed at construction and validated there.

use crate::error::{GraphError, Result};
use crate::field::{EnumDecl, FieldEnum};
use crate::key::OpKey;
use crate::operator::{OpKind, Operator};
use crate::store::{ChunkData, GatherRequest, GatherSources, ResultStore};
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub static SHUFFLE_FETCH_TYPE_DECL: EnumDecl = EnumDecl {
    name: "ShuffleFetchType",
    variants: &["FETCH_BY_KEY", "FETCH_BY_INDEX"],
};

pub static PARTITIONER_DECL: EnumDecl = EnumDecl {
    name: "Partitioner",
    variants: &["HASH", "RANGE"],
};

/// Addressing mode of a [`FetchShuffle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShuffleFetchType {
    /// Mapper `i` is named by `source_keys[i]`.
    FetchByKey,
    /// Mapper `i` is addressed purely by its position in the shuffle stage.
    FetchByIndex,
}

impl FieldEnum for ShuffleFetchType {
    fn decl() -> &'static EnumDecl {
        &SHUFFLE_FETCH_TYPE_DECL
    }

    fn variant(self) -> &'static str {
        match self {
            Self::FetchByKey => "FETCH_BY_KEY",
            Self::FetchByIndex => "FETCH_BY_INDEX",
        }
    }

    fn from_variant(name: &str) -> Option<Self> {
        match name {
            "FETCH_BY_KEY" => Some(Self::FetchByKey),
            "FETCH_BY_INDEX" => Some(Self::FetchByIndex),
            _ => None,
        }
    }
}

/// How a mapper routes records to reducers. Chosen by the tiler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partitioner {
    /// `stable_hash(record) mod n_reducers`.
    Hash,
    /// Global row `r` goes to the reducer `j` with `boundaries[j] <= r < boundaries[j + 1]`.
    Range,
}

impl FieldEnum for Partitioner {
    fn decl() -> &'static EnumDecl {
        &PARTITIONER_DECL
    }

    fn variant(self) -> &'static str {
        match self {
            Self::Hash => "HASH",
            Self::Range => "RANGE",
        }
    }

    fn from_variant(name: &str) -> Option<Self> {
        match name {
            "HASH" => Some(Self::Hash),
            "RANGE" => Some(Self::Range),
            _ => None,
        }
    }
}

fn expect_kind(op: &Operator, kind: OpKind) -> Result<()> {
    if op.kind() == kind {
        Ok(())
    } else {
        Err(GraphError::Schema(format!(
            "expected a {kind} operator, got {}",
            op.kind()
        )))
    }
}

/// One-to-one dependency on a published chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fetch {
    source_key: OpKey,
}

impl Fetch {
    pub fn new(source_key: impl Into<OpKey>) -> Self {
        Self {
            source_key: source_key.into(),
        }
    }

    #[must_use]
    pub fn source_key(&self) -> &OpKey {
        &self.source_key
    }

    /// Operator form under a freshly allocated key.
    ///
    /// # Errors
    ///
    /// Field validation errors (none for a well-formed key).
    pub fn into_operator(self) -> Result<Operator> {
        Operator::new(OpKind::Fetch).with("source_key", self.source_key.as_str())
    }

    /// Operator form that adopts the key of the chunk it stands in for, so edges inside a
    /// fragment keep pointing at the same key.
    ///
    /// # Errors
    ///
    /// Field validation errors (none for a well-formed key).
    pub fn placeholder(self) -> Result<Operator> {
        let key = self.source_key.clone();
        Operator::with_key(OpKind::Fetch, key).with("source_key", self.source_key.as_str())
    }

    /// Read the view back from an operator.
    ///
    /// # Errors
    ///
    /// `Schema` if `op` is not a `Fetch` or has no `source_key`.
    pub fn from_operator(op: &Operator) -> Result<Self> {
        expect_kind(op, OpKind::Fetch)?;
        let source_key = op
            .fields()
            .get_string("source_key")?
            .ok_or_else(|| GraphError::Schema(format!("Fetch `{}` has no source_key", op.key())))?;
        Ok(Self::new(source_key))
    }

    /// Resolve without waiting.
    ///
    /// # Errors
    ///
    /// `NotFound` before publication or for an unknown key; `MissingPartition` if the
    /// producer failed or the result was evicted; `Canceled`.
    pub fn resolve_now(&self, store: &ResultStore) -> Result<ChunkData> {
        store.get(&self.source_key)
    }

    /// Resolve, waiting for publication until `deadline`.
    ///
    /// # Errors
    ///
    /// As [`resolve_now`](Self::resolve_now); `NotFound` once the deadline passes.
    pub fn resolve(&self, store: &ResultStore, deadline: Option<Instant>) -> Result<ChunkData> {
        store.wait(&self.source_key, deadline)
    }

    /// [`resolve`](Self::resolve) on behalf of `consumers`; canceling any of them ends
    /// the wait.
    ///
    /// # Errors
    ///
    /// As [`resolve`](Self::resolve); `Canceled` for a canceled consumer.
    pub fn resolve_for(
        &self,
        store: &ResultStore,
        consumers: &[OpKey],
        deadline: Option<Instant>,
    ) -> Result<ChunkData> {
        store.wait_for(&self.source_key, consumers, deadline)
    }
}

/// All-to-all dependency of one reducer on every mapper of a shuffle stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchShuffle {
    source_keys: Vec<OpKey>,
    n_mappers: usize,
    n_reducers: usize,
    fetch_type: ShuffleFetchType,
}

impl FetchShuffle {
    /// Validate and build.
    ///
    /// # Errors
    ///
    /// `InvalidShuffle` when either count is zero, when `FETCH_BY_KEY` is given a key list
    /// whose length differs from `n_mappers`, or when `FETCH_BY_INDEX` is given a non-empty
    /// key list of the wrong length.
    pub fn new(
        source_keys: Vec<OpKey>,
        n_mappers: usize,
        n_reducers: usize,
        fetch_type: ShuffleFetchType,
    ) -> Result<Self> {
        if n_mappers == 0 || n_reducers == 0 {
            return Err(GraphError::InvalidShuffle(format!(
                "n_mappers ({n_mappers}) and n_reducers ({n_reducers}) must be positive"
            )));
        }
        let keys_ok = match fetch_type {
            ShuffleFetchType::FetchByKey => source_keys.len() == n_mappers,
            ShuffleFetchType::FetchByIndex => {
                source_keys.is_empty() || source_keys.len() == n_mappers
            }
        };
        if !keys_ok {
            return Err(GraphError::InvalidShuffle(format!(
                "{} source keys for {n_mappers} mappers",
                source_keys.len()
            )));
        }
        Ok(Self {
            source_keys,
            n_mappers,
            n_reducers,
            fetch_type,
        })
    }

    /// Key-addressed shuffle; `n_mappers` is the key count.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn by_key(source_keys: Vec<OpKey>, n_reducers: usize) -> Result<Self> {
        let n = source_keys.len();
        Self::new(source_keys, n, n_reducers, ShuffleFetchType::FetchByKey)
    }

    /// Position-addressed shuffle.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn by_index(n_mappers: usize, n_reducers: usize) -> Result<Self> {
        Self::new(Vec::new(), n_mappers, n_reducers, ShuffleFetchType::FetchByIndex)
    }

    #[must_use]
    pub fn source_keys(&self) -> &[OpKey] {
        &self.source_keys
    }

    #[must_use]
    pub fn n_mappers(&self) -> usize {
        self.n_mappers
    }

    #[must_use]
    pub fn n_reducers(&self) -> usize {
        self.n_reducers
    }

    #[must_use]
    pub fn fetch_type(&self) -> ShuffleFetchType {
        self.fetch_type
    }

    fn to_operator_under(&self, op: Operator) -> Result<Operator> {
        let keys: Vec<String> = self.source_keys.iter().map(ToString::to_string).collect();
        op.with("source_keys", keys)?
            .with("n_mappers", count_field(self.n_mappers)?)?
            .with("n_reducers", count_field(self.n_reducers)?)?
            .with("shuffle_fetch_type", self.fetch_type.to_field())
    }

    /// Operator form under a freshly allocated key.
    ///
    /// # Errors
    ///
    /// `InvalidShuffle` if a count does not fit the declared int32 field.
    pub fn into_operator(self) -> Result<Operator> {
        self.to_operator_under(Operator::new(OpKind::FetchShuffle))
    }

    /// Operator form adopting the key of the shuffle stage it stands in for.
    ///
    /// # Errors
    ///
    /// `InvalidShuffle` if a count does not fit the declared int32 field.
    pub fn placeholder(self, shuffle: OpKey) -> Result<Operator> {
        self.to_operator_under(Operator::with_key(OpKind::FetchShuffle, shuffle))
    }

    /// Read and re-validate the view from an operator.
    ///
    /// # Errors
    ///
    /// `Schema` for a different kind, `InvalidShuffle` for unset or inconsistent fields.
    pub fn from_operator(op: &Operator) -> Result<Self> {
        expect_kind(op, OpKind::FetchShuffle)?;
        let fields = op.fields();
        let count = |name: &str| -> Result<usize> {
            let v = fields.get_opt_i32(name)?.ok_or_else(|| {
                GraphError::InvalidShuffle(format!("FetchShuffle `{}` has no {name}", op.key()))
            })?;
            usize::try_from(v)
                .map_err(|_| GraphError::InvalidShuffle(format!("{name} is negative: {v}")))
        };
        let source_keys = fields
            .get_strings("source_keys")?
            .into_iter()
            .map(OpKey::from)
            .collect();
        Self::new(
            source_keys,
            count("n_mappers")?,
            count("n_reducers")?,
            fields.get_enum("shuffle_fetch_type")?,
        )
    }

    /// Barrier request for `reducer`. `shuffle` names the stage for index addressing.
    ///
    /// # Errors
    ///
    /// `InvalidShuffle` if `reducer` is out of range.
    pub fn request(&self, shuffle: &OpKey, reducer: usize) -> Result<GatherRequest> {
        if reducer >= self.n_reducers {
            return Err(GraphError::InvalidShuffle(format!(
                "reducer {reducer} out of range for {} reducers",
                self.n_reducers
            )));
        }
        let sources = match self.fetch_type {
            ShuffleFetchType::FetchByKey => GatherSources::ByKey(self.source_keys.clone()),
            ShuffleFetchType::FetchByIndex => GatherSources::ByIndex {
                shuffle: shuffle.clone(),
                n_mappers: self.n_mappers,
            },
        };
        Ok(GatherRequest { reducer, sources })
    }

    /// Check the barrier without waiting.
    ///
    /// # Errors
    ///
    /// `IncompleteShuffle` while mappers are outstanding; otherwise as
    /// [`ResultStore::try_gather`].
    pub fn try_resolve(
        &self,
        store: &ResultStore,
        shuffle: &OpKey,
        reducer: usize,
    ) -> Result<Vec<ChunkData>> {
        store.try_gather(&self.request(shuffle, reducer)?)
    }

    /// Wait until all `n_mappers` partitions for `reducer` are available.
    ///
    /// # Errors
    ///
    /// As [`ResultStore::gather`].
    pub fn resolve(
        &self,
        store: &ResultStore,
        shuffle: &OpKey,
        reducer: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<ChunkData>> {
        store.gather(&self.request(shuffle, reducer)?, deadline)
    }

    /// [`resolve`](Self::resolve) on behalf of `consumers`, watched for cancellation.
    ///
    /// # Errors
    ///
    /// As [`ResultStore::gather_for`].
    pub fn resolve_for(
        &self,
        store: &ResultStore,
        shuffle: &OpKey,
        reducer: usize,
        consumers: &[OpKey],
        deadline: Option<Instant>,
    ) -> Result<Vec<ChunkData>> {
        store.gather_for(&self.request(shuffle, reducer)?, consumers, deadline)
    }
}

fn count_field(n: usize) -> Result<i32> {
    i32::try_from(n).map_err(|_| GraphError::InvalidShuffle(format!("count {n} exceeds int32")))
}
