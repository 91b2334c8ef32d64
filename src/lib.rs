//! # irontile
//!
//! A **deferred operator graph** with deterministic tiling into chunk-level work.
//!
//! Operators are declared against logical, size-agnostic data. Nothing runs at
//! construction time: a [`Planner`] later tiles every logical operator into chunk
//! operators sized from the metadata it can see, inserting shuffle stages wherever the
//! partitioning changes. A [`Runner`] cuts the resulting chunk graph into subtasks that
//! exchange data only through a key-addressed [`ResultStore`].
//!
//! ## Key Features
//!
//! - **Schema-validated fields** - every operator kind declares a static field schema;
//!   values are type-checked on write and on decode
//! - **Explicit construction context** - graphs are built through a [`GraphBuilder`]
//!   passed by the caller, never through ambient state
//! - **Deterministic tiling** - identical metadata always produces the same chunk keys
//!   and the same chunk-graph structure
//! - **Shuffle barriers** - mapper → proxy → reducer stages with key- or index-addressed
//!   gathering ([`ShuffleFetchType`])
//! - **Fetch placeholders** - zero-input operators that resolve published results at
//!   execution time
//! - **Serializable graphs** - JSON always, compact binary behind `compact-codec`
//!
//! ## Quick Start
//!
//! ```
//! use irontile::testing::{RowExecutor, collect_rows, map, rebalance, source};
//! use irontile::{GraphBuilder, Planner, Runner};
//!
//! # fn main() -> anyhow::Result<()> {
//! // Declare: 10 rows, split four ways, incremented.
//! let (graph, out) = GraphBuilder::scope(|b| {
//!     let src = source(b, 10)?;
//!     let parts = rebalance(b, &src, 4)?;
//!     map(b, &parts, "increment")
//! })?;
//!
//! // Tile and run.
//! let mut planner = Planner::default();
//! let plan = planner.tile(&graph)?;
//! let result = Runner::default().run(&planner, &plan, &RowExecutor)?;
//! assert_eq!(collect_rows(&result, &out)?, (1..=10).collect::<Vec<i64>>());
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Operators and fields
//!
//! An [`Operator`] is an [`OpKind`], a unique [`OpKey`], validated fields, input keys and
//! output placeholders. Linkage happens once through [`Operator::bind`]; the graph builder
//! seals operators it accepts.
//!
//! ### Tiling
//!
//! [`Planner::tile`] turns a logical [`Graph`] into a [`PhysicalPlan`]. Chunk keys derive
//! from the logical key, the chunk's role and its position, so re-tiling is reproducible
//! and [`Graph::fingerprint`] witnesses it.
//!
//! ### Exchange
//!
//! [`Fetch`] and [`FetchShuffle`] are placeholders standing in for results produced
//! elsewhere. A `FetchShuffle` is a barrier: its reducer proceeds only once every mapper
//! has published.
//!
//! ## Module Overview
//!
//! - [`error`] - `GraphError` and the `Result` alias
//! - [`key`] - operator keys and allocation
//! - [`field`] - field declarations and validated values
//! - [`operator`] - operator kinds, linkage and encoding
//! - [`graph`] - graphs and the explicit builder
//! - [`tileable`] - per-kind tiling rules
//! - [`planner`] - physical plans, subtasks, explain
//! - [`exchange`] - fetch placeholders and partitioning modes
//! - [`store`] - the shared result store
//! - [`runner`] - subtask execution
//! - [`testing`] - executors, fixtures and assertions for tests

pub mod error;
pub mod exchange;
pub mod field;
pub mod graph;
pub mod key;
pub mod operator;
pub mod planner;
pub mod runner;
pub mod store;
pub mod testing;
pub mod tileable;

// General re-exports
pub use error::{GraphError, MissingReason, Result, SourceRef};
pub use exchange::{Fetch, FetchShuffle, Partitioner, ShuffleFetchType};
pub use field::{FieldDecl, FieldType, FieldValue, Fields};
pub use graph::{Graph, GraphBuilder};
pub use key::{KeyAllocator, OpKey};
pub use operator::{OpKind, Operator, OperatorRecord, OutputMeta};
pub use planner::{PhysicalPlan, PlanDecision, Planner, PlannerConfig, Subtask, dependency_waves};
pub use runner::{ChunkExecutor, ChunkInput, ChunkOutput, RunOutput, Runner, RunnerConfig};
pub use store::{CancelHandle, ChunkData, ResultStore, chunk, downcast_chunk};
pub use tileable::{Shape, TiledTileable};
