//! Testing utilities for irontile graphs.
//!
//! - **Executors**: [`RowExecutor`] runs every chunk kind over `Vec<i64>` rows;
//!   [`FailingExecutor`] injects failures into selected operators.
//! - **Fixtures**: one-line builders for logical operators with consistent shapes.
//! - **Assertions**: read sink rows back out of a [`RunOutput`](crate::runner::RunOutput)
//!   and compare them.
//!
//! # Quick Start
//!
//! ```
//! use irontile::testing::*;
//! use irontile::{GraphBuilder, Planner, Runner};
//!
//! # fn main() -> anyhow::Result<()> {
//! let (graph, total) = GraphBuilder::scope(|b| {
//!     let src = source(b, 100)?;
//!     let doubled = map(b, &src, "double")?;
//!     reduce(b, &doubled, "sum")
//! })?;
//!
//! let mut planner = Planner::default();
//! let plan = planner.tile(&graph)?;
//! let out = Runner::default().run(&planner, &plan, &RowExecutor)?;
//! assert_eq!(collect_rows(&out, &total)?, vec![9900]);
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod executor;
pub mod fixtures;

pub use assertions::*;
pub use executor::*;
pub use fixtures::*;
