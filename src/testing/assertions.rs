//! Reading and comparing [`RowExecutor`](super::RowExecutor) results.

use super::executor::Rows;
use crate::error::SourceRef;
use crate::key::OpKey;
use crate::runner::RunOutput;
use crate::store::downcast_chunk;
use anyhow::{Result, anyhow};
use std::sync::Arc;

/// Rows of each chunk of a logical sink, in partition order.
///
/// # Errors
///
/// If `key` is not a sink of the run or a chunk is not [`Rows`].
pub fn partition_rows(output: &RunOutput, key: &OpKey) -> Result<Vec<Rows>> {
    let chunks = output
        .get(key)
        .ok_or_else(|| anyhow!("`{key}` is not a result of this run"))?;
    chunks
        .iter()
        .map(|data| {
            let rows = downcast_chunk::<Rows>(Arc::clone(data), SourceRef::Key(key.clone()))?;
            Ok(rows.as_ref().clone())
        })
        .collect()
}

/// All rows of a logical sink, concatenated in partition order.
///
/// # Errors
///
/// As [`partition_rows`].
pub fn collect_rows(output: &RunOutput, key: &OpKey) -> Result<Rows> {
    Ok(partition_rows(output, key)?.into_iter().flatten().collect())
}

/// Assert that two row sets are equal in order and content.
///
/// # Panics
///
/// Panics if the rows differ in length or content.
pub fn assert_rows_equal(actual: &[i64], expected: &[i64]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Row count mismatch:\n  Expected: {expected:?}\n  Actual: {actual:?}"
    );
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert_eq!(
            a, e,
            "Row mismatch at index {i}:\n  Expected: {expected:?}\n  Actual: {actual:?}"
        );
    }
}

/// Assert that two row sets hold the same multiset of values.
///
/// # Panics
///
/// Panics if the sorted rows differ.
pub fn assert_rows_unordered_equal(actual: &[i64], expected: &[i64]) {
    let mut a = actual.to_vec();
    let mut e = expected.to_vec();
    a.sort_unstable();
    e.sort_unstable();
    assert_eq!(
        a, e,
        "Row content mismatch (ignoring order):\n  Expected: {expected:?}\n  Actual: {actual:?}"
    );
}
