//! Computation graphs and the explicit construction context that builds them.
//!
//! A [`Graph`] is an insertion-ordered set of sealed [`Operator`]s. Edges are implied by each
//! operator's input keys; every input must already be present when an operator is added,
//! so insertion order is always a valid topological order.
//!
//! Construction goes through a [`GraphBuilder`] passed explicitly to whatever code creates
//! operators. There is no ambient "current graph": [`GraphBuilder::scope`] creates one,
//! hands it to a closure and returns the finished graph. The builder is single-writer.

use crate::error::{GraphError, Result};
use crate::key::{OpKey, digest_hex};
use crate::operator::{Operator, OperatorRecord, OutputMeta};
use std::collections::{HashMap, VecDeque};

/// An immutable, topologically ordered graph of operators.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Graph {
    ops: Vec<Operator>,
    index: HashMap<OpKey, usize>,
}

impl Graph {
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &OpKey) -> Option<&Operator> {
        self.index.get(key).map(|&i| &self.ops[i])
    }

    #[must_use]
    pub fn contains(&self, key: &OpKey) -> bool {
        self.index.contains_key(key)
    }

    /// Operators in topological (insertion) order.
    #[must_use]
    pub fn operators(&self) -> &[Operator] {
        &self.ops
    }

    /// `(producer, consumer)` pairs, ordered by consumer then input position.
    #[must_use]
    pub fn edges(&self) -> Vec<(OpKey, OpKey)> {
        self.ops
            .iter()
            .flat_map(|op| {
                op.inputs()
                    .iter()
                    .map(move |input| (input.clone(), op.key().clone()))
            })
            .collect()
    }

    /// Keys consuming `key`, in topological order.
    #[must_use]
    pub fn successors(&self, key: &OpKey) -> Vec<&OpKey> {
        self.ops
            .iter()
            .filter(|op| op.inputs().contains(key))
            .map(Operator::key)
            .collect()
    }

    /// Number of consuming edges per key (keys without consumers are absent).
    #[must_use]
    pub fn consumer_counts(&self) -> HashMap<&OpKey, usize> {
        let mut counts = HashMap::new();
        for op in &self.ops {
            for input in op.inputs() {
                *counts.entry(input).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Operators without inputs.
    pub fn sources(&self) -> impl Iterator<Item = &Operator> {
        self.ops.iter().filter(|op| op.inputs().is_empty())
    }

    /// Operators nothing in the graph consumes.
    #[must_use]
    pub fn sinks(&self) -> Vec<&Operator> {
        let counts = self.consumer_counts();
        self.ops
            .iter()
            .filter(|op| !counts.contains_key(op.key()))
            .collect()
    }

    /// Key-independent structural digest: operator kinds in order, edge topology by
    /// position, and output shapes.
    ///
    /// Two graphs with equal fingerprints are isomorphic in operator-type sequence and edge
    /// topology.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let lines: Vec<String> = self
            .ops
            .iter()
            .map(|op| {
                let inputs: Vec<String> = op
                    .inputs()
                    .iter()
                    .map(|k| self.index.get(k).map_or_else(|| "?".to_string(), usize::to_string))
                    .collect();
                let outputs: Vec<String> = op
                    .outputs()
                    .iter()
                    .map(|o| format!("{}:{:?}", o.index, o.shape))
                    .collect();
                format!("{}({})->[{}]", op.kind(), inputs.join(","), outputs.join(";"))
            })
            .collect();
        digest_hex(lines.iter().map(String::as_bytes))
    }

    #[must_use]
    pub fn to_records(&self) -> Vec<OperatorRecord> {
        self.ops.iter().map(Operator::to_record).collect()
    }

    /// Rebuild a graph from records in any order.
    ///
    /// # Errors
    ///
    /// Decoding errors from [`Operator::from_record`]; `Graph` for dangling inputs or
    /// cycles.
    pub fn from_records(records: Vec<OperatorRecord>) -> Result<Self> {
        let ops = records
            .into_iter()
            .map(Operator::from_record)
            .collect::<Result<Vec<_>>>()?;

        // Kahn's algorithm over record order so the result is deterministic.
        let position: HashMap<OpKey, usize> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| (op.key().clone(), i))
            .collect();
        let mut pending: Vec<usize> = vec![0; ops.len()];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); ops.len()];
        for (i, op) in ops.iter().enumerate() {
            for input in op.inputs() {
                let &p = position.get(input).ok_or_else(|| {
                    GraphError::Graph(format!("`{}` consumes unknown `{input}`", op.key()))
                })?;
                pending[i] += 1;
                consumers[p].push(i);
            }
        }
        let mut ready: VecDeque<usize> = (0..ops.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(ops.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &c in &consumers[i] {
                pending[c] -= 1;
                if pending[c] == 0 {
                    ready.push_back(c);
                }
            }
        }
        if order.len() != ops.len() {
            return Err(GraphError::Graph("cycle in operator records".into()));
        }

        let mut slots: Vec<Option<Operator>> = ops.into_iter().map(Some).collect();
        let mut builder = GraphBuilder::new();
        for i in order {
            if let Some(op) = slots[i].take() {
                builder.add_bound(op)?;
            }
        }
        Ok(builder.finish())
    }

    /// # Errors
    ///
    /// `Schema` if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.to_records())
            .map_err(|e| GraphError::Schema(format!("encode failed: {e}")))
    }

    /// # Errors
    ///
    /// `Schema` for malformed input; otherwise as [`from_records`](Self::from_records).
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let records: Vec<OperatorRecord> = serde_json::from_slice(bytes)
            .map_err(|e| GraphError::Schema(format!("malformed graph: {e}")))?;
        Self::from_records(records)
    }
}

/// Explicit, single-writer graph construction context.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `build` against a fresh builder and return the finished graph with the closure's
    /// result. The builder does not outlive the call.
    ///
    /// # Errors
    ///
    /// Whatever `build` returns.
    pub fn scope<T>(build: impl FnOnce(&mut Self) -> Result<T>) -> Result<(Graph, T)> {
        let mut builder = Self::new();
        let out = build(&mut builder)?;
        Ok((builder.finish(), out))
    }

    /// Bind `op` to `inputs`/`outputs`, seal it and register it.
    ///
    /// Registering an identical operator twice is a no-op.
    ///
    /// # Errors
    ///
    /// `Graph` for an input not yet registered, `InputArity`/`AlreadyBound` from
    /// [`Operator::bind`], `DuplicateKey` for a different operator under a taken key.
    pub fn add(
        &mut self,
        mut op: Operator,
        inputs: Vec<OpKey>,
        outputs: Vec<OutputMeta>,
    ) -> Result<OpKey> {
        op.bind(inputs, outputs)?;
        self.add_bound(op)
    }

    /// Register an operator that is already bound (decoded or produced by the tiler).
    ///
    /// # Errors
    ///
    /// As [`add`](Self::add).
    pub fn add_bound(&mut self, mut op: Operator) -> Result<OpKey> {
        op.check_inputs(op.inputs())?;
        if let Some(missing) = op.inputs().iter().find(|k| !self.graph.contains(k)) {
            return Err(GraphError::Graph(format!(
                "`{}` consumes `{missing}`, which is not in the graph",
                op.key()
            )));
        }
        op.seal();
        let key = op.key().clone();
        if let Some(existing) = self.graph.get(&key) {
            return if *existing == op {
                Ok(key)
            } else {
                Err(GraphError::DuplicateKey(key))
            };
        }
        self.graph.index.insert(key.clone(), self.graph.ops.len());
        self.graph.ops.push(op);
        Ok(key)
    }

    #[must_use]
    pub fn get(&self, key: &OpKey) -> Option<&Operator> {
        self.graph.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    #[must_use]
    pub fn finish(self) -> Graph {
        self.graph
    }
}
