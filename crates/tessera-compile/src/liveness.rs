//! Liveness intervals over a compiled exec order.
//!
//! Position `p` is the `p`-th exec of the order; position `order.len()` is
//! "after the last exec". A tensor is live from its definition to its last
//! use, inclusive:
//!
//! - produced and consumed: `[producer, last consumer]`
//! - produced, never consumed: `[producer, end]`, so the caller can read it
//! - not produced in the order: `[0, end]`; it is set by the caller (or by a
//!   previous run) and must survive the whole run

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tessera_core::{CoreError, ExecSymbol, SymbolicGraph, TensorSymbol};

/// Inclusive range of positions during which a tensor holds a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: usize,
    pub end: usize,
}

impl Interval {
    pub fn new(start: usize, end: usize) -> Self {
        Interval { start, end }
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Intervals of every tensor read or written by `order`, in first-reference
/// order.
pub fn intervals(
    graph: &SymbolicGraph,
    order: &[ExecSymbol],
) -> Result<IndexMap<TensorSymbol, Interval>, CoreError> {
    let end = order.len();
    let mut referenced: IndexMap<TensorSymbol, ()> = IndexMap::new();
    let mut defs: HashMap<TensorSymbol, usize> = HashMap::new();
    let mut last_use: HashMap<TensorSymbol, usize> = HashMap::new();

    for (position, exec) in order.iter().enumerate() {
        let info = graph.exec(*exec)?;
        for t in &info.inputs {
            referenced.insert(*t, ());
            last_use.insert(*t, position);
        }
        for t in &info.outputs {
            referenced.insert(*t, ());
            defs.insert(*t, position);
        }
    }

    Ok(referenced
        .into_keys()
        .map(|t| {
            let interval = match (defs.get(&t), last_use.get(&t)) {
                (Some(def), Some(used)) if used >= def => Interval::new(*def, *used),
                (Some(def), _) => Interval::new(*def, end),
                (None, _) => Interval::new(0, end),
            };
            (t, interval)
        })
        .collect())
}
