//! Autogen: sources, destinations and a deterministic execution order.
//!
//! The dependency relation is derived from producers: exec `p -> e` whenever
//! `e` consumes a tensor `p` produces. It is materialized as a
//! [`DiGraphMap`] over local exec indices for the duration of one request.
//!
//! Ordering is Kahn's algorithm with a min-heap of ready execs, so among
//! execs whose dependencies are satisfied the lowest local index runs first.
//! The same graph and request always produce the same order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::ops::BitOr;

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;

use crate::error::CoreError;
use crate::graph::SymbolicGraph;
use crate::id::ExecSymbol;

/// Flags controlling [`SymbolicGraph::autogen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AutogenFlags(u8);

impl AutogenFlags {
    /// Only the execs passed explicitly.
    pub const NONE: AutogenFlags = AutogenFlags(0);
    /// Consider every exec in the graph instead of an explicit list.
    pub const ALL_EXECS: AutogenFlags = AutogenFlags(1);
    /// Also recompute the cached sources and destinations.
    pub const SOURCES_AND_DESTINATIONS: AutogenFlags = AutogenFlags(2);

    pub fn contains(self, other: AutogenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AutogenFlags {
    type Output = AutogenFlags;

    fn bitor(self, rhs: AutogenFlags) -> AutogenFlags {
        AutogenFlags(self.0 | rhs.0)
    }
}

impl SymbolicGraph {
    /// Recomputes the cached execution order (and, with
    /// `SOURCES_AND_DESTINATIONS`, the cached sources and destinations) over
    /// `execs`, or over the whole graph with `ALL_EXECS`.
    ///
    /// Sources are execs with no producer among the considered set;
    /// destinations are execs with no consumer among it. Both are sorted by
    /// local index. On `CycleDetected` the caches are left untouched.
    pub fn autogen(&mut self, execs: &[ExecSymbol], flags: AutogenFlags) -> Result<(), CoreError> {
        let subset = if flags.contains(AutogenFlags::ALL_EXECS) {
            self.all_exec_indices()
        } else {
            self.checked_indices(execs)?
        };
        let deps = self.dependency_graph(&subset);
        let order = stable_toposort(&deps, self)?;

        self.exec_order = order.iter().map(|i| self.exec_symbol(*i)).collect();
        if flags.contains(AutogenFlags::SOURCES_AND_DESTINATIONS) {
            self.sources = subset
                .iter()
                .filter(|n| deps.neighbors_directed(**n, Direction::Incoming).next().is_none())
                .map(|i| self.exec_symbol(*i))
                .collect();
            self.destinations = subset
                .iter()
                .filter(|n| deps.neighbors_directed(**n, Direction::Outgoing).next().is_none())
                .map(|i| self.exec_symbol(*i))
                .collect();
        }
        tracing::debug!(
            scope = %self.scope(),
            execs = self.exec_order.len(),
            sources = self.sources.len(),
            destinations = self.destinations.len(),
            "autogen"
        );
        Ok(())
    }

    /// Topological order of the execs reachable from `sources` that also
    /// reach `destinations`. An empty slice on either side means "no bound".
    ///
    /// Does not touch the cached order.
    pub fn exec_order_between(
        &self,
        sources: &[ExecSymbol],
        destinations: &[ExecSymbol],
    ) -> Result<Vec<ExecSymbol>, CoreError> {
        let all = self.all_exec_indices();
        let deps = self.dependency_graph(&all);

        let forward: BTreeSet<u32> = if sources.is_empty() {
            all.clone()
        } else {
            let mut seen = BTreeSet::new();
            for start in self.checked_indices(sources)? {
                let mut dfs = Dfs::new(&deps, start);
                while let Some(n) = dfs.next(&deps) {
                    seen.insert(n);
                }
            }
            seen
        };
        let backward: BTreeSet<u32> = if destinations.is_empty() {
            all
        } else {
            let reversed = Reversed(&deps);
            let mut seen = BTreeSet::new();
            for start in self.checked_indices(destinations)? {
                let mut dfs = Dfs::new(reversed, start);
                while let Some(n) = dfs.next(reversed) {
                    seen.insert(n);
                }
            }
            seen
        };

        let subset: BTreeSet<u32> = forward.intersection(&backward).copied().collect();
        self.order_indices(&subset)
    }

    /// Topological order of exactly `execs`, ignoring every other exec.
    pub fn order_of(&self, execs: &[ExecSymbol]) -> Result<Vec<ExecSymbol>, CoreError> {
        let subset = self.checked_indices(execs)?;
        self.order_indices(&subset)
    }

    fn order_indices(&self, subset: &BTreeSet<u32>) -> Result<Vec<ExecSymbol>, CoreError> {
        let deps = self.dependency_graph(subset);
        Ok(stable_toposort(&deps, self)?
            .into_iter()
            .map(|i| self.exec_symbol(i))
            .collect())
    }

    fn exec_symbol(&self, index: u32) -> ExecSymbol {
        ExecSymbol::new(self.scope(), index)
    }

    fn all_exec_indices(&self) -> BTreeSet<u32> {
        (0..self.exec_count() as u32).collect()
    }

    fn checked_indices(&self, execs: &[ExecSymbol]) -> Result<BTreeSet<u32>, CoreError> {
        execs
            .iter()
            .map(|e| self.exec(*e).map(|_| e.index))
            .collect()
    }

    /// Producer -> consumer edges restricted to `subset`.
    fn dependency_graph(&self, subset: &BTreeSet<u32>) -> DiGraphMap<u32, ()> {
        let mut deps = DiGraphMap::new();
        for index in subset {
            deps.add_node(*index);
        }
        for index in subset {
            let Ok(info) = self.exec(self.exec_symbol(*index)) else {
                continue;
            };
            for input in &info.inputs {
                if let Ok(Some(producer)) = self.producer(*input) {
                    if subset.contains(&producer.index) {
                        deps.add_edge(producer.index, *index, ());
                    }
                }
            }
        }
        deps
    }
}

/// Kahn's algorithm with ascending-index tie-breaking.
fn stable_toposort(
    deps: &DiGraphMap<u32, ()>,
    graph: &SymbolicGraph,
) -> Result<Vec<u32>, CoreError> {
    let mut indegree: BTreeMap<u32, usize> = deps
        .nodes()
        .map(|n| (n, deps.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let mut ready: BinaryHeap<Reverse<u32>> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| Reverse(*n))
        .collect();

    let mut order = Vec::with_capacity(deps.node_count());
    while let Some(Reverse(n)) = ready.pop() {
        order.push(n);
        for succ in deps.neighbors_directed(n, Direction::Outgoing) {
            if let Some(d) = indegree.get_mut(&succ) {
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }
    }

    if order.len() < deps.node_count() {
        let culprit = match petgraph::algo::toposort(deps, None) {
            Err(cycle) => cycle.node_id(),
            Ok(_) => indegree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(n, _)| *n)
                .unwrap_or_default(),
        };
        return Err(CoreError::CycleDetected {
            exec: ExecSymbol::new(graph.scope(), culprit),
        });
    }
    Ok(order)
}
