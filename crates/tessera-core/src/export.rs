//! Diagnostic export of symbolic graphs.
//!
//! Two formats: Graphviz DOT text for eyeballing, and a serde-serializable
//! [`GraphDescription`] for tooling. Both use local indices only; scope ids
//! depend on construction order across the whole process and are left out.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::cmd::{BackendId, Command};
use crate::graph::SymbolicGraph;
use crate::symbol::{ExecKind, Pass};
use crate::tensor::TensorParams;

/// Serializable snapshot of one graph scope and its branch sub-graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    pub tensors: Vec<TensorDescription>,
    pub execs: Vec<ExecDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescription {
    pub index: u32,
    pub name: Option<String>,
    pub params: TensorParams,
    pub producer: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecDescription {
    pub index: u32,
    pub name: String,
    pub label: String,
    /// Present for plain command execs.
    pub command: Option<Command>,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
    pub backend: Option<BackendId>,
    pub pass: Pass,
    /// Branches of a case-of exec, in index order.
    pub branches: Vec<BranchDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchDescription {
    pub index: usize,
    /// `(sub-graph tensor, parent tensor)` pairs feeding the branch.
    pub inputs: Vec<(u32, u32)>,
    /// `(sub-graph tensor, parent tensor)` pairs the branch fills.
    pub outputs: Vec<(u32, u32)>,
    pub graph: GraphDescription,
}

/// Builds the serializable description of `graph`.
pub fn describe(graph: &SymbolicGraph) -> GraphDescription {
    let symbols = graph.symbols();
    let tensors = symbols
        .tensor_symbols()
        .filter_map(|t| {
            let info = graph.tensor(t).ok()?;
            Some(TensorDescription {
                index: t.index,
                name: info.name.clone(),
                params: info.params.clone(),
                producer: graph.producer(t).ok().flatten().map(|e| e.index),
            })
        })
        .collect();

    let execs = symbols
        .exec_symbols()
        .filter_map(|e| {
            let info = graph.exec(e).ok()?;
            let branches = match &info.kind {
                ExecKind::CaseOf(node) => node
                    .branches()
                    .map(|(index, branch)| BranchDescription {
                        index,
                        inputs: branch
                            .input_map()
                            .iter()
                            .map(|(i, o)| (i.index, o.index))
                            .collect(),
                        outputs: branch
                            .output_map()
                            .iter()
                            .map(|(i, o)| (i.index, o.index))
                            .collect(),
                        graph: describe(branch.graph()),
                    })
                    .collect(),
                _ => Vec::new(),
            };
            Some(ExecDescription {
                index: e.index,
                name: info.name.clone(),
                label: info.kind.label(),
                command: info.kind.command().cloned(),
                inputs: info.inputs.iter().map(|t| t.index).collect(),
                outputs: info.outputs.iter().map(|t| t.index).collect(),
                backend: info.backend,
                pass: info.pass,
                branches,
            })
        })
        .collect();

    GraphDescription { tensors, execs }
}

/// Pretty JSON of [`describe`].
pub fn to_json(graph: &SymbolicGraph) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&describe(graph))
}

/// Graphviz DOT text. Branch sub-graphs become clusters; remaps are dashed.
pub fn to_dot(graph: &SymbolicGraph) -> String {
    let mut out = String::from("digraph {\n");
    write_scope(&describe(graph), "", 1, &mut out);
    out.push_str("}\n");
    out
}

fn write_scope(desc: &GraphDescription, prefix: &str, depth: usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    for t in &desc.tensors {
        let label = t.name.clone().unwrap_or_else(|| format!("t{}", t.index));
        let _ = writeln!(out, "{pad}{prefix}t{} [shape=ellipse, label={label:?}];", t.index);
    }
    for e in &desc.execs {
        let label = if e.name.is_empty() {
            e.label.clone()
        } else {
            format!("{}: {}", e.name, e.label)
        };
        let _ = writeln!(out, "{pad}{prefix}e{} [shape=box, label={label:?}];", e.index);
        for t in &e.inputs {
            let _ = writeln!(out, "{pad}{prefix}t{t} -> {prefix}e{};", e.index);
        }
        for t in &e.outputs {
            let _ = writeln!(out, "{pad}{prefix}e{} -> {prefix}t{t};", e.index);
        }
        for branch in &e.branches {
            let inner = format!("{prefix}e{}b{}_", e.index, branch.index);
            let _ = writeln!(out, "{pad}subgraph cluster_{inner} {{");
            let _ = writeln!(out, "{pad}  label=\"branch {}\";", branch.index);
            write_scope(&branch.graph, &inner, depth + 1, out);
            let _ = writeln!(out, "{pad}}}");
            for (i, o) in &branch.inputs {
                let _ = writeln!(out, "{pad}{prefix}t{o} -> {inner}t{i} [style=dashed];");
            }
            for (i, o) in &branch.outputs {
                let _ = writeln!(out, "{pad}{inner}t{i} -> {prefix}t{o} [style=dashed];");
            }
        }
    }
}
