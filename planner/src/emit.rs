// emit.rs — Execution plan emission
//
// Turns the consolidated schedule and the parallelization plan into the
// final artifacts: a master timeline and one instruction list per node.
// Scheduled blocks become RUN entries on their node, preceded by WAIT
// entries for every dependency produced on a different node. Parallelized
// calls fan out over a worker set with round-robin chunk assignment and
// collapse back on an elected aggregator. Deferred and failed blocks appear
// in the master timeline with their reason and emit no node instructions.
//
// Preconditions: schedule and plan over the same block arena.
// Postconditions: every roster node has an instruction list, possibly
//                 empty; the master timeline mentions every live block.
// Failure modes: none; unplaced blocks downgrade to warnings.
// Side effects: none — writing the documents to disk is the caller's job.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Write as _;

use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::parallel::{Chunk, Decision, ParallelPlan, Status};
use crate::schedule::{largest, NodeSpec, Schedule};
use crate::textscan;

// ── Instructions ──

/// One line of a node's instruction list.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Block until `what` arrives from `from`.
    Wait { what: String, from: String },
    Run { command: String },
    /// Ship `what` to node `to`.
    Send { what: String, to: String },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Wait { what, from } => write!(f, "WAIT {} FROM {}", what, from),
            Instruction::Run { command } => write!(f, "RUN {}", command),
            Instruction::Send { what, to } => write!(f, "SEND {} TO {}", what, to),
        }
    }
}

/// The emitted plan: a master timeline plus per-node instruction lists,
/// keyed by node name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanDocuments {
    pub master: String,
    pub per_node: BTreeMap<String, Vec<Instruction>>,
}

impl PlanDocuments {
    /// Render one node's instruction list as its own document.
    pub fn render_node(&self, name: &str) -> String {
        let mut out = format!("instructions for {}\n\n", name);
        match self.per_node.get(name) {
            Some(instructions) if !instructions.is_empty() => {
                for instr in instructions {
                    let _ = writeln!(out, "{}", instr);
                }
            }
            _ => out.push_str("(idle)\n"),
        }
        out
    }
}

#[derive(Debug)]
pub struct EmitResult {
    pub documents: PlanDocuments,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Emission ──

pub fn emit(schedule: &Schedule, plan: &ParallelPlan, nodes: &[NodeSpec]) -> EmitResult {
    let mut documents = PlanDocuments::default();
    let mut diagnostics = Vec::new();
    for node in nodes {
        documents.per_node.insert(node.name.clone(), Vec::new());
    }

    let mut master = String::new();
    let _ = writeln!(
        master,
        "execution plan: {} block(s) across {} node(s)",
        schedule.entries.len(),
        nodes.len()
    );
    let _ = writeln!(master, "strategy: {}", strategy_name(schedule));
    let roster = nodes
        .iter()
        .map(|n| format!("{}({})", n.name, n.memory))
        .collect::<Vec<_>>()
        .join(" ");
    let _ = writeln!(master, "nodes: {}", roster);

    // Scheduled blocks, in consolidated order.
    for entry in &schedule.entries {
        let Some(node) = entry.assigned_node.as_deref() else {
            continue;
        };
        let block = schedule.blocks.arena.block(entry.block);
        let _ = writeln!(master);
        let _ = writeln!(
            master,
            "block {} on {} peak={}",
            entry.block.0, node, entry.peak_memory
        );

        let instructions = documents
            .per_node
            .entry(node.to_string())
            .or_default();
        for (variable, source) in block.waited_variables(&schedule.blocks.arena) {
            let Some(source_node) = schedule.node_of(source) else {
                continue;
            };
            if source_node == node {
                continue;
            }
            let _ = writeln!(
                master,
                "  wait {} <- block {} on {}",
                variable, source.0, source_node
            );
            instructions.push(Instruction::Wait {
                what: variable,
                from: source_node.to_string(),
            });
        }
        for statement in &block.statements {
            instructions.push(Instruction::Run {
                command: statement.clone(),
            });
        }
    }

    // Parallelized, deferred, and failed blocks.
    for decision in &plan.decisions {
        let _ = writeln!(master);
        match decision.status {
            Status::Success => emit_parallel(decision, schedule, nodes, &mut documents, &mut master),
            Status::Deferred => {
                let _ = writeln!(
                    master,
                    "block {} deferred: {}",
                    decision.block.0,
                    decision.reason.as_deref().unwrap_or("unspecified")
                );
                diagnostics.push(unplaced(decision));
            }
            Status::Failed => {
                let _ = writeln!(
                    master,
                    "block {} failed: {}",
                    decision.block.0,
                    decision.reason.as_deref().unwrap_or("unspecified")
                );
                diagnostics.push(unplaced(decision));
            }
        }
    }

    documents.master = master;
    EmitResult {
        documents,
        diagnostics,
    }
}

fn strategy_name(schedule: &Schedule) -> &'static str {
    match schedule.strategy {
        crate::schedule::Strategy::WholeProgram => "whole-program",
        crate::schedule::Strategy::Consolidated => "consolidated",
    }
}

fn unplaced(decision: &Decision) -> Diagnostic {
    let mut diag = Diagnostic::new(
        DiagLevel::Warning,
        format!("block {} emits no node instructions", decision.block.0),
    )
    .with_code(codes::W0200)
    .with_statement(&decision.statement);
    if let Some(reason) = &decision.reason {
        diag = diag.with_hint(reason);
    }
    diag
}

/// Fan one successful parallelization out over the worker set and collapse
/// the chunk results on the aggregator.
fn emit_parallel(
    decision: &Decision,
    schedule: &Schedule,
    nodes: &[NodeSpec],
    documents: &mut PlanDocuments,
    master: &mut String,
) {
    let Some(chunks) = &decision.chunks else {
        return;
    };
    let (aggregator, workers) = elect_roles(schedule, nodes);
    let Some(aggregator) = aggregator else {
        return;
    };

    let factor = decision.factor.unwrap_or(0);
    let _ = writeln!(
        master,
        "block {} parallel factor={} aggregator={} workers={}",
        decision.block.0,
        factor,
        aggregator,
        workers.join(",")
    );
    for (arg, ranges) in chunks {
        let rendered = ranges
            .iter()
            .map(|c| format!("[{}:{})", c.start, c.end))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(master, "  {}: {}", arg, rendered);
    }
    if let Some(spec) = &decision.aggregate {
        let _ = writeln!(master, "  aggregate: {}", spec);
    }

    let target = textscan::parse_call(&decision.statement)
        .map(|c| c.target)
        .or_else(|| textscan::lhs_of(&decision.statement))
        .unwrap_or_else(|| "result".to_string());
    let tasks = chunks.values().map(Vec::len).max().unwrap_or(0);

    for task in 0..tasks {
        let worker = workers[task % workers.len()].clone();
        let slices = chunks
            .iter()
            .filter_map(|(arg, ranges)| {
                ranges
                    .get(task)
                    .map(|c: &Chunk| format!("{}[{}:{}]", arg, c.start, c.end))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let part = format!("{}[chunk {}]", target, task);

        let worker_list = documents.per_node.entry(worker.clone()).or_default();
        worker_list.push(Instruction::Run {
            command: format!("{} [{}]", decision.statement, slices),
        });
        worker_list.push(Instruction::Send {
            what: part.clone(),
            to: aggregator.clone(),
        });

        if worker != aggregator {
            documents
                .per_node
                .entry(aggregator.clone())
                .or_default()
                .push(Instruction::Wait {
                    what: part,
                    from: worker,
                });
        }
    }

    let combine = match &decision.aggregate {
        Some(spec) => format!("{} [aggregate: {}]", decision.statement, spec),
        None => format!("{} [aggregate]", decision.statement),
    };
    documents
        .per_node
        .entry(aggregator)
        .or_default()
        .push(Instruction::Run { command: combine });
}

/// Aggregator: first idle node, or the highest-capacity node when every
/// node already runs scheduled work. Workers: the remaining idle nodes, or
/// the whole roster when none are idle.
fn elect_roles(schedule: &Schedule, nodes: &[NodeSpec]) -> (Option<String>, Vec<String>) {
    let busy: BTreeSet<&str> = schedule
        .entries
        .iter()
        .filter_map(|e| e.assigned_node.as_deref())
        .collect();
    let idle: Vec<&str> = nodes
        .iter()
        .map(|n| n.name.as_str())
        .filter(|name| !busy.contains(name))
        .collect();

    let aggregator = idle
        .first()
        .map(|s| s.to_string())
        .or_else(|| largest(nodes).map(|n| n.name.clone()));
    let Some(aggregator) = aggregator else {
        return (None, Vec::new());
    };

    let workers: Vec<String> = idle
        .iter()
        .filter(|name| **name != aggregator)
        .map(|s| s.to_string())
        .collect();
    let workers = if workers.is_empty() {
        nodes.iter().map(|n| n.name.clone()).collect()
    } else {
        workers
    };
    (Some(aggregator), workers)
}
