// parallel.rs — Data-parallel chunking of unplaced blocks
//
// Takes every block the scheduler could not place and decides one of three
// ways: Deferred when the block still waits on another block's output (its
// input size is only known at run time), Failed when the call consumes an
// argument holistically (a nested loop iterates over it) or cannot be
// reconstructed, Success with a per-argument chunk map otherwise.
//
// Preconditions: a finished schedule and the footprints that sized it.
// Postconditions: exactly one decision per unplaced block; every chunked
//                 argument's ranges cover `[0, length)` without gaps.
// Failure modes: none — infeasibility is recorded on the decision, not
//                raised.
// Side effects: none.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::diag::Diagnostic;
use crate::error::PlanError;
use crate::estimate::{Footprints, VarStat};
use crate::id::BlockId;
use crate::pass::StageCert;
use crate::schedule::{effective_key, smallest, NodeSpec, Schedule};
use crate::textscan;

/// Fewest chunks a split is ever divided into, even when one node could
/// technically hold everything the scheduler declined.
pub const MIN_FACTOR: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Deferred,
    Failed,
}

/// One contiguous index range of one argument, assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub id: u32,
    pub start: u64,
    /// Exclusive.
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub block: BlockId,
    pub statement: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factor: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<BTreeMap<String, Vec<Chunk>>>,
    /// Aggregation spec (`op:variable`) the call's body declared, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Decision {
    fn deferred(block: BlockId, statement: String, reason: String) -> Self {
        Decision {
            block,
            statement,
            status: Status::Deferred,
            factor: None,
            chunks: None,
            aggregate: None,
            reason: Some(reason),
        }
    }

    fn failed(block: BlockId, statement: String, reason: String) -> Self {
        Decision {
            block,
            statement,
            status: Status::Failed,
            factor: None,
            chunks: None,
            aggregate: None,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParallelPlan {
    pub decisions: Vec<Decision>,
}

impl ParallelPlan {
    pub fn decision_for(&self, block: BlockId) -> Option<&Decision> {
        self.decisions.iter().find(|d| d.block == block)
    }

    pub fn successes(&self) -> impl Iterator<Item = &Decision> {
        self.decisions
            .iter()
            .filter(|d| d.status == Status::Success)
    }
}

#[derive(Debug)]
pub struct ParallelResult {
    pub plan: ParallelPlan,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Planning ──

pub fn parallelize(
    schedule: &Schedule,
    footprints: &Footprints,
    nodes: &[NodeSpec],
) -> ParallelResult {
    let mut plan = ParallelPlan::default();
    let Some(small) = smallest(nodes) else {
        return ParallelResult {
            plan,
            diagnostics: Vec::new(),
        };
    };

    for entry in schedule.unplaced() {
        plan.decisions
            .push(decide(entry.block, schedule, footprints, small.memory));
    }

    ParallelResult {
        plan,
        diagnostics: Vec::new(),
    }
}

fn decide(
    id: BlockId,
    schedule: &Schedule,
    footprints: &Footprints,
    smallest_capacity: f64,
) -> Decision {
    let arena = &schedule.blocks.arena;
    let block = arena.block(id);
    let representative = block.statements.first().cloned().unwrap_or_default();

    // A wait key pointing at another block means the input size is only
    // known after that block runs.
    let keys = effective_key(block, arena);
    if let Some(source) = keys.iter().find_map(|k| k.source_block()) {
        return Decision::deferred(
            id,
            representative,
            format!(
                "requires feedback: input size is known only after block {} runs",
                source.0
            ),
        );
    }

    let Some((statement, call)) = block
        .statements
        .iter()
        .find_map(|s| textscan::parse_call(s).map(|c| (s.clone(), c)))
    else {
        return Decision::failed(id, representative, "no call site to split".into());
    };

    let Some(trace) = footprints.trace_for(&statement) else {
        return Decision::failed(
            id,
            statement,
            "no footprint trace recorded for the call".into(),
        );
    };

    // Reconstruct the callee source from the trace, dropping aggregation
    // markers, and reject calls whose nested loop walks an argument.
    let aggregate = trace.lines().find_map(textscan::aggregation_spec);
    let mut in_loop = false;
    for line in trace.lines() {
        if textscan::aggregation_spec(line).is_some() {
            continue;
        }
        if let Some(header) = textscan::parse_for(line) {
            if in_loop {
                if let Some(iterable) = &header.iterable {
                    if call.args.contains(iterable) {
                        let err = PlanError::InfeasibleParallelization {
                            statement: statement.clone(),
                            argument: iterable.clone(),
                        };
                        return Decision::failed(id, statement, err.to_string());
                    }
                }
            }
            in_loop = true;
        }
    }

    // Required memory: every argument plus the call's execution footprint.
    let mut total = trace.total();
    for arg in &call.args {
        if let Some(stat) = arg_stat(footprints, &statement, arg) {
            total += stat.size;
        }
    }
    let factor = ((total / smallest_capacity).ceil() as u64).max(MIN_FACTOR);

    let mut chunks: BTreeMap<String, Vec<Chunk>> = BTreeMap::new();
    for arg in &call.args {
        let Some(length) = arg_stat(footprints, &statement, arg).and_then(|s| s.length) else {
            continue;
        };
        if length == 0 {
            continue;
        }
        chunks.insert(arg.clone(), split_range(length, factor));
    }
    if chunks.is_empty() {
        return Decision::failed(
            id,
            statement,
            "no argument carries a known length to chunk".into(),
        );
    }

    Decision {
        block: id,
        statement,
        status: Status::Success,
        factor: Some(factor),
        chunks: Some(chunks),
        aggregate,
        reason: None,
    }
}

/// Size of `arg` at the call site, falling back to any snapshot that
/// mentions it (external artifacts do not always key snapshots the same
/// way the call renders).
fn arg_stat(footprints: &Footprints, statement: &str, arg: &str) -> Option<VarStat> {
    if let Some(stat) = footprints.live_at(statement).and_then(|m| m.get(arg)) {
        return Some(*stat);
    }
    footprints
        .live
        .values()
        .find_map(|m| m.get(arg))
        .copied()
}

/// Split `[0, length)` into at most `factor` contiguous chunks of equal
/// ceiling size.
fn split_range(length: u64, factor: u64) -> Vec<Chunk> {
    let effective = factor.min(length).max(1);
    let size = length.div_ceil(effective);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut next_id = 0;
    while start < length {
        let end = (start + size).min(length);
        chunks.push(Chunk {
            id: next_id,
            start,
            end,
        });
        next_id += 1;
        start = end;
    }
    chunks
}

// ── Certification ──

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCert {
    /// Chunked ranges are gapless, non-overlapping, and cover the
    /// argument's recorded length.
    pub coverage: bool,
    /// Every deferred or failed decision explains itself.
    pub reasons: bool,
}

impl StageCert for ChunkCert {
    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![("chunk-coverage", self.coverage), ("reasons", self.reasons)]
    }
}

pub fn certify(plan: &ParallelPlan, footprints: &Footprints) -> ChunkCert {
    let mut coverage = true;
    for decision in plan.successes() {
        let Some(chunks) = &decision.chunks else {
            coverage = false;
            continue;
        };
        for (arg, ranges) in chunks {
            let length = arg_stat(footprints, &decision.statement, arg).and_then(|s| s.length);
            let mut expected_start = 0;
            for (i, chunk) in ranges.iter().enumerate() {
                if chunk.id != i as u32 || chunk.start != expected_start || chunk.end <= chunk.start
                {
                    coverage = false;
                }
                expected_start = chunk.end;
            }
            if let Some(length) = length {
                if expected_start != length {
                    coverage = false;
                }
            }
        }
    }

    let reasons = plan
        .decisions
        .iter()
        .filter(|d| d.status != Status::Success)
        .all(|d| d.reason.is_some());

    ChunkCert { coverage, reasons }
}
