// schedule.rs — Memory-constrained scheduling
//
// Three increasingly granular strategies, each handing its remainder to the
// next: place the whole program on one sufficient node; greedily merge
// dependent blocks while the merged peak fits the largest node; then
// consolidate runs of adjacent schedulable blocks and assign each survivor
// the smallest node that holds it.
//
// Preconditions: grouped blocks, footprints covering their statements, and a
//                non-empty node roster.
// Postconditions: one entry per live block in order; `assigned_node` absent
//                 means the parallelization planner must take the block.
// Failure modes: an empty roster is an error; nothing else fails — unplaced
//                blocks are handed on, not rejected.
// Side effects: none.
//
// Merging is greedy and commits immediately: one merge per scan restart, no
// backtracking. Peaks are context-aware — a block is charged only for
// variables it waits on or produces itself, never for bindings private to
// unrelated blocks.

use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;

use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::estimate::Footprints;
use crate::group::{Block, BlockArena, Blocks, DepKey, DepSource};
use crate::id::BlockId;
use crate::pass::StageCert;
use crate::textscan;

// ── Node roster ──

/// One compute node: a name and how many bytes it can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub memory: f64,
}

/// Smallest-capacity node whose capacity covers `peak`; ties break by name.
pub fn cheapest_fit(nodes: &[NodeSpec], peak: f64) -> Option<&NodeSpec> {
    nodes
        .iter()
        .filter(|n| n.memory >= peak)
        .min_by(|a, b| {
            a.memory
                .total_cmp(&b.memory)
                .then_with(|| a.name.cmp(&b.name))
        })
}

pub fn largest(nodes: &[NodeSpec]) -> Option<&NodeSpec> {
    nodes.iter().max_by(|a, b| {
        a.memory
            .total_cmp(&b.memory)
            .then_with(|| b.name.cmp(&a.name))
    })
}

pub fn smallest(nodes: &[NodeSpec]) -> Option<&NodeSpec> {
    nodes.iter().min_by(|a, b| {
        a.memory
            .total_cmp(&b.memory)
            .then_with(|| a.name.cmp(&b.name))
    })
}

// ── Schedule artifacts ──

/// Which strategy produced the final placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    WholeProgram,
    Consolidated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub block: BlockId,
    pub peak_memory: f64,
    pub assigned_node: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    /// Post-merge arena and live order; entries index into it.
    pub blocks: Blocks,
    pub entries: Vec<ScheduleEntry>,
    pub strategy: Strategy,
}

impl Schedule {
    pub fn entry_for(&self, block: BlockId) -> Option<&ScheduleEntry> {
        self.entries.iter().find(|e| e.block == block)
    }

    /// Node a live block was assigned to, if any.
    pub fn node_of(&self, block: BlockId) -> Option<&str> {
        self.entry_for(block)
            .and_then(|e| e.assigned_node.as_deref())
    }

    pub fn unplaced(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.iter().filter(|e| e.assigned_node.is_none())
    }
}

#[derive(Debug)]
pub struct ScheduleResult {
    pub schedule: Schedule,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Peak computation ──

/// Peak over every entry statement, counting every live binding plus the
/// execution size of any call at that point. Used by the whole-program
/// attempt only; order does not matter for a maximum.
pub fn whole_program_peak(footprints: &Footprints) -> f64 {
    let mut peak = 0.0f64;
    for (text, live) in &footprints.live {
        let mut at: f64 = live.values().map(|s| s.size).sum();
        if textscan::parse_call(text).is_some() {
            at += footprints.execution_size(text).unwrap_or(0.0);
        }
        peak = peak.max(at);
    }
    peak
}

/// Context-aware peak of one block: walk its statements in order, admitting
/// a variable once the block produces it (or lists it in `key`), and take
/// the maximum admitted-live total plus any call execution size.
pub fn context_peak(statements: &[String], key: &[DepKey], footprints: &Footprints) -> f64 {
    let mut allowed: BTreeSet<String> = key
        .iter()
        .filter_map(|k| k.variable().map(str::to_string))
        .collect();
    let mut peak = 0.0f64;
    for text in statements {
        if let Some(lhs) = textscan::lhs_of(text) {
            allowed.insert(lhs);
        }
        let mut at = 0.0;
        if let Some(live) = footprints.live_at(text) {
            at += live
                .iter()
                .filter(|(var, _)| allowed.contains(var.as_str()))
                .map(|(_, s)| s.size)
                .sum::<f64>();
        }
        if textscan::parse_call(text).is_some() {
            at += footprints.execution_size(text).unwrap_or(0.0);
        }
        peak = peak.max(at);
    }
    peak
}

/// `block`'s key with merge-satisfied entries dropped and surviving sources
/// resolved to live identifiers.
pub fn effective_key(block: &Block, arena: &BlockArena) -> Vec<DepKey> {
    let mut out = Vec::new();
    for key in &block.key {
        match key {
            DepKey::Dep {
                variable,
                source: DepSource::Block(id),
            } => {
                let live = arena.resolve(*id);
                if live != block.id {
                    out.push(DepKey::from_block(variable.clone(), live));
                }
            }
            other => out.push(other.clone()),
        }
    }
    out.sort();
    out.dedup();
    out
}

fn block_peak(id: BlockId, arena: &BlockArena, footprints: &Footprints) -> f64 {
    let block = arena.block(id);
    context_peak(&block.statements, &effective_key(block, arena), footprints)
}

// ── Scheduling ──

pub fn schedule(blocks: &Blocks, footprints: &Footprints, nodes: &[NodeSpec]) -> ScheduleResult {
    let mut diagnostics = Vec::new();
    if nodes.is_empty() {
        diagnostics.push(
            Diagnostic::new(DiagLevel::Error, "node roster is empty; nothing can be placed")
                .with_code(codes::E0300)
                .with_hint("provide at least one node with a memory capacity"),
        );
        return ScheduleResult {
            schedule: Schedule {
                blocks: blocks.clone(),
                entries: Vec::new(),
                strategy: Strategy::Consolidated,
            },
            diagnostics,
        };
    }
    if blocks.order.is_empty() {
        return ScheduleResult {
            schedule: Schedule {
                blocks: blocks.clone(),
                entries: Vec::new(),
                strategy: Strategy::Consolidated,
            },
            diagnostics,
        };
    }

    // Strategy 1: the entire program on one node.
    let whole = whole_program_peak(footprints);
    if let Some(node) = cheapest_fit(nodes, whole) {
        let mut work = blocks.clone();
        let merged = merge_all(&mut work);
        let entries = vec![ScheduleEntry {
            block: merged,
            peak_memory: whole,
            assigned_node: Some(node.name.clone()),
        }];
        return ScheduleResult {
            schedule: Schedule {
                blocks: work,
                entries,
                strategy: Strategy::WholeProgram,
            },
            diagnostics,
        };
    }

    // Strategy 2: merge dependent blocks while the merged peak fits the
    // largest node.
    let capacity = largest(nodes).map(|n| n.memory).unwrap_or(0.0);
    let mut work = blocks.clone();
    merge_dependents(&mut work, footprints, capacity);

    // Strategy 3: coalesce adjacent schedulable runs, then assign nodes.
    coalesce_adjacent(&mut work, footprints, capacity);
    let entries = work
        .order
        .iter()
        .map(|id| {
            let peak = block_peak(*id, &work.arena, footprints);
            ScheduleEntry {
                block: *id,
                peak_memory: peak,
                assigned_node: cheapest_fit(nodes, peak).map(|n| n.name.clone()),
            }
        })
        .collect();

    ScheduleResult {
        schedule: Schedule {
            blocks: work,
            entries,
            strategy: Strategy::Consolidated,
        },
        diagnostics,
    }
}

/// Collapse every live block into one, in order. Keys of the constituents
/// are carried over verbatim; resolution drops the now-internal ones.
fn merge_all(work: &mut Blocks) -> BlockId {
    let mut statements = Vec::new();
    let mut key = Vec::new();
    for id in &work.order {
        let block = work.arena.block(*id);
        statements.extend(block.statements.iter().cloned());
        key.extend(block.key.iter().cloned());
    }
    let merged = work.arena.alloc(key, statements);
    for id in work.order.clone() {
        work.arena.retire(id, merged);
    }
    work.order = vec![merged];
    merged
}

/// Merge two live blocks, producer first. Returns the successor id.
fn commit_merge(work: &mut Blocks, producer: BlockId, consumer: BlockId) -> BlockId {
    let mut statements = work.arena.block(producer).statements.clone();
    statements.extend(work.arena.block(consumer).statements.iter().cloned());
    let mut key = work.arena.block(producer).key.clone();
    key.extend(work.arena.block(consumer).key.iter().cloned());
    let merged = work.arena.alloc(key, statements);
    work.arena.retire(producer, merged);
    work.arena.retire(consumer, merged);
    let at = work
        .order
        .iter()
        .position(|id| *id == producer)
        .expect("producer is live");
    work.order[at] = merged;
    work.order.retain(|id| *id != consumer);
    merged
}

/// Peak the merge of `producer` and `consumer` would have, without
/// committing anything.
fn simulated_merge_peak(
    work: &Blocks,
    producer: BlockId,
    consumer: BlockId,
    footprints: &Footprints,
) -> f64 {
    let a = work.arena.block(producer);
    let b = work.arena.block(consumer);
    let mut statements = a.statements.clone();
    statements.extend(b.statements.iter().cloned());
    let mut key = Vec::new();
    for entry in a.key.iter().chain(b.key.iter()) {
        match entry {
            DepKey::Dep {
                variable,
                source: DepSource::Block(id),
            } => {
                let live = work.arena.resolve(*id);
                if live != producer && live != consumer {
                    key.push(DepKey::from_block(variable.clone(), live));
                }
            }
            other => key.push(other.clone()),
        }
    }
    context_peak(&statements, &key, footprints)
}

fn merge_dependents(work: &mut Blocks, footprints: &Footprints, capacity: f64) {
    loop {
        let mut committed = false;
        'scan: for i in 0..work.order.len() {
            let consumer = work.order[i];
            let targets = work.arena.block(consumer).wait_sources(&work.arena);
            for producer in targets {
                if producer == consumer || !work.arena.is_live(producer) {
                    continue;
                }
                if simulated_merge_peak(work, producer, consumer, footprints) <= capacity {
                    commit_merge(work, producer, consumer);
                    committed = true;
                    break 'scan;
                }
            }
        }
        if !committed {
            break;
        }
    }
}

fn coalesce_adjacent(work: &mut Blocks, footprints: &Footprints, capacity: f64) {
    let mut i = 0;
    while i + 1 < work.order.len() {
        let a = work.order[i];
        let b = work.order[i + 1];
        let schedulable = block_peak(a, &work.arena, footprints) <= capacity
            && block_peak(b, &work.arena, footprints) <= capacity;
        if schedulable && simulated_merge_peak(work, a, b, footprints) <= capacity {
            commit_merge(work, a, b);
            // Keep extending the same run from the merged block.
        } else {
            i += 1;
        }
    }
}

// ── Certification ──

/// Obligations of a finished schedule against the grouping it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleCert {
    /// Every assigned block's recomputed peak fits its node.
    pub capacity: bool,
    /// Every surviving wait key points at a live, ordered block.
    pub key_closure: bool,
    /// Statements are conserved through merging and consolidation.
    pub conservation: bool,
}

impl StageCert for ScheduleCert {
    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("capacity", self.capacity),
            ("key-closure", self.key_closure),
            ("statement-conservation", self.conservation),
        ]
    }
}

pub fn certify(
    schedule: &Schedule,
    grouped: &Blocks,
    footprints: &Footprints,
    nodes: &[NodeSpec],
) -> ScheduleCert {
    let mut capacity = true;
    for entry in &schedule.entries {
        if let Some(name) = &entry.assigned_node {
            let peak = block_peak(entry.block, &schedule.blocks.arena, footprints);
            let fits = nodes
                .iter()
                .any(|n| n.name == *name && n.memory >= peak);
            if !fits {
                capacity = false;
            }
        }
    }

    let mut key_closure = true;
    for block in schedule.blocks.live() {
        for source in block.wait_sources(&schedule.blocks.arena) {
            if !schedule.blocks.order.contains(&source) {
                key_closure = false;
            }
        }
    }

    let mut before: Vec<&str> = grouped
        .live()
        .flat_map(|b| b.statements.iter().map(String::as_str))
        .collect();
    let mut after: Vec<&str> = schedule
        .blocks
        .live()
        .flat_map(|b| b.statements.iter().map(String::as_str))
        .collect();
    before.sort_unstable();
    after.sort_unstable();

    ScheduleCert {
        capacity,
        key_closure,
        conservation: before == after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::VarStat;
    use std::collections::BTreeMap;

    fn node(name: &str, memory: f64) -> NodeSpec {
        NodeSpec {
            name: name.into(),
            memory,
        }
    }

    fn stat(size: f64) -> VarStat {
        VarStat { size, length: None }
    }

    fn live(vars: &[(&str, f64)]) -> BTreeMap<String, VarStat> {
        vars.iter()
            .map(|(name, size)| (name.to_string(), stat(*size)))
            .collect()
    }

    fn footprints(rows: &[(&str, &[(&str, f64)])]) -> Footprints {
        let mut fp = Footprints::default();
        for (text, vars) in rows {
            fp.live.insert(text.to_string(), live(vars));
        }
        fp
    }

    fn single_block(statements: &[&str], key: Vec<DepKey>) -> Blocks {
        let mut blocks = Blocks::default();
        let id = blocks
            .arena
            .alloc(key, statements.iter().map(|s| s.to_string()).collect());
        blocks.order = vec![id];
        blocks
    }

    #[test]
    fn whole_program_fits_on_one_node() {
        let blocks = single_block(&["xs = [1, 2, 3]"], Vec::new());
        let fp = footprints(&[("xs = [1, 2, 3]", &[("xs", 500.0)])]);
        let out = schedule(&blocks, &fp, &[node("N1", 1000.0)]);
        assert!(out.diagnostics.is_empty());
        assert_eq!(out.schedule.strategy, Strategy::WholeProgram);
        assert_eq!(out.schedule.entries.len(), 1);
        let entry = &out.schedule.entries[0];
        assert_eq!(entry.peak_memory, 500.0);
        assert_eq!(entry.assigned_node.as_deref(), Some("N1"));
        let placed = out.schedule.blocks.arena.block(entry.block);
        assert_eq!(placed.statements, vec!["xs = [1, 2, 3]".to_string()]);
    }

    #[test]
    fn dependent_blocks_merge_when_the_pair_fits() {
        // Whole-program fails because an unrelated binding (`tmp`) coexists
        // with the pair, but the context-aware merged peak ignores it.
        let mut blocks = Blocks::default();
        let b0 = blocks.arena.alloc(Vec::new(), vec!["x = load()".into()]);
        let b1 = blocks.arena.alloc(
            vec![DepKey::from_block("x", b0)],
            vec!["y = x + x".into()],
        );
        let b2 = blocks.arena.alloc(Vec::new(), vec!["tmp = spare()".into()]);
        blocks.order = vec![b0, b1, b2];

        let fp = footprints(&[
            ("x = load()", &[("x", 600.0)]),
            ("y = x + x", &[("x", 600.0), ("y", 300.0), ("tmp", 200.0)]),
            (
                "tmp = spare()",
                &[("x", 600.0), ("y", 300.0), ("tmp", 200.0)],
            ),
        ]);
        let nodes = [node("N1", 1000.0)];
        assert!(whole_program_peak(&fp) > 1000.0);

        let out = schedule(&blocks, &fp, &nodes);
        assert_eq!(out.schedule.strategy, Strategy::Consolidated);
        // The producer/consumer pair merged; `tmp`'s block would push the
        // run past capacity and stays separate.
        assert_eq!(out.schedule.entries.len(), 2);
        let merged = out.schedule.blocks.arena.block(out.schedule.entries[0].block);
        assert_eq!(
            merged.statements,
            vec!["x = load()".to_string(), "y = x + x".to_string()]
        );
        assert_eq!(out.schedule.entries[0].peak_memory, 900.0);
        assert_eq!(
            out.schedule.entries[0].assigned_node.as_deref(),
            Some("N1")
        );
        assert_eq!(
            out.schedule.entries[1].assigned_node.as_deref(),
            Some("N1")
        );

        let cert = certify(&out.schedule, &blocks, &fp, &nodes);
        assert!(cert.all_pass(), "{:?}", cert.obligations());
    }

    #[test]
    fn adjacent_schedulable_blocks_coalesce() {
        let mut blocks = Blocks::default();
        let b0 = blocks.arena.alloc(Vec::new(), vec!["a = build_a()".into()]);
        let b1 = blocks.arena.alloc(Vec::new(), vec!["b = build_b()".into()]);
        let b2 = blocks.arena.alloc(Vec::new(), vec!["c = build_c()".into()]);
        blocks.order = vec![b0, b1, b2];

        let fp = footprints(&[
            ("a = build_a()", &[("a", 300.0)]),
            ("b = build_b()", &[("a", 300.0), ("b", 300.0)]),
            (
                "c = build_c()",
                &[("a", 300.0), ("b", 300.0), ("c", 990.0)],
            ),
        ]);
        let nodes = [node("N1", 1000.0)];
        assert!(whole_program_peak(&fp) > 1000.0);

        let out = schedule(&blocks, &fp, &nodes);
        assert_eq!(out.schedule.entries.len(), 2);
        let first = out.schedule.blocks.arena.block(out.schedule.entries[0].block);
        assert_eq!(
            first.statements,
            vec!["a = build_a()".to_string(), "b = build_b()".to_string()]
        );
        assert_eq!(out.schedule.entries[0].peak_memory, 600.0);
        // Extending the run with `c` would reach 1590; it starts a new run.
        assert_eq!(out.schedule.entries[1].peak_memory, 990.0);
    }

    #[test]
    fn oversized_block_is_left_for_the_planner() {
        let blocks = single_block(&["huge = expand(seed)"], vec![DepKey::external("seed")]);
        let fp = footprints(&[("huge = expand(seed)", &[("seed", 100.0), ("huge", 5000.0)])]);
        let out = schedule(&blocks, &fp, &[node("N1", 1000.0)]);
        assert_eq!(out.schedule.entries.len(), 1);
        assert_eq!(out.schedule.entries[0].assigned_node, None);
        assert_eq!(out.schedule.unplaced().count(), 1);
    }

    #[test]
    fn empty_roster_is_an_error() {
        let blocks = single_block(&["a = 1"], Vec::new());
        let fp = footprints(&[("a = 1", &[("a", 28.0)])]);
        let out = schedule(&blocks, &fp, &[]);
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].code, Some(codes::E0300));
        assert!(out.schedule.entries.is_empty());
    }

    #[test]
    fn fitting_node_is_the_smallest_sufficient() {
        let nodes = [node("big", 2000.0), node("small", 700.0)];
        assert_eq!(cheapest_fit(&nodes, 600.0).unwrap().name, "small");
        assert_eq!(cheapest_fit(&nodes, 1500.0).unwrap().name, "big");
        assert!(cheapest_fit(&nodes, 2500.0).is_none());
        assert_eq!(largest(&nodes).unwrap().name, "big");
        assert_eq!(smallest(&nodes).unwrap().name, "small");
    }
}
