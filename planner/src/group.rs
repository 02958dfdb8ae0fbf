// group.rs — Need-set grouping and wait-key assignment
//
// Buckets the entry sequence's statements by dependency signature: two
// statements land in the same block exactly when they need the same
// variables from the same producers. Each block's key names, per needed
// variable, the block that produces it (or marks it external).
//
// Preconditions: a dependency graph containing the entry unit.
// Postconditions: every entry statement appears in exactly one block; no
//                 block waits on itself; the emitted order is a readiness
//                 hint only — the scheduler is the authority on placement.
// Failure modes: none; an absent or empty entry graph yields no blocks.
// Side effects: none.
//
// Blocks live in an arena and keep their identifier for the lifetime of
// the analysis. Merging never renumbers: a retired block forwards to its
// successor and keys are resolved through the forwarding map on read.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ddg::Ddg;
use crate::diag::Diagnostic;
use crate::id::{BlockId, LineId};
use crate::pass::StageCert;

// ── Dependency keys ──

/// Where a needed variable comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DepSource {
    /// No producer in this unit; satisfiable without waiting.
    External,
    Block(BlockId),
}

/// One entry of a block's wait key. `Opaque` preserves a key string from an
/// external artifact that does not parse as `var:index|none` — kept verbatim
/// so a real dependency is never silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DepKey {
    Dep { variable: String, source: DepSource },
    Opaque(String),
}

impl DepKey {
    pub fn external(variable: impl Into<String>) -> Self {
        DepKey::Dep {
            variable: variable.into(),
            source: DepSource::External,
        }
    }

    pub fn from_block(variable: impl Into<String>, block: BlockId) -> Self {
        DepKey::Dep {
            variable: variable.into(),
            source: DepSource::Block(block),
        }
    }

    /// Parse the `var:index|none` wire form; anything else is kept opaque.
    pub fn parse(raw: &str) -> DepKey {
        let Some((var, source)) = raw.split_once(':') else {
            return DepKey::Opaque(raw.to_string());
        };
        let ident = !var.is_empty()
            && !var.starts_with(|c: char| c.is_ascii_digit())
            && var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !ident {
            return DepKey::Opaque(raw.to_string());
        }
        if source == "none" {
            return DepKey::external(var);
        }
        match source.parse::<u32>() {
            Ok(index) => DepKey::from_block(var, BlockId(index)),
            Err(_) => DepKey::Opaque(raw.to_string()),
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, DepKey::Opaque(_))
    }

    pub fn variable(&self) -> Option<&str> {
        match self {
            DepKey::Dep { variable, .. } => Some(variable),
            DepKey::Opaque(_) => None,
        }
    }

    pub fn source_block(&self) -> Option<BlockId> {
        match self {
            DepKey::Dep {
                source: DepSource::Block(id),
                ..
            } => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for DepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepKey::Dep {
                variable,
                source: DepSource::External,
            } => write!(f, "{}:none", variable),
            DepKey::Dep {
                variable,
                source: DepSource::Block(id),
            } => write!(f, "{}:{}", variable, id.0),
            DepKey::Opaque(raw) => write!(f, "{}", raw),
        }
    }
}

// Keys cross the artifact boundary in their wire form.
impl Serialize for DepKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DepKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(DepKey::parse(&raw))
    }
}

// ── Blocks and the arena ──

/// A set of statements scheduled as a unit, plus the wait key that names
/// every variable it still needs from outside.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub id: BlockId,
    /// Sorted, deduplicated.
    pub key: Vec<DepKey>,
    pub statements: Vec<String>,
}

impl Block {
    /// Live blocks this one waits on, resolved through the forwarding map.
    /// Self-references (keys satisfied by an earlier merge) are dropped.
    pub fn wait_sources(&self, arena: &BlockArena) -> Vec<BlockId> {
        let mut sources = Vec::new();
        for key in &self.key {
            if let Some(id) = key.source_block() {
                let live = arena.resolve(id);
                if live != self.id && !sources.contains(&live) {
                    sources.push(live);
                }
            }
        }
        sources
    }

    /// Variables the key marks as produced by another block, with their
    /// resolved source.
    pub fn waited_variables(&self, arena: &BlockArena) -> Vec<(String, BlockId)> {
        let mut out = Vec::new();
        for key in &self.key {
            if let (Some(var), Some(id)) = (key.variable(), key.source_block()) {
                let live = arena.resolve(id);
                if live != self.id {
                    out.push((var.to_string(), live));
                }
            }
        }
        out
    }

    pub fn key_variables(&self) -> BTreeSet<String> {
        self.key
            .iter()
            .filter_map(|k| k.variable().map(str::to_string))
            .collect()
    }
}

/// Owns every block ever created. Identifiers are permanent: a merge
/// retires its constituents and records a forward to the successor instead
/// of rewriting other blocks' keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockArena {
    blocks: Vec<Block>,
    forwards: BTreeMap<BlockId, BlockId>,
}

impl BlockArena {
    pub fn alloc(&mut self, key: Vec<DepKey>, statements: Vec<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let mut key = key;
        key.sort();
        key.dedup();
        self.blocks.push(Block {
            id,
            key,
            statements,
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn contains(&self, id: BlockId) -> bool {
        (id.0 as usize) < self.blocks.len()
    }

    pub fn is_live(&self, id: BlockId) -> bool {
        self.contains(id) && !self.forwards.contains_key(&id)
    }

    /// Follow forwards to the block that currently owns `id`'s statements.
    /// Unknown identifiers resolve to themselves.
    pub fn resolve(&self, id: BlockId) -> BlockId {
        let mut current = id;
        while let Some(next) = self.forwards.get(&current) {
            current = *next;
        }
        current
    }

    pub fn retire(&mut self, old: BlockId, into: BlockId) {
        debug_assert!(old != into);
        self.forwards.insert(old, into);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Grouping output: the arena plus the readiness-ordered live blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Blocks {
    pub arena: BlockArena,
    pub order: Vec<BlockId>,
}

impl Blocks {
    pub fn live(&self) -> impl Iterator<Item = &Block> {
        self.order.iter().map(|id| self.arena.block(*id))
    }

    pub fn statement_count(&self) -> usize {
        self.live().map(|b| b.statements.len()).sum()
    }
}

#[derive(Debug)]
pub struct GroupResult {
    pub blocks: Blocks,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Grouping ──

type NeedSig = BTreeSet<(String, Option<LineId>)>;

pub fn group(ddg: &Ddg) -> GroupResult {
    let mut blocks = Blocks::default();
    let Some(graph) = ddg.entry() else {
        return GroupResult {
            blocks,
            diagnostics: Vec::new(),
        };
    };

    // Bucket statements by (variable, producer line) signature, preserving
    // first-occurrence order.
    let mut sig_index: BTreeMap<NeedSig, usize> = BTreeMap::new();
    let mut protos: Vec<(NeedSig, Vec<&crate::ddg::Statement>)> = Vec::new();
    for stmt in &graph.statements {
        let sig: NeedSig = stmt
            .needs
            .iter()
            .map(|var| (var.clone(), graph.producer_of(var, stmt.line)))
            .collect();
        match sig_index.get(&sig) {
            Some(&i) => protos[i].1.push(stmt),
            None => {
                sig_index.insert(sig.clone(), protos.len());
                protos.push((sig, vec![stmt]));
            }
        }
    }

    // Allocate identifiers in formation order, then translate producer
    // lines to the blocks that contain them.
    let mut line_block: BTreeMap<LineId, BlockId> = BTreeMap::new();
    for (_, stmts) in &protos {
        let id = blocks
            .arena
            .alloc(Vec::new(), stmts.iter().map(|s| s.text.clone()).collect());
        for stmt in stmts {
            line_block.insert(stmt.line, id);
        }
    }
    let mut first_lines: BTreeMap<BlockId, LineId> = BTreeMap::new();
    for (i, (sig, stmts)) in protos.iter().enumerate() {
        let id = BlockId(i as u32);
        let key: Vec<DepKey> = sig
            .iter()
            .map(|(var, producer)| match producer.and_then(|p| line_block.get(&p)) {
                Some(source) => DepKey::from_block(var.clone(), *source),
                None => DepKey::external(var.clone()),
            })
            .collect();
        blocks.arena.block_mut(id).key = {
            let mut key = key;
            key.sort();
            key.dedup();
            key
        };
        first_lines.insert(id, stmts[0].line);
    }

    blocks.order = readiness_order(&blocks.arena, &first_lines);
    GroupResult {
        blocks,
        diagnostics: Vec::new(),
    }
}

/// Starting order for the scheduler: ready blocks first by source position,
/// then blocks waiting on a single producer by that producer's position,
/// then multi-need blocks by need count and rendered key.
fn readiness_order(arena: &BlockArena, first_lines: &BTreeMap<BlockId, LineId>) -> Vec<BlockId> {
    let mut ids: Vec<BlockId> = (0..arena.len() as u32).map(BlockId).collect();
    ids.sort_by_key(|id| {
        let block = arena.block(*id);
        let first = first_lines.get(id).map(|l| l.0 as u64).unwrap_or(u64::MAX);
        let waited: Vec<BlockId> = block.key.iter().filter_map(DepKey::source_block).collect();
        if waited.is_empty() {
            (0u8, first, 0u64, String::new())
        } else if block.key.len() == 1 {
            (1, waited[0].0 as u64, first, String::new())
        } else {
            let rendered = block
                .key
                .iter()
                .map(DepKey::to_string)
                .collect::<Vec<_>>()
                .join(";");
            (2, block.key.len() as u64, 0, rendered)
        }
    });
    ids
}

// ── Certification ──

/// Structural obligations of a grouped block set.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupCert {
    /// Every entry statement appears in exactly one live block.
    pub conservation: bool,
    /// Every block-sourced key resolves to a live block in the order.
    pub key_closure: bool,
    /// No block waits on itself.
    pub no_self_wait: bool,
}

impl StageCert for GroupCert {
    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("statement-conservation", self.conservation),
            ("key-closure", self.key_closure),
            ("no-self-wait", self.no_self_wait),
        ]
    }
}

pub fn certify(ddg: &Ddg, blocks: &Blocks) -> GroupCert {
    let mut grouped: BTreeMap<&str, usize> = BTreeMap::new();
    for block in blocks.live() {
        for text in &block.statements {
            *grouped.entry(text.as_str()).or_default() += 1;
        }
    }
    let conservation = match ddg.entry() {
        Some(graph) => {
            let mut expected: BTreeMap<&str, usize> = BTreeMap::new();
            for stmt in &graph.statements {
                *expected.entry(stmt.text.as_str()).or_default() += 1;
            }
            expected == grouped
        }
        None => grouped.is_empty(),
    };

    let mut key_closure = true;
    let mut no_self_wait = true;
    for block in blocks.live() {
        for source in block.wait_sources(&blocks.arena) {
            if !blocks.order.contains(&source) {
                key_closure = false;
            }
            if source == block.id {
                no_self_wait = false;
            }
        }
    }

    GroupCert {
        conservation,
        key_closure,
        no_self_wait,
    }
}
