// boundary.rs — Artifact reading and writing
//
// Everything that crosses the filesystem boundary lives here: the node
// roster, externally pre-extracted blocks, live-variable and footprint
// tables (all JSON), and the emitted plan documents. The analysis stages
// themselves never touch the disk, except for the estimator's `readlines`
// inspection.
//
// Preconditions: none; every reader validates its own input.
// Postconditions: written artifacts carry a provenance record (tool,
//                 version, input digest).
// Failure modes: I/O and JSON errors are wrapped with the offending path;
//                unparseable dependency keys are kept verbatim and warned
//                about, never dropped.
// Side effects: file reads and writes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::ast::Program;
use crate::ddg::Ddg;
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::emit::PlanDocuments;
use crate::error::PlanError;
use crate::estimate::{Footprints, SizeModel, Trace, VarStat};
use crate::extract::Units;
use crate::group::{Block, Blocks, DepKey};
use crate::parallel::ParallelPlan;
use crate::schedule::{effective_key, NodeSpec, Schedule};

// ── Reading ──

fn read_bytes(path: &Path) -> Result<Vec<u8>, PlanError> {
    fs::read(path).map_err(|source| PlanError::IoError {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T, PlanError> {
    serde_json::from_slice(bytes).map_err(|source| PlanError::JsonError {
        path: path.to_path_buf(),
        source,
    })
}

/// Node roster: a JSON array of `{name, memory}` records.
pub fn read_roster(path: &Path) -> Result<Vec<NodeSpec>, PlanError> {
    let bytes = read_bytes(path)?;
    parse_json(path, &bytes)
}

/// A parsed program document (the front end's output).
pub fn read_program(path: &Path) -> Result<Program, PlanError> {
    let bytes = read_bytes(path)?;
    parse_json(path, &bytes)
}

/// Size-model override; absent fields keep their defaults.
pub fn read_size_model(path: &Path) -> Result<SizeModel, PlanError> {
    let bytes = read_bytes(path)?;
    parse_json(path, &bytes)
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    key: Vec<String>,
    statements: Vec<String>,
}

/// Pre-extracted blocks: a JSON array of `{key: ["var:index|none", …],
/// statements: […]}`. Keys that do not parse are kept opaque and warned
/// about — dropping one could silently lose a real dependency.
pub fn read_blocks(path: &Path) -> Result<(Blocks, Vec<Diagnostic>), PlanError> {
    let bytes = read_bytes(path)?;
    let raw: Vec<RawBlock> = parse_json(path, &bytes)?;

    let mut blocks = Blocks::default();
    let mut diagnostics = Vec::new();
    for entry in raw {
        let key: Vec<DepKey> = entry.key.iter().map(|s| DepKey::parse(s)).collect();
        for (parsed, raw_key) in key.iter().zip(&entry.key) {
            if parsed.is_opaque() {
                diagnostics.push(
                    Diagnostic::new(
                        DiagLevel::Warning,
                        format!("dependency key `{}` does not parse; kept verbatim", raw_key),
                    )
                    .with_code(codes::W0100)
                    .with_statement(entry.statements.first().cloned().unwrap_or_default()),
                );
            }
        }
        let id = blocks.arena.alloc(key, entry.statements);
        blocks.order.push(id);
    }
    Ok((blocks, diagnostics))
}

/// Live-variable table: statement text → variable → `{size, length?}`.
pub fn read_live_vars(
    path: &Path,
) -> Result<BTreeMap<String, BTreeMap<String, VarStat>>, PlanError> {
    let bytes = read_bytes(path)?;
    parse_json(path, &bytes)
}

/// Function footprint table: call-site key → ordered line → cumulative
/// size. Read through `serde_json::Map` so the on-disk entry order (the
/// execution order) survives.
pub fn read_traces(path: &Path) -> Result<BTreeMap<String, Trace>, PlanError> {
    let bytes = read_bytes(path)?;
    let raw: serde_json::Map<String, Value> = parse_json(path, &bytes)?;

    let mut traces = BTreeMap::new();
    for (statement, value) in raw {
        let Value::Object(lines) = value else {
            return Err(PlanError::JsonError {
                path: path.to_path_buf(),
                source: serde_json::Error::custom(format!(
                    "trace for `{}` is not an object",
                    statement
                )),
            });
        };
        let mut trace = Trace::default();
        for (line, cumulative) in lines {
            let Some(size) = cumulative.as_f64() else {
                return Err(PlanError::JsonError {
                    path: path.to_path_buf(),
                    source: serde_json::Error::custom(format!(
                        "trace entry `{}` of `{}` is not a number",
                        line, statement
                    )),
                });
            };
            trace.record(&line, size);
        }
        traces.insert(statement, trace);
    }
    Ok(traces)
}

/// Join boundary-loaded tables into the estimator's artifact shape.
pub fn assemble_footprints(
    live: BTreeMap<String, BTreeMap<String, VarStat>>,
    traces: BTreeMap<String, Trace>,
) -> Footprints {
    Footprints { live, traces }
}

/// Convert a load failure into the pipeline's diagnostic form: a missing
/// file is a missing artifact, anything else is a malformed one.
pub fn load_diagnostic(err: &PlanError, what: &str) -> Diagnostic {
    let code = match err {
        PlanError::IoError { source, .. }
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            codes::E0500
        }
        _ => codes::E0501,
    };
    Diagnostic::new(DiagLevel::Error, format!("cannot load {}: {}", what, err)).with_code(code)
}

// ── Provenance ──

/// Stamped into every machine-readable output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub tool: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_digest: Option<String>,
}

impl Provenance {
    pub fn new(input_digest: Option<String>) -> Self {
        Provenance {
            tool: "parplan",
            version: env!("CARGO_PKG_VERSION"),
            input_digest,
        }
    }
}

/// Hex SHA-256 of an input document.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    let mut hex = String::with_capacity(out.len() * 2);
    for byte in out {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Digest of a file's bytes, when readable.
pub fn digest_file(path: &Path) -> Option<String> {
    fs::read(path).ok().map(|bytes| digest(&bytes))
}

// ── Writing ──

fn write_file(path: &Path, contents: &[u8]) -> Result<(), PlanError> {
    fs::write(path, contents).map_err(|source| PlanError::IoError {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PlanError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| PlanError::JsonError {
        path: path.to_path_buf(),
        source,
    })?;
    write_file(path, &bytes)
}

fn ensure_dir(dir: &Path) -> Result<(), PlanError> {
    fs::create_dir_all(dir).map_err(|source| PlanError::IoError {
        path: dir.to_path_buf(),
        source,
    })
}

fn node_file_name(node: &str) -> String {
    let safe: String = node
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.txt", safe)
}

/// Extracted units, recorded for inspection.
pub fn write_units(dir: &Path, units: &Units) -> Result<PathBuf, PlanError> {
    ensure_dir(dir)?;
    let path = dir.join("units.json");
    write_json(&path, units)?;
    Ok(path)
}

/// Per-unit dependency graphs.
pub fn write_graph(dir: &Path, ddg: &Ddg) -> Result<PathBuf, PlanError> {
    ensure_dir(dir)?;
    let path = dir.join("dependency_graph.json");
    write_json(&path, ddg)?;
    Ok(path)
}

/// Estimator output as the two boundary tables: each file is re-loadable
/// through the matching `--live-vars` / `--footprints` flag.
pub fn write_footprints(dir: &Path, footprints: &Footprints) -> Result<Vec<PathBuf>, PlanError> {
    ensure_dir(dir)?;
    let live = dir.join("live_vars.json");
    write_json(&live, &footprints.live)?;
    let traces = dir.join("footprints.json");
    write_json(&traces, &footprints.traces)?;
    Ok(vec![live, traces])
}

/// Live blocks in readiness order, keys in wire form. Re-loadable through
/// `--blocks` (the `id` field is ignored on the way back in).
pub fn write_blocks(dir: &Path, blocks: &Blocks) -> Result<PathBuf, PlanError> {
    ensure_dir(dir)?;
    let live: Vec<&Block> = blocks.live().collect();
    let path = dir.join("blocks.json");
    write_json(&path, &live)?;
    Ok(path)
}

/// Write the master timeline and one instruction document per node.
/// Returns the written paths.
pub fn write_documents(dir: &Path, documents: &PlanDocuments) -> Result<Vec<PathBuf>, PlanError> {
    ensure_dir(dir)?;
    let mut written = Vec::new();

    let master = dir.join("master_schedule.txt");
    write_file(&master, documents.master.as_bytes())?;
    written.push(master);

    for node in documents.per_node.keys() {
        let path = dir.join(node_file_name(node));
        write_file(&path, documents.render_node(node).as_bytes())?;
        written.push(path);
    }
    Ok(written)
}

#[derive(Serialize)]
struct ScheduleDoc<'a> {
    provenance: &'a Provenance,
    strategy: crate::schedule::Strategy,
    entries: Vec<ScheduleEntryDoc>,
}

#[derive(Serialize)]
struct ScheduleEntryDoc {
    block: u32,
    peak_memory: f64,
    assigned_node: Option<String>,
    statements: Vec<String>,
    key: Vec<String>,
}

/// Machine-readable consolidated schedule.
pub fn write_schedule(
    dir: &Path,
    schedule: &Schedule,
    provenance: &Provenance,
) -> Result<PathBuf, PlanError> {
    ensure_dir(dir)?;
    let entries = schedule
        .entries
        .iter()
        .map(|entry| {
            let block = schedule.blocks.arena.block(entry.block);
            ScheduleEntryDoc {
                block: entry.block.0,
                peak_memory: entry.peak_memory,
                assigned_node: entry.assigned_node.clone(),
                statements: block.statements.clone(),
                key: effective_key(block, &schedule.blocks.arena)
                    .iter()
                    .map(DepKey::to_string)
                    .collect(),
            }
        })
        .collect();
    let doc = ScheduleDoc {
        provenance,
        strategy: schedule.strategy,
        entries,
    };

    let path = dir.join("consolidated_schedule.json");
    write_json(&path, &doc)?;
    Ok(path)
}

#[derive(Serialize)]
struct PlanDoc<'a> {
    provenance: &'a Provenance,
    #[serde(flatten)]
    plan: &'a ParallelPlan,
}

/// Machine-readable parallelization plan.
pub fn write_plan(
    dir: &Path,
    plan: &ParallelPlan,
    provenance: &Provenance,
) -> Result<PathBuf, PlanError> {
    ensure_dir(dir)?;
    let doc = PlanDoc { provenance, plan };
    let path = dir.join("parallelization_plan.json");
    write_json(&path, &doc)?;
    Ok(path)
}
