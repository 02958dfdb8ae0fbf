// End-to-end planning scenarios, through the library pipeline and the CLI.
//
// Covers:
// - whole-program placement on a single sufficient node
// - dependent blocks consolidating onto one node with no waits
// - growth-table sizing observed through the full pipeline
// - chunked parallelization when no node can hold a block
// - boundary-artifact loading, including opaque dependency keys
// - graceful stage skipping when an input artifact is missing

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

use parplan::ast::{Item, ListRhs, LoopIter, MutateOp, PrimExpr, PrimLit, Program, Rhs, Stmt, StmtKind};
use parplan::diag::codes;
use parplan::estimate::{Footprints, SizeModel, Trace, VarStat};
use parplan::group::{Blocks, DepKey};
use parplan::parallel::Status;
use parplan::pipeline::AnalysisState;
use parplan::schedule::{NodeSpec, Strategy};

// ── Fixture helpers ──

fn node(name: &str, memory: f64) -> NodeSpec {
    NodeSpec {
        name: name.into(),
        memory,
    }
}

fn stat(size: f64, length: Option<u64>) -> VarStat {
    VarStat { size, length }
}

fn snapshot(vars: &[(&str, VarStat)]) -> BTreeMap<String, VarStat> {
    vars.iter().map(|(n, s)| (n.to_string(), *s)).collect()
}

fn state_with(
    roster: Vec<NodeSpec>,
    blocks: Blocks,
    footprints: Footprints,
) -> AnalysisState {
    let mut state = AnalysisState::new(roster, SizeModel::default());
    state.blocks = Some(blocks);
    state.footprints = Some(footprints);
    state
}

// ── Scenario: one block, one sufficient node ──

#[test]
fn single_block_goes_whole_program_onto_the_node() {
    let mut blocks = Blocks::default();
    let id = blocks
        .arena
        .alloc(Vec::new(), vec!["data = build_table()".to_string()]);
    blocks.order.push(id);

    let mut footprints = Footprints::default();
    footprints.live.insert(
        "data = build_table()".into(),
        snapshot(&[("data", stat(500.0, Some(20)))]),
    );

    let mut state = state_with(vec![node("N1", 1000.0)], blocks, footprints);
    state.run_to(parplan::pass::PassId::Emit);

    assert!(!state.has_errors(), "diagnostics: {:?}", state.diagnostics);
    let schedule = state.schedule.as_ref().unwrap();
    assert_eq!(schedule.strategy, Strategy::WholeProgram);
    assert_eq!(schedule.entries.len(), 1);
    assert_eq!(schedule.entries[0].assigned_node.as_deref(), Some("N1"));
    assert_eq!(schedule.entries[0].peak_memory, 500.0);

    let docs = state.documents.as_ref().unwrap();
    assert!(docs.master.contains("on N1 peak=500"));
    let n1 = docs.render_node("N1");
    assert!(n1.contains("RUN data = build_table()"));
    assert!(!n1.contains("WAIT"));
}

// ── Scenario: two dependent blocks consolidate, no waits ──

#[test]
fn dependent_blocks_land_together_without_waits() {
    let mut blocks = Blocks::default();
    let b0 = blocks
        .arena
        .alloc(Vec::new(), vec!["x = load_rows()".to_string()]);
    let b1 = blocks.arena.alloc(
        vec![DepKey::from_block("x", b0)],
        vec!["y = refine(x)".to_string()],
    );
    blocks.order.push(b0);
    blocks.order.push(b1);

    let mut footprints = Footprints::default();
    footprints.live.insert(
        "x = load_rows()".into(),
        snapshot(&[("x", stat(600.0, Some(50)))]),
    );
    footprints.live.insert(
        "y = refine(x)".into(),
        snapshot(&[("x", stat(600.0, Some(50))), ("y", stat(300.0, Some(50)))]),
    );

    let mut state = state_with(vec![node("N1", 1000.0)], blocks, footprints);
    state.run_to(parplan::pass::PassId::Emit);

    assert!(!state.has_errors(), "diagnostics: {:?}", state.diagnostics);
    let schedule = state.schedule.as_ref().unwrap();
    assert_eq!(schedule.entries.len(), 1, "one consolidated block");
    assert_eq!(schedule.entries[0].assigned_node.as_deref(), Some("N1"));

    // Producer and consumer share the node, so nothing waits.
    let docs = state.documents.as_ref().unwrap();
    let n1 = docs.render_node("N1");
    assert!(n1.contains("RUN x = load_rows()"));
    assert!(n1.contains("RUN y = refine(x)"));
    assert!(!n1.contains("WAIT"));
    assert!(!docs.master.contains("wait"));
}

// ── Scenario: append-loop sizing matches a literal of the same length ──

#[test]
fn append_loop_and_literal_agree_through_the_pipeline() {
    let program = Program {
        name: None,
        items: vec![
            Item::Stmt(Stmt::new(StmtKind::Assign {
                target: "xs".into(),
                value: Rhs::List(ListRhs::Literal(Vec::new())),
            })),
            Item::Stmt(Stmt::new(StmtKind::Loop {
                var: "i".into(),
                iter: LoopIter::Range(PrimExpr::Lit(PrimLit::Int(10))),
                body: vec![Stmt::new(StmtKind::Mutate {
                    target: "xs".into(),
                    op: MutateOp::Append(PrimExpr::Lit(PrimLit::Int(7))),
                })],
            })),
            Item::Stmt(Stmt::new(StmtKind::Assign {
                target: "ys".into(),
                value: Rhs::List(ListRhs::Literal(
                    (0..10).map(|v| PrimExpr::Lit(PrimLit::Int(v))).collect(),
                )),
            })),
        ],
    };

    let mut state = AnalysisState::new(vec![node("N1", 100_000.0)], SizeModel::default());
    state.program = Some(program);
    state.run_all();
    assert!(!state.has_errors(), "diagnostics: {:?}", state.diagnostics);

    let footprints = state.footprints.as_ref().unwrap();
    let last = footprints.live_at("ys = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]").unwrap();
    // 10 × 28 + 56 + 8 × capacity(10), where the table rounds 10 up to 16.
    assert_eq!(last["xs"].size, 464.0);
    assert_eq!(last["ys"].size, 464.0);
    assert_eq!(last["xs"].length, Some(10));
    assert_eq!(last["ys"].length, Some(10));
}

// ── Scenario: an oversized call fans out in four chunks ──

#[test]
fn oversized_call_splits_into_four_chunks() {
    let statement = "y = f(data)";
    let mut blocks = Blocks::default();
    let id = blocks
        .arena
        .alloc(vec![DepKey::external("data")], vec![statement.to_string()]);
    blocks.order.push(id);

    let mut footprints = Footprints::default();
    footprints.live.insert(
        statement.into(),
        snapshot(&[("data", stat(32_000_000.0, Some(1_000_000)))]),
    );
    let mut trace = Trace::default();
    trace.record("total = 0", 8_000_000.0);
    footprints.traces.insert(statement.into(), trace);

    let mut state = state_with(vec![node("N1", 10_000_000.0)], blocks, footprints);
    state.run_to(parplan::pass::PassId::Emit);

    let schedule = state.schedule.as_ref().unwrap();
    assert_eq!(schedule.entries[0].assigned_node, None, "no node fits");

    let plan = state.plan.as_ref().unwrap();
    assert_eq!(plan.decisions.len(), 1);
    let decision = &plan.decisions[0];
    assert_eq!(decision.status, Status::Success);
    assert_eq!(decision.factor, Some(4));

    let chunks = &decision.chunks.as_ref().unwrap()["data"];
    let ranges: Vec<(u64, u64)> = chunks.iter().map(|c| (c.start, c.end)).collect();
    assert_eq!(
        ranges,
        vec![
            (0, 250_000),
            (250_000, 500_000),
            (500_000, 750_000),
            (750_000, 1_000_000),
        ]
    );

    let docs = state.documents.as_ref().unwrap();
    assert!(docs.master.contains("parallel factor=4"));
}

// ── Graceful skipping ──

#[test]
fn missing_front_artifacts_skip_but_still_report() {
    let mut state = AnalysisState::new(vec![node("N1", 1000.0)], SizeModel::default());
    state.run_all();

    assert!(state.has_errors());
    assert!(state
        .diagnostics
        .iter()
        .any(|d| d.code == Some(codes::E0500)));
    assert!(state.documents.is_none());
    assert!(state.schedule.is_none());
}

// ── CLI: boundary artifacts in, documents out ──

fn parplan_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_parplan"))
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("parplan-it-{}-{}", std::process::id(), tag));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn cli_plans_from_boundary_artifacts_and_warns_on_opaque_keys() {
    let dir = scratch_dir("cli");
    let roster = dir.join("nodes.json");
    let blocks = dir.join("blocks.json");
    let live = dir.join("live_vars.json");
    let traces = dir.join("footprints.json");
    let out = dir.join("out");

    std::fs::write(&roster, r#"[{"name": "N1", "memory": 1000.0}]"#).unwrap();
    std::fs::write(
        &blocks,
        r#"[{"key": ["data:none", "???"], "statements": ["x = crunch(data)"]}]"#,
    )
    .unwrap();
    std::fs::write(
        &live,
        r#"{"x = crunch(data)": {"data": {"size": 400.0, "length": 5}, "x": {"size": 100.0}}}"#,
    )
    .unwrap();
    std::fs::write(&traces, r#"{"x = crunch(data)": {"t = 0": 28.0}}"#).unwrap();

    let output = Command::new(parplan_binary())
        .arg("--roster")
        .arg(&roster)
        .arg("--blocks")
        .arg(&blocks)
        .arg("--live-vars")
        .arg(&live)
        .arg("--footprints")
        .arg(&traces)
        .arg("--out-dir")
        .arg(&out)
        .output()
        .expect("failed to run parplan");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        output.status.success(),
        "planning from boundary artifacts should succeed.\nstderr: {}",
        stderr
    );
    assert!(stderr.contains("W0100"), "stderr: {}", stderr);

    assert!(out.join("master_schedule.txt").exists());
    assert!(out.join("N1.txt").exists());
    let schedule_json = std::fs::read_to_string(out.join("consolidated_schedule.json")).unwrap();
    assert!(schedule_json.contains("provenance"));
    assert!(schedule_json.contains("x = crunch(data)"));
    let plan_json = std::fs::read_to_string(out.join("parallelization_plan.json")).unwrap();
    assert!(plan_json.contains("decisions"));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn cli_rejects_a_missing_roster() {
    let dir = scratch_dir("noroster");
    let output = Command::new(parplan_binary())
        .arg("--roster")
        .arg(dir.join("absent.json"))
        .output()
        .expect("failed to run parplan");

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"), "stderr: {}", stderr);

    std::fs::remove_dir_all(&dir).unwrap();
}
