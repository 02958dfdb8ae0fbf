// ddg.rs — Data-dependency graph construction
//
// Builds one graph per unit: statements with their produced (`has`) and
// consumed (`needs`) variable sets, and edges from each consumed variable's
// most recent producer to the consumer. Function graphs are prefixed with a
// synthetic parameter-binding statement at line 0 so parameter reads resolve
// like any other dependency.
//
// Preconditions: extracted `Units`.
// Postconditions: edges are unique per (producer, consumer) pair, variable
//                 sets accumulated; statements keep source order.
// Failure modes: none — a need with no producer is simply left without an
//                edge (an external input for grouping purposes).
//
// Loops are not unrolled: a loop statement's has/needs aggregate its whole
// body, so cross-iteration dependencies are approximated by a single node.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ast::{
    self, ExtendSource, ListOperand, ListRhs, LoopIter, MutateOp, PrimExpr, ReturnValue, Rhs,
    Stmt, StmtKind,
};
use crate::diag::Diagnostic;
use crate::extract::{FunctionUnit, Units, ENTRY_UNIT};
use crate::id::LineId;
use crate::pass::StageCert;

// ── Graph model ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub line: LineId,
    pub text: String,
    pub has: BTreeSet<String>,
    pub needs: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub producer: LineId,
    pub consumer: LineId,
    pub variables: BTreeSet<String>,
}

/// The dependency graph of one unit (a function body or the entry sequence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitGraph {
    pub unit: String,
    pub statements: Vec<Statement>,
    pub edges: Vec<DependencyEdge>,
    /// The returned identifier, for function units.
    pub output: Option<String>,
}

impl UnitGraph {
    pub fn statement(&self, line: LineId) -> Option<&Statement> {
        self.statements.iter().find(|s| s.line == line)
    }

    /// The most recent producer line of `var` before `consumer`, if any.
    pub fn producer_of(&self, var: &str, consumer: LineId) -> Option<LineId> {
        self.edges
            .iter()
            .find(|e| e.consumer == consumer && e.variables.contains(var))
            .map(|e| e.producer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ddg {
    /// Function graphs in declaration order, then the entry graph.
    pub graphs: Vec<UnitGraph>,
}

impl Ddg {
    pub fn unit(&self, name: &str) -> Option<&UnitGraph> {
        self.graphs.iter().find(|g| g.unit == name)
    }

    pub fn entry(&self) -> Option<&UnitGraph> {
        self.unit(ENTRY_UNIT)
    }
}

#[derive(Debug)]
pub struct DdgResult {
    pub ddg: Ddg,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Construction ──

pub fn build(units: &Units) -> DdgResult {
    let mut graphs = Vec::with_capacity(units.functions.len() + 1);
    for func in &units.functions {
        graphs.push(build_function_graph(func));
    }
    graphs.push(build_unit_graph(
        ENTRY_UNIT,
        &units.entry,
        LineId(1),
        Vec::new(),
    ));
    DdgResult {
        ddg: Ddg { graphs },
        diagnostics: Vec::new(),
    }
}

fn build_function_graph(func: &FunctionUnit) -> UnitGraph {
    // Parameters enter the graph as a synthetic producer at line 0.
    let binder = Statement {
        line: LineId(0),
        text: ast::def_header(&func.name, &func.params),
        has: func.params.iter().cloned().collect(),
        needs: BTreeSet::new(),
    };
    build_unit_graph(&func.name, &func.body, LineId(1), vec![binder])
}

fn build_unit_graph(unit: &str, body: &[Stmt], first: LineId, prefix: Vec<Statement>) -> UnitGraph {
    let mut statements = prefix;
    for (offset, stmt) in body.iter().enumerate() {
        let line = LineId(first.0 + offset as u32);
        let (has, needs) = has_needs(stmt);
        statements.push(Statement {
            line,
            text: stmt.to_string(),
            has,
            needs,
        });
    }

    let output = body.iter().find_map(|s| match &s.kind {
        StmtKind::Return(v) => Some(v.var().to_string()),
        _ => None,
    });

    // One edge per (producer, consumer) pair; variable sets accumulate.
    let mut last_producer: BTreeMap<String, LineId> = BTreeMap::new();
    let mut edge_vars: BTreeMap<(LineId, LineId), BTreeSet<String>> = BTreeMap::new();
    for stmt in &statements {
        for need in &stmt.needs {
            if let Some(&producer) = last_producer.get(need) {
                edge_vars
                    .entry((producer, stmt.line))
                    .or_default()
                    .insert(need.clone());
            }
        }
        for var in &stmt.has {
            last_producer.insert(var.clone(), stmt.line);
        }
    }
    let edges = edge_vars
        .into_iter()
        .map(|((producer, consumer), variables)| DependencyEdge {
            producer,
            consumer,
            variables,
        })
        .collect();

    UnitGraph {
        unit: unit.to_string(),
        statements,
        edges,
        output,
    }
}

// ── has / needs ──

/// Produced and consumed variable sets of one statement.
pub fn has_needs(stmt: &Stmt) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut has = BTreeSet::new();
    let mut needs = BTreeSet::new();
    match &stmt.kind {
        StmtKind::Assign { target, value } => {
            has.insert(target.clone());
            rhs_reads(value, &mut needs);
        }
        StmtKind::Call { target, args, .. } => {
            has.insert(target.clone());
            needs.extend(args.iter().cloned());
        }
        StmtKind::Mutate { target, op } => {
            needs.insert(target.clone());
            mutate_reads(op, &mut needs);
        }
        StmtKind::Delete { target, index } => {
            needs.insert(target.clone());
            if let Some(ast::DeleteIndex::Slice(spec)) = index {
                slice_reads(spec, &mut needs);
            }
        }
        StmtKind::Return(value) => {
            needs.insert(value.var().to_string());
            if let ReturnValue::Slice { spec, .. } = value {
                slice_reads(spec, &mut needs);
            }
        }
        StmtKind::Conditional { arms } => {
            for arm in arms {
                if let Some(cond) = &arm.cond {
                    expr_reads(cond, &mut needs);
                }
            }
            // One approximate has/needs pair for the whole chain.
            for arm in arms {
                collect_block(&arm.body, &mut has, &mut needs);
            }
        }
        StmtKind::Loop { var, iter, body } => {
            match iter {
                LoopIter::Range(count) => expr_reads(count, &mut needs),
                LoopIter::Var(xs) => {
                    needs.insert(xs.clone());
                }
                LoopIter::Slice { src, spec } => {
                    needs.insert(src.clone());
                    slice_reads(spec, &mut needs);
                }
            }
            has.insert(var.clone());
            collect_block(body, &mut has, &mut needs);
            needs.remove(var);
        }
    }
    (has, needs)
}

fn collect_block(body: &[Stmt], has: &mut BTreeSet<String>, needs: &mut BTreeSet<String>) {
    for stmt in body {
        let (h, n) = has_needs(stmt);
        has.extend(h);
        needs.extend(n);
    }
}

fn rhs_reads(rhs: &Rhs, out: &mut BTreeSet<String>) {
    match rhs {
        Rhs::Prim(e) => expr_reads(e, out),
        Rhs::List(list) => list_reads(list, out),
    }
}

fn list_reads(list: &ListRhs, out: &mut BTreeSet<String>) {
    match list {
        ListRhs::Literal(elems) => {
            for e in elems {
                expr_reads(e, out);
            }
        }
        ListRhs::CopyOf(v) => {
            out.insert(v.clone());
        }
        ListRhs::Concat(a, b) => {
            operand_reads(a, out);
            operand_reads(b, out);
        }
        ListRhs::Repeat { elems, count } => {
            for e in elems {
                expr_reads(e, out);
            }
            expr_reads(count, out);
        }
        ListRhs::Comprehension { elem, count } => {
            expr_reads(elem, out);
            expr_reads(count, out);
        }
        ListRhs::Slice { src, spec } => {
            out.insert(src.clone());
            slice_reads(spec, out);
        }
        ListRhs::Index { src, .. } => {
            out.insert(src.clone());
        }
        ListRhs::ReadLines { path } => expr_reads(path, out),
    }
}

fn operand_reads(op: &ListOperand, out: &mut BTreeSet<String>) {
    match op {
        ListOperand::Literal(elems) => {
            for e in elems {
                expr_reads(e, out);
            }
        }
        ListOperand::Var(v) => {
            out.insert(v.clone());
        }
    }
}

fn mutate_reads(op: &MutateOp, out: &mut BTreeSet<String>) {
    match op {
        MutateOp::Append(e) | MutateOp::Remove(e) => expr_reads(e, out),
        MutateOp::Insert { value, .. } => expr_reads(value, out),
        MutateOp::Extend(ExtendSource::Var(v)) => {
            out.insert(v.clone());
        }
        MutateOp::Extend(ExtendSource::Literal(elems)) => {
            for e in elems {
                expr_reads(e, out);
            }
        }
        MutateOp::Pop | MutateOp::Clear | MutateOp::Reverse | MutateOp::Sort => {}
    }
}

fn slice_reads(spec: &ast::SliceSpec, out: &mut BTreeSet<String>) {
    for bound in [&spec.lower, &spec.upper, &spec.step] {
        if let ast::Bound::Dynamic(name) = bound {
            out.insert(name.clone());
        }
    }
}

fn expr_reads(expr: &PrimExpr, out: &mut BTreeSet<String>) {
    match expr {
        PrimExpr::Lit(_) => {}
        PrimExpr::Var(v) | PrimExpr::Len(v) => {
            out.insert(v.clone());
        }
        PrimExpr::Bin { lhs, rhs, .. } => {
            expr_reads(lhs, out);
            expr_reads(rhs, out);
        }
        PrimExpr::Cast { arg, .. } => expr_reads(arg, out),
        PrimExpr::Elem { src, indices } => {
            out.insert(src.clone());
            for ix in indices {
                expr_reads(ix, out);
            }
        }
        PrimExpr::Query { src, arg, .. } => {
            out.insert(src.clone());
            expr_reads(arg, out);
        }
    }
}

// ── Certificate ──

/// Machine-checkable postconditions of graph construction.
#[derive(Debug, Clone, Copy)]
pub struct GraphCert {
    /// Every consumed variable with an earlier producer has an edge from the
    /// most recent such producer.
    pub edge_completeness: bool,
    /// Every edge's variable set is contained in producer.has ∩ consumer.needs.
    pub edge_soundness: bool,
}

impl StageCert for GraphCert {
    fn all_pass(&self) -> bool {
        self.edge_completeness && self.edge_soundness
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("edge-completeness", self.edge_completeness),
            ("edge-soundness", self.edge_soundness),
        ]
    }
}

pub fn certify(ddg: &Ddg) -> GraphCert {
    let mut completeness = true;
    let mut soundness = true;
    for graph in &ddg.graphs {
        for (i, stmt) in graph.statements.iter().enumerate() {
            for need in &stmt.needs {
                let latest = graph.statements[..i]
                    .iter()
                    .rev()
                    .find(|p| p.has.contains(need))
                    .map(|p| p.line);
                if let Some(expected) = latest {
                    if graph.producer_of(need, stmt.line) != Some(expected) {
                        completeness = false;
                    }
                }
            }
        }
        for edge in &graph.edges {
            let producer = graph.statement(edge.producer);
            let consumer = graph.statement(edge.consumer);
            match (producer, consumer) {
                (Some(p), Some(c)) => {
                    if !edge
                        .variables
                        .iter()
                        .all(|v| p.has.contains(v) && c.needs.contains(v))
                    {
                        soundness = false;
                    }
                }
                _ => soundness = false,
            }
        }
    }
    GraphCert {
        edge_completeness: completeness,
        edge_soundness: soundness,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Bound, CondArm, NumOp, PrimLit, SliceSpec};
    use crate::extract::FunctionUnit;

    fn assign(target: &str, value: Rhs) -> Stmt {
        Stmt::new(StmtKind::Assign {
            target: target.into(),
            value,
        })
    }

    fn int(v: i64) -> PrimExpr {
        PrimExpr::Lit(PrimLit::Int(v))
    }

    fn var(name: &str) -> PrimExpr {
        PrimExpr::Var(name.into())
    }

    fn add(lhs: PrimExpr, rhs: PrimExpr) -> PrimExpr {
        PrimExpr::Bin {
            op: NumOp::Add,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn entry_units(stmts: Vec<Stmt>) -> Units {
        Units {
            file_name: None,
            functions: Vec::new(),
            entry: stmts,
        }
    }

    fn edge<'a>(g: &'a UnitGraph, producer: u32, consumer: u32) -> Option<&'a DependencyEdge> {
        g.edges
            .iter()
            .find(|e| e.producer == LineId(producer) && e.consumer == LineId(consumer))
    }

    #[test]
    fn links_to_most_recent_producer() {
        // x = 1; x = 2; y = x
        let units = entry_units(vec![
            assign("x", Rhs::Prim(int(1))),
            assign("x", Rhs::Prim(int(2))),
            assign("y", Rhs::Prim(var("x"))),
        ]);
        let g = build(&units).ddg;
        let g = g.entry().unwrap();
        assert!(edge(g, 1, 3).is_none());
        let e = edge(g, 2, 3).unwrap();
        assert!(e.variables.contains("x"));
    }

    #[test]
    fn shared_pair_accumulates_one_edge() {
        // xs = [1, 2]; s = xs[0] + len(xs)
        let units = entry_units(vec![
            assign("xs", Rhs::List(ListRhs::Literal(vec![int(1), int(2)]))),
            assign(
                "s",
                Rhs::Prim(add(
                    PrimExpr::Elem {
                        src: "xs".into(),
                        indices: vec![int(0)],
                    },
                    PrimExpr::Len("xs".into()),
                )),
            ),
        ]);
        let g = build(&units).ddg;
        let g = g.entry().unwrap();
        assert_eq!(g.edges.len(), 1);
        assert_eq!(
            edge(g, 1, 2).unwrap().variables,
            BTreeSet::from(["xs".to_string()])
        );
    }

    #[test]
    fn mutation_consumes_without_producing() {
        // xs = [1]; xs.append(2); ys = xs[0:]
        let units = entry_units(vec![
            assign("xs", Rhs::List(ListRhs::Literal(vec![int(1)]))),
            Stmt::new(StmtKind::Mutate {
                target: "xs".into(),
                op: MutateOp::Append(int(2)),
            }),
            assign(
                "ys",
                Rhs::List(ListRhs::Slice {
                    src: "xs".into(),
                    spec: SliceSpec {
                        lower: Bound::Known(0),
                        upper: Bound::Absent,
                        step: Bound::Absent,
                    },
                }),
            ),
        ]);
        let g = build(&units).ddg;
        let g = g.entry().unwrap();
        // The append waits on the literal; the slice still reads the
        // literal's binding (mutations define nothing new).
        assert!(edge(g, 1, 2).is_some());
        assert!(edge(g, 1, 3).is_some());
        assert!(edge(g, 2, 3).is_none());
    }

    #[test]
    fn function_params_bind_at_line_zero() {
        let func = FunctionUnit {
            name: "calculate_sum".into(),
            params: vec!["data".into()],
            body: vec![
                assign("total", Rhs::Prim(int(0))),
                Stmt::new(StmtKind::Loop {
                    var: "row".into(),
                    iter: LoopIter::Var("data".into()),
                    body: vec![assign("total", Rhs::Prim(add(var("total"), var("row"))))],
                }),
                Stmt::new(StmtKind::Return(ReturnValue::Var("total".into()))),
            ],
        };
        let units = Units {
            file_name: None,
            functions: vec![func],
            entry: Vec::new(),
        };
        let out = build(&units);
        let g = out.ddg.unit("calculate_sum").unwrap();
        assert_eq!(g.statements[0].text, "def calculate_sum(data):");
        assert_eq!(
            g.statements[0].has,
            BTreeSet::from(["data".to_string()])
        );
        // for-loop consumes data from the parameter binder, produces total/row.
        let e = edge(g, 0, 2).unwrap();
        assert!(e.variables.contains("data"));
        let loop_stmt = &g.statements[2];
        assert!(loop_stmt.has.contains("total") && loop_stmt.has.contains("row"));
        assert!(!loop_stmt.needs.contains("row"));
        // return consumes total from its most recent producer, the loop.
        assert!(edge(g, 2, 3).is_some());
        assert_eq!(g.output.as_deref(), Some("total"));
    }

    #[test]
    fn conditional_aggregates_arm_assignments() {
        // flag = 1; if flag: a = 1 else: b = 2; c = a + b
        let units = entry_units(vec![
            assign("flag", Rhs::Prim(int(1))),
            Stmt::new(StmtKind::Conditional {
                arms: vec![
                    CondArm {
                        cond: Some(var("flag")),
                        body: vec![assign("a", Rhs::Prim(int(1)))],
                    },
                    CondArm {
                        cond: None,
                        body: vec![assign("b", Rhs::Prim(int(2)))],
                    },
                ],
            }),
            assign("c", Rhs::Prim(add(var("a"), var("b")))),
        ]);
        let g = build(&units).ddg;
        let g = g.entry().unwrap();
        let cond = &g.statements[1];
        assert_eq!(
            cond.has,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        assert!(cond.needs.contains("flag"));
        let e = edge(g, 2, 3).unwrap();
        assert_eq!(
            e.variables,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn certificate_holds_for_built_graphs() {
        let units = entry_units(vec![
            assign("a", Rhs::Prim(int(1))),
            assign("b", Rhs::Prim(add(var("a"), int(1)))),
            Stmt::new(StmtKind::Call {
                target: "y".into(),
                callee: "f".into(),
                args: vec!["b".into()],
            }),
        ]);
        let out = build(&units);
        let cert = certify(&out.ddg);
        assert!(cert.all_pass(), "obligations: {:?}", cert.obligations());
    }
}
