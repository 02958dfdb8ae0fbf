// ast.rs — Typed program model for restricted data-processing programs
//
// The planner does not parse source text. An external front end supplies a
// program document in this typed form (JSON via serde); each statement is a
// tagged union carrying only the operand identifiers and literal data the
// analysis stages need. `Display` renders the canonical statement text used
// to key every boundary table (blocks, live variables, footprint traces).
//
// Preconditions: produced by deserializing a program document or built in
//                tests; no validation happens here.
// Postconditions: `Display` output is deterministic for a given tree.
// Failure modes: none (data-only module).
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Root ──

/// A complete restricted program: named file, top-level prologue statements,
/// function definitions, and the entry sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// The `FILE_NAME` the program reads its input from, when declared.
    pub name: Option<String>,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    Function(FunctionDef),
    /// The `__main__` entry block. A program may carry several; the
    /// extractor concatenates them in order.
    Entry(Vec<Stmt>),
    /// A top-level prologue statement (e.g. the data-loading block).
    Stmt(Stmt),
}

/// A single-return, non-nested function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Stmt { kind }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    /// `target = <rhs>`
    Assign { target: String, value: Rhs },
    /// In-place list mutation: `target.append(e)`, `target.extend(y)`, …
    Mutate { target: String, op: MutateOp },
    /// `del target` / `del target[i]` / `del target[a:b]`
    Delete {
        target: String,
        index: Option<DeleteIndex>,
    },
    /// `return x` / `return x[0]` / `return x[a:b]`
    Return(ReturnValue),
    /// `target = callee(arg, ...)` — a user-function call site.
    Call {
        target: String,
        callee: String,
        args: Vec<String>,
    },
    /// `if`/`elif`/`else` chain. Treated as one statement by the graph
    /// builder; the estimator walks every arm.
    Conditional { arms: Vec<CondArm> },
    /// `for var in range(k):` / `for var in xs:`
    Loop {
        var: String,
        iter: LoopIter,
        body: Vec<Stmt>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondArm {
    /// `None` for the `else` arm.
    pub cond: Option<PrimExpr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoopIter {
    /// `range(<count>)`; the count must fold to a non-negative integer.
    Range(PrimExpr),
    /// Iterate over a list variable.
    Var(String),
    /// Iterate over a slice of a list variable (`for row in data[1:]:`).
    Slice { src: String, spec: SliceSpec },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutateOp {
    Append(PrimExpr),
    Extend(ExtendSource),
    /// Normalized to `Append` during estimation — the position does not
    /// change the footprint.
    Insert { index: i64, value: PrimExpr },
    Pop,
    Remove(PrimExpr),
    Clear,
    /// Footprint no-ops; carried so reordering statements survive analysis.
    Reverse,
    Sort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtendSource {
    Literal(Vec<PrimExpr>),
    Var(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeleteIndex {
    At(i64),
    Slice(SliceSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReturnValue {
    Var(String),
    Index { src: String, at: i64 },
    Slice { src: String, spec: SliceSpec },
}

impl ReturnValue {
    /// The returned variable's name (the unit's externally visible output).
    pub fn var(&self) -> &str {
        match self {
            ReturnValue::Var(v) => v,
            ReturnValue::Index { src, .. } => src,
            ReturnValue::Slice { src, .. } => src,
        }
    }
}

// ── Right-hand sides ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rhs {
    Prim(PrimExpr),
    List(ListRhs),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ListRhs {
    /// `[e0, e1, ...]`
    Literal(Vec<PrimExpr>),
    /// `x = y` where `y` is a list — binding copy.
    CopyOf(String),
    /// `a + b` over list operands.
    Concat(ListOperand, ListOperand),
    /// `[e0, ...] * k`
    Repeat {
        elems: Vec<PrimExpr>,
        count: PrimExpr,
    },
    /// `[<elem> for _ in range(<count>)]` with a statically-known count.
    Comprehension {
        elem: Box<PrimExpr>,
        count: Box<PrimExpr>,
    },
    /// `src[l:u:s]` with every bound statically known or absent.
    Slice { src: String, spec: SliceSpec },
    /// `src[i]`
    Index { src: String, at: i64 },
    /// `open(<path>).readlines()`
    ReadLines { path: PrimExpr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ListOperand {
    Literal(Vec<PrimExpr>),
    Var(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub lower: Bound,
    pub upper: Bound,
    pub step: Bound,
}

impl SliceSpec {
    pub fn full() -> Self {
        SliceSpec {
            lower: Bound::Absent,
            upper: Bound::Absent,
            step: Bound::Absent,
        }
    }
}

/// One slice bound. `Dynamic` names a variable the front end could not fold;
/// the estimator rejects it (ambiguous bounds are unsupported).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Bound {
    Absent,
    Known(i64),
    Dynamic(String),
}

// ── Primitive expressions ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimExpr {
    Lit(PrimLit),
    Var(String),
    Bin {
        op: NumOp,
        lhs: Box<PrimExpr>,
        rhs: Box<PrimExpr>,
    },
    Cast {
        to: CastKind,
        arg: Box<PrimExpr>,
    },
    /// `len(x)`
    Len(String),
    /// `src[i]` (or `src[i][j]…`) read in primitive position. Element values
    /// are never tracked; indices matter only for rendering and dependency
    /// collection.
    Elem {
        src: String,
        indices: Vec<PrimExpr>,
    },
    /// `src.count(e)` / `src.index(e)` — integer-valued list queries.
    Query {
        src: String,
        op: ListQuery,
        arg: Box<PrimExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListQuery {
    Count,
    Index,
}

impl ListQuery {
    pub fn name(self) -> &'static str {
        match self {
            ListQuery::Count => "count",
            ListQuery::Index => "index",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimLit {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl NumOp {
    pub fn symbol(self) -> &'static str {
        match self {
            NumOp::Add => "+",
            NumOp::Sub => "-",
            NumOp::Mul => "*",
            NumOp::Div => "/",
            NumOp::FloorDiv => "//",
            NumOp::Mod => "%",
            NumOp::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastKind {
    Int,
    Float,
    Str,
    Bool,
}

impl CastKind {
    pub fn name(self) -> &'static str {
        match self {
            CastKind::Int => "int",
            CastKind::Float => "float",
            CastKind::Str => "str",
            CastKind::Bool => "bool",
        }
    }
}

// ── Rendering ──
//
// Canonical statement text. Every table in the pipeline is keyed by this
// rendering, so it must stay deterministic; changing it invalidates any
// externally produced live-variable or footprint artifact.

fn join<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

impl fmt::Display for PrimLit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimLit::Int(v) => write!(f, "{}", v),
            PrimLit::Float(v) => write!(f, "{:?}", v),
            PrimLit::Bool(true) => write!(f, "True"),
            PrimLit::Bool(false) => write!(f, "False"),
            PrimLit::Str(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            PrimLit::Bytes(b) => {
                write!(f, "b'")?;
                for byte in b {
                    write!(f, "{}", byte.escape_ascii())?;
                }
                write!(f, "'")
            }
        }
    }
}

impl fmt::Display for PrimExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimExpr::Lit(l) => write!(f, "{}", l),
            PrimExpr::Var(v) => write!(f, "{}", v),
            PrimExpr::Bin { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op.symbol(), rhs),
            PrimExpr::Cast { to, arg } => write!(f, "{}({})", to.name(), arg),
            PrimExpr::Len(v) => write!(f, "len({})", v),
            PrimExpr::Elem { src, indices } => {
                write!(f, "{}", src)?;
                for ix in indices {
                    write!(f, "[{}]", ix)?;
                }
                Ok(())
            }
            PrimExpr::Query { src, op, arg } => write!(f, "{}.{}({})", src, op.name(), arg),
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Absent => Ok(()),
            Bound::Known(v) => write!(f, "{}", v),
            Bound::Dynamic(name) => write!(f, "{}", name),
        }
    }
}

impl fmt::Display for SliceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lower, self.upper)?;
        if !matches!(self.step, Bound::Absent) {
            write!(f, ":{}", self.step)?;
        }
        Ok(())
    }
}

impl fmt::Display for ListOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListOperand::Literal(elems) => write!(f, "[{}]", join(elems, ", ")),
            ListOperand::Var(v) => write!(f, "{}", v),
        }
    }
}

impl fmt::Display for ListRhs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListRhs::Literal(elems) => write!(f, "[{}]", join(elems, ", ")),
            ListRhs::CopyOf(v) => write!(f, "{}", v),
            ListRhs::Concat(a, b) => write!(f, "{} + {}", a, b),
            ListRhs::Repeat { elems, count } => write!(f, "[{}] * {}", join(elems, ", "), count),
            ListRhs::Comprehension { elem, count } => {
                write!(f, "[{} for _ in range({})]", elem, count)
            }
            ListRhs::Slice { src, spec } => write!(f, "{}[{}]", src, spec),
            ListRhs::Index { src, at } => write!(f, "{}[{}]", src, at),
            ListRhs::ReadLines { path } => write!(f, "open({}).readlines()", path),
        }
    }
}

impl fmt::Display for Rhs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rhs::Prim(e) => write!(f, "{}", e),
            Rhs::List(l) => write!(f, "{}", l),
        }
    }
}

impl fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnValue::Var(v) => write!(f, "{}", v),
            ReturnValue::Index { src, at } => write!(f, "{}[{}]", src, at),
            ReturnValue::Slice { src, spec } => write!(f, "{}[{}]", src, spec),
        }
    }
}

impl fmt::Display for MutateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutateOp::Append(e) => write!(f, "append({})", e),
            MutateOp::Extend(ExtendSource::Literal(elems)) => {
                write!(f, "extend([{}])", join(elems, ", "))
            }
            MutateOp::Extend(ExtendSource::Var(v)) => write!(f, "extend({})", v),
            MutateOp::Insert { index, value } => write!(f, "insert({}, {})", index, value),
            MutateOp::Pop => write!(f, "pop()"),
            MutateOp::Remove(e) => write!(f, "remove({})", e),
            MutateOp::Clear => write!(f, "clear()"),
            MutateOp::Reverse => write!(f, "reverse()"),
            MutateOp::Sort => write!(f, "sort()"),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StmtKind::Assign { target, value } => write!(f, "{} = {}", target, value),
            StmtKind::Mutate { target, op } => write!(f, "{}.{}", target, op),
            StmtKind::Delete { target, index } => match index {
                None => write!(f, "del {}", target),
                Some(DeleteIndex::At(i)) => write!(f, "del {}[{}]", target, i),
                Some(DeleteIndex::Slice(spec)) => write!(f, "del {}[{}]", target, spec),
            },
            StmtKind::Return(v) => write!(f, "return {}", v),
            StmtKind::Call {
                target,
                callee,
                args,
            } => write!(f, "{} = {}({})", target, callee, args.join(", ")),
            StmtKind::Conditional { arms } => {
                // The whole chain is one statement; its text is the first
                // arm's header.
                match arms.first().and_then(|a| a.cond.as_ref()) {
                    Some(cond) => write!(f, "if {}:", cond),
                    None => write!(f, "if:"),
                }
            }
            StmtKind::Loop { var, iter, .. } => match iter {
                LoopIter::Range(count) => write!(f, "for {} in range({}):", var, count),
                LoopIter::Var(xs) => write!(f, "for {} in {}:", var, xs),
                LoopIter::Slice { src, spec } => write!(f, "for {} in {}[{}]:", var, src, spec),
            },
        }
    }
}

/// Render a function definition header (the synthetic line-0 statement of a
/// callable unit's graph).
pub fn def_header(name: &str, params: &[String]) -> String {
    format!("def {}({}):", name, params.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(target: &str, value: Rhs) -> Stmt {
        Stmt::new(StmtKind::Assign {
            target: target.into(),
            value,
        })
    }

    #[test]
    fn render_prim_assign() {
        let s = assign(
            "x",
            Rhs::Prim(PrimExpr::Bin {
                op: NumOp::Add,
                lhs: Box::new(PrimExpr::Var("a".into())),
                rhs: Box::new(PrimExpr::Lit(PrimLit::Int(1))),
            }),
        );
        assert_eq!(s.to_string(), "x = a + 1");
    }

    #[test]
    fn render_float_keeps_decimal_point() {
        let s = assign("x", Rhs::Prim(PrimExpr::Lit(PrimLit::Float(2.0))));
        assert_eq!(s.to_string(), "x = 2.0");
    }

    #[test]
    fn render_list_literal_and_slice() {
        let s = assign(
            "xs",
            Rhs::List(ListRhs::Literal(vec![
                PrimExpr::Lit(PrimLit::Int(1)),
                PrimExpr::Lit(PrimLit::Int(2)),
            ])),
        );
        assert_eq!(s.to_string(), "xs = [1, 2]");

        let s = assign(
            "ys",
            Rhs::List(ListRhs::Slice {
                src: "xs".into(),
                spec: SliceSpec {
                    lower: Bound::Known(1),
                    upper: Bound::Absent,
                    step: Bound::Absent,
                },
            }),
        );
        assert_eq!(s.to_string(), "ys = xs[1:]");
    }

    #[test]
    fn render_mutations() {
        let s = Stmt::new(StmtKind::Mutate {
            target: "xs".into(),
            op: MutateOp::Append(PrimExpr::Lit(PrimLit::Int(5))),
        });
        assert_eq!(s.to_string(), "xs.append(5)");

        let s = Stmt::new(StmtKind::Mutate {
            target: "xs".into(),
            op: MutateOp::Extend(ExtendSource::Var("ys".into())),
        });
        assert_eq!(s.to_string(), "xs.extend(ys)");

        let s = Stmt::new(StmtKind::Mutate {
            target: "xs".into(),
            op: MutateOp::Sort,
        });
        assert_eq!(s.to_string(), "xs.sort()");
    }

    #[test]
    fn render_list_queries() {
        let s = assign(
            "n",
            Rhs::Prim(PrimExpr::Query {
                src: "xs".into(),
                op: ListQuery::Count,
                arg: Box::new(PrimExpr::Lit(PrimLit::Int(5))),
            }),
        );
        assert_eq!(s.to_string(), "n = xs.count(5)");
    }

    #[test]
    fn render_call_and_loop() {
        let s = Stmt::new(StmtKind::Call {
            target: "result".into(),
            callee: "calculate_sum".into(),
            args: vec!["data".into()],
        });
        assert_eq!(s.to_string(), "result = calculate_sum(data)");

        let s = Stmt::new(StmtKind::Loop {
            var: "i".into(),
            iter: LoopIter::Range(PrimExpr::Lit(PrimLit::Int(10))),
            body: vec![],
        });
        assert_eq!(s.to_string(), "for i in range(10):");

        let s = Stmt::new(StmtKind::Loop {
            var: "row".into(),
            iter: LoopIter::Slice {
                src: "data".into(),
                spec: SliceSpec {
                    lower: Bound::Known(1),
                    upper: Bound::Absent,
                    step: Bound::Absent,
                },
            },
            body: vec![],
        });
        assert_eq!(s.to_string(), "for row in data[1:]:");
    }

    #[test]
    fn render_def_header() {
        assert_eq!(
            def_header("calculate_sum", &["data".to_string()]),
            "def calculate_sum(data):"
        );
    }

    #[test]
    fn program_document_round_trips() {
        let prog = Program {
            name: Some("test.csv".into()),
            items: vec![
                Item::Function(FunctionDef {
                    name: "f".into(),
                    params: vec!["xs".into()],
                    body: vec![Stmt::new(StmtKind::Return(ReturnValue::Var("xs".into())))],
                }),
                Item::Entry(vec![Stmt::new(StmtKind::Call {
                    target: "y".into(),
                    callee: "f".into(),
                    args: vec!["data".into()],
                })]),
            ],
        };
        let json = serde_json::to_string(&prog).unwrap();
        let back: Program = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prog);
    }
}
