// estimate.rs — Memory footprint estimation
//
// Simulates the program variable by variable, under a reference dynamic-array
// growth policy, without evaluating actual data. Produces per-statement live
// snapshots for the entry sequence and an ordered per-line trace for every
// call site; the last trace entry is the call's execution footprint.
//
// Preconditions: extracted `Units` that passed shape checks.
// Postconditions: every entry statement has a live snapshot; every entry call
//                 site has a trace keyed by its rendered text.
// Failure modes: undefined variables, type mismatches, unsupported shapes and
//                empty-list underflow abort the run with a typed error — the
//                estimator does not guess. File inspection may fail with I/O
//                errors.
// Side effects: reads file metadata/contents for `readlines` sizing.
//
// Loop bodies are walked once; list mutations scale by the statically-known
// trip count product. Conditionals run every arm in sequence, an
// over-approximation that keeps the binding table deterministic.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::ast::{
    Bound, CastKind, ExtendSource, ListOperand, ListRhs, LoopIter, MutateOp, NumOp, PrimExpr,
    PrimLit, ReturnValue, Rhs, SliceSpec, Stmt, StmtKind,
};
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::error::PlanError;
use crate::extract::{Units, ENTRY_UNIT};

// ── Size model ──

/// Per-type size constants of the reference runtime, plus the dynamic-array
/// over-allocation policy. Deserializable so a JSON override can replace any
/// subset of the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeModel {
    pub int_size: f64,
    pub float_size: f64,
    pub bool_size: f64,
    /// String size = `str_base` + one byte per character.
    pub str_base: f64,
    /// Bytes size = `bytes_base` + one byte per element.
    pub bytes_base: f64,
    pub base_list_overhead: f64,
    pub pointer_size: f64,
    /// Growth multiplier past the fixed capacity table.
    pub growth_factor: f64,
}

impl Default for SizeModel {
    fn default() -> Self {
        SizeModel {
            int_size: 28.0,
            float_size: 24.0,
            bool_size: 28.0,
            str_base: 49.0,
            bytes_base: 33.0,
            base_list_overhead: 56.0,
            pointer_size: 8.0,
            growth_factor: 1.025,
        }
    }
}

impl SizeModel {
    /// Reserved slot count for a dynamic array holding `len` elements; an
    /// empty list reserves none, whatever path produced it.
    pub fn capacity(&self, len: u64) -> u64 {
        match len {
            0 => 0,
            1..=4 => 4,
            5..=8 => 8,
            9..=16 => 16,
            17..=25 => 25,
            26..=35 => 35,
            36..=49 => 49,
            50..=64 => 64,
            n => (n as f64 * self.growth_factor).ceil() as u64,
        }
    }

    /// Container bytes of a list of `len` elements: header plus one pointer
    /// slot per reserved capacity entry.
    pub fn list_overhead(&self, len: u64) -> f64 {
        self.base_list_overhead + self.pointer_size * self.capacity(len) as f64
    }

    fn lit_size(&self, lit: &PrimLit) -> f64 {
        match lit {
            PrimLit::Int(_) => self.int_size,
            PrimLit::Float(_) => self.float_size,
            PrimLit::Bool(_) => self.bool_size,
            PrimLit::Str(s) => self.str_base + s.len() as f64,
            PrimLit::Bytes(b) => self.bytes_base + b.len() as f64,
        }
    }
}

// ── Bindings ──

#[derive(Debug, Clone, PartialEq)]
enum PrimVal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Sized but unvalued (arithmetic that did not fold, loop variables,
    /// list elements).
    Unknown,
}

impl PrimVal {
    fn as_f64(&self) -> Option<f64> {
        match self {
            PrimVal::Int(v) => Some(*v as f64),
            PrimVal::Float(v) => Some(*v),
            PrimVal::Bool(v) => Some(*v as i64 as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Primitive,
    List,
}

/// Size/length state of one variable during a simulated execution. Owned by
/// one estimator run and never shared across call simulations — a callee
/// receives copies of the caller's argument bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub kind: BindingKind,
    pub size: f64,
    pub length: Option<u64>,
    value: PrimVal,
}

impl Binding {
    fn primitive(value: PrimVal, size: f64) -> Self {
        Binding {
            kind: BindingKind::Primitive,
            size,
            length: None,
            value,
        }
    }

    fn list(length: u64, size: f64) -> Self {
        Binding {
            kind: BindingKind::List,
            size,
            length: Some(length),
            value: PrimVal::Unknown,
        }
    }

    pub fn stat(&self) -> VarStat {
        VarStat {
            size: self.size,
            length: self.length,
        }
    }

    /// Bytes attributable to elements (total minus container overhead).
    fn element_bytes(&self, model: &SizeModel) -> f64 {
        match self.length {
            Some(len) => (self.size - model.list_overhead(len)).max(0.0),
            None => 0.0,
        }
    }
}

/// Size and length of one live variable at a snapshot point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarStat {
    pub size: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

// ── Footprint artifacts ──

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub line: String,
    pub cumulative: f64,
}

/// Ordered per-line footprint of one simulated call: reconstructed source
/// line → cumulative live size immediately after that line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trace {
    pub entries: Vec<TraceEntry>,
}

impl Trace {
    /// Record a line. Re-executed lines (loop bodies) keep their first
    /// position and take the latest cumulative value.
    pub fn record(&mut self, line: &str, cumulative: f64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.line == line) {
            entry.cumulative = cumulative;
        } else {
            self.entries.push(TraceEntry {
                line: line.to_string(),
                cumulative,
            });
        }
    }

    /// The call's total execution footprint (last entry).
    pub fn total(&self) -> f64 {
        self.entries.last().map(|e| e.cumulative).unwrap_or(0.0)
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.line.as_str())
    }
}

// Serialized as an ordered map so the artifact keeps execution order.
impl Serialize for Trace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.line, &entry.cumulative)?;
        }
        map.end()
    }
}

/// Estimator output: per-statement live snapshots of the entry sequence and
/// per-call-site footprint traces.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Footprints {
    pub live: BTreeMap<String, BTreeMap<String, VarStat>>,
    pub traces: BTreeMap<String, Trace>,
}

impl Footprints {
    pub fn live_at(&self, statement: &str) -> Option<&BTreeMap<String, VarStat>> {
        self.live.get(statement)
    }

    /// Trace lookup tolerates statement-rendering drift between producers:
    /// exact match first, then the first key sharing a prefix either way.
    pub fn trace_for(&self, statement: &str) -> Option<&Trace> {
        if let Some(t) = self.traces.get(statement) {
            return Some(t);
        }
        self.traces
            .iter()
            .find(|(key, _)| statement.starts_with(key.as_str()) || key.starts_with(statement))
            .map(|(_, t)| t)
    }

    /// Execution footprint of a call site (last trace entry).
    pub fn execution_size(&self, statement: &str) -> Option<f64> {
        self.trace_for(statement).map(Trace::total)
    }
}

#[derive(Debug)]
pub struct EstimateResult {
    pub footprints: Footprints,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Estimation driver ──

pub fn estimate(units: &Units, model: &SizeModel) -> EstimateResult {
    let mut footprints = Footprints::default();
    let mut diagnostics = Vec::new();
    let mut ctx = EstimateCtx::new(model, units, false);

    for stmt in &units.entry {
        let text = stmt.to_string();
        let outcome = match &stmt.kind {
            StmtKind::Call {
                target,
                callee,
                args,
            } => ctx.simulate_call(target, callee, args, &text, &mut footprints),
            _ => ctx.execute(stmt, 1),
        };
        match outcome {
            Ok(()) => {
                footprints.live.insert(text, ctx.snapshot());
            }
            Err(err) => {
                diagnostics.push(diagnostic_for(&err, ENTRY_UNIT));
                return EstimateResult {
                    footprints,
                    diagnostics,
                };
            }
        }
    }

    EstimateResult {
        footprints,
        diagnostics,
    }
}

/// Convert an estimation failure into an error-level diagnostic.
pub(crate) fn diagnostic_for(err: &PlanError, unit: &str) -> Diagnostic {
    let code = match err {
        PlanError::UndefinedVariable { .. } => codes::E0200,
        PlanError::TypeMismatch { .. } => codes::E0201,
        PlanError::EmptyListUnderflow { .. } => codes::E0203,
        PlanError::IoError { .. } | PlanError::JsonError { .. } => codes::E0204,
        _ => codes::E0202,
    };
    let mut diag = Diagnostic::new(DiagLevel::Error, err.to_string())
        .with_code(code)
        .with_unit(unit);
    if let Some(statement) = err.statement() {
        diag = diag.with_statement(statement);
    }
    diag
}

// ── Execution context ──

struct EstimateCtx<'a> {
    model: &'a SizeModel,
    units: &'a Units,
    bindings: BTreeMap<String, Binding>,
    in_function: bool,
}

impl<'a> EstimateCtx<'a> {
    fn new(model: &'a SizeModel, units: &'a Units, in_function: bool) -> Self {
        EstimateCtx {
            model,
            units,
            bindings: BTreeMap::new(),
            in_function,
        }
    }

    fn snapshot(&self) -> BTreeMap<String, VarStat> {
        self.bindings
            .iter()
            .map(|(name, b)| (name.clone(), b.stat()))
            .collect()
    }

    fn total_live(&self) -> f64 {
        self.bindings.values().map(|b| b.size).sum()
    }

    // ── statement execution ──

    /// Execute one statement (recursing into loop/conditional bodies) with a
    /// mutation multiplier `m` — the product of enclosing trip counts.
    fn execute(&mut self, stmt: &Stmt, m: u64) -> Result<(), PlanError> {
        match &stmt.kind {
            StmtKind::Loop { var, iter, body } => {
                let text = stmt.to_string();
                let trips = self.bind_loop_var(var, iter, &text)?;
                for inner in body {
                    self.execute(inner, m.saturating_mul(trips))?;
                }
                Ok(())
            }
            StmtKind::Conditional { arms } => {
                for arm in arms {
                    if let Some(cond) = &arm.cond {
                        self.eval(cond, &stmt.to_string())?;
                    }
                    for inner in &arm.body {
                        self.execute(inner, m)?;
                    }
                }
                Ok(())
            }
            _ => self.apply_simple(stmt, m),
        }
    }

    /// Like `execute`, recording every line into `trace` in source order.
    fn execute_traced(&mut self, stmt: &Stmt, m: u64, trace: &mut Trace) -> Result<(), PlanError> {
        let text = stmt.to_string();
        match &stmt.kind {
            StmtKind::Loop { var, iter, body } => {
                let trips = self.bind_loop_var(var, iter, &text)?;
                trace.record(&text, self.total_live());
                for inner in body {
                    self.execute_traced(inner, m.saturating_mul(trips), trace)?;
                }
                Ok(())
            }
            StmtKind::Conditional { arms } => {
                for arm in arms {
                    if let Some(cond) = &arm.cond {
                        self.eval(cond, &text)?;
                    }
                }
                trace.record(&text, self.total_live());
                for arm in arms {
                    for inner in &arm.body {
                        self.execute_traced(inner, m, trace)?;
                    }
                }
                Ok(())
            }
            _ => {
                self.apply_simple(stmt, m)?;
                trace.record(&text, self.total_live());
                Ok(())
            }
        }
    }

    fn apply_simple(&mut self, stmt: &Stmt, m: u64) -> Result<(), PlanError> {
        let text = stmt.to_string();
        match &stmt.kind {
            StmtKind::Assign { target, value } => {
                let binding = self.assign_binding(value, &text)?;
                self.bindings.insert(target.clone(), binding);
                Ok(())
            }
            StmtKind::Mutate { target, op } => self.apply_mutate(target, op, m, &text),
            StmtKind::Delete { target, index } => self.apply_delete(target, index, m, &text),
            StmtKind::Return(_) if self.in_function => Ok(()),
            StmtKind::Return(_) => Err(PlanError::UnsupportedConstruct {
                what: "return outside a function".into(),
                statement: text,
            }),
            StmtKind::Call { .. } => Err(PlanError::UnsupportedConstruct {
                what: "call nested inside another statement".into(),
                statement: text,
            }),
            StmtKind::Loop { .. } | StmtKind::Conditional { .. } => unreachable!(),
        }
    }

    /// Bind the loop variable and return the trip count.
    fn bind_loop_var(
        &mut self,
        var: &str,
        iter: &LoopIter,
        statement: &str,
    ) -> Result<u64, PlanError> {
        let model = self.model;
        match iter {
            LoopIter::Range(count) => {
                let trips = self.fold_count(count, statement)?;
                self.bindings.insert(
                    var.to_string(),
                    Binding::primitive(PrimVal::Unknown, model.int_size),
                );
                Ok(trips)
            }
            LoopIter::Var(xs) => {
                let (len, _, size) = self.list_stats(xs, statement)?;
                let elem = if len > 0 { size / len as f64 } else { 0.0 };
                self.bindings
                    .insert(var.to_string(), Binding::primitive(PrimVal::Unknown, elem));
                Ok(len)
            }
            LoopIter::Slice { src, spec } => {
                let slice = self.slice_binding(src, spec, statement)?;
                let (src_len, _, src_size) = self.list_stats(src, statement)?;
                let elem = if src_len > 0 {
                    src_size / src_len as f64
                } else {
                    0.0
                };
                self.bindings
                    .insert(var.to_string(), Binding::primitive(PrimVal::Unknown, elem));
                Ok(slice.length.unwrap_or(0))
            }
        }
    }

    // ── assignments ──

    fn assign_binding(&mut self, value: &Rhs, statement: &str) -> Result<Binding, PlanError> {
        match value {
            Rhs::Prim(expr) => {
                let (v, size) = self.eval(expr, statement)?;
                Ok(Binding::primitive(v, size))
            }
            Rhs::List(list) => self.assign_list(list, statement),
        }
    }

    fn assign_list(&mut self, list: &ListRhs, statement: &str) -> Result<Binding, PlanError> {
        let model = self.model;
        match list {
            ListRhs::Literal(elems) => {
                let bytes = self.element_sum(elems, statement)?;
                let len = elems.len() as u64;
                Ok(Binding::list(len, bytes + model.list_overhead(len)))
            }
            // Binding copy: identical footprint.
            ListRhs::CopyOf(src) => self
                .bindings
                .get(src)
                .cloned()
                .ok_or_else(|| PlanError::UndefinedVariable {
                    name: src.clone(),
                    statement: statement.to_string(),
                }),
            ListRhs::Concat(a, b) => {
                let (la, ba) = self.operand_stats(a, statement)?;
                let (lb, bb) = self.operand_stats(b, statement)?;
                let len = la + lb;
                Ok(Binding::list(len, ba + bb + model.list_overhead(len)))
            }
            ListRhs::Repeat { elems, count } => {
                let k = self.fold_count(count, statement)?;
                let bytes = self.element_sum(elems, statement)? * k as f64;
                let len = elems.len() as u64 * k;
                Ok(Binding::list(len, bytes + model.list_overhead(len)))
            }
            ListRhs::Comprehension { elem, count } => {
                let k = self.fold_count(count, statement)?;
                let (_, elem_size) = self.eval(elem, statement)?;
                Ok(Binding::list(
                    k,
                    elem_size * k as f64 + model.list_overhead(k),
                ))
            }
            ListRhs::Slice { src, spec } => self.slice_binding(src, spec, statement),
            ListRhs::Index { src, .. } => self.index_binding(src, statement),
            ListRhs::ReadLines { path } => self.readlines_binding(path, statement),
        }
    }

    fn element_sum(&mut self, elems: &[PrimExpr], statement: &str) -> Result<f64, PlanError> {
        let mut total = 0.0;
        for elem in elems {
            total += self.element_size(elem, statement)?;
        }
        Ok(total)
    }

    /// Size one element contributes to a list. A list-valued variable in
    /// element position contributes a pointer slot, not its payload.
    fn element_size(&mut self, elem: &PrimExpr, statement: &str) -> Result<f64, PlanError> {
        if let PrimExpr::Var(name) = elem {
            if let Some(binding) = self.bindings.get(name) {
                if binding.kind == BindingKind::List {
                    return Ok(self.model.pointer_size);
                }
            }
        }
        Ok(self.eval(elem, statement)?.1)
    }

    fn operand_stats(
        &mut self,
        operand: &ListOperand,
        statement: &str,
    ) -> Result<(u64, f64), PlanError> {
        match operand {
            ListOperand::Literal(elems) => {
                Ok((elems.len() as u64, self.element_sum(elems, statement)?))
            }
            ListOperand::Var(name) => {
                let (len, elem_bytes, _) = self.list_stats(name, statement)?;
                Ok((len, elem_bytes))
            }
        }
    }

    fn slice_binding(
        &mut self,
        src: &str,
        spec: &SliceSpec,
        statement: &str,
    ) -> Result<Binding, PlanError> {
        let model = self.model;
        let (len, elem_bytes, _) = self.list_stats(src, statement)?;
        let (lower, upper, step) = resolve_bounds(spec, len, statement)?;
        let new_len = if upper > lower {
            (upper - lower) / step
        } else {
            0
        };
        let avg = if len > 0 {
            elem_bytes / len as f64
        } else {
            0.0
        };
        Ok(Binding::list(
            new_len,
            avg * new_len as f64 + model.list_overhead(new_len),
        ))
    }

    /// Indexing keeps the source's per-position share of the total size and
    /// yields a length-1 binding (good enough for row reads; element values
    /// are never tracked).
    fn index_binding(&mut self, src: &str, statement: &str) -> Result<Binding, PlanError> {
        let (len, _, size) = self.list_stats(src, statement)?;
        if len == 0 {
            return Err(PlanError::EmptyListUnderflow {
                name: src.to_string(),
                statement: statement.to_string(),
            });
        }
        Ok(Binding::list(1, size / len as f64))
    }

    fn readlines_binding(&mut self, path: &PrimExpr, statement: &str) -> Result<Binding, PlanError> {
        let (value, _) = self.eval(path, statement)?;
        let name = match value {
            PrimVal::Str(s) => s,
            _ => {
                return Err(PlanError::UnsupportedConstruct {
                    what: "file path not statically known".into(),
                    statement: statement.to_string(),
                })
            }
        };
        let path = PathBuf::from(&name);
        let bytes = fs::read(&path).map_err(|source| PlanError::IoError {
            path: path.clone(),
            source,
        })?;
        let mut lines = bytes.iter().filter(|b| **b == b'\n').count() as u64;
        if !bytes.is_empty() && bytes.last() != Some(&b'\n') {
            lines += 1;
        }
        Ok(Binding::list(
            lines,
            bytes.len() as f64 + self.model.base_list_overhead,
        ))
    }

    // ── mutations ──

    fn apply_mutate(
        &mut self,
        target: &str,
        op: &MutateOp,
        m: u64,
        statement: &str,
    ) -> Result<(), PlanError> {
        match op {
            MutateOp::Append(value) | MutateOp::Insert { value, .. } => {
                let elem = self.element_size(value, statement)?;
                let (len, elem_bytes, _) = self.list_stats(target, statement)?;
                let new_len = len + m;
                self.rebind_list(target, new_len, elem_bytes + elem * m as f64);
            }
            MutateOp::Extend(source) => {
                let (src_len, src_bytes) = match source {
                    ExtendSource::Literal(elems) => {
                        (elems.len() as u64, self.element_sum(elems, statement)?)
                    }
                    ExtendSource::Var(name) => {
                        let (len, bytes, _) = self.list_stats(name, statement)?;
                        (len, bytes)
                    }
                };
                let (len, elem_bytes, _) = self.list_stats(target, statement)?;
                let new_len = len + src_len * m;
                self.rebind_list(target, new_len, elem_bytes + src_bytes * m as f64);
            }
            MutateOp::Pop | MutateOp::Remove(_) => {
                if let MutateOp::Remove(value) = op {
                    self.eval(value, statement)?;
                }
                let (len, elem_bytes, _) = self.list_stats(target, statement)?;
                if len == 0 {
                    return Err(PlanError::EmptyListUnderflow {
                        name: target.to_string(),
                        statement: statement.to_string(),
                    });
                }
                let removed = m.min(len);
                let avg = elem_bytes / len as f64;
                self.rebind_list(target, len - removed, elem_bytes - avg * removed as f64);
            }
            MutateOp::Clear => {
                self.list_stats(target, statement)?;
                self.rebind_list(target, 0, 0.0);
            }
            MutateOp::Reverse | MutateOp::Sort => {
                // Order changes nothing about the footprint.
                self.list_stats(target, statement)?;
            }
        }
        Ok(())
    }

    fn apply_delete(
        &mut self,
        target: &str,
        index: &Option<crate::ast::DeleteIndex>,
        m: u64,
        statement: &str,
    ) -> Result<(), PlanError> {
        match index {
            None => {
                self.bindings
                    .remove(target)
                    .ok_or_else(|| PlanError::UndefinedVariable {
                        name: target.to_string(),
                        statement: statement.to_string(),
                    })?;
                Ok(())
            }
            Some(crate::ast::DeleteIndex::At(_)) => {
                self.apply_mutate(target, &MutateOp::Pop, m, statement)
            }
            Some(crate::ast::DeleteIndex::Slice(spec)) => {
                for _ in 0..m {
                    let (len, elem_bytes, _) = self.list_stats(target, statement)?;
                    let (lower, upper, step) = resolve_bounds(spec, len, statement)?;
                    let removed = if upper > lower {
                        ((upper - lower) / step).min(len)
                    } else {
                        0
                    };
                    if removed == 0 {
                        break;
                    }
                    let avg = elem_bytes / len as f64;
                    self.rebind_list(target, len - removed, elem_bytes - avg * removed as f64);
                }
                Ok(())
            }
        }
    }

    fn rebind_list(&mut self, name: &str, len: u64, elem_bytes: f64) {
        let size = elem_bytes.max(0.0) + self.model.list_overhead(len);
        self.bindings
            .insert(name.to_string(), Binding::list(len, size));
    }

    // ── call simulation ──

    /// Simulate `target = callee(args…)`: seed a fresh context with copies of
    /// the argument bindings, walk the body to build the footprint trace, and
    /// bind the call's result in the caller.
    fn simulate_call(
        &mut self,
        target: &str,
        callee: &str,
        args: &[String],
        statement: &str,
        footprints: &mut Footprints,
    ) -> Result<(), PlanError> {
        let func = self
            .units
            .function(callee)
            .ok_or_else(|| PlanError::UnsupportedConstruct {
                what: format!("unknown callable '{}'", callee),
                statement: statement.to_string(),
            })?;
        if func.params.len() != args.len() {
            return Err(PlanError::UnsupportedConstruct {
                what: format!(
                    "'{}' takes {} arguments, {} supplied",
                    callee,
                    func.params.len(),
                    args.len()
                ),
                statement: statement.to_string(),
            });
        }

        let mut callee_ctx = EstimateCtx::new(self.model, self.units, true);
        for (param, arg) in func.params.iter().zip(args) {
            let binding =
                self.bindings
                    .get(arg)
                    .cloned()
                    .ok_or_else(|| PlanError::UndefinedVariable {
                        name: arg.clone(),
                        statement: statement.to_string(),
                    })?;
            callee_ctx.bindings.insert(param.clone(), binding);
        }

        let mut trace = Trace::default();
        for stmt in &func.body {
            callee_ctx.execute_traced(stmt, 1, &mut trace)?;
        }

        let returned = func
            .body
            .iter()
            .find_map(|s| match &s.kind {
                StmtKind::Return(value) => Some(value),
                _ => None,
            })
            .ok_or_else(|| PlanError::UnsupportedConstruct {
                what: format!("'{}' never returns", callee),
                statement: statement.to_string(),
            })?;
        let result = callee_ctx.return_binding(returned, statement)?;

        footprints.traces.insert(statement.to_string(), trace);
        self.bindings.insert(target.to_string(), result);
        Ok(())
    }

    fn return_binding(
        &mut self,
        value: &ReturnValue,
        statement: &str,
    ) -> Result<Binding, PlanError> {
        match value {
            ReturnValue::Var(name) => {
                self.bindings
                    .get(name)
                    .cloned()
                    .ok_or_else(|| PlanError::UndefinedVariable {
                        name: name.clone(),
                        statement: statement.to_string(),
                    })
            }
            ReturnValue::Index { src, .. } => self.index_binding(src, statement),
            ReturnValue::Slice { src, spec } => self.slice_binding(src, spec, statement),
        }
    }

    // ── expression evaluation ──

    fn eval(&mut self, expr: &PrimExpr, statement: &str) -> Result<(PrimVal, f64), PlanError> {
        let model = self.model;
        match expr {
            PrimExpr::Lit(lit) => {
                let value = match lit {
                    PrimLit::Int(v) => PrimVal::Int(*v),
                    PrimLit::Float(v) => PrimVal::Float(*v),
                    PrimLit::Bool(v) => PrimVal::Bool(*v),
                    PrimLit::Str(s) => PrimVal::Str(s.clone()),
                    PrimLit::Bytes(_) => PrimVal::Unknown,
                };
                Ok((value, model.lit_size(lit)))
            }
            PrimExpr::Var(name) => {
                let binding =
                    self.bindings
                        .get(name)
                        .ok_or_else(|| PlanError::UndefinedVariable {
                            name: name.clone(),
                            statement: statement.to_string(),
                        })?;
                if binding.kind == BindingKind::List {
                    return Err(PlanError::TypeMismatch {
                        name: name.clone(),
                        expected: "primitive",
                        statement: statement.to_string(),
                    });
                }
                Ok((binding.value.clone(), binding.size))
            }
            PrimExpr::Bin { op, lhs, rhs } => {
                let (lv, _) = self.eval(lhs, statement)?;
                let (rv, _) = self.eval(rhs, statement)?;
                if matches!(op, NumOp::Div | NumOp::FloorDiv | NumOp::Mod)
                    && rv.as_f64() == Some(0.0)
                {
                    return Err(PlanError::UnsupportedConstruct {
                        what: "division by zero".into(),
                        statement: statement.to_string(),
                    });
                }
                let value = fold_bin(*op, &lv, &rv);
                let size = self.value_size(&value);
                Ok((value, size))
            }
            PrimExpr::Cast { to, arg } => {
                let (v, _) = self.eval(arg, statement)?;
                Ok(self.cast_value(*to, v))
            }
            PrimExpr::Len(name) => {
                let binding =
                    self.bindings
                        .get(name)
                        .ok_or_else(|| PlanError::UndefinedVariable {
                            name: name.clone(),
                            statement: statement.to_string(),
                        })?;
                let value = match (&binding.kind, &binding.value, binding.length) {
                    (BindingKind::List, _, Some(len)) => PrimVal::Int(len as i64),
                    (BindingKind::List, _, None) => PrimVal::Unknown,
                    (BindingKind::Primitive, PrimVal::Str(s), _) => {
                        PrimVal::Int(s.chars().count() as i64)
                    }
                    _ => {
                        return Err(PlanError::TypeMismatch {
                            name: name.clone(),
                            expected: "sequence",
                            statement: statement.to_string(),
                        })
                    }
                };
                Ok((value, model.int_size))
            }
            PrimExpr::Elem { src, indices } => {
                for index in indices {
                    self.eval(index, statement)?;
                }
                let (len, _, size) = self.list_stats(src, statement)?;
                if indices.len() > 1 {
                    return Ok((PrimVal::Unknown, model.int_size));
                }
                if len == 0 {
                    return Err(PlanError::EmptyListUnderflow {
                        name: src.clone(),
                        statement: statement.to_string(),
                    });
                }
                Ok((PrimVal::Unknown, size / len as f64))
            }
            PrimExpr::Query { src, arg, .. } => {
                self.list_stats(src, statement)?;
                self.eval(arg, statement)?;
                Ok((PrimVal::Unknown, model.int_size))
            }
        }
    }

    fn cast_value(&self, to: CastKind, v: PrimVal) -> (PrimVal, f64) {
        let model = self.model;
        match to {
            CastKind::Int => {
                let value = match v {
                    PrimVal::Int(i) => PrimVal::Int(i),
                    PrimVal::Float(f) => PrimVal::Int(f.trunc() as i64),
                    PrimVal::Bool(b) => PrimVal::Int(b as i64),
                    PrimVal::Str(s) => {
                        s.trim().parse().map(PrimVal::Int).unwrap_or(PrimVal::Unknown)
                    }
                    PrimVal::Unknown => PrimVal::Unknown,
                };
                (value, model.int_size)
            }
            CastKind::Float => {
                let value = match v {
                    PrimVal::Int(i) => PrimVal::Float(i as f64),
                    PrimVal::Float(f) => PrimVal::Float(f),
                    PrimVal::Bool(b) => PrimVal::Float(b as i64 as f64),
                    PrimVal::Str(s) => s
                        .trim()
                        .parse()
                        .map(PrimVal::Float)
                        .unwrap_or(PrimVal::Unknown),
                    PrimVal::Unknown => PrimVal::Unknown,
                };
                (value, model.float_size)
            }
            CastKind::Str => {
                let rendered = match v {
                    PrimVal::Int(i) => Some(i.to_string()),
                    PrimVal::Float(f) => Some(format!("{:?}", f)),
                    PrimVal::Bool(true) => Some("True".to_string()),
                    PrimVal::Bool(false) => Some("False".to_string()),
                    PrimVal::Str(s) => Some(s),
                    PrimVal::Unknown => None,
                };
                match rendered {
                    Some(s) => {
                        let size = model.str_base + s.len() as f64;
                        (PrimVal::Str(s), size)
                    }
                    None => (PrimVal::Unknown, model.str_base),
                }
            }
            CastKind::Bool => {
                let value = match v {
                    PrimVal::Int(i) => PrimVal::Bool(i != 0),
                    PrimVal::Float(f) => PrimVal::Bool(f != 0.0),
                    PrimVal::Bool(b) => PrimVal::Bool(b),
                    PrimVal::Str(s) => PrimVal::Bool(!s.is_empty()),
                    PrimVal::Unknown => PrimVal::Unknown,
                };
                (value, model.bool_size)
            }
        }
    }

    fn value_size(&self, v: &PrimVal) -> f64 {
        let model = self.model;
        match v {
            PrimVal::Int(_) => model.int_size,
            PrimVal::Float(_) => model.float_size,
            PrimVal::Bool(_) => model.bool_size,
            PrimVal::Str(s) => model.str_base + s.len() as f64,
            PrimVal::Unknown => model.int_size,
        }
    }

    /// Fold an expression to a non-negative repeat/trip count.
    fn fold_count(&mut self, count: &PrimExpr, statement: &str) -> Result<u64, PlanError> {
        let (value, _) = self.eval(count, statement)?;
        match value {
            PrimVal::Int(v) => Ok(v.max(0) as u64),
            _ => Err(PlanError::UnsupportedConstruct {
                what: "count not statically known".into(),
                statement: statement.to_string(),
            }),
        }
    }

    /// `(length, element_bytes, total_size)` of a list binding.
    fn list_stats(&self, name: &str, statement: &str) -> Result<(u64, f64, f64), PlanError> {
        let binding = self
            .bindings
            .get(name)
            .ok_or_else(|| PlanError::UndefinedVariable {
                name: name.to_string(),
                statement: statement.to_string(),
            })?;
        if binding.kind != BindingKind::List {
            return Err(PlanError::TypeMismatch {
                name: name.to_string(),
                expected: "list",
                statement: statement.to_string(),
            });
        }
        Ok((
            binding.length.unwrap_or(0),
            binding.element_bytes(self.model),
            binding.size,
        ))
    }
}

// ── helpers ──

fn fold_bin(op: NumOp, l: &PrimVal, r: &PrimVal) -> PrimVal {
    use PrimVal::*;
    match (l, r) {
        (Int(a), Int(b)) => match op {
            NumOp::Add => a.checked_add(*b).map(Int).unwrap_or(Unknown),
            NumOp::Sub => a.checked_sub(*b).map(Int).unwrap_or(Unknown),
            NumOp::Mul => a.checked_mul(*b).map(Int).unwrap_or(Unknown),
            NumOp::Div => Float(*a as f64 / *b as f64),
            NumOp::FloorDiv => Int((*a as f64 / *b as f64).floor() as i64),
            NumOp::Mod => match a.checked_rem(*b) {
                Some(rem) if rem != 0 && (rem < 0) != (*b < 0) => Int(rem + b),
                Some(rem) => Int(rem),
                None => Unknown,
            },
            NumOp::Pow => {
                if (0..=u32::MAX as i64).contains(b) {
                    a.checked_pow(*b as u32).map(Int).unwrap_or(Unknown)
                } else {
                    Float((*a as f64).powf(*b as f64))
                }
            }
        },
        (Str(a), Str(b)) if op == NumOp::Add => Str(format!("{}{}", a, b)),
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => match op {
                NumOp::Add => Float(a + b),
                NumOp::Sub => Float(a - b),
                NumOp::Mul => Float(a * b),
                NumOp::Div => Float(a / b),
                NumOp::FloorDiv => Float((a / b).floor()),
                NumOp::Mod => Float(a - b * (a / b).floor()),
                NumOp::Pow => Float(a.powf(b)),
            },
            _ => Unknown,
        },
    }
}

/// Resolve slice bounds against a source length. Negative bounds count from
/// the end; the step must be a known positive integer.
fn resolve_bounds(
    spec: &SliceSpec,
    len: u64,
    statement: &str,
) -> Result<(u64, u64, u64), PlanError> {
    let clamp = |v: i64| -> u64 {
        let adjusted = if v < 0 { v + len as i64 } else { v };
        adjusted.clamp(0, len as i64) as u64
    };
    let lower = match &spec.lower {
        Bound::Absent => 0,
        Bound::Known(v) => clamp(*v),
        Bound::Dynamic(name) => {
            return Err(PlanError::UnsupportedConstruct {
                what: format!("slice bound '{}' not statically known", name),
                statement: statement.to_string(),
            })
        }
    };
    let upper = match &spec.upper {
        Bound::Absent => len,
        Bound::Known(v) => clamp(*v),
        Bound::Dynamic(name) => {
            return Err(PlanError::UnsupportedConstruct {
                what: format!("slice bound '{}' not statically known", name),
                statement: statement.to_string(),
            })
        }
    };
    let step = match &spec.step {
        Bound::Absent => 1,
        Bound::Known(v) if *v > 0 => *v as u64,
        Bound::Known(_) => {
            return Err(PlanError::UnsupportedConstruct {
                what: "non-positive slice step".into(),
                statement: statement.to_string(),
            })
        }
        Bound::Dynamic(name) => {
            return Err(PlanError::UnsupportedConstruct {
                what: format!("slice step '{}' not statically known", name),
                statement: statement.to_string(),
            })
        }
    };
    Ok((lower, upper, step))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionDef, Item, Program};
    use crate::extract::extract;

    fn int(v: i64) -> PrimExpr {
        PrimExpr::Lit(PrimLit::Int(v))
    }

    fn var(name: &str) -> PrimExpr {
        PrimExpr::Var(name.into())
    }

    fn assign(target: &str, value: Rhs) -> Stmt {
        Stmt::new(StmtKind::Assign {
            target: target.into(),
            value,
        })
    }

    fn int_list(target: &str, n: i64) -> Stmt {
        assign(
            target,
            Rhs::List(ListRhs::Literal((0..n).map(int).collect())),
        )
    }

    fn run_entry(stmts: Vec<Stmt>) -> EstimateResult {
        let units = Units {
            file_name: None,
            functions: Vec::new(),
            entry: stmts,
        };
        estimate(&units, &SizeModel::default())
    }

    fn size_of(result: &EstimateResult, stmt: &str, var: &str) -> VarStat {
        result.footprints.live[stmt][var]
    }

    #[test]
    fn capacity_table() {
        let m = SizeModel::default();
        assert_eq!(m.capacity(0), 0);
        assert_eq!(m.capacity(1), 4);
        assert_eq!(m.capacity(4), 4);
        assert_eq!(m.capacity(5), 8);
        assert_eq!(m.capacity(16), 16);
        assert_eq!(m.capacity(17), 25);
        assert_eq!(m.capacity(26), 35);
        assert_eq!(m.capacity(36), 49);
        assert_eq!(m.capacity(50), 64);
        assert_eq!(m.capacity(64), 64);
        // Past the table: ceil(n * 1.025).
        assert_eq!(m.capacity(65), 67);
        assert_eq!(m.capacity(100), 103);
        assert_eq!(m.capacity(1000), 1025);
    }

    #[test]
    fn literal_list_sizes_elements_plus_overhead() {
        let out = run_entry(vec![int_list("xs", 10)]);
        assert!(out.diagnostics.is_empty());
        let stat = size_of(&out, "xs = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]", "xs");
        assert_eq!(stat.length, Some(10));
        // 10 ints + 56 + 8 * capacity(10)=16.
        assert_eq!(stat.size, 10.0 * 28.0 + 56.0 + 8.0 * 16.0);
    }

    #[test]
    fn appends_in_loop_match_equivalent_literal() {
        let out = run_entry(vec![
            assign("xs", Rhs::List(ListRhs::Literal(vec![]))),
            Stmt::new(StmtKind::Loop {
                var: "i".into(),
                iter: LoopIter::Range(int(10)),
                body: vec![Stmt::new(StmtKind::Mutate {
                    target: "xs".into(),
                    op: MutateOp::Append(var("i")),
                })],
            }),
        ]);
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let stat = size_of(&out, "for i in range(10):", "xs");
        assert_eq!(stat.length, Some(10));
        assert_eq!(stat.size, 10.0 * 28.0 + 56.0 + 8.0 * 16.0);
    }

    #[test]
    fn slice_prorates_element_bytes() {
        let out = run_entry(vec![
            int_list("data", 11),
            assign(
                "rows",
                Rhs::List(ListRhs::Slice {
                    src: "data".into(),
                    spec: SliceSpec {
                        lower: Bound::Known(1),
                        upper: Bound::Absent,
                        step: Bound::Absent,
                    },
                }),
            ),
        ]);
        assert!(out.diagnostics.is_empty());
        let stat = size_of(&out, "rows = data[1:]", "rows");
        assert_eq!(stat.length, Some(10));
        // avg element = 11*28/11 = 28; 10 elements + overhead(10).
        assert_eq!(stat.size, 28.0 * 10.0 + 56.0 + 8.0 * 16.0);
    }

    #[test]
    fn negative_bounds_count_from_the_end() {
        let out = run_entry(vec![
            int_list("xs", 10),
            assign(
                "tail",
                Rhs::List(ListRhs::Slice {
                    src: "xs".into(),
                    spec: SliceSpec {
                        lower: Bound::Known(-3),
                        upper: Bound::Absent,
                        step: Bound::Absent,
                    },
                }),
            ),
        ]);
        let stat = size_of(&out, "tail = xs[-3:]", "tail");
        assert_eq!(stat.length, Some(3));
    }

    #[test]
    fn pop_on_empty_list_is_underflow() {
        let out = run_entry(vec![
            assign("xs", Rhs::List(ListRhs::Literal(vec![]))),
            Stmt::new(StmtKind::Mutate {
                target: "xs".into(),
                op: MutateOp::Pop,
            }),
        ]);
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].code, Some(codes::E0203));
    }

    #[test]
    fn undefined_variable_fails_fast() {
        let out = run_entry(vec![assign(
            "y",
            Rhs::Prim(PrimExpr::Bin {
                op: NumOp::Mul,
                lhs: Box::new(var("missing")),
                rhs: Box::new(int(2)),
            }),
        )]);
        assert_eq!(out.diagnostics[0].code, Some(codes::E0200));
        assert_eq!(
            out.diagnostics[0].statement.as_deref(),
            Some("y = missing * 2")
        );
    }

    #[test]
    fn division_by_zero_is_unsupported() {
        let out = run_entry(vec![assign(
            "y",
            Rhs::Prim(PrimExpr::Bin {
                op: NumOp::Div,
                lhs: Box::new(int(1)),
                rhs: Box::new(int(0)),
            }),
        )]);
        assert_eq!(out.diagnostics[0].code, Some(codes::E0202));
    }

    #[test]
    fn clear_keeps_only_the_header() {
        let out = run_entry(vec![
            int_list("xs", 5),
            Stmt::new(StmtKind::Mutate {
                target: "xs".into(),
                op: MutateOp::Clear,
            }),
        ]);
        let stat = size_of(&out, "xs.clear()", "xs");
        assert_eq!(stat.length, Some(0));
        assert_eq!(stat.size, 56.0);
    }

    #[test]
    fn empty_list_sizes_alike_from_literal_and_clear() {
        let out = run_entry(vec![
            assign("xs", Rhs::List(ListRhs::Literal(vec![]))),
            assign("ys", Rhs::List(ListRhs::Literal(vec![int(1)]))),
            Stmt::new(StmtKind::Mutate {
                target: "ys".into(),
                op: MutateOp::Clear,
            }),
        ]);
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let xs = size_of(&out, "ys.clear()", "xs");
        let ys = size_of(&out, "ys.clear()", "ys");
        assert_eq!(xs.size, ys.size);
        assert_eq!(ys.size, 56.0);
        assert_eq!(ys.length, Some(0));
    }

    #[test]
    fn del_removes_the_binding() {
        let out = run_entry(vec![
            int_list("xs", 5),
            assign("y", Rhs::Prim(int(1))),
            Stmt::new(StmtKind::Delete {
                target: "xs".into(),
                index: None,
            }),
        ]);
        let live = out.footprints.live_at("del xs").unwrap();
        assert!(!live.contains_key("xs"));
        assert!(live.contains_key("y"));
    }

    #[test]
    fn call_builds_ordered_trace_and_binds_result() {
        let program = Program {
            name: None,
            items: vec![
                Item::Function(FunctionDef {
                    name: "calculate_sum".into(),
                    params: vec!["data".into()],
                    body: vec![
                        assign("total", Rhs::Prim(int(0))),
                        Stmt::new(StmtKind::Loop {
                            var: "row".into(),
                            iter: LoopIter::Var("data".into()),
                            body: vec![assign(
                                "total",
                                Rhs::Prim(PrimExpr::Bin {
                                    op: NumOp::Add,
                                    lhs: Box::new(var("total")),
                                    rhs: Box::new(var("row")),
                                }),
                            )],
                        }),
                        Stmt::new(StmtKind::Return(ReturnValue::Var("total".into()))),
                    ],
                }),
                Item::Entry(vec![
                    int_list("data", 4),
                    Stmt::new(StmtKind::Call {
                        target: "sum_values".into(),
                        callee: "calculate_sum".into(),
                        args: vec!["data".into()],
                    }),
                ]),
            ],
        };
        let extracted = extract(&program);
        assert!(extracted.diagnostics.is_empty());
        let out = estimate(&extracted.units, &SizeModel::default());
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);

        let trace = out
            .footprints
            .trace_for("sum_values = calculate_sum(data)")
            .unwrap();
        let lines: Vec<&str> = trace.lines().collect();
        assert_eq!(
            lines,
            vec![
                "total = 0",
                "for row in data:",
                "total = total + row",
                "return total",
            ]
        );
        // data (4 ints + overhead) + total + the loop variable.
        let data_size = 4.0 * 28.0 + 56.0 + 8.0 * 4.0;
        let elem = data_size / 4.0;
        assert_eq!(trace.total(), data_size + 28.0 + elem);
        assert_eq!(
            out.footprints
                .execution_size("sum_values = calculate_sum(data)"),
            Some(trace.total())
        );

        // The caller sees the returned primitive.
        let stat = size_of(&out, "sum_values = calculate_sum(data)", "sum_values");
        assert_eq!(stat.size, 28.0);
        assert_eq!(stat.length, None);
    }

    #[test]
    fn conditional_runs_every_arm() {
        let out = run_entry(vec![
            assign("flag", Rhs::Prim(int(1))),
            Stmt::new(StmtKind::Conditional {
                arms: vec![
                    crate::ast::CondArm {
                        cond: Some(var("flag")),
                        body: vec![int_list("xs", 2)],
                    },
                    crate::ast::CondArm {
                        cond: None,
                        body: vec![int_list("ys", 3)],
                    },
                ],
            }),
        ]);
        assert!(out.diagnostics.is_empty());
        let live = out.footprints.live_at("if flag:").unwrap();
        assert!(live.contains_key("xs"));
        assert!(live.contains_key("ys"));
    }

    #[test]
    fn readlines_sizes_from_the_file() {
        let path = std::env::temp_dir().join(format!(
            "parplan-estimate-{}-readlines.txt",
            std::process::id()
        ));
        fs::write(&path, b"3,4\n5,6\n").unwrap();

        let out = run_entry(vec![
            assign(
                "FILE_NAME",
                Rhs::Prim(PrimExpr::Lit(PrimLit::Str(
                    path.to_string_lossy().into_owned(),
                ))),
            ),
            assign(
                "data",
                Rhs::List(ListRhs::ReadLines {
                    path: var("FILE_NAME"),
                }),
            ),
        ]);
        fs::remove_file(&path).unwrap();

        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let (_, stat) = out
            .footprints
            .live
            .iter()
            .find_map(|(k, vars)| vars.get("data").map(|s| (k.clone(), *s)))
            .unwrap();
        assert_eq!(stat.length, Some(2));
        assert_eq!(stat.size, 8.0 + 56.0);
    }

    #[test]
    fn size_model_accepts_partial_overrides() {
        let model: SizeModel = serde_json::from_str(r#"{ "int_size": 16.0 }"#).unwrap();
        assert_eq!(model.int_size, 16.0);
        assert_eq!(model.base_list_overhead, 56.0);
        assert_eq!(model.growth_factor, 1.025);
    }

    #[test]
    fn trace_serializes_in_execution_order() {
        let mut trace = Trace::default();
        trace.record("b = 1", 28.0);
        trace.record("a = 2", 56.0);
        let json = serde_json::to_string(&trace).unwrap();
        assert_eq!(json, r#"{"b = 1":28.0,"a = 2":56.0}"#);
    }
}
