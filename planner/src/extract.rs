// extract.rs — Statement extraction
//
// Splits a typed program into its callable units (declared functions) and the
// entry sequence, and checks the restricted shape the rest of the pipeline
// assumes: unique function names, exactly one top-level return per function,
// and no calls to user functions from inside a function body (units are a
// single level deep).
//
// Preconditions: a deserialized `ast::Program`.
// Postconditions: `Units` preserves declaration order; the entry sequence is
//                 the concatenation of prologue statements and `__main__`
//                 blocks in document order.
// Failure modes: shape violations are reported as diagnostics; extraction
//                still returns the offending units so later stages can be
//                skipped cleanly rather than crash.

use serde::{Deserialize, Serialize};

use crate::ast::{Item, Program, Stmt, StmtKind};
use crate::diag::{codes, DiagLevel, Diagnostic};

pub const ENTRY_UNIT: &str = "__main__";

/// One declared function, flattened for analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionUnit {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

/// Extraction output: every callable unit plus the entry sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Units {
    pub file_name: Option<String>,
    pub functions: Vec<FunctionUnit>,
    pub entry: Vec<Stmt>,
}

impl Units {
    pub fn function(&self, name: &str) -> Option<&FunctionUnit> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug)]
pub struct ExtractResult {
    pub units: Units,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn extract(program: &Program) -> ExtractResult {
    let mut diagnostics = Vec::new();
    let mut functions: Vec<FunctionUnit> = Vec::new();
    let mut entry = Vec::new();

    for item in &program.items {
        match item {
            Item::Function(def) => {
                if functions.iter().any(|f| f.name == def.name) {
                    diagnostics.push(
                        Diagnostic::new(
                            DiagLevel::Error,
                            format!("function '{}' defined twice", def.name),
                        )
                        .with_code(codes::E0101)
                        .with_unit(&def.name),
                    );
                    continue;
                }
                check_body(&def.name, &def.body, &mut diagnostics);
                functions.push(FunctionUnit {
                    name: def.name.clone(),
                    params: def.params.clone(),
                    body: def.body.clone(),
                });
            }
            Item::Entry(stmts) => entry.extend(stmts.iter().cloned()),
            Item::Stmt(stmt) => entry.push(stmt.clone()),
        }
    }

    ExtractResult {
        units: Units {
            file_name: program.name.clone(),
            functions,
            entry,
        },
        diagnostics,
    }
}

fn check_body(unit: &str, body: &[Stmt], diagnostics: &mut Vec<Diagnostic>) {
    let mut returns = 0usize;
    for stmt in body {
        if matches!(stmt.kind, StmtKind::Return(_)) {
            returns += 1;
        }
        reject_nested_calls(unit, stmt, diagnostics);
    }
    if returns != 1 {
        diagnostics.push(
            Diagnostic::new(
                DiagLevel::Error,
                format!(
                    "function '{}' must return exactly once at top level, found {}",
                    unit, returns
                ),
            )
            .with_code(codes::E0102)
            .with_unit(unit),
        );
    }
}

// Units are one level deep: only the entry sequence may call a declared
// function. A call inside a function body would require recursive call
// simulation the estimator does not perform.
fn reject_nested_calls(unit: &str, stmt: &Stmt, diagnostics: &mut Vec<Diagnostic>) {
    match &stmt.kind {
        StmtKind::Call { .. } => diagnostics.push(
            Diagnostic::new(DiagLevel::Error, "call inside a function body is unsupported")
                .with_code(codes::E0100)
                .with_unit(unit)
                .with_statement(stmt.to_string()),
        ),
        StmtKind::Loop { body, .. } => {
            for inner in body {
                reject_nested_calls(unit, inner, diagnostics);
            }
        }
        StmtKind::Conditional { arms } => {
            for arm in arms {
                for inner in &arm.body {
                    reject_nested_calls(unit, inner, diagnostics);
                }
            }
        }
        _ => {}
    }
}
