// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all planner stages.
// Stages identify failure sites by statement text and unit name — the input
// is a typed program document, so there are no byte-offset spans to carry.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0200`, `W0100`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different semantic
/// meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable code constants, grouped by stage.
pub mod codes {
    use super::DiagCode;

    // Extraction (E01xx)
    pub const E0100: DiagCode = DiagCode("E0100"); // call nested inside a function body
    pub const E0101: DiagCode = DiagCode("E0101"); // duplicate function name
    pub const E0102: DiagCode = DiagCode("E0102"); // missing return statement

    // Estimation (E02xx)
    pub const E0200: DiagCode = DiagCode("E0200"); // undefined variable
    pub const E0201: DiagCode = DiagCode("E0201"); // type mismatch
    pub const E0202: DiagCode = DiagCode("E0202"); // unsupported construct
    pub const E0203: DiagCode = DiagCode("E0203"); // empty-list underflow
    pub const E0204: DiagCode = DiagCode("E0204"); // input-file inspection failed

    // Scheduling (E03xx)
    pub const E0300: DiagCode = DiagCode("E0300"); // empty node roster

    // Boundary artifacts (E05xx / W01xx)
    pub const E0500: DiagCode = DiagCode("E0500"); // missing input artifact
    pub const E0501: DiagCode = DiagCode("E0501"); // malformed artifact
    pub const W0100: DiagCode = DiagCode("W0100"); // opaque dependency key

    // Stage certificates (E06xx)
    pub const E0600: DiagCode = DiagCode("E0600"); // graph verification failed
    pub const E0601: DiagCode = DiagCode("E0601"); // schedule verification failed
    pub const E0602: DiagCode = DiagCode("E0602"); // plan verification failed

    // Parallelization (W02xx)
    pub const W0200: DiagCode = DiagCode("W0200"); // block left unplaced
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A planner diagnostic emitted by any stage.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub message: String,
    /// Rendered text of the statement the diagnostic refers to, if any.
    pub statement: Option<String>,
    /// Unit (function name or entry sequence) the diagnostic refers to.
    pub unit: Option<String>,
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, statement, unit, or hint.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            message: message.into(),
            statement: None,
            unit: None,
            hint: None,
        }
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the offending statement's rendered text.
    pub fn with_statement(mut self, text: impl Into<String>) -> Self {
        self.statement = Some(text.into());
        self
    }

    /// Attach the unit (function or entry sequence) name.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(unit) = &self.unit {
            write!(f, "\n  in: {}", unit)?;
        }
        if let Some(stmt) = &self.statement {
            write!(f, "\n  at: {}", stmt)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// True if any diagnostic in the slice is error-level.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}
