// error.rs — Planner error type
//
// One enum for every statement-scoped failure the analysis stages can hit.
// All variants carry enough context (statement text, variable, unit) for a
// caller to fix the input program or artifacts. No retries anywhere — inputs
// are static, so a retry cannot change the outcome.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum PlanError {
    /// A need references a variable the estimator never bound.
    UndefinedVariable { name: String, statement: String },
    /// An operation expected a list/primitive but the binding says otherwise.
    TypeMismatch {
        name: String,
        expected: &'static str,
        statement: String,
    },
    /// An expression or statement shape the estimator does not model.
    UnsupportedConstruct { what: String, statement: String },
    /// `pop`/`remove` on a zero-length list.
    EmptyListUnderflow { name: String, statement: String },
    /// A call whose argument is consumed by a nested loop over that argument.
    InfeasibleParallelization { statement: String, argument: String },
    /// A required boundary artifact is absent.
    MissingArtifact { artifact: &'static str },
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    JsonError {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::UndefinedVariable { name, statement } => {
                write!(f, "undefined variable '{}' in `{}`", name, statement)
            }
            PlanError::TypeMismatch {
                name,
                expected,
                statement,
            } => {
                write!(
                    f,
                    "variable '{}' is not a {} in `{}`",
                    name, expected, statement
                )
            }
            PlanError::UnsupportedConstruct { what, statement } => {
                write!(f, "unsupported construct ({}) in `{}`", what, statement)
            }
            PlanError::EmptyListUnderflow { name, statement } => {
                write!(f, "removal from empty list '{}' in `{}`", name, statement)
            }
            PlanError::InfeasibleParallelization {
                statement,
                argument,
            } => {
                write!(
                    f,
                    "infeasible: nested loop iterates over argument '{}' of `{}`",
                    argument, statement
                )
            }
            PlanError::MissingArtifact { artifact } => {
                write!(f, "missing required input artifact: {}", artifact)
            }
            PlanError::IoError { path, source } => {
                write!(f, "{}: {}", path.display(), source)
            }
            PlanError::JsonError { path, source } => {
                write!(f, "{}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for PlanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlanError::IoError { source, .. } => Some(source),
            PlanError::JsonError { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl PlanError {
    /// Statement text the error refers to, if any.
    pub fn statement(&self) -> Option<&str> {
        match self {
            PlanError::UndefinedVariable { statement, .. }
            | PlanError::TypeMismatch { statement, .. }
            | PlanError::UnsupportedConstruct { statement, .. }
            | PlanError::EmptyListUnderflow { statement, .. }
            | PlanError::InfeasibleParallelization { statement, .. } => Some(statement),
            _ => None,
        }
    }
}
