// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the planner's 7 analysis passes, their dependency edges, and the
// artifacts they produce. Used by the pipeline driver to compute minimal pass
// subsets for each --emit target, and to skip passes whose outputs were
// supplied as boundary artifacts.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──

/// Identifies each planner pass (program-document deserialization is outside
/// the runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Extract,
    BuildDdg,
    Estimate,
    Group,
    Schedule,
    Parallelize,
    Emit,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type in the
/// analysis state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Units,      // extract::Units
    Ddg,        // ddg::Ddg
    Footprints, // estimate::Footprints
    Blocks,     // group::Blocks
    Schedule,   // schedule::Schedule
    Plan,       // parallel::ParallelPlan
    Documents,  // emit::PlanDocuments
}

impl ArtifactId {
    pub fn name(self) -> &'static str {
        match self {
            ArtifactId::Units => "units",
            ArtifactId::Ddg => "dependency graph",
            ArtifactId::Footprints => "footprints",
            ArtifactId::Blocks => "blocks",
            ArtifactId::Schedule => "schedule",
            ArtifactId::Plan => "parallelization plan",
            ArtifactId::Documents => "plan documents",
        }
    }
}

// ── Stage certificates ──

/// Machine-checkable postconditions of a completed stage. A stage that
/// produces a certificate exposes its obligations by name so --verify and
/// tests can report which one failed.
pub trait StageCert {
    /// Named obligations with their outcome.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    /// True when every obligation holds.
    fn all_pass(&self) -> bool {
        self.obligations().iter().all(|(_, ok)| *ok)
    }
}

// ── Pass descriptor ──

/// Static metadata about a planner pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// Describes what invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Extract => PassDescriptor {
            name: "extract",
            inputs: &[],
            outputs: &[ArtifactId::Units],
            invalidation_key: "program document",
            invariants: "units split, restricted shape checked",
        },
        PassId::BuildDdg => PassDescriptor {
            name: "build_ddg",
            inputs: &[PassId::Extract],
            outputs: &[ArtifactId::Ddg],
            invalidation_key: "units",
            invariants: "edges link each need to its most recent producer",
        },
        PassId::Estimate => PassDescriptor {
            name: "estimate",
            inputs: &[PassId::Extract, PassId::BuildDdg],
            outputs: &[ArtifactId::Footprints],
            invalidation_key: "units + ddg + size model",
            invariants: "every live binding sized, call traces recorded",
        },
        PassId::Group => PassDescriptor {
            name: "group",
            inputs: &[PassId::BuildDdg],
            outputs: &[ArtifactId::Blocks],
            invalidation_key: "ddg",
            invariants: "blocks keyed by need signature, readiness-ordered",
        },
        PassId::Schedule => PassDescriptor {
            name: "schedule",
            inputs: &[PassId::Group, PassId::Estimate],
            outputs: &[ArtifactId::Schedule],
            invalidation_key: "blocks + footprints + roster",
            invariants: "every scheduled block fits its assigned node",
        },
        PassId::Parallelize => PassDescriptor {
            name: "parallelize",
            inputs: &[PassId::Schedule],
            outputs: &[ArtifactId::Plan],
            invalidation_key: "schedule + footprints + roster",
            invariants: "chunks exactly cover each split argument",
        },
        PassId::Emit => PassDescriptor {
            name: "emit",
            inputs: &[PassId::Schedule, PassId::Parallelize],
            outputs: &[ArtifactId::Documents],
            invalidation_key: "schedule + plan + roster",
            invariants: "every placed statement appears on exactly one node",
        },
    }
}

// ── Dependency resolution ──

/// All 7 pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 7] = [
    PassId::Extract,
    PassId::BuildDdg,
    PassId::Estimate,
    PassId::Group,
    PassId::Schedule,
    PassId::Parallelize,
    PassId::Emit,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_group_skips_estimate() {
        let passes = required_passes(PassId::Group);
        assert_eq!(
            passes,
            vec![PassId::Extract, PassId::BuildDdg, PassId::Group]
        );
        assert!(!passes.contains(&PassId::Estimate));
    }

    #[test]
    fn required_passes_emit_includes_all() {
        let passes = required_passes(PassId::Emit);
        assert_eq!(passes.len(), 7);
        assert_eq!(*passes.last().unwrap(), PassId::Emit);
        for pass in ALL_PASSES {
            assert!(passes.contains(&pass));
        }
    }

    #[test]
    fn required_passes_extract_is_minimal() {
        assert_eq!(required_passes(PassId::Extract), vec![PassId::Extract]);
    }

    #[test]
    fn all_descriptors_have_outputs() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            assert!(
                !desc.outputs.is_empty(),
                "pass {:?} has no outputs declared",
                pass
            );
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            for dep in desc.inputs {
                let order = required_passes(*pass);
                let dep_pos = order.iter().position(|p| p == dep);
                let self_pos = order.iter().position(|p| p == pass);
                assert!(
                    dep_pos.unwrap() < self_pos.unwrap(),
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }
}
