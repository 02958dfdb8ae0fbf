// pipeline.rs — End-to-end pass driver
//
// Owns the analysis state (every artifact plus accumulated diagnostics) and
// runs passes in dependency order. Artifacts supplied at the boundary prune
// the passes that would have computed them; a pass whose inputs are missing
// (typically because an upstream pass failed) is skipped with a diagnostic
// instead of crashing, so the run still yields everything computable.
//
// Preconditions: roster and size model installed before running.
// Postconditions: after `run_to(p)`, either every output of `p` is present or
//                 a diagnostic explains which input was missing.
// Failure modes: none beyond diagnostics; the driver itself does not error.
// Side effects: verbose mode prints per-pass timings to stderr.

use std::collections::HashSet;
use std::time::Instant;

use crate::ast::Program;
use crate::ddg::{self, Ddg};
use crate::diag::{codes, DiagCode, DiagLevel, Diagnostic};
use crate::emit::{self, PlanDocuments};
use crate::estimate::{self, Footprints, SizeModel};
use crate::extract::{self, Units};
use crate::group::{self, Blocks};
use crate::parallel::{self, ParallelPlan};
use crate::pass::{descriptor, ArtifactId, PassId, StageCert};
use crate::schedule::{self, NodeSpec, Schedule};

/// Everything a run accumulates: inputs, artifacts, diagnostics.
#[derive(Debug, Default)]
pub struct AnalysisState {
    pub program: Option<Program>,
    pub roster: Vec<NodeSpec>,
    pub size_model: SizeModel,

    pub units: Option<Units>,
    pub ddg: Option<Ddg>,
    pub footprints: Option<Footprints>,
    pub blocks: Option<Blocks>,
    pub schedule: Option<Schedule>,
    pub plan: Option<ParallelPlan>,
    pub documents: Option<PlanDocuments>,

    pub diagnostics: Vec<Diagnostic>,
    pub verbose: bool,
}

impl AnalysisState {
    pub fn new(roster: Vec<NodeSpec>, size_model: SizeModel) -> Self {
        AnalysisState {
            roster,
            size_model,
            ..AnalysisState::default()
        }
    }

    pub fn artifact_present(&self, id: ArtifactId) -> bool {
        match id {
            ArtifactId::Units => self.units.is_some(),
            ArtifactId::Ddg => self.ddg.is_some(),
            ArtifactId::Footprints => self.footprints.is_some(),
            ArtifactId::Blocks => self.blocks.is_some(),
            ArtifactId::Schedule => self.schedule.is_some(),
            ArtifactId::Plan => self.plan.is_some(),
            ArtifactId::Documents => self.documents.is_some(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.level == DiagLevel::Error)
    }

    /// Run every pass needed to produce `terminal`'s artifacts. Passes whose
    /// outputs are already present (boundary-supplied or computed earlier)
    /// are pruned along with their whole input subtree.
    pub fn run_to(&mut self, terminal: PassId) {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        self.needed(terminal, &mut visited, &mut order);
        for pass in order {
            self.run(pass);
        }
    }

    /// The full pipeline.
    pub fn run_all(&mut self) {
        self.run_to(PassId::Emit);
    }

    fn needed(&self, id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
        if !visited.insert(id) {
            return;
        }
        let desc = descriptor(id);
        if desc.outputs.iter().all(|&a| self.artifact_present(a)) {
            return;
        }
        for &input in desc.inputs {
            self.needed(input, visited, order);
        }
        order.push(id);
    }

    /// Run a single pass. No-op when its outputs already exist; skips with a
    /// diagnostic when an input artifact is absent.
    pub fn run(&mut self, id: PassId) {
        let desc = descriptor(id);
        if desc.outputs.iter().all(|&a| self.artifact_present(a)) {
            return;
        }

        let mut missing: Vec<&str> = Vec::new();
        if id == PassId::Extract && self.program.is_none() {
            missing.push("program document");
        }
        for &input in desc.inputs {
            for &artifact in descriptor(input).outputs {
                if !self.artifact_present(artifact) {
                    missing.push(artifact.name());
                }
            }
        }
        if !missing.is_empty() {
            self.diagnostics.push(
                Diagnostic::new(
                    DiagLevel::Error,
                    format!("skipping {}: missing {}", desc.name, missing.join(", ")),
                )
                .with_code(codes::E0500),
            );
            return;
        }

        let started = Instant::now();
        match id {
            PassId::Extract => {
                let Some(program) = &self.program else { return };
                let result = extract::extract(program);
                if self.finish(result.diagnostics) {
                    self.units = Some(result.units);
                }
            }
            PassId::BuildDdg => {
                let Some(units) = &self.units else { return };
                let result = ddg::build(units);
                if self.finish(result.diagnostics) {
                    self.ddg = Some(result.ddg);
                }
            }
            PassId::Estimate => {
                let Some(units) = &self.units else { return };
                let result = estimate::estimate(units, &self.size_model);
                if self.finish(result.diagnostics) {
                    self.footprints = Some(result.footprints);
                }
            }
            PassId::Group => {
                let Some(ddg) = &self.ddg else { return };
                let result = group::group(ddg);
                if self.finish(result.diagnostics) {
                    self.blocks = Some(result.blocks);
                }
            }
            PassId::Schedule => {
                let (Some(blocks), Some(footprints)) = (&self.blocks, &self.footprints) else {
                    return;
                };
                let result = schedule::schedule(blocks, footprints, &self.roster);
                if self.finish(result.diagnostics) {
                    self.schedule = Some(result.schedule);
                }
            }
            PassId::Parallelize => {
                let (Some(sched), Some(footprints)) = (&self.schedule, &self.footprints) else {
                    return;
                };
                let result = parallel::parallelize(sched, footprints, &self.roster);
                if self.finish(result.diagnostics) {
                    self.plan = Some(result.plan);
                }
            }
            PassId::Emit => {
                let (Some(sched), Some(plan)) = (&self.schedule, &self.plan) else {
                    return;
                };
                let result = emit::emit(sched, plan, &self.roster);
                if self.finish(result.diagnostics) {
                    self.documents = Some(result.documents);
                }
            }
        }
        if self.verbose {
            eprintln!(
                "parplan: {} {:.1}ms",
                desc.name,
                started.elapsed().as_secs_f64() * 1000.0
            );
        }
    }

    /// Record a pass's diagnostics; the artifact is kept only when the pass
    /// produced no errors, so downstream passes skip instead of consuming a
    /// half-built artifact.
    fn finish(&mut self, diagnostics: Vec<Diagnostic>) -> bool {
        let clean = diagnostics.iter().all(|d| d.level != DiagLevel::Error);
        self.diagnostics.extend(diagnostics);
        clean
    }

    /// Re-check every stage certificate against the current artifacts and
    /// report each failed obligation.
    pub fn verify(&mut self) {
        if let Some(ddg) = &self.ddg {
            let cert = ddg::certify(ddg);
            self.report_cert("dependency graph", &cert, codes::E0600);
        }
        if let (Some(ddg), Some(blocks)) = (&self.ddg, &self.blocks) {
            let cert = group::certify(ddg, blocks);
            self.report_cert("grouping", &cert, codes::E0600);
        }
        if let (Some(sched), Some(blocks), Some(footprints)) =
            (&self.schedule, &self.blocks, &self.footprints)
        {
            let cert = schedule::certify(sched, blocks, footprints, &self.roster);
            self.report_cert("schedule", &cert, codes::E0601);
        }
        if let (Some(plan), Some(footprints)) = (&self.plan, &self.footprints) {
            let cert = parallel::certify(plan, footprints);
            self.report_cert("parallelization plan", &cert, codes::E0602);
        }
    }

    fn report_cert(&mut self, what: &str, cert: &dyn StageCert, code: DiagCode) {
        if cert.all_pass() {
            return;
        }
        let failed: Vec<&str> = cert
            .obligations()
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| *name)
            .collect();
        self.diagnostics.push(
            Diagnostic::new(
                DiagLevel::Error,
                format!("{} verification failed: {}", what, failed.join(", ")),
            )
            .with_code(code),
        );
    }
}
