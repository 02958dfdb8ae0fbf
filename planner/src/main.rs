use clap::Parser;
use std::path::PathBuf;

use parplan::boundary;
use parplan::pass::PassId;
use parplan::pipeline::AnalysisState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitTarget {
    Units,
    Graph,
    Footprints,
    Blocks,
    Schedule,
    Plan,
    Docs,
}

impl EmitTarget {
    fn terminal(self) -> PassId {
        match self {
            EmitTarget::Units => PassId::Extract,
            EmitTarget::Graph => PassId::BuildDdg,
            EmitTarget::Footprints => PassId::Estimate,
            EmitTarget::Blocks => PassId::Group,
            EmitTarget::Schedule => PassId::Schedule,
            EmitTarget::Plan => PassId::Parallelize,
            EmitTarget::Docs => PassId::Emit,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "parplan",
    version,
    about = "Memory-aware execution planner — places restricted data-processing programs onto memory-limited clusters"
)]
struct Cli {
    /// Typed program document (JSON). Optional when the front artifacts are
    /// supplied through --blocks/--live-vars/--footprints.
    program: Option<PathBuf>,

    /// Node roster: JSON array of {name, memory}
    #[arg(long)]
    roster: PathBuf,

    /// Pre-extracted blocks artifact (skips extraction through grouping)
    #[arg(long)]
    blocks: Option<PathBuf>,

    /// Live-variable table (paired with --footprints, skips estimation)
    #[arg(long)]
    live_vars: Option<PathBuf>,

    /// Function footprint traces (paired with --live-vars)
    #[arg(long)]
    footprints: Option<PathBuf>,

    /// Size-model override; absent fields keep their defaults
    #[arg(long)]
    size_model: Option<PathBuf>,

    /// Output directory for emitted artifacts
    #[arg(long, default_value = "plan_out")]
    out_dir: PathBuf,

    /// Artifact to emit (repeatable; default: schedule, plan, docs)
    #[arg(long, value_enum)]
    emit: Vec<EmitTarget>,

    /// Re-check stage certificates after the run
    #[arg(long)]
    verify: bool,

    /// Print per-pass timing to stderr
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    // ── Load inputs ──
    let roster = match boundary::read_roster(&cli.roster) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("parplan: error: {}", e);
            std::process::exit(2);
        }
    };

    let size_model = match &cli.size_model {
        Some(path) => match boundary::read_size_model(path) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("parplan: error: {}", e);
                std::process::exit(2);
            }
        },
        None => Default::default(),
    };

    let mut state = AnalysisState::new(roster, size_model);
    state.verbose = cli.verbose;

    // The provenance digest fingerprints the primary input: the program
    // document, or the blocks artifact when planning starts there.
    let input_digest = cli
        .program
        .as_ref()
        .or(cli.blocks.as_ref())
        .and_then(|path| boundary::digest_file(path));

    if let Some(path) = &cli.program {
        match boundary::read_program(path) {
            Ok(program) => state.program = Some(program),
            Err(e) => {
                eprintln!("parplan: error: {}", e);
                std::process::exit(2);
            }
        }
        if cli.verbose {
            eprintln!("parplan: program = {}", path.display());
        }
    }

    if let Some(path) = &cli.blocks {
        match boundary::read_blocks(path) {
            Ok((blocks, warnings)) => {
                state.diagnostics.extend(warnings);
                state.blocks = Some(blocks);
            }
            Err(e) => {
                eprintln!("parplan: error: {}", e);
                std::process::exit(2);
            }
        }
    }

    match (&cli.live_vars, &cli.footprints) {
        (Some(live_path), Some(trace_path)) => {
            let live = match boundary::read_live_vars(live_path) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("parplan: error: {}", e);
                    std::process::exit(2);
                }
            };
            let traces = match boundary::read_traces(trace_path) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("parplan: error: {}", e);
                    std::process::exit(2);
                }
            };
            state.footprints = Some(boundary::assemble_footprints(live, traces));
        }
        (None, None) => {}
        _ => {
            eprintln!("parplan: error: --live-vars and --footprints must be given together");
            std::process::exit(2);
        }
    }

    // ── Run the requested passes ──
    let targets: Vec<EmitTarget> = if cli.emit.is_empty() {
        vec![EmitTarget::Schedule, EmitTarget::Plan, EmitTarget::Docs]
    } else {
        let mut seen = Vec::new();
        for target in &cli.emit {
            if !seen.contains(target) {
                seen.push(*target);
            }
        }
        seen
    };

    for target in &targets {
        state.run_to(target.terminal());
    }

    if cli.verify {
        state.verify();
    }

    for diag in &state.diagnostics {
        eprintln!("parplan: {}", diag);
    }

    // ── Emit whatever was produced ──
    let provenance = boundary::Provenance::new(input_digest);
    let mut written: Vec<PathBuf> = Vec::new();
    for target in &targets {
        let result = match target {
            EmitTarget::Units => state
                .units
                .as_ref()
                .map(|units| boundary::write_units(&cli.out_dir, units).map(|p| vec![p])),
            EmitTarget::Graph => state
                .ddg
                .as_ref()
                .map(|ddg| boundary::write_graph(&cli.out_dir, ddg).map(|p| vec![p])),
            EmitTarget::Footprints => state
                .footprints
                .as_ref()
                .map(|fp| boundary::write_footprints(&cli.out_dir, fp)),
            EmitTarget::Blocks => state
                .blocks
                .as_ref()
                .map(|blocks| boundary::write_blocks(&cli.out_dir, blocks).map(|p| vec![p])),
            EmitTarget::Schedule => state.schedule.as_ref().map(|schedule| {
                boundary::write_schedule(&cli.out_dir, schedule, &provenance).map(|p| vec![p])
            }),
            EmitTarget::Plan => state.plan.as_ref().map(|plan| {
                boundary::write_plan(&cli.out_dir, plan, &provenance).map(|p| vec![p])
            }),
            EmitTarget::Docs => state
                .documents
                .as_ref()
                .map(|docs| boundary::write_documents(&cli.out_dir, docs)),
        };
        match result {
            Some(Ok(paths)) => written.extend(paths),
            Some(Err(e)) => {
                eprintln!("parplan: error: {}", e);
                std::process::exit(2);
            }
            // Not produced; the diagnostics above say why.
            None => {}
        }
    }

    if cli.verbose {
        for path in &written {
            eprintln!("parplan: wrote {}", path.display());
        }
    }

    if state.has_errors() {
        std::process::exit(1);
    }
}
