//! Resource build tool.
//!
//! Thin wrapper over [`plinth_resource::build`]: loads a project manifest,
//! builds the requested targets and maps the outcome to an exit code.
//! Applications with their own resource types wrap the library the same way
//! and pass their populated reflection registry instead of the empty one.

use clap::Parser;
use plinth_core::interner::intern;
use plinth_core::reflection::RegistryBuilder;
use plinth_resource::{build, BuildOutcome, BuildSetup, Project};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "plinth-build", about = "Builds plinth resource projects")]
struct Arguments {
    /// Path to the project manifest.
    project: PathBuf,

    /// Targets to build; all project targets when omitted.
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Additionally pack deployed outputs into one indexed container per
    /// target.
    #[arg(long)]
    pack: bool,

    /// Log verbosity: error, warn, info, debug or trace.
    #[arg(long, default_value = "info")]
    verbosity: String,
}

fn main() -> ExitCode {
    let arguments = Arguments::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&arguments.verbosity))
        .init();

    let project = match Project::load(&arguments.project) {
        Ok(project) => project,
        Err(error) => {
            tracing::error!(%error, "project manifest failed to load");
            return ExitCode::from(2);
        }
    };

    let mut registry = RegistryBuilder::new();
    plinth_resource::register_provider_types(&mut registry);

    let setup = BuildSetup {
        project,
        registry: registry.build(),
        targets_to_build: arguments.targets.iter().map(|name| intern(name)).collect(),
        pack: arguments.pack,
    };

    let report = build(&setup);
    for diagnostic in &report.diagnostics {
        tracing::warn!("{}", diagnostic);
    }
    tracing::info!(
        built = report.built.len(),
        failed = report.failed.len(),
        skipped = report.skipped,
        "build finished"
    );

    match report.outcome {
        BuildOutcome::Success => ExitCode::SUCCESS,
        BuildOutcome::PartialFailure => ExitCode::from(1),
        BuildOutcome::Fatal => ExitCode::from(2),
    }
}
