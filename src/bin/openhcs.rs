//! The `openhcs` CLI binary (spec §6 "CLI surface"). A thin wrapper around
//! `Orchestrator::run`, in the same spirit as the teacher's `#[pyfunction]`
//! FFI entry points: parse input, call the pure Rust core, map the result.
//!
//! Custom processing functions are registered through the Python bridge
//! (`py_register_function`, see `lib.rs`); this binary only runs plates
//! whose pipeline steps name already-registered functions, which in
//! practice means `--dry-run` compilation checks or pipelines built
//! entirely from the engine's own built-ins. A full run with custom
//! functions is expected to go through the Python entry points instead.

use clap::Parser;
use openhcs_core::cli::{exit_code, load_config, Cli, Commands, EXIT_COMPILE_FAILURE, EXIT_TOTAL_FAILURE};
use openhcs_core::config::WellFilterMode;
use openhcs_core::memory_converter::ConverterGraph;
use openhcs_core::orchestrator::Orchestrator;
use openhcs_core::registry::FunctionRegistry;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { plate, config, wells, dry_run } => run(plate, config, wells, dry_run),
    }
}

fn run(plate: std::path::PathBuf, config: std::path::PathBuf, wells: Vec<String>, dry_run: bool) {
    let (mut global, pipeline) = match load_config(&config) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_COMPILE_FAILURE);
        }
    };

    if !wells.is_empty() {
        global.well_filter = wells;
        global.well_filter_mode = WellFilterMode::Include;
    }

    let orchestrator = match Orchestrator::new(&plate, global, FunctionRegistry::new(), ConverterGraph::new()) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("failed to initialize orchestrator: {e}");
            std::process::exit(EXIT_TOTAL_FAILURE);
        }
    };

    if dry_run {
        let mut failures = 0;
        for (well_id, result) in orchestrator.compile_plate(&pipeline) {
            match result {
                Ok(Some(plans)) => println!("{well_id}: compiled {} step(s)", plans.len()),
                Ok(None) => println!("{well_id}: skipped (no matching files)"),
                Err(e) => {
                    eprintln!("{well_id}: compile failed: {e}");
                    failures += 1;
                }
            }
        }
        std::process::exit(if failures > 0 { EXIT_COMPILE_FAILURE } else { 0 });
    }

    match orchestrator.run(&pipeline) {
        Ok(outcome) => {
            for (well, result) in &outcome.wells {
                log::info!("{well}: {result:?}");
            }
            if let Some(summary) = &outcome.analysis_summary {
                log::info!("analysis summary written ({} bytes)", summary.len());
            }
            std::process::exit(exit_code(&outcome));
        }
        Err(e) => {
            eprintln!("run failed: {e}");
            std::process::exit(EXIT_TOTAL_FAILURE);
        }
    }
}
