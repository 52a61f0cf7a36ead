//! Driver: the Michael–Scott queue, verified in summary mode.
//!
//! Interference is replaced by the per-function summaries; the run includes
//! the CHK-MIMIC soundness pass over the finished encoding.

use std::env;
use std::process::ExitCode;
use std::time::Instant;

use smrcheck::factory::{michael_scott_queue, no_reclamation_observer, queue_observer};
use smrcheck::{check_conformance, MemorySetup, Mode, Options, RunSummary};

enum Expectation {
    Success,
    Failure,
    Unknown,
}

fn usage(bin: &str) {
    println!();
    println!(
        "Usage: {bin} [--PRF] [--GC] [--MM] [--ages/--no-ages] [--interference/--summaries] \
         [--malloc/--init] [--fail/--success] [--json]"
    );
    println!();
    println!("default: --PRF --ages --summaries --malloc");
    println!();
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let mut opts = Options::default();
    opts.mode = Mode::Summary;
    let mut use_ages = true;
    let mut mega_malloc = false;
    let mut expec = Expectation::Unknown;
    let mut json = false;
    for a in &args {
        match a.as_str() {
            "--PRF" => opts.msetup = MemorySetup::Prf,
            "--GC" => opts.msetup = MemorySetup::Gc,
            "--MM" => opts.msetup = MemorySetup::Mm,
            "--ages" => use_ages = true,
            "--no-ages" => use_ages = false,
            "--summaries" => opts.mode = Mode::Summary,
            "--interference" => opts.mode = Mode::Interference,
            "--init" => mega_malloc = true,
            "--malloc" => mega_malloc = false,
            "--fail" => expec = Expectation::Failure,
            "--success" => expec = Expectation::Success,
            "--json" => json = true,
            other => {
                if other != "--help" && other != "help" {
                    println!("unrecognized command line argument: {other}");
                }
                usage("michael_scott");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    let program = michael_scott_queue(mega_malloc, use_ages, use_ages)?;
    let lin = queue_observer(&program)?;
    let smr = no_reclamation_observer()?;

    println!("{}", program.listing(opts.print_id));
    println!("Memory semantics: {}", opts.msetup);
    println!(
        "Analysis mode   : {}",
        if opts.mode == Mode::Summary { "summaries + CHK-MIMIC" } else { "interference" }
    );
    println!();

    let started = Instant::now();
    let result = check_conformance(&program, &lin, &smr, &opts);
    let verdict = if result.conformance { "  CORRECT" } else { "INCORRECT" };

    println!();
    println!("***********************************************************");
    println!("**     CONFORMANCE CHECK DONE, PROGRAM IS: {verdict}!    **");
    println!("***********************************************************");
    if let Some(reason) = &result.reason {
        println!();
        println!("Reason:\n    {reason}");
    }

    let summary = RunSummary::new(program.name(), &result, started);
    println!();
    println!("{}", summary.condensed(&args));
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(match expec {
        Expectation::Unknown => ExitCode::SUCCESS,
        Expectation::Success if result.conformance => ExitCode::SUCCESS,
        Expectation::Failure if !result.conformance => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
