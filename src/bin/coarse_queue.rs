//! Driver: the coarse queue against the queue observer.
//!
//! Exit code 0 iff the verdict matches the `--fail`/`--success` expectation
//! (or unconditionally when no expectation is given).

use std::env;
use std::process::ExitCode;
use std::time::Instant;

use smrcheck::factory::{coarse_queue, no_reclamation_observer, queue_observer};
use smrcheck::{check_conformance, MemorySetup, Options, RunSummary};

enum Expectation {
    Success,
    Failure,
    Unknown,
}

fn usage(bin: &str) {
    println!();
    println!("Usage: {bin} [--PRF] [--GC] [--MM] [--malloc/--init] [--fail/--success] [--json]");
    println!();
    println!("default: --PRF --malloc");
    println!();
    println!("--PRF       => pointer-race-free semantics");
    println!("--GC        => garbage-collection semantics");
    println!("--MM        => explicitly managed memory semantics");
    println!("--init      => malloc atomically initialises the cell's fields");
    println!("--malloc    => plain malloc");
    println!("--fail      => exit 0 iff the program is proven incorrect");
    println!("--success   => exit 0 iff the program is proven correct");
    println!("--json      => additionally print the run summary as JSON");
    println!();
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let mut opts = Options::default();
    let mut mega_malloc = false;
    let mut expec = Expectation::Unknown;
    let mut json = false;
    for a in &args {
        match a.as_str() {
            "--PRF" => opts.msetup = MemorySetup::Prf,
            "--GC" => opts.msetup = MemorySetup::Gc,
            "--MM" => opts.msetup = MemorySetup::Mm,
            "--init" => mega_malloc = true,
            "--malloc" => mega_malloc = false,
            "--fail" => expec = Expectation::Failure,
            "--success" => expec = Expectation::Success,
            "--json" => json = true,
            other => {
                if other != "--help" && other != "help" {
                    println!("unrecognized command line argument: {other}");
                }
                usage("coarse_queue");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    let program = coarse_queue(mega_malloc)?;
    let lin = queue_observer(&program)?;
    let smr = no_reclamation_observer()?;

    println!("{}", program.listing(opts.print_id));
    println!("Memory semantics: {}", opts.msetup);
    println!("Malloc vs. init : {}", if mega_malloc { "atomic init" } else { "malloc" });
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
