//! Driver: Treiber's stack against the stack observer.
//!
//! The `--ages`/`--no-ages` and `--ccas`/`--hwcas` knobs select the CAS
//! flavour; without age fields the cheating CAS is open to malicious reuse.

use std::env;
use std::process::ExitCode;
use std::time::Instant;

use smrcheck::factory::{no_reclamation_observer, stack_observer, treibers_stack};
use smrcheck::{check_conformance, MemorySetup, Options, RunSummary};

enum Expectation {
    Success,
    Failure,
    Unknown,
}

fn usage(bin: &str) {
    println!();
    println!(
        "Usage: {bin} [--PRF] [--GC] [--MM] [--ages/--no-ages] [--ccas/--hwcas] \
         [--malloc/--init] [--fail/--success] [--json]"
    );
    println!();
    println!("default: --PRF --ages --ccas --malloc");
    println!();
    println!("--PRF       => pointer-race-free semantics");
    println!("--GC        => garbage-collection semantics");
    println!("--MM        => explicitly managed memory semantics");
    println!("--ages      => age-checked comparisons (rules out CAS confusion)");
    println!("--no-ages   => plain comparisons (ABA-prone)");
    println!("--ccas      => allow top.next as the CAS source (atomic dereference)");
    println!("--hwcas     => hardware-compliant CAS only");
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
    let mut use_ages = true;
    let mut cheating_cas = true;
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
            "--ccas" => cheating_cas = true,
            "--hwcas" => cheating_cas = false,
            "--init" => mega_malloc = true,
            "--malloc" => mega_malloc = false,
            "--fail" => expec = Expectation::Failure,
            "--success" => expec = Expectation::Success,
            "--json" => json = true,
            other => {
                if other != "--help" && other != "help" {
                    println!("unrecognized command line argument: {other}");
                }
                usage("treibers_stack");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    let program = treibers_stack(cheating_cas, mega_malloc, use_ages)?;
    let lin = stack_observer(&program)?;
    let smr = no_reclamation_observer()?;

    println!("{}", program.listing(opts.print_id));
    println!("Memory semantics: {}", opts.msetup);
    println!("Using age fields: {}", if use_ages { "yes" } else { "no" });
    println!("Compare-and-swap: {}", if cheating_cas { "cheating" } else { "hw-compliant" });
    println!("Malloc vs. init : {}", if mega_malloc { "atomic init" } else { "malloc" });
    println!();

    let started = Instant::now();
    let result = check_conformance(&program, &lin, &smr, &opts);
    let verdict = if result.conformance { "  CORRECT" } else { "INCORRECT" };

    println!();
    println!("***********************************************************");
    println!("**     CONFORMANCE CHECK DONE, PROGRAM IS: {verdict}!    **");
    println!("***********************************************************");
    eprintln!("==> {verdict}");
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
