#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use shake_harness::{inspect, inspect_policy, pattern, write_fragmented};
use std::env;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("inspect") => {
            if args.len() < 2 {
                bail!("usage: shake-harness inspect <path>...");
            }
            for path in &args[1..] {
                let report = inspect(Path::new(path))?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Ok(())
        }
        Some("fragment") => fragment(&args[1..]),
        Some("policy") => {
            println!("{}", serde_json::to_string_pretty(&inspect_policy())?);
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn fragment(args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("usage: shake-harness fragment <path> [chunks] [kib]");
    }
    let path = Path::new(&args[0]);
    let chunks: usize = args
        .get(1)
        .map_or(Ok(30), |raw| raw.parse())
        .context("invalid chunk count")?;
    let kib: usize = args
        .get(2)
        .map_or(Ok(4096), |raw| raw.parse())
        .context("invalid size")?;
    let content = pattern(kib * 1024, 0x5A);
    write_fragmented(path, &content, chunks)?;
    let report = inspect(path)?;
    eprintln!(
        "wrote {} KiB in {chunks} chunks: {} fragments",
        kib,
        report.fragments()
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_usage() {
    println!("shake-harness: fixtures and extent reports for shake");
    println!();
    println!("USAGE:");
    println!("  shake-harness inspect <path>...");
    println!("  shake-harness fragment <path> [chunks] [kib]");
    println!("  shake-harness policy");
    println!();
    println!("`inspect` prints what a scan would learn about each path, with");
    println!("fragment positions. `fragment` writes a file of `kib` KiB (default");
    println!("4096) in `chunks` pieces (default 30), last piece first, and");
    println!("inspects it.");
}
