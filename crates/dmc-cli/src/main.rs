#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use dmc_cli::{
    RoundtripConfig, SimulateConfig, run_hint_selftest, run_roundtrip, run_simulation,
};
use dmc_hint::MAX_HINT_WIDTH;
use std::env;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("simulate") => simulate_cmd(&args[1..]),
        Some("roundtrip") => roundtrip_cmd(&args[1..]),
        Some("selftest") => selftest_cmd(&args[1..]),
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

fn print_usage() {
    println!("dmc-cli\n");
    println!("USAGE:");
    println!(
        "  dmc-cli simulate [--cache-size N] [--hint-size W] [--ops N] [--span N] [--hot-percent P] [--remove-every N] [--seed S]"
    );
    println!(
        "  dmc-cli roundtrip [--cache-size N] [--hint-size W] [--ops N] [--corrupt-every N] [--seed S]"
    );
    println!("  dmc-cli selftest [--max-width W]");
}

fn value<'a>(args: &'a [String], index: usize, flag: &str) -> Result<&'a str> {
    args.get(index + 1)
        .map(String::as_str)
        .with_context(|| format!("{flag} requires a value"))
}

fn simulate_cmd(args: &[String]) -> Result<()> {
    let mut config = SimulateConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        let flag = args[index].as_str();
        let raw = value(args, index, flag)?;
        match flag {
            "--cache-size" => config.cache_size = raw.parse().context("invalid --cache-size")?,
            "--hint-size" => config.hint_size = Some(raw.parse().context("invalid --hint-size")?),
            "--ops" => config.operations = raw.parse().context("invalid --ops")?,
            "--span" => config.span = raw.parse().context("invalid --span")?,
            "--hot-percent" => config.hot_percent = raw.parse().context("invalid --hot-percent")?,
            "--remove-every" => {
                config.remove_every = raw.parse().context("invalid --remove-every")?;
            }
            "--seed" => config.seed = raw.parse().context("invalid --seed")?,
            other => bail!("unknown simulate option: {other}"),
        }
        index += 2;
    }

    let report = run_simulation(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn roundtrip_cmd(args: &[String]) -> Result<()> {
    let mut config = RoundtripConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        let flag = args[index].as_str();
        let raw = value(args, index, flag)?;
        match flag {
            "--cache-size" => config.cache_size = raw.parse().context("invalid --cache-size")?,
            "--hint-size" => config.hint_size = raw.parse().context("invalid --hint-size")?,
            "--ops" => config.operations = raw.parse().context("invalid --ops")?,
            "--corrupt-every" => {
                config.corrupt_every = raw.parse().context("invalid --corrupt-every")?;
            }
            "--seed" => config.seed = raw.parse().context("invalid --seed")?,
            other => bail!("unknown roundtrip option: {other}"),
        }
        index += 2;
    }

    let report = run_roundtrip(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.verified != report.persisted {
        bail!(
            "{} of {} reloaded mappings point at the wrong cache block",
            report.persisted - report.verified,
            report.persisted
        );
    }
    Ok(())
}

fn selftest_cmd(args: &[String]) -> Result<()> {
    let mut max_width = MAX_HINT_WIDTH;
    let mut index = 0_usize;
    while index < args.len() {
        let flag = args[index].as_str();
        let raw = value(args, index, flag)?;
        match flag {
            "--max-width" => max_width = raw.parse().context("invalid --max-width")?,
            other => bail!("unknown selftest option: {other}"),
        }
        index += 2;
    }

    let report = run_hint_selftest(max_width)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
