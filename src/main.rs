use anyhow::Context;
use clap::{parser::ValueSource, Arg, ArgAction, Command};
use colored::*;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use fgpt_ident::{
    config::IdentConfig,
    output::{build_fingerprints, FingerprintData, ReportWriter},
    packet::{load_splits, read_time_labels, CorpusOptions},
    synthesis::{BinaryOp, UnaryOp},
    FingerprintIdentifier, IdentificationOutcome,
};

fn build_cli() -> Command {
    Command::new("fgpt-ident")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Discovers TCP/IP traffic fingerprints in captured packet corpora")
        .arg(
            Arg::new("corpus")
                .value_name("CORPUS")
                .help("CSV corpus: time,ip_id,src_ip,dst_ip,src_port,dst_port,seq,window")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("functions")
                .short('f')
                .long("functions")
                .value_name("N")
                .help("Number of functions to synthesize")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("samples")
                .short('s')
                .long("samples")
                .value_name("N")
                .help("Packets sampled per iteration")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("threshold")
                .short('t')
                .long("threshold")
                .value_name("SCORE")
                .help("Initial effectiveness threshold")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("iterations")
                .short('i')
                .long("iterations")
                .value_name("N")
                .help("Iteration budget")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("times")
                .long("times")
                .value_name("FILE")
                .help("Time labels to load, one per line, in split order"),
        )
        .arg(
            Arg::new("limit")
                .short('l')
                .long("limit")
                .value_name("N")
                .help("Load at most N packets per split")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("exclude-zmap")
                .long("exclude-zmap")
                .help("Drop ZMap scan packets (IP id 54321) while loading")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("binary-ops")
                .long("binary-ops")
                .value_name("OPS")
                .help("Comma separated binary operations (xor, and, or)")
                .value_delimiter(','),
        )
        .arg(
            Arg::new("unary-ops")
                .long("unary-ops")
                .value_name("OPS")
                .help("Comma separated feature extractions, e.g. lbytes:1,rbytes:2,rbitshift:4")
                .value_delimiter(','),
        )
        .arg(
            Arg::new("seed1")
                .long("seed1")
                .value_name("SEED")
                .help("First base seed, random when omitted")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("seed2")
                .long("seed2")
                .value_name("SEED")
                .help("Second base seed, random when omitted")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("function-workers")
                .long("function-workers")
                .value_name("N")
                .help("Concurrent function evaluations")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("auto-workers")
                .long("auto-workers")
                .help("Size worker pools from the number of CPUs")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file (default: ~/.fgpt-ident.toml)"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("DIR")
                .help("Directory for report files"),
        )
        .arg(
            Arg::new("details")
                .long("details")
                .help("Print who each fingerprint matches")
                .action(ArgAction::SetTrue),
        )
}

/// Apply command line overrides on top of the file configuration
fn apply_overrides(mut config: IdentConfig, matches: &clap::ArgMatches) -> anyhow::Result<IdentConfig> {
    if let Some(n) = matches.get_one::<usize>("functions") {
        config.n_functions = *n;
    }
    if let Some(n) = matches.get_one::<usize>("samples") {
        config.n_samples = *n;
    }
    if let Some(t) = matches.get_one::<f64>("threshold") {
        config.threshold = *t;
    }
    if let Some(n) = matches.get_one::<usize>("iterations") {
        config.iterations = *n;
    }
    if let Some(times) = matches.get_one::<String>("times") {
        config.times_file = Some(PathBuf::from(times));
    }
    if let Some(limit) = matches.get_one::<usize>("limit") {
        config.limit = Some(*limit);
    }
    if matches.get_flag("exclude-zmap") {
        config.exclude_zmap = true;
    }
    if let Some(ops) = matches.get_many::<String>("binary-ops") {
        config.binary_ops = ops
            .map(|op| op.parse::<BinaryOp>().map_err(anyhow::Error::msg))
            .collect::<anyhow::Result<_>>()?;
    }
    if let Some(ops) = matches.get_many::<String>("unary-ops") {
        config.unary_ops = ops
            .map(|op| op.parse::<UnaryOp>().map_err(anyhow::Error::msg))
            .collect::<anyhow::Result<_>>()?;
    }
    if let Some(seed) = matches.get_one::<u64>("seed1") {
        config.seed1 = Some(*seed);
    }
    if let Some(seed) = matches.get_one::<u64>("seed2") {
        config.seed2 = Some(*seed);
    }
    if let Some(n) = matches.get_one::<usize>("function-workers") {
        config.function_workers = *n;
    }
    if let Some(dir) = matches.get_one::<String>("output") {
        config = config.with_output_dir(dir);
    }

    if matches.get_flag("auto-workers") {
        let cpu = num_cpus::get();
        if matches.value_source("function-workers") != Some(ValueSource::CommandLine) {
            config.function_workers = cpu * 2;
        }
        config.filter_workers = cpu * 8;
        config.subset_workers = cpu;
        println!(
            "{} {}",
            "[~] Sizing worker pools for CPUs:".bright_blue(),
            cpu.to_string().bright_white().bold()
        );
    }
    Ok(config)
}

fn print_fingerprints(outcome: &IdentificationOutcome, n_packets: usize, details: bool) {
    let fingerprints = build_fingerprints(&outcome.intersections, &outcome.function_results);
    println!(
        "{} {}",
        "[✓] Found fingerprints:".bright_green(),
        fingerprints.len().to_string().bright_white().bold()
    );
    for (i, (fingerprint, intersection)) in fingerprints.iter().zip(&outcome.intersections).enumerate() {
        println!();
        print!("{}", fingerprint.render(i).bright_cyan());
        println!(
            "  {} {} ({:.6})",
            "packets:".bright_blue(),
            intersection.size.to_string().bright_yellow(),
            intersection.size as f64 / n_packets.max(1) as f64
        );
        if details {
            print!("{}", FingerprintData::collect(fingerprint, &outcome.corpus).render(n_packets));
        }
    }
}

async fn run(matches: clap::ArgMatches) -> anyhow::Result<()> {
    let base_config = match matches.get_one::<String>("config") {
        Some(config_file) => {
            let config = IdentConfig::from_toml_file(config_file)
                .with_context(|| format!("Failed to load config file {}", config_file))?;
            println!("[~] Loaded config from {}", config_file);
            config
        }
        None => IdentConfig::load_default_config(),
    };
    let config = apply_overrides(base_config, &matches)?;

    let time_labels = match &config.times_file {
        Some(path) => read_time_labels(path)?,
        None => Vec::new(),
    };
    let options = CorpusOptions {
        time_labels,
        limit: config.limit,
        exclude_zmap: config.exclude_zmap,
    };

    let corpus_path = matches
        .get_one::<String>("corpus")
        .context("No corpus given")?;
    println!(
        "{} {}{}",
        "[~] Loading packets from".bright_blue(),
        corpus_path.bright_yellow(),
        if config.exclude_zmap { " without ZMap" } else { "" }
    );
    let load_start = Instant::now();
    let (splits, n_packets) = load_splits(corpus_path, &options)?;
    log::info!(
        "Got {} packets in {} splits in {:?}",
        n_packets,
        splits.len(),
        load_start.elapsed()
    );

    let output_dir = config.output_dir.clone();
    let identifier = FingerprintIdentifier::new(config)?;
    let start = Instant::now();
    let outcome = identifier.run(splits).await;
    println!(
        "{} {:?} ({})",
        "[~] Time elapsed for identifier:".bright_blue(),
        start.elapsed(),
        outcome.stop_reason
    );

    print_fingerprints(&outcome, n_packets, matches.get_flag("details"));

    let written = ReportWriter::new(&output_dir)
        .write(&outcome, n_packets)
        .with_context(|| format!("Failed to write reports to {}", output_dir.display()))?;
    println!(
        "{} {} {}",
        "[~] Wrote".bright_blue(),
        written.len().to_string().bright_white().bold(),
        format!("files to {}", output_dir.display()).bright_blue()
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = build_cli().get_matches();
    if let Err(e) = run(matches).await {
        eprintln!("{} {:#}", "[!] ERROR:".bright_red(), e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let matches = build_cli().get_matches_from([
            "fgpt-ident",
            "corpus.csv",
            "-s",
            "5000",
            "--threshold",
            "250",
            "--unary-ops",
            "lbytes:1,rbitshift:3",
            "--seed1",
            "7",
            "--exclude-zmap",
            "-o",
            "reports",
        ]);
        let config = apply_overrides(IdentConfig::default(), &matches).unwrap();
        assert_eq!(config.n_samples, 5000);
        assert_eq!(config.threshold, 250.0);
        assert_eq!(config.unary_ops, vec![UnaryOp::LeftBytes(1), UnaryOp::ShiftRight(3)]);
        assert_eq!(config.seed1, Some(7));
        assert_eq!(config.seed2, None);
        assert!(config.exclude_zmap);
        assert_eq!(config.n_functions, IdentConfig::default().n_functions);
        assert_eq!(config.output_dir, PathBuf::from("reports"));
    }

    #[test]
    fn test_bad_operator_is_rejected() {
        let matches = build_cli().get_matches_from(["fgpt-ident", "corpus.csv", "--binary-ops", "nand"]);
        assert!(apply_overrides(IdentConfig::default(), &matches).is_err());
    }
}
