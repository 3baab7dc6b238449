use clap::Parser;

use super::parse;
use crate::cli::{Cli, CliCommand};

#[test]
fn cli_parse_simulate_defaults() {
    match parse(&["throttlectl", "simulate", "--group-type", "web", "--group", "g", "--bin", "A"]).command {
        CliCommand::Simulate(args) => {
            assert_eq!(args.group_type, "web");
            assert_eq!(args.group, "g");
            assert_eq!(args.bins, ["A"]);
            assert_eq!(
                (args.workers, args.cycles, args.fetches, args.reads, args.read_bytes),
                (10, 3, 3, 3, 1000)
            );
            assert!(!args.json);
        }
        _ => panic!("expected Simulate"),
    }
}

#[test]
fn cli_parse_simulate_overrides() {
    let cli = parse(&[
        "throttlectl",
        "--config",
        "rules.toml",
        "simulate",
        "--group-type",
        "web",
        "--group",
        "g",
        "--bin",
        "A",
        "--bin",
        "B",
        "--workers",
        "4",
        "--read-bytes",
        "512",
        "--json",
    ]);
    assert!(cli.config.is_some());
    match cli.command {
        CliCommand::Simulate(args) => {
            assert_eq!(args.bins, ["A", "B"]);
            assert_eq!(args.workers, 4);
            assert_eq!(args.read_bytes, 512);
            assert!(args.json);
        }
        _ => panic!("expected Simulate with overrides"),
    }
}

#[test]
fn cli_simulate_requires_a_bin() {
    assert!(Cli::try_parse_from(["throttlectl", "simulate", "--group-type", "web", "--group", "g"]).is_err());
}
