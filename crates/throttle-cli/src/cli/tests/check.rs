use std::path::PathBuf;

use super::parse;
use crate::cli::CliCommand;

#[test]
fn cli_parse_check() {
    let cli = parse(&["throttlectl", "check"]);
    assert!(cli.config.is_none());
    match cli.command {
        CliCommand::Check { bins } => assert!(bins.is_empty()),
        _ => panic!("expected Check"),
    }
}

#[test]
fn cli_parse_check_with_bins_and_config() {
    let cli = parse(&[
        "throttlectl",
        "check",
        "--bin",
        "www.example.com",
        "--bin",
        "lists.debian.org",
        "--config",
        "/tmp/t.toml",
    ]);
    assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.toml")));
    match cli.command {
        CliCommand::Check { bins } => assert_eq!(bins, ["www.example.com", "lists.debian.org"]),
        _ => panic!("expected Check with bins"),
    }
}
