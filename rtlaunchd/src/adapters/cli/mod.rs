// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{Args, CommandFactory, FromArgMatches, Parser, Subcommand};

pub mod format;

#[derive(Parser, Debug)]
#[command(
    name = "rtlaunchd",
    version,
    about = "Run radiative-transfer simulations on remote hosts and track them to completion",
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < RTLAUNCH_CONFIG_PATH < --config.\n\
Every command first reconciles jobs left outstanding by a previous run."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        global = true,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, RTLAUNCH_CONFIG_PATH or the default location is used if present."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long = "hosts",
        global = true,
        value_name = "PATH",
        help = "Host profiles file. Overrides `hosts_path` from the config file."
    )]
    pub hosts_path: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "SQLite job database. Overrides `database_path` from the config file."
    )]
    pub database: Option<PathBuf>,
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a simulation and start it on a host.
    Submit(SubmitArgs),
    /// Show the state of a job.
    Status(JobArgs),
    /// Cancel a job. Finished jobs are left untouched.
    Cancel(JobIdArg),
    /// Retrieve the output of a finished job.
    Output(JobIdArg),
    /// List tracked jobs.
    List(ListArgs),
    /// Show the recorded state transitions of a job.
    History(JobArgs),
    /// Poll outstanding jobs until all are finished or Ctrl-C is pressed.
    Watch,
    /// List configured host profiles.
    Hosts(HostsArgs),
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Host profile name.
    #[arg(long, value_name = "NAME")]
    pub host: String,
    /// Simulation description file.
    #[arg(long, value_name = "FILE")]
    pub description: PathBuf,
    /// Input file or directory uploaded next to the description.
    #[arg(long = "input", value_name = "PATH", action = clap::ArgAction::Append)]
    pub inputs: Vec<PathBuf>,
    /// Local directory for retrieved output. Defaults to the description's directory.
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub processes: u32,
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub threads: u32,
    /// Retrieve only output files matching GLOB (repeatable). Everything when omitted.
    #[arg(long = "retrieve", value_name = "GLOB", action = clap::ArgAction::Append)]
    pub retrieve: Vec<String>,
    /// Delete the remote run directory once output has been retrieved.
    #[arg(long)]
    pub remove_remote: bool,
    /// Stay attached until the job finishes.
    #[arg(long)]
    pub wait: bool,
}

#[derive(Args, Debug)]
pub struct JobIdArg {
    pub job_id: i64,
}

#[derive(Args, Debug)]
pub struct JobArgs {
    pub job_id: i64,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, value_name = "NAME")]
    pub host: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct HostsArgs {
    /// Check that each host's SSH port accepts connections.
    #[arg(long)]
    pub check: bool,
    #[arg(long)]
    pub json: bool,
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

pub fn cli_command() -> clap::Command {
    Opts::command()
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    let verbose_override = matches.get_flag("verbose").then_some(true);
    let opts = Opts::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    ParsedOpts {
        opts,
        verbose_override,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opts {
        let matches = cli_command().try_get_matches_from(args).unwrap();
        Opts::from_arg_matches(&matches).unwrap()
    }

    #[test]
    fn command_definition_is_consistent() {
        cli_command().debug_assert();
    }

    #[test]
    fn submit_collects_repeated_flags() {
        let opts = parse(&[
            "rtlaunchd",
            "submit",
            "--host",
            "hpc",
            "--description",
            "galaxy.ski",
            "--input",
            "grids",
            "--input",
            "sed.dat",
            "--processes",
            "4",
            "--retrieve",
            "*_total.fits",
            "--retrieve",
            "*_log.txt",
            "--wait",
        ]);
        let Command::Submit(args) = opts.command else {
            panic!("expected submit");
        };
        assert_eq!(args.host, "hpc");
        assert_eq!(args.inputs, vec![PathBuf::from("grids"), PathBuf::from("sed.dat")]);
        assert_eq!(args.processes, 4);
        assert_eq!(args.threads, 1);
        assert_eq!(args.retrieve, vec!["*_total.fits", "*_log.txt"]);
        assert!(args.wait);
        assert!(!args.remove_remote);
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let opts = parse(&["rtlaunchd", "list", "--host", "nancy", "-v", "--database", "/tmp/j.db"]);
        assert!(opts.verbose);
        assert_eq!(opts.database, Some(PathBuf::from("/tmp/j.db")));
        let Command::List(args) = opts.command else {
            panic!("expected list");
        };
        assert_eq!(args.host.as_deref(), Some("nancy"));
    }

    #[test]
    fn zero_processes_is_rejected() {
        let err = cli_command()
            .try_get_matches_from([
                "rtlaunchd",
                "submit",
                "--host",
                "hpc",
                "--description",
                "x.ski",
                "--processes",
                "0",
            ])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
