use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::env;
use std::io::BufRead;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "sboforge",
    version,
    about = "Build packages from a SlackBuilds-style recipe repository, \
             dependency-ordered, across a pool of build workers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve the dependency closure of the targets and build it.
    Build(BuildArgs),
    /// Clone or refresh the recipe repository and report its state.
    Recipes(RecipesArgs),
}

#[derive(Debug, clap::Args)]
pub struct BuildArgs {
    /// Recipe repository root. Defaults to <dotdir>/slackbuilds, cloned from
    /// the upstream recipes mirror when missing.
    #[arg(short = 's', long)]
    pub slackbuilds: Option<PathBuf>,

    /// Workspace directory holding downloads, worker roots, hook scripts and
    /// status files. Defaults to ~/.sboforge.
    #[arg(long)]
    pub dotdir: Option<PathBuf>,

    /// Directory where recipe scripts leave their built package archives.
    #[arg(long, default_value = "/tmp")]
    pub artifact_dir: PathBuf,

    /// How many parallel build workers to run.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub numthreads: usize,

    /// Let source downloads overlap instead of fetching one at a time.
    #[arg(short = 'g', long)]
    pub getinparallel: bool,

    /// Install language packages from the package index instead of building
    /// them from their recipes.
    #[arg(short = 'p', long)]
    pub pipinstall: bool,

    /// Stop after downloading sources, so the builds can run offline later.
    #[arg(short = 'o', long)]
    pub onlydownload: bool,

    /// Echo every external step instead of executing it. Worker threading is
    /// unchanged, so the echoed steps may interleave across slots.
    #[arg(short = 'd', long)]
    pub donothing: bool,

    /// Ignore pip-installed packages when deciding what is already present
    /// (same effect as --nopip2 plus --nopip3).
    #[arg(short = 'v', long)]
    pub novirtual: bool,

    /// Ignore pip2-installed packages in dependency computations.
    #[arg(short = '2', long)]
    pub nopip2: bool,

    /// Ignore pip3-installed packages in dependency computations.
    #[arg(short = '3', long)]
    pub nopip3: bool,

    /// Skip any 'before' hook scripts.
    #[arg(short = 'b', long)]
    pub before: bool,

    /// Skip any 'after' hook scripts.
    #[arg(short = 'a', long)]
    pub after: bool,

    /// Skip any 'requires' hook scripts.
    #[arg(short = 'r', long)]
    pub requires: bool,

    /// Keep vt100 colour codes out of the multiplexed console output.
    #[arg(short = 'c', long)]
    pub nocolour: bool,

    /// Print the resolved build queue, one package per line, and exit
    /// without scheduling anything.
    #[arg(short = 'q', long)]
    pub queue: bool,

    /// Run every external command on this host over ssh instead of locally.
    #[arg(long)]
    pub remote_host: Option<String>,

    /// Packages to build. A single '-' reads names from stdin, one per
    /// line; '#' introduces a comment.
    #[arg(value_name = "PACKAGE", required = true)]
    pub packages: Vec<String>,
}

#[derive(Debug, clap::Args)]
pub struct RecipesArgs {
    /// Recipe repository root. Defaults to <dotdir>/slackbuilds.
    #[arg(short = 's', long)]
    pub slackbuilds: Option<PathBuf>,

    /// Workspace directory. Defaults to ~/.sboforge.
    #[arg(long)]
    pub dotdir: Option<PathBuf>,

    /// Fetch the upstream remote and check out its default branch.
    #[arg(long)]
    pub sync: bool,
}

pub fn default_dotdir() -> PathBuf {
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".sboforge"),
        None => PathBuf::from(".sboforge"),
    }
}

impl BuildArgs {
    pub fn effective_dotdir(&self) -> PathBuf {
        self.dotdir.clone().unwrap_or_else(default_dotdir)
    }

    pub fn effective_slackbuilds(&self) -> PathBuf {
        self.slackbuilds
            .clone()
            .unwrap_or_else(|| self.effective_dotdir().join("slackbuilds"))
    }

    /// The positional targets, or names read from stdin when the single
    /// positional is '-'.
    pub fn effective_targets(&self) -> Result<Vec<String>> {
        if self.packages == ["-"] {
            let stdin = std::io::stdin();
            parse_target_lines(stdin.lock())
        } else {
            Ok(self.packages.clone())
        }
    }
}

impl RecipesArgs {
    pub fn effective_dotdir(&self) -> PathBuf {
        self.dotdir.clone().unwrap_or_else(default_dotdir)
    }

    pub fn effective_slackbuilds(&self) -> PathBuf {
        self.slackbuilds
            .clone()
            .unwrap_or_else(|| self.effective_dotdir().join("slackbuilds"))
    }
}

/// One package name per line; '#' starts a comment, blank lines are skipped.
pub fn parse_target_lines<R: BufRead>(reader: R) -> Result<Vec<String>> {
    let mut targets = Vec::new();
    for line in reader.lines() {
        let line = line.context("reading target list")?;
        let name = line.split('#').next().unwrap_or("").trim();
        if !name.is_empty() {
            targets.push(name.to_string());
        }
    }
    Ok(targets)
}
