//! Build automation for the dbkit workspace.
//!
//! Run with `cargo xtask <command>`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

const CRATES: &[&str] = &["dbkit-client", "dbkit-pool", "dbkit-testing"];

#[derive(Parser)]
#[command(name = "xtask", about = "Build automation for dbkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format check, clippy, tests and docs
    Ci,
    /// Run cargo fmt --check
    Fmt,
    /// Run clippy on every target with all features
    Clippy,
    /// Run the test suite
    Test {
        /// Only test this crate
        #[arg(short, long)]
        package: Option<String>,
    },
    /// Run the pool property tests with more cases
    Props {
        /// Cases per property
        #[arg(long, default_value_t = 1024)]
        cases: u32,
    },
    /// Build documentation, failing on broken links
    Doc,
    /// Run the statement cache benchmarks
    Bench,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    sh.change_dir(workspace_root()?);

    match cli.command {
        Command::Ci => {
            println!("Running CI checks...");
            fmt(&sh)?;
            clippy(&sh)?;
            test(&sh, None)?;
            doc(&sh)?;
            println!("All CI checks passed!");
        }
        Command::Fmt => fmt(&sh)?,
        Command::Clippy => clippy(&sh)?,
        Command::Test { package } => test(&sh, package.as_deref())?,
        Command::Props { cases } => props(&sh, cases)?,
        Command::Doc => doc(&sh)?,
        Command::Bench => bench(&sh)?,
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("failed to run cargo locate-project")?;

    let manifest = String::from_utf8(output.stdout).context("invalid UTF-8 in cargo output")?;
    PathBuf::from(manifest.trim())
        .parent()
        .map(PathBuf::from)
        .context("manifest path has no parent")
}

fn fmt(sh: &Shell) -> Result<()> {
    println!("Checking formatting...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    println!("Running clippy...");
    cmd!(sh, "cargo clippy --workspace --all-features --all-targets -- -D warnings").run()?;
    Ok(())
}

fn test(sh: &Shell, package: Option<&str>) -> Result<()> {
    match package {
        Some(package) => {
            anyhow::ensure!(
                CRATES.contains(&package),
                "unknown crate {package}, expected one of {CRATES:?}"
            );
            println!("Testing {package}...");
            cmd!(sh, "cargo test -p {package} --all-features").run()?;
        }
        None => {
            println!("Running tests...");
            cmd!(sh, "cargo test --workspace --all-features").run()?;
        }
    }
    Ok(())
}

fn props(sh: &Shell, cases: u32) -> Result<()> {
    println!("Running pool properties with {cases} cases...");
    let _env = sh.push_env("PROPTEST_CASES", cases.to_string());
    cmd!(sh, "cargo test -p dbkit-testing --test pool properties").run()?;
    Ok(())
}

fn doc(sh: &Shell) -> Result<()> {
    println!("Generating documentation...");
    let _env = sh.push_env("RUSTDOCFLAGS", "-D warnings");
    cmd!(sh, "cargo doc --workspace --all-features --no-deps").run()?;
    Ok(())
}

fn bench(sh: &Shell) -> Result<()> {
    println!("Running benchmarks...");
    cmd!(sh, "cargo bench -p dbkit-client --bench statement_cache").run()?;
    Ok(())
}
