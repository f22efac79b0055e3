//! Workspace automation tasks.
//!
//! Run with: `cargo xtask <command>`

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

/// Attributes every library crate must declare.
const REQUIRED_LIB_ATTRIBUTES: &[&str] = &["#![forbid(unsafe_code)]", "#![deny(missing_docs)]"];

#[derive(Parser)]
#[command(name = "xtask", about = "Vigil workspace automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all CI checks locally
    Ci,
    /// Validate workspace conventions
    Lint,
    /// Generate coverage report
    Coverage {
        /// Emit lcov instead of HTML
        #[arg(long)]
        lcov: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ci => run_ci(),
        Commands::Lint => run_lint(),
        Commands::Coverage { lcov } => run_coverage(lcov),
    }
}

fn run_ci() -> Result<()> {
    println!("Running CI checks...\n");

    run_lint()?;
    run_cmd("cargo", &["fmt", "--check"])?;
    run_cmd(
        "cargo",
        &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
    )?;
    run_cmd("cargo", &["test", "--workspace"])?;
    run_cmd("cargo", &["doc", "--workspace", "--no-deps"])?;

    println!("\nAll CI checks passed!");
    Ok(())
}

fn run_lint() -> Result<()> {
    println!("Validating workspace conventions...\n");

    for entry in std::fs::read_dir("crates").context("reading crates/")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("vigil-") {
            anyhow::bail!("Crate '{name}' does not follow vigil-* naming");
        }
        check_lib_attributes(&entry.path().join("src/lib.rs"))?;
    }

    println!("All conventions validated!");
    Ok(())
}

fn check_lib_attributes(lib: &Path) -> Result<()> {
    let source = std::fs::read_to_string(lib)
        .with_context(|| format!("reading {}", lib.display()))?;
    for attribute in REQUIRED_LIB_ATTRIBUTES {
        if !source.contains(attribute) {
            anyhow::bail!("{} is missing {attribute}", lib.display());
        }
    }
    Ok(())
}

fn run_coverage(lcov: bool) -> Result<()> {
    if lcov {
        run_cmd(
            "cargo",
            &["llvm-cov", "--workspace", "--lcov", "--output-path", "lcov.info"],
        )?;
        println!("\nCoverage report: lcov.info");
    } else {
        run_cmd("cargo", &["llvm-cov", "--workspace", "--html"])?;
        println!("\nCoverage report: target/llvm-cov/html/index.html");
    }
    Ok(())
}

fn run_cmd(cmd: &str, args: &[&str]) -> Result<()> {
    println!("$ {} {}", cmd, args.join(" "));
    let status = Command::new(cmd)
        .args(args)
        .status()
        .with_context(|| format!("Failed to run: {} {}", cmd, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("Command failed: {} {}", cmd, args.join(" "));
    }
    Ok(())
}
