use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;

const EBPF_PACKAGE: &str = "pagetap-ebpf";
const EBPF_BIN: &str = "pagetap";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the kernel programs
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        /// Accepted for compatibility; the kernel programs are always built in release
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run pagetap under sudo
    Run {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        /// Arguments passed through to pagetap
        #[arg(last = true)]
        run_args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, release: _ } => {
            build_ebpf(&target)?;
        }
        Cmd::Run { target, run_args } => run(&target, &run_args)?,
    }

    Ok(())
}

/// Object file produced by [`build_ebpf`].
fn ebpf_object(target: &str) -> PathBuf {
    Path::new("target").join(target).join("release").join(EBPF_BIN)
}

fn build_ebpf(target: &str) -> Result<PathBuf> {
    // Always release: debug builds pull in formatting code (LowerHex) the BPF
    // linker rejects, and LTO strips the rest.
    let status = Command::new("cargo")
        .arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg(EBPF_PACKAGE)
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release")
        .status()
        .context("Failed to build eBPF program")?;

    if !status.success() {
        bail!("Failed to build eBPF program");
    }

    let object = ebpf_object(target);
    if !object.is_file() {
        bail!("build succeeded but {} is missing", object.display());
    }

    println!("✓ eBPF program built successfully");
    println!("  Object: {}", object.display());
    Ok(object)
}

fn run(target: &str, run_args: &[String]) -> Result<()> {
    let object = build_ebpf(target)?;

    let status = Command::new("cargo")
        .args(["build", "--release", "--package", "pagetap"])
        .status()
        .context("Failed to build pagetap")?;
    if !status.success() {
        bail!("Failed to build pagetap");
    }

    let status = Command::new("sudo")
        .arg("-E")
        .arg("target/release/pagetap")
        .arg("--ebpf-object")
        .arg(&object)
        .args(run_args)
        .status()
        .context("Failed to run pagetap")?;
    if !status.success() {
        bail!("pagetap exited with {status}");
    }
    Ok(())
}
