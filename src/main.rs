// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vmm::config::VmmConfig;
use vmm::Vmm;

#[derive(Parser)]
#[command(version, about = "A minimal AArch64 VMM with a virtio-GPU display")]
struct Cli {
    /// Path to the flat kernel image to boot.
    #[arg(short, long)]
    kernel: PathBuf,

    /// Guest RAM size in bytes (defaults to 512 MiB).
    #[arg(long)]
    ram_size: Option<usize>,

    /// Directory PPM snapshots are written to on RESOURCE_FLUSH.
    #[arg(long, default_value = "./")]
    ppm_prefix: PathBuf,

    /// Increase log verbosity (repeatable); ignored if RUST_LOG is set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error(transparent)]
    Config(#[from] vmm::config::Error),
    #[error(transparent)]
    Hypervisor(#[from] vmm::hypervisor::Error),
    #[error(transparent)]
    Vmm(#[from] vmm::Error),
    #[error("this host has no supported hypervisor backend")]
    UnsupportedHost,
}

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let mut builder = VmmConfig::builder(cli.kernel).ppm_prefix(cli.ppm_prefix).verbose(cli.verbose);
    if let Some(ram_size) = cli.ram_size {
        builder = builder.ram_size(ram_size);
    }
    let config = builder.build()?;

    let mut vmm = new_vmm(&config)?;
    vmm.configure(&config)?;
    vmm.run()?;
    Ok(())
}

#[cfg(target_os = "macos")]
fn new_vmm(config: &VmmConfig) -> Result<Vmm<vmm::hypervisor::hvf::HvfBackend>, Error> {
    let backend = vmm::hypervisor::hvf::HvfBackend::new()?;
    Ok(Vmm::new(backend, config)?)
}

#[cfg(not(target_os = "macos"))]
fn new_vmm(_config: &VmmConfig) -> Result<Vmm<vmm::hypervisor::fake::FakeBackend>, Error> {
    Err(Error::UnsupportedHost)
}
