// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::convert::TryFrom;
use std::path::PathBuf;

mod builder;
pub use builder::VmmConfigBuilder;

/// Guest RAM size when no override is given (§6: 512 MiB).
pub const DEFAULT_RAM_SIZE: usize = 512 * 1024 * 1024;
const DEFAULT_PPM_PREFIX: &str = "./";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kernel image path does not exist: {0}")]
    KernelNotFound(PathBuf),
}

/// Everything the VMM needs to boot a guest: which kernel to load, how much
/// RAM to back it with, where to write PPM snapshots, and how chatty to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmmConfig {
    pub kernel: KernelConfig,
    pub ram_size: usize,
    pub ppm_prefix: PathBuf,
    pub verbose: u8,
}

impl VmmConfig {
    pub fn builder(kernel_path: impl Into<PathBuf>) -> VmmConfigBuilder {
        VmmConfigBuilder::new(kernel_path)
    }
}

impl Default for VmmConfig {
    fn default() -> Self {
        VmmConfig {
            kernel: KernelConfig::default(),
            ram_size: DEFAULT_RAM_SIZE,
            ppm_prefix: PathBuf::from(DEFAULT_PPM_PREFIX),
            verbose: 0,
        }
    }
}

/// The flat kernel image to load at RAM base.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelConfig {
    pub kernel_path: PathBuf,
}

impl TryFrom<PathBuf> for KernelConfig {
    type Error = Error;

    fn try_from(kernel_path: PathBuf) -> Result<Self, Self::Error> {
        if !kernel_path.exists() {
            return Err(Error::KernelNotFound(kernel_path));
        }
        Ok(KernelConfig { kernel_path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_kernel_path() {
        let result = KernelConfig::try_from(PathBuf::from("/nonexistent/kernel.img"));
        assert!(result.is_err());
    }

    #[test]
    fn accepts_existing_path() {
        let result = KernelConfig::try_from(PathBuf::from("./Cargo.toml"));
        assert!(result.is_ok());
    }

    #[test]
    fn builder_applies_overrides() {
        let cfg = VmmConfig::builder("./Cargo.toml")
            .ram_size(1024)
            .ppm_prefix("/tmp/snapshots")
            .verbose(2)
            .build()
            .unwrap();
        assert_eq!(cfg.ram_size, 1024);
        assert_eq!(cfg.ppm_prefix, PathBuf::from("/tmp/snapshots"));
        assert_eq!(cfg.verbose, 2);
    }
}
