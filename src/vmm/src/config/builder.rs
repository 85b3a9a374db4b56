// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::convert::TryFrom;
use std::path::PathBuf;

use crate::config::{Error, KernelConfig, VmmConfig, DEFAULT_RAM_SIZE};

/// See [`VmmConfig`] for explanations of these options.
#[derive(Debug)]
pub struct VmmConfigBuilder {
    kernel_path: PathBuf,
    ram_size: usize,
    ppm_prefix: PathBuf,
    verbose: u8,
}

impl VmmConfigBuilder {
    pub fn new(kernel_path: impl Into<PathBuf>) -> Self {
        VmmConfigBuilder {
            kernel_path: kernel_path.into(),
            ram_size: DEFAULT_RAM_SIZE,
            ppm_prefix: PathBuf::from("./"),
            verbose: 0,
        }
    }

    pub fn ram_size(mut self, bytes: usize) -> Self {
        self.ram_size = bytes;
        self
    }

    pub fn ppm_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.ppm_prefix = prefix.into();
        self
    }

    pub fn verbose(mut self, level: u8) -> Self {
        self.verbose = level;
        self
    }

    pub fn build(self) -> Result<VmmConfig, Error> {
        Ok(VmmConfig {
            kernel: KernelConfig::try_from(self.kernel_path)?,
            ram_size: self.ram_size,
            ppm_prefix: self.ppm_prefix,
            verbose: self.verbose,
        })
    }
}
