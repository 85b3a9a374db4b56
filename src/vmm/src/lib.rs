// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Top-level orchestration: allocate guest RAM, create the vCPU through the
//! abstract [`hypervisor`] contract, load the kernel image, wire up the
//! UART and virtio-GPU devices, and drive the exit loop.

pub mod config;
pub mod cpu;
pub mod devices;
pub mod hypervisor;
pub mod memory;

use std::fs;

use tracing::{debug, info};

use config::VmmConfig;
use cpu::Cpu;
use devices::uart::Uart;
use devices::virtio_gpu::GpuDevice;
use devices::virtio_mmio::VirtioMmioTransport;
use hypervisor::{MemPerms, Reg, VcpuHandle, VmBackend};
use memory::GuestMemory;

/// Guest-physical RAM base (§6).
pub const RAM_BASE: u64 = 0x7000_0000;
/// Guest translation-granule alignment RAM must respect (§3).
const RAM_ALIGN: usize = 16 * 1024;
/// Processor state at boot: EL1h with DAIF fully masked.
const BOOT_CPSR: u64 = 0x3C5;
/// Bound on handled exits per `run()` call; prevents a misbehaving guest
/// from looping the host forever (§4.1's "implementation-defined ceiling").
const MAX_EXIT_ITERATIONS: u64 = 1_000_000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("failed to read kernel image {path}: {source}")]
    KernelRead { path: String, source: std::io::Error },
    #[error("guest memory error: {0}")]
    Memory(#[from] memory::Error),
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] hypervisor::Error),
    #[error("exit loop error: {0}")]
    Cpu(#[from] cpu::Error),
    #[error("RAM size {0} is not aligned to the {1}-byte translation granule")]
    UnalignedRamSize(usize, usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Owns every piece of the single-vCPU virtual machine for its lifetime.
///
/// Field order matters: Rust drops struct fields top-to-bottom, and §5
/// requires device/vCPU resources to drop, then the vCPU destroyed, then
/// the VM destroyed, and only then guest RAM freed. `cpu` (which itself
/// drops its devices before its vCPU) must therefore drop before
/// `backend` (whose `Drop` issues the VM-destroy call), which in turn
/// must drop before `mem` (whose `Drop` frees the mapped RAM).
pub struct Vmm<B: VmBackend> {
    cpu: Option<Cpu<B::Vcpu>>,
    backend: B,
    mem: GuestMemory,
}

impl<B: VmBackend> Vmm<B> {
    /// Allocate guest RAM and map it into the backend with RWX permissions.
    pub fn new(mut backend: B, config: &VmmConfig) -> Result<Self> {
        if !config.ram_size.is_multiple_of(RAM_ALIGN) {
            return Err(Error::UnalignedRamSize(config.ram_size, RAM_ALIGN));
        }

        let mem = GuestMemory::new(RAM_BASE, config.ram_size)?;
        let host_ptr = mem.host_ptr()?;
        backend.map_memory(host_ptr, RAM_BASE, config.ram_size, MemPerms::all())?;

        info!(ram_size = config.ram_size, ram_base = RAM_BASE, "guest memory mapped");
        Ok(Vmm { backend, mem, cpu: None })
    }

    /// Load the kernel image, create the vCPU, and set its initial register
    /// state: PC at RAM base, CPSR = EL1h with interrupts masked, X0 = 0.
    pub fn configure(&mut self, config: &VmmConfig) -> Result<()> {
        let image = fs::read(&config.kernel.kernel_path).map_err(|source| Error::KernelRead {
            path: config.kernel.kernel_path.display().to_string(),
            source,
        })?;
        self.mem.load_kernel_image(&image)?;
        debug!(bytes = image.len(), "kernel image loaded at RAM base");

        let mut vcpu = self.backend.create_vcpu()?;
        vcpu.set_reg(Reg::Pc, RAM_BASE)?;
        vcpu.set_reg(Reg::Cpsr, BOOT_CPSR)?;
        vcpu.set_reg(Reg::X(0), 0)?;

        let gpu = GpuDevice::new(config.ppm_prefix.clone());
        let transport = VirtioMmioTransport::new(gpu);
        let uart = Uart::new();

        self.cpu = Some(Cpu::new(vcpu, uart, transport));
        Ok(())
    }

    /// Run the exit loop to completion (halt, cancellation, or the
    /// iteration ceiling).
    pub fn run(&mut self) -> Result<()> {
        let cpu = self.cpu.as_mut().expect("configure() must run before run()");
        cpu.run(&self.mem, MAX_EXIT_ITERATIONS)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypervisor::fake::FakeBackend;
    use std::io::Write;

    fn write_flat_image(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f
    }

    #[test]
    fn new_maps_ram_with_full_permissions() {
        let image = write_flat_image(&[0xaa; 16]);
        let config = VmmConfig::builder(image.path()).ram_size(16 * 1024).build().unwrap();

        let vmm = Vmm::new(FakeBackend::default(), &config).unwrap();
        assert_eq!(vmm.backend.mapped.len(), 1);
        let (_, gpa, len, perms) = vmm.backend.mapped[0];
        assert_eq!(gpa, RAM_BASE);
        assert_eq!(len, 16 * 1024);
        assert_eq!(perms, MemPerms::all());
    }

    #[test]
    fn configure_loads_kernel_and_sets_boot_registers() {
        let image = write_flat_image(&[0xde, 0xad, 0xbe, 0xef]);
        let config = VmmConfig::builder(image.path()).ram_size(16 * 1024).build().unwrap();

        let mut vmm = Vmm::new(FakeBackend::default(), &config).unwrap();
        vmm.configure(&config).unwrap();

        let mut loaded = [0u8; 4];
        vmm.mem.read_bytes(RAM_BASE, &mut loaded).unwrap();
        assert_eq!(loaded, [0xde, 0xad, 0xbe, 0xef]);

        let cpu = vmm.cpu.as_mut().unwrap();
        assert_eq!(cpu.vcpu_mut().get_reg(Reg::Pc).unwrap(), RAM_BASE);
        assert_eq!(cpu.vcpu_mut().get_reg(Reg::Cpsr).unwrap(), BOOT_CPSR);
    }

    #[test]
    fn rejects_unaligned_ram_size() {
        let image = write_flat_image(&[0u8; 4]);
        let config = VmmConfig::builder(image.path()).ram_size(100).build().unwrap();
        assert!(Vmm::new(FakeBackend::default(), &config).is_err());
    }
}
