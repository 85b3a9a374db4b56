// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Abstract contract for the host hypervisor primitives the VMM depends on
//! (VM create/destroy, memory map, vCPU create/run, register get/set).
//!
//! This is the boundary named in §6 of the design: VM create/destroy and
//! vCPU run/exit are owned by the host, not emulated here. Keeping it as a
//! trait lets [`crate::cpu`] be driven in tests by [`fake::FakeBackend`]
//! without ever touching a real hypervisor.

pub mod fake;

#[cfg(target_os = "macos")]
pub mod hvf;

use thiserror::Error;

/// General-purpose and special register identifiers a vCPU handle accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    /// `X0`..=`X30`.
    X(u8),
    Pc,
    Cpsr,
}

bitflags::bitflags! {
    /// Guest-visible permissions for a `vm_map`'d range.
    pub struct MemPerms: u32 {
        const READ  = 0b001;
        const WRITE = 0b010;
        const EXEC  = 0b100;
    }
}

/// Reason a call to [`VcpuHandle::run`] returned control to the VMM.
#[derive(Debug, Clone, Copy)]
pub enum ExitReason {
    /// A synchronous exception. `syndrome` is the raw ESR-shaped value;
    /// `fault_gpa` is the faulting address for data/instruction aborts.
    Exception { syndrome: u64, fault_gpa: u64 },
    /// The host canceled the vCPU (e.g. on shutdown request).
    Canceled,
    /// The virtual timer fired; purely informational, no guest-visible effect.
    VtimerActivated,
    /// Anything else the host surfaces that this VMM does not model.
    Unknown(u64),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create VM: {0}")]
    VmCreate(String),
    #[error("failed to map guest memory: {0}")]
    MemMap(String),
    #[error("failed to create vCPU: {0}")]
    VcpuCreate(String),
    #[error("failed to access vCPU register {0:?}: {1}")]
    RegAccess(Reg, String),
    #[error("vCPU run failed: {0}")]
    Run(String),
    #[error("failed to destroy vCPU or VM: {0}")]
    Destroy(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One-shot, process-wide VM: memory mapping and vCPU creation.
pub trait VmBackend {
    type Vcpu: VcpuHandle;

    /// Install a guest-physical range backed by `host_ptr`. `host_ptr` must
    /// remain valid for the lifetime of the VM.
    fn map_memory(&mut self, host_ptr: *mut u8, guest_phys: u64, len: usize, perms: MemPerms) -> Result<()>;

    /// Create the (single) vCPU driven by this VMM.
    fn create_vcpu(&mut self) -> Result<Self::Vcpu>;
}

/// A single vCPU: register access and the run/exit suspension point.
pub trait VcpuHandle {
    fn set_reg(&mut self, reg: Reg, val: u64) -> Result<()>;
    fn get_reg(&mut self, reg: Reg) -> Result<u64>;

    /// Resume the vCPU. Blocks until it exits; returns the exit reason.
    fn run(&mut self) -> Result<ExitReason>;
}
