// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Production [`VmBackend`]/[`VcpuHandle`] implementation on top of Apple's
//! Hypervisor.framework, the native AArch64 host primitive this design was
//! written against: `hv_vcpu_create` hands back a stable pointer to an
//! `hv_vcpu_exit_t` that the framework refreshes on every `hv_vcpu_run` —
//! exactly the "stable reference through which exit details will be
//! reported" required by §6.

use std::ptr;

use libc::c_void;
use tracing::trace;

use super::{Error, ExitReason, MemPerms, Reg, Result, VcpuHandle, VmBackend};

mod sys {
    use libc::c_void;

    pub type HvReturn = i32;
    pub type HvVcpu = u64;
    pub type HvReg = u32;
    pub type HvGpa = u64;
    pub type HvIpa = u64;
    pub type HvMemoryFlags = u32;

    pub const HV_SUCCESS: HvReturn = 0;

    pub const HV_MEMORY_READ: HvMemoryFlags = 1 << 0;
    pub const HV_MEMORY_WRITE: HvMemoryFlags = 1 << 1;
    pub const HV_MEMORY_EXEC: HvMemoryFlags = 1 << 2;

    pub const HV_REG_PC: HvReg = 31;
    pub const HV_REG_CPSR: HvReg = 34;

    pub const HV_EXIT_REASON_CANCELED: u32 = 0;
    pub const HV_EXIT_REASON_EXCEPTION: u32 = 1;
    pub const HV_EXIT_REASON_VTIMER_ACTIVATED: u32 = 2;

    #[repr(C)]
    pub struct HvVcpuExitException {
        pub syndrome: u64,
        pub virtual_address: HvGpa,
        pub physical_address: HvGpa,
    }

    #[repr(C)]
    pub struct HvVcpuExit {
        pub reason: u32,
        pub exception: HvVcpuExitException,
    }

    #[link(name = "Hypervisor", kind = "framework")]
    extern "C" {
        pub fn hv_vm_create(config: *mut c_void) -> HvReturn;
        pub fn hv_vm_destroy() -> HvReturn;
        pub fn hv_vm_map(addr: *mut c_void, ipa: HvIpa, size: usize, flags: HvMemoryFlags) -> HvReturn;

        pub fn hv_vcpu_create(vcpu: *mut HvVcpu, exit: *mut *mut HvVcpuExit, config: *mut c_void) -> HvReturn;
        pub fn hv_vcpu_destroy(vcpu: HvVcpu) -> HvReturn;
        pub fn hv_vcpu_set_reg(vcpu: HvVcpu, reg: HvReg, value: u64) -> HvReturn;
        pub fn hv_vcpu_get_reg(vcpu: HvVcpu, reg: HvReg, value: *mut u64) -> HvReturn;
        pub fn hv_vcpu_run(vcpu: HvVcpu) -> HvReturn;
    }
}

fn check(ret: sys::HvReturn) -> std::result::Result<(), String> {
    if ret == sys::HV_SUCCESS {
        Ok(())
    } else {
        Err(format!("hv_return_t {ret:#x}"))
    }
}

/// Process-wide VM handle. Hypervisor.framework's VM is a singleton per
/// process; construction here issues the one-shot `hv_vm_create`.
pub struct HvfBackend {
    _private: (),
}

impl HvfBackend {
    pub fn new() -> Result<Self> {
        check(unsafe { sys::hv_vm_create(ptr::null_mut()) }).map_err(Error::VmCreate)?;
        Ok(HvfBackend { _private: () })
    }
}

impl Drop for HvfBackend {
    fn drop(&mut self) {
        if let Err(e) = check(unsafe { sys::hv_vm_destroy() }) {
            tracing::error!(error = %e, "hv_vm_destroy failed");
        }
    }
}

impl VmBackend for HvfBackend {
    type Vcpu = HvfVcpu;

    fn map_memory(&mut self, host_ptr: *mut u8, guest_phys: u64, len: usize, perms: MemPerms) -> Result<()> {
        let mut flags = 0u32;
        if perms.contains(MemPerms::READ) {
            flags |= sys::HV_MEMORY_READ;
        }
        if perms.contains(MemPerms::WRITE) {
            flags |= sys::HV_MEMORY_WRITE;
        }
        if perms.contains(MemPerms::EXEC) {
            flags |= sys::HV_MEMORY_EXEC;
        }
        check(unsafe { sys::hv_vm_map(host_ptr as *mut c_void, guest_phys, len, flags) })
            .map_err(Error::MemMap)
    }

    fn create_vcpu(&mut self) -> Result<HvfVcpu> {
        let mut vcpu: sys::HvVcpu = 0;
        let mut exit_ptr: *mut sys::HvVcpuExit = ptr::null_mut();
        check(unsafe { sys::hv_vcpu_create(&mut vcpu, &mut exit_ptr, ptr::null_mut()) })
            .map_err(Error::VcpuCreate)?;
        Ok(HvfVcpu { vcpu, exit_ptr })
    }
}

pub struct HvfVcpu {
    vcpu: sys::HvVcpu,
    exit_ptr: *mut sys::HvVcpuExit,
}

impl HvfVcpu {
    fn reg_id(reg: Reg) -> sys::HvReg {
        match reg {
            Reg::X(n) => n as sys::HvReg,
            Reg::Pc => sys::HV_REG_PC,
            Reg::Cpsr => sys::HV_REG_CPSR,
        }
    }
}

impl VcpuHandle for HvfVcpu {
    fn set_reg(&mut self, reg: Reg, val: u64) -> Result<()> {
        check(unsafe { sys::hv_vcpu_set_reg(self.vcpu, Self::reg_id(reg), val) })
            .map_err(|e| Error::RegAccess(reg, e))
    }

    fn get_reg(&mut self, reg: Reg) -> Result<u64> {
        let mut val = 0u64;
        check(unsafe { sys::hv_vcpu_get_reg(self.vcpu, Self::reg_id(reg), &mut val) })
            .map_err(|e| Error::RegAccess(reg, e))?;
        Ok(val)
    }

    fn run(&mut self) -> Result<ExitReason> {
        check(unsafe { sys::hv_vcpu_run(self.vcpu) }).map_err(Error::Run)?;

        // Safety: `exit_ptr` was populated by `hv_vcpu_create` and is kept
        // valid and current by the framework across every `hv_vcpu_run`.
        let exit = unsafe { &*self.exit_ptr };
        let reason = match exit.reason {
            sys::HV_EXIT_REASON_CANCELED => ExitReason::Canceled,
            sys::HV_EXIT_REASON_VTIMER_ACTIVATED => ExitReason::VtimerActivated,
            sys::HV_EXIT_REASON_EXCEPTION => {
                trace!(
                    syndrome = exit.exception.syndrome,
                    fault_gpa = exit.exception.physical_address,
                    "hvf exception exit"
                );
                ExitReason::Exception {
                    syndrome: exit.exception.syndrome,
                    fault_gpa: exit.exception.physical_address,
                }
            }
            other => ExitReason::Unknown(other as u64),
        };
        Ok(reason)
    }
}

impl Drop for HvfVcpu {
    fn drop(&mut self) {
        if let Err(e) = check(unsafe { sys::hv_vcpu_destroy(self.vcpu) }) {
            tracing::error!(error = %e, "hv_vcpu_destroy failed");
        }
    }
}
