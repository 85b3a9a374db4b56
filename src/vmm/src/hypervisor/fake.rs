// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! An in-process stand-in for a real hypervisor, used to drive [`crate::cpu`]
//! and the device emulation in unit tests without spawning a VM (§9, "Global
//! state").

use std::collections::VecDeque;

use super::{Error, ExitReason, MemPerms, Reg, Result, VcpuHandle, VmBackend};

#[derive(Default)]
pub struct FakeBackend {
    pub mapped: Vec<(u64, u64, usize, MemPerms)>,
}

impl VmBackend for FakeBackend {
    type Vcpu = FakeVcpu;

    fn map_memory(&mut self, host_ptr: *mut u8, guest_phys: u64, len: usize, perms: MemPerms) -> Result<()> {
        self.mapped.push((host_ptr as u64, guest_phys, len, perms));
        Ok(())
    }

    fn create_vcpu(&mut self) -> Result<FakeVcpu> {
        Ok(FakeVcpu::default())
    }
}

/// A vCPU whose register file is a plain array and whose exits are a
/// caller-supplied script, consumed in order by [`VcpuHandle::run`].
#[derive(Default)]
pub struct FakeVcpu {
    x: [u64; 31],
    pc: u64,
    cpsr: u64,
    pub exits: VecDeque<ExitReason>,
}

impl FakeVcpu {
    pub fn push_exit(&mut self, exit: ExitReason) {
        self.exits.push_back(exit);
    }
}

impl VcpuHandle for FakeVcpu {
    fn set_reg(&mut self, reg: Reg, val: u64) -> Result<()> {
        match reg {
            Reg::X(n) if (n as usize) < 31 => self.x[n as usize] = val,
            Reg::X(n) => return Err(Error::RegAccess(Reg::X(n), "index out of range".into())),
            Reg::Pc => self.pc = val,
            Reg::Cpsr => self.cpsr = val,
        }
        Ok(())
    }

    fn get_reg(&mut self, reg: Reg) -> Result<u64> {
        Ok(match reg {
            Reg::X(n) if (n as usize) < 31 => self.x[n as usize],
            Reg::X(n) => return Err(Error::RegAccess(Reg::X(n), "index out of range".into())),
            Reg::Pc => self.pc,
            Reg::Cpsr => self.cpsr,
        })
    }

    fn run(&mut self) -> Result<ExitReason> {
        self.exits
            .pop_front()
            .ok_or_else(|| Error::Run("fake vCPU exit script exhausted".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_scripted_exits_in_order() {
        let mut vcpu = FakeVcpu::default();
        vcpu.push_exit(ExitReason::Exception { syndrome: 0, fault_gpa: 0x0900_0000 });
        vcpu.push_exit(ExitReason::Canceled);

        assert!(matches!(vcpu.run().unwrap(), ExitReason::Exception { .. }));
        assert!(matches!(vcpu.run().unwrap(), ExitReason::Canceled));
        assert!(vcpu.run().is_err());
    }

    #[test]
    fn zero_register_reads_back_as_written() {
        let mut vcpu = FakeVcpu::default();
        vcpu.set_reg(Reg::X(3), 42).unwrap();
        assert_eq!(vcpu.get_reg(Reg::X(3)).unwrap(), 42);
        vcpu.set_reg(Reg::Pc, 0x7000_0000).unwrap();
        assert_eq!(vcpu.get_reg(Reg::Pc).unwrap(), 0x7000_0000);
    }
}
