// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The vCPU exit loop: classify every synchronous exception by its ESR
//! exception class, decode the faulting MMIO access when the host's
//! syndrome doesn't already carry it, and dispatch to the mapped device.

use std::io::{self, Write};

use tracing::{debug, info, trace, warn};

use crate::devices::uart::Uart;
use crate::devices::virtio_mmio::VirtioMmioTransport;
use crate::devices::{self, Mmio};
use crate::hypervisor::{self, ExitReason, Reg, VcpuHandle};
use crate::memory::GuestMemory;

const EC_WFX: u64 = 0x01;
const EC_HVC: u64 = 0x16;
const EC_DATA_ABORT_LOWER_EL: u64 = 0x24;
const EC_DATA_ABORT_SAME_EL: u64 = 0x25;

const ISS_ISV: u64 = 1 << 24;
const ISS_WNR: u64 = 1 << 6;
const ISS_SRT_SHIFT: u64 = 16;
const ISS_SRT_MASK: u64 = 0b1_1111;

const ZERO_REG: u8 = 31;
const INSTRUCTION_LEN: u64 = 4;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Hypervisor(#[from] hypervisor::Error),
    #[error(transparent)]
    Memory(#[from] crate::memory::Error),
    #[error("unhandled exception class {ec:#x} (syndrome {syndrome:#x})")]
    UnhandledException { ec: u64, syndrome: u64 },
    #[error("unexpected vCPU exit reason: {0}")]
    UnexpectedExit(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

fn exception_class(syndrome: u64) -> u64 {
    (syndrome >> 26) & 0x3F
}

/// A decoded data-abort: which register carries the value, and whether the
/// guest is storing (true) or loading (false).
struct DataAbort {
    reg: u8,
    write: bool,
}

/// ISV is honored for loads; for stores it's never trusted (§4.1), so the
/// faulting instruction is always fetched and decoded for that direction.
fn decode_data_abort(mem: &GuestMemory, pc: u64, syndrome: u64) -> Option<DataAbort> {
    let write = syndrome & ISS_WNR != 0;
    if syndrome & ISS_ISV != 0 && !write {
        let reg = ((syndrome >> ISS_SRT_SHIFT) & ISS_SRT_MASK) as u8;
        return Some(DataAbort { reg, write });
    }
    decode_load_store_instruction(mem, pc)
}

/// Decodes the A64 "LDR/STR (immediate, unsigned offset)" family — the only
/// encoding the guest driver in this system emits against MMIO — and
/// recovers `Rt` (bits [4:0]) and the load/store direction (`opc` bit 0).
fn decode_load_store_instruction(mem: &GuestMemory, pc: u64) -> Option<DataAbort> {
    let insn = mem.read_u32(pc).ok()?;
    let is_vector = (insn >> 26) & 1 != 0;
    let family = (insn >> 24) & 0b0011_1111;
    if is_vector || family != 0b111001 {
        return None;
    }
    let opc = (insn >> 22) & 0b11;
    let reg = (insn & 0x1F) as u8;
    Some(DataAbort { reg, write: opc & 1 == 0 })
}

/// Owns the vCPU and the two emulated devices it can fault into.
///
/// Field order matters: Rust drops struct fields top-to-bottom, and the
/// device resources (`uart`, `transport`) must be torn down before the
/// vCPU handle itself is destroyed.
pub struct Cpu<V: VcpuHandle, W: Write = io::Stdout> {
    uart: Uart<W>,
    transport: VirtioMmioTransport,
    vcpu: V,
}

impl<V: VcpuHandle, W: Write> Cpu<V, W> {
    pub fn new(vcpu: V, uart: Uart<W>, transport: VirtioMmioTransport) -> Self {
        Cpu { uart, transport, vcpu }
    }

    pub fn uart_mut(&mut self) -> &mut Uart<W> {
        &mut self.uart
    }

    pub fn vcpu_mut(&mut self) -> &mut V {
        &mut self.vcpu
    }

    /// Drive the vCPU until a halt, cancellation, or `max_iterations` exits
    /// have been handled — the implementation-defined outer ceiling §4.1
    /// requires to bound the loop.
    pub fn run(&mut self, mem: &GuestMemory, max_iterations: u64) -> Result<()> {
        for _ in 0..max_iterations {
            match self.vcpu.run()? {
                ExitReason::Exception { syndrome, fault_gpa } => {
                    let ec = exception_class(syndrome);
                    trace!(ec, syndrome, fault_gpa, "vcpu exception exit");
                    match ec {
                        EC_DATA_ABORT_LOWER_EL | EC_DATA_ABORT_SAME_EL => {
                            self.handle_data_abort(mem, syndrome, fault_gpa)?;
                        }
                        EC_HVC => {
                            debug!("hvc trap, unused in this system");
                            self.advance_pc()?;
                        }
                        EC_WFX => {
                            info!("guest halted on wfi/wfe");
                            return Ok(());
                        }
                        other => {
                            warn!(ec = other, syndrome, "unhandled exception class");
                            return Err(Error::UnhandledException { ec: other, syndrome });
                        }
                    }
                }
                ExitReason::VtimerActivated => continue,
                ExitReason::Canceled => {
                    info!("vcpu canceled");
                    return Ok(());
                }
                ExitReason::Unknown(reason) => {
                    warn!(reason, "unknown vcpu exit reason");
                    return Err(Error::UnexpectedExit(reason));
                }
            }
        }
        warn!(max_iterations, "exit loop iteration ceiling reached");
        Ok(())
    }

    fn handle_data_abort(&mut self, mem: &GuestMemory, syndrome: u64, fault_gpa: u64) -> Result<()> {
        let pc = self.vcpu.get_reg(Reg::Pc)?;
        let abort = decode_data_abort(mem, pc, syndrome);

        match abort {
            Some(DataAbort { reg, write: true }) => {
                let val = if reg == ZERO_REG { 0 } else { self.vcpu.get_reg(Reg::X(reg))? as u32 };
                self.dispatch_store(mem, fault_gpa, val);
            }
            Some(DataAbort { reg, write: false }) => {
                let val = self.dispatch_load(fault_gpa);
                if reg != ZERO_REG {
                    self.vcpu.set_reg(Reg::X(reg), val as u64)?;
                }
            }
            None => {
                warn!(pc, fault_gpa, "failed to decode faulting MMIO instruction");
            }
        }

        self.advance_pc()
    }

    fn dispatch_load(&mut self, gpa: u64) -> u32 {
        match devices::classify(gpa) {
            Mmio::Uart(off) => self.uart.read(off),
            Mmio::Gpu(off) => self.transport.read(off),
            Mmio::Unknown => {
                warn!(gpa, "load from unmapped mmio address");
                0
            }
        }
    }

    fn dispatch_store(&mut self, mem: &GuestMemory, gpa: u64, val: u32) {
        match devices::classify(gpa) {
            Mmio::Uart(off) => self.uart.write(off, val),
            Mmio::Gpu(off) => self.transport.write(mem, off, val),
            Mmio::Unknown => warn!(gpa, val, "store to unmapped mmio address, dropped"),
        }
    }

    fn advance_pc(&mut self) -> Result<()> {
        let pc = self.vcpu.get_reg(Reg::Pc)?;
        self.vcpu.set_reg(Reg::Pc, pc + INSTRUCTION_LEN)?;
        Ok(())
    }
}
