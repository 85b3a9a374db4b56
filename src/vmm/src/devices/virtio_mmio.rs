// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! virtio-mmio transport: register file, feature/status state machine, and
//! split-virtqueue descriptor-chain walking down to the GPU command handler.

use tracing::{debug, trace, warn};

use crate::devices::virtio_gpu::GpuDevice;
use crate::memory::GuestMemory;

const MAGIC_VALUE: u32 = 0x7472_6976; // "virt"
const VERSION_MODERN: u32 = 2;
const DEVICE_ID_GPU: u32 = 16;
const VENDOR_ID: u32 = 0x554D_4551;
const QUEUE_NUM_MAX: u32 = 256;
const NUM_QUEUES: usize = 2;

const REG_MAGIC_VALUE: u64 = 0x000;
const REG_VERSION: u64 = 0x004;
const REG_DEVICE_ID: u64 = 0x008;
const REG_VENDOR_ID: u64 = 0x00C;
const REG_DEVICE_FEATURES: u64 = 0x010;
const REG_DEVICE_FEATURES_SEL: u64 = 0x014;
const REG_DRIVER_FEATURES: u64 = 0x020;
const REG_DRIVER_FEATURES_SEL: u64 = 0x024;
const REG_QUEUE_SEL: u64 = 0x030;
const REG_QUEUE_NUM_MAX: u64 = 0x034;
const REG_QUEUE_NUM: u64 = 0x038;
const REG_QUEUE_READY: u64 = 0x044;
const REG_QUEUE_NOTIFY: u64 = 0x050;
const REG_INTERRUPT_STATUS: u64 = 0x060;
const REG_INTERRUPT_ACK: u64 = 0x064;
const REG_STATUS: u64 = 0x070;
const REG_QUEUE_DESC_LOW: u64 = 0x080;
const REG_QUEUE_DESC_HIGH: u64 = 0x084;
const REG_QUEUE_AVAIL_LOW: u64 = 0x090;
const REG_QUEUE_AVAIL_HIGH: u64 = 0x094;
const REG_QUEUE_USED_LOW: u64 = 0x0A0;
const REG_QUEUE_USED_HIGH: u64 = 0x0A4;
const REG_CONFIG_START: u64 = 0x100;
const REG_CONFIG_END: u64 = 0x118;

const DESC_LEN: u64 = 16;
const DESC_FLAG_NEXT: u16 = 1;
const DESC_FLAG_WRITE: u16 = 2;

/// `(gpa, len)` of a descriptor-chain buffer.
type ChainBuffer = (u64, u32);

#[derive(Default, Clone, Copy)]
struct Queue {
    desc_gpa: u64,
    avail_gpa: u64,
    used_gpa: u64,
    num: u32,
    ready: bool,
    last_avail_idx: u16,
    used_idx: u16,
}

impl Queue {
    fn reset(&mut self) {
        *self = Queue::default();
    }
}

pub struct VirtioMmioTransport {
    device_features_sel: u32,
    driver_features_sel: u32,
    queue_sel: u32,
    status: u32,
    interrupt_status: u32,
    queues: [Queue; NUM_QUEUES],
    gpu: GpuDevice,
}

impl VirtioMmioTransport {
    pub fn new(gpu: GpuDevice) -> Self {
        VirtioMmioTransport {
            device_features_sel: 0,
            driver_features_sel: 0,
            queue_sel: 0,
            status: 0,
            interrupt_status: 0,
            queues: [Queue::default(); NUM_QUEUES],
            gpu,
        }
    }

    fn current_queue(&self) -> Option<&Queue> {
        self.queues.get(self.queue_sel as usize)
    }

    fn current_queue_mut(&mut self) -> Option<&mut Queue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    pub fn read(&self, offset: u64) -> u32 {
        let val = match offset {
            REG_MAGIC_VALUE => MAGIC_VALUE,
            REG_VERSION => VERSION_MODERN,
            REG_DEVICE_ID => DEVICE_ID_GPU,
            REG_VENDOR_ID => VENDOR_ID,
            REG_DEVICE_FEATURES => 0,
            REG_QUEUE_NUM_MAX => QUEUE_NUM_MAX,
            REG_QUEUE_READY => self.current_queue().map_or(0, |q| q.ready as u32),
            REG_INTERRUPT_STATUS => self.interrupt_status,
            REG_STATUS => self.status,
            REG_CONFIG_START..=REG_CONFIG_END => self.gpu.config_read(offset - REG_CONFIG_START),
            _ => {
                trace!(offset, "virtio-mmio: read from unknown register");
                0
            }
        };
        trace!(offset, val, "virtio-mmio: register read");
        val
    }

    pub fn write(&mut self, mem: &GuestMemory, offset: u64, val: u32) {
        trace!(offset, val, "virtio-mmio: register write");
        match offset {
            REG_DEVICE_FEATURES_SEL => self.device_features_sel = val,
            REG_DRIVER_FEATURES => {} // accepted, no feature bits are actually honored
            REG_DRIVER_FEATURES_SEL => self.driver_features_sel = val,
            REG_QUEUE_SEL => self.queue_sel = val,
            REG_QUEUE_NUM => {
                if let Some(q) = self.current_queue_mut() {
                    q.num = val;
                }
            }
            REG_QUEUE_READY => {
                if let Some(q) = self.current_queue_mut() {
                    q.ready = val != 0;
                }
            }
            REG_QUEUE_NOTIFY => self.queue_notify(mem, val),
            REG_INTERRUPT_ACK => self.interrupt_status &= !val,
            REG_STATUS => {
                self.status = val;
                if val == 0 {
                    self.reset();
                }
            }
            REG_QUEUE_DESC_LOW => self.set_low(offset, val),
            REG_QUEUE_DESC_HIGH => self.set_high(offset, val),
            REG_QUEUE_AVAIL_LOW => self.set_low(offset, val),
            REG_QUEUE_AVAIL_HIGH => self.set_high(offset, val),
            REG_QUEUE_USED_LOW => self.set_low(offset, val),
            REG_QUEUE_USED_HIGH => self.set_high(offset, val),
            REG_CONFIG_START..=REG_CONFIG_END => {} // config space is read-only from the guest's view
            _ => trace!(offset, val, "virtio-mmio: write to unknown register dropped"),
        }
    }

    fn set_low(&mut self, offset: u64, val: u32) {
        if let Some(q) = self.current_queue_mut() {
            let field = Self::field_for(offset);
            *field(q) = (*field(q) & 0xFFFF_FFFF_0000_0000) | val as u64;
        }
    }

    fn set_high(&mut self, offset: u64, val: u32) {
        if let Some(q) = self.current_queue_mut() {
            // high-half registers are one past their low-half counterpart
            let field = Self::field_for(offset - 4);
            *field(q) = (*field(q) & 0x0000_0000_FFFF_FFFF) | ((val as u64) << 32);
        }
    }

    fn field_for(low_offset: u64) -> fn(&mut Queue) -> &mut u64 {
        match low_offset {
            REG_QUEUE_DESC_LOW => |q: &mut Queue| &mut q.desc_gpa,
            REG_QUEUE_AVAIL_LOW => |q: &mut Queue| &mut q.avail_gpa,
            REG_QUEUE_USED_LOW => |q: &mut Queue| &mut q.used_gpa,
            _ => unreachable!("field_for called with a non-ring-address offset"),
        }
    }

    /// Discard all device and queue state. Triggered by a `Status` write of
    /// 0. The host framebuffer is left alone; it's re-initialized lazily.
    fn reset(&mut self) {
        debug!("virtio-mmio: device reset");
        for q in &mut self.queues {
            q.reset();
        }
        self.interrupt_status = 0;
        self.device_features_sel = 0;
        self.driver_features_sel = 0;
        self.gpu.reset();
    }

    fn queue_notify(&mut self, mem: &GuestMemory, queue_idx: u32) {
        let Some(idx) = usize::try_from(queue_idx).ok().filter(|&i| i < NUM_QUEUES) else {
            warn!(queue_idx, "virtio-mmio: queue-notify for out-of-range queue");
            return;
        };

        let (desc_gpa, avail_gpa, used_gpa, num, mut last_avail, mut used_idx) = {
            let q = &self.queues[idx];
            if !q.ready || q.num == 0 {
                return;
            }
            (q.desc_gpa, q.avail_gpa, q.used_gpa, q.num, q.last_avail_idx, q.used_idx)
        };

        let avail_idx = match mem.read_u16(avail_gpa + 2) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "virtio-mmio: failed to read avail.idx");
                return;
            }
        };

        while last_avail != avail_idx {
            let ring_slot = (last_avail as u32 % num) as u64;
            let head = match mem.read_u16(avail_gpa + 4 + ring_slot * 2) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "virtio-mmio: failed to read avail ring entry");
                    break;
                }
            };

            let (cmd_buf, resp_buf) = self.walk_descriptor_chain(mem, desc_gpa, head as u32, num);
            let written = match (cmd_buf, resp_buf) {
                (Some((cmd_gpa, cmd_len)), Some((resp_gpa, resp_len))) => {
                    self.gpu.handle_command(mem, cmd_gpa, cmd_len, resp_gpa, resp_len)
                }
                _ => {
                    warn!(head, "virtio-mmio: descriptor chain missing command or response buffer");
                    0
                }
            };

            let used_slot = (used_idx as u32 % num) as u64;
            let slot_gpa = used_gpa + 4 + used_slot * 8;
            if let Err(e) = mem.write_u32(slot_gpa, head as u32) {
                warn!(error = %e, "virtio-mmio: failed to publish used-ring id");
            }
            if let Err(e) = mem.write_u32(slot_gpa + 4, written) {
                warn!(error = %e, "virtio-mmio: failed to publish used-ring len");
            }
            used_idx = used_idx.wrapping_add(1);
            // used.idx is published only after the slot it indexes is written.
            if let Err(e) = mem.write_u16(used_gpa + 2, used_idx) {
                warn!(error = %e, "virtio-mmio: failed to publish used.idx");
            }

            last_avail = last_avail.wrapping_add(1);
        }

        let q = &mut self.queues[idx];
        q.last_avail_idx = last_avail;
        q.used_idx = used_idx;
    }

    /// Walk a descriptor chain starting at `head`, bounded by `num`
    /// descriptors. Returns the first write=0 descriptor as the command
    /// buffer and the first write=1 descriptor as the response buffer.
    fn walk_descriptor_chain(&self, mem: &GuestMemory, desc_gpa: u64, head: u32, num: u32) -> (Option<ChainBuffer>, Option<ChainBuffer>) {
        let mut cmd = None;
        let mut resp = None;
        let mut idx = head;

        for _ in 0..num {
            let desc_off = desc_gpa + idx as u64 * DESC_LEN;
            let addr = match mem.read_u64(desc_off) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "virtio-mmio: failed to read descriptor addr");
                    break;
                }
            };
            let len = match mem.read_u32(desc_off + 8) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "virtio-mmio: failed to read descriptor len");
                    break;
                }
            };
            let flags = match mem.read_u16(desc_off + 12) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "virtio-mmio: failed to read descriptor flags");
                    break;
                }
            };

            if flags & DESC_FLAG_WRITE != 0 {
                resp.get_or_insert((addr, len));
            } else {
                cmd.get_or_insert((addr, len));
            }

            if flags & DESC_FLAG_NEXT == 0 {
                break;
            }
            idx = match mem.read_u16(desc_off + 14) {
                Ok(v) => v as u32,
                Err(e) => {
                    warn!(error = %e, "virtio-mmio: failed to read descriptor next");
                    break;
                }
            };
        }

        (cmd, resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_desc(mem: &GuestMemory, desc_gpa: u64, idx: u32, addr: u64, len: u32, flags: u16, next: u16) {
        let off = desc_gpa + idx as u64 * DESC_LEN;
        mem.write_u64(off, addr).unwrap();
        mem.write_u32(off + 8, len).unwrap();
        mem.write_u16(off + 12, flags).unwrap();
        mem.write_u16(off + 14, next).unwrap();
    }

    fn setup_queue(t: &mut VirtioMmioTransport, mem: &GuestMemory, qsel: u32, desc: u64, avail: u64, used: u64, num: u32) {
        t.write(mem, REG_QUEUE_SEL, qsel);
        t.write(mem, REG_QUEUE_NUM, num);
        t.write(mem, REG_QUEUE_DESC_LOW, desc as u32);
        t.write(mem, REG_QUEUE_DESC_HIGH, (desc >> 32) as u32);
        t.write(mem, REG_QUEUE_AVAIL_LOW, avail as u32);
        t.write(mem, REG_QUEUE_AVAIL_HIGH, (avail >> 32) as u32);
        t.write(mem, REG_QUEUE_USED_LOW, used as u32);
        t.write(mem, REG_QUEUE_USED_HIGH, (used >> 32) as u32);
        t.write(mem, REG_QUEUE_READY, 1);
    }

    #[test]
    fn magic_and_ids() {
        let t = VirtioMmioTransport::new(GpuDevice::new(std::env::temp_dir()));
        assert_eq!(t.read(REG_MAGIC_VALUE), 0x7472_6976);
        assert_eq!(t.read(REG_VERSION), 2);
        assert_eq!(t.read(REG_DEVICE_ID), 16);
        assert_eq!(t.read(REG_VENDOR_ID), 0x554D_4551);
    }

    #[test]
    fn queue_notify_drains_display_info_and_publishes_used_ring() {
        let mem = GuestMemory::new(0x1000, 0x2_0000).unwrap();
        let mut t = VirtioMmioTransport::new(GpuDevice::new(std::env::temp_dir()));

        let desc_gpa = 0x1000;
        let avail_gpa = 0x1100;
        let used_gpa = 0x1200;
        setup_queue(&mut t, &mem, 0, desc_gpa, avail_gpa, used_gpa, 4);

        let cmd_gpa = 0x1400;
        let resp_gpa = 0x1500;
        let mut cmd = vec![0u8; 24];
        cmd[0..4].copy_from_slice(&0x0100u32.to_le_bytes()); // GET_DISPLAY_INFO
        mem.write_bytes(cmd_gpa, &cmd).unwrap();

        write_desc(&mem, desc_gpa, 0, cmd_gpa, 24, DESC_FLAG_NEXT, 1);
        write_desc(&mem, desc_gpa, 1, resp_gpa, 408, DESC_FLAG_WRITE, 0);

        mem.write_u16(avail_gpa, 0).unwrap(); // flags
        mem.write_u16(avail_gpa + 4, 0).unwrap(); // ring[0] = head desc 0
        mem.write_u16(avail_gpa + 2, 1).unwrap(); // idx

        mem.write_u16(used_gpa + 2, 0).unwrap();

        t.write(&mem, REG_QUEUE_NOTIFY, 0);

        let used_idx = mem.read_u16(used_gpa + 2).unwrap();
        assert_eq!(used_idx, 1);
        let used_id = mem.read_u32(used_gpa + 4).unwrap();
        assert_eq!(used_id, 0);

        let mut resp = vec![0u8; 4];
        mem.read_bytes(resp_gpa, &mut resp).unwrap();
        assert_eq!(u32::from_le_bytes(resp.try_into().unwrap()), 0x1101);
    }

    #[test]
    fn status_write_zero_resets_queues() {
        let mem = GuestMemory::new(0x1000, 0x2000).unwrap();
        let mut t = VirtioMmioTransport::new(GpuDevice::new(std::env::temp_dir()));

        setup_queue(&mut t, &mem, 0, 0x1000, 0x1100, 0x1200, 4);
        assert_eq!(t.read(REG_QUEUE_READY), 1);

        t.write(&mem, REG_STATUS, 0);
        t.write(&mem, REG_QUEUE_SEL, 0);
        assert_eq!(t.read(REG_QUEUE_READY), 0);
        assert_eq!(t.queues[0].num, 0);
        assert_eq!(t.queues[0].desc_gpa, 0);
    }
}
