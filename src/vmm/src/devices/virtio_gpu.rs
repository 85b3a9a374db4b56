// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! 2D command handler for the single-scanout virtio-GPU device: resource
//! lifecycle, the host-side framebuffer, scanout binding, guest-to-host
//! pixel transfer, and PPM snapshot on flush.
//!
//! A pure function of `(cmd, response buffer, guest memory, &mut self)` —
//! see §9's note on the transport/GPU cycle. No back-pointer to the
//! transport that calls it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::memory::GuestMemory;

const HEADER_LEN: usize = 24;
const DISPLAY_INFO_ENTRY_LEN: usize = 24;
const NUM_DISPLAY_ENTRIES: usize = 16;
/// Guest-controlled command/response lengths are clamped here; nothing in
/// this protocol legitimately needs more.
const MAX_BUF_LEN: u32 = 64 * 1024;

const CMD_GET_DISPLAY_INFO: u32 = 0x0100;
const CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
const CMD_SET_SCANOUT: u32 = 0x0103;
const CMD_RESOURCE_FLUSH: u32 = 0x0104;
const CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
const CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;

const RESP_OK_NODATA: u32 = 0x1100;
const RESP_OK_DISPLAY_INFO: u32 = 0x1101;
const RESP_ERR_UNSPEC: u32 = 0x1200;

const DEFAULT_SCANOUT_WIDTH: u32 = 800;
const DEFAULT_SCANOUT_HEIGHT: u32 = 600;

#[derive(Debug, thiserror::Error)]
enum CmdError {
    #[error("command buffer too short: need {need} bytes, have {have}")]
    ShortCommand { need: usize, have: usize },
    #[error("guest memory access failed: {0}")]
    Memory(#[from] crate::memory::Error),
}

#[derive(Debug, Clone, Copy)]
struct Resource {
    // Recorded for completeness; this handler doesn't branch on pixel format.
    #[allow(dead_code)]
    format: u32,
    width: u32,
    height: u32,
    backing_gpa: u64,
    backing_len: u32,
}

pub struct GpuDevice {
    resources: HashMap<u32, Resource>,
    scanout_resource_id: Option<u32>,
    scanout_width: u32,
    scanout_height: u32,
    framebuffer: Vec<u8>,
    fb_width: u32,
    fb_height: u32,
    flush_count: u64,
    ppm_prefix: PathBuf,
}

impl GpuDevice {
    pub fn new(ppm_prefix: impl Into<PathBuf>) -> Self {
        GpuDevice {
            resources: HashMap::new(),
            scanout_resource_id: None,
            scanout_width: DEFAULT_SCANOUT_WIDTH,
            scanout_height: DEFAULT_SCANOUT_HEIGHT,
            framebuffer: Vec::new(),
            fb_width: 0,
            fb_height: 0,
            flush_count: 0,
            ppm_prefix: ppm_prefix.into(),
        }
    }

    /// Discard all GPU resources. Called on a `Status` write of 0. Does not
    /// release the host framebuffer (it's re-initialized lazily on the next
    /// `RESOURCE_CREATE_2D`); the scanout's resource binding is cleared since
    /// it can no longer name a live resource.
    pub fn reset(&mut self) {
        self.resources.clear();
        self.scanout_resource_id = None;
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn framebuffer_len(&self) -> usize {
        self.framebuffer.len()
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    /// Device config space at transport offset `0x100`: `events_read`,
    /// `events_clear` are 0, `num_scanouts` is 1, everything else reads 0.
    pub fn config_read(&self, offset: u64) -> u32 {
        match offset {
            0x00 => 0, // events_read
            0x04 => 0, // events_clear
            0x08 => 1, // num_scanouts
            _ => 0,
        }
    }

    /// Run one control-queue command. Returns the number of bytes written
    /// into the response buffer.
    pub fn handle_command(&mut self, mem: &GuestMemory, cmd_gpa: u64, cmd_len: u32, resp_gpa: u64, resp_len: u32) -> u32 {
        let cmd_len = cmd_len.min(MAX_BUF_LEN);
        let resp_len = resp_len.min(MAX_BUF_LEN);

        let mut buf = vec![0u8; cmd_len as usize];
        if let Err(e) = mem.read_bytes(cmd_gpa, &mut buf) {
            warn!(error = %e, cmd_gpa, "virtio-gpu: failed to read command buffer");
            return self.write_header_only(mem, resp_gpa, resp_len, RESP_ERR_UNSPEC);
        }

        match self.dispatch(mem, &buf, resp_gpa, resp_len) {
            Ok(written) => written,
            Err(e) => {
                warn!(error = %e, "virtio-gpu: malformed command, responding ERR_UNSPEC");
                self.write_header_only(mem, resp_gpa, resp_len, RESP_ERR_UNSPEC)
            }
        }
    }

    fn dispatch(&mut self, mem: &GuestMemory, cmd: &[u8], resp_gpa: u64, resp_len: u32) -> Result<u32, CmdError> {
        require_len(cmd, HEADER_LEN)?;
        let cmd_type = read_u32(cmd, 0);
        debug!(cmd_type, "virtio-gpu: dispatching command");

        match cmd_type {
            CMD_GET_DISPLAY_INFO => Ok(self.get_display_info(mem, resp_gpa, resp_len)),
            CMD_RESOURCE_CREATE_2D => self.resource_create_2d(cmd, mem, resp_gpa, resp_len),
            CMD_RESOURCE_ATTACH_BACKING => self.resource_attach_backing(cmd, mem, resp_gpa, resp_len),
            CMD_SET_SCANOUT => self.set_scanout(cmd, mem, resp_gpa, resp_len),
            CMD_TRANSFER_TO_HOST_2D => self.transfer_to_host_2d(cmd, mem, resp_gpa, resp_len),
            CMD_RESOURCE_FLUSH => self.resource_flush(cmd, mem, resp_gpa, resp_len),
            other => {
                warn!(cmd_type = other, "virtio-gpu: unknown command");
                Ok(self.write_header_only(mem, resp_gpa, resp_len, RESP_ERR_UNSPEC))
            }
        }
    }

    fn get_display_info(&self, mem: &GuestMemory, resp_gpa: u64, resp_len: u32) -> u32 {
        let mut resp = vec![0u8; HEADER_LEN + NUM_DISPLAY_ENTRIES * DISPLAY_INFO_ENTRY_LEN];
        write_u32(&mut resp, 0, RESP_OK_DISPLAY_INFO);

        let entry0 = HEADER_LEN;
        write_u32(&mut resp, entry0, 0); // x
        write_u32(&mut resp, entry0 + 4, 0); // y
        write_u32(&mut resp, entry0 + 8, self.scanout_width);
        write_u32(&mut resp, entry0 + 12, self.scanout_height);
        write_u32(&mut resp, entry0 + 16, 1); // enabled
        write_u32(&mut resp, entry0 + 20, 0); // flags

        write_response(mem, resp_gpa, resp_len, &resp)
    }

    fn resource_create_2d(&mut self, cmd: &[u8], mem: &GuestMemory, resp_gpa: u64, resp_len: u32) -> Result<u32, CmdError> {
        require_len(cmd, HEADER_LEN + 16)?;
        let resource_id = read_u32(cmd, HEADER_LEN);
        let format = read_u32(cmd, HEADER_LEN + 4);
        let width = read_u32(cmd, HEADER_LEN + 8);
        let height = read_u32(cmd, HEADER_LEN + 12);

        self.resources.insert(
            resource_id,
            Resource { format, width, height, backing_gpa: 0, backing_len: 0 },
        );

        if width > 0 && width <= 4096 && height > 0 && height <= 4096 {
            self.framebuffer = vec![0u8; width as usize * height as usize * 4];
            self.fb_width = width;
            self.fb_height = height;
        }

        Ok(self.write_header_only(mem, resp_gpa, resp_len, RESP_OK_NODATA))
    }

    fn resource_attach_backing(&mut self, cmd: &[u8], mem: &GuestMemory, resp_gpa: u64, resp_len: u32) -> Result<u32, CmdError> {
        require_len(cmd, HEADER_LEN + 8)?;
        let resource_id = read_u32(cmd, HEADER_LEN);
        let nr_entries = read_u32(cmd, HEADER_LEN + 4);

        if nr_entries > 0 {
            require_len(cmd, HEADER_LEN + 8 + 16)?;
            let addr = read_u64(cmd, HEADER_LEN + 8);
            let length = read_u32(cmd, HEADER_LEN + 16);
            if let Some(res) = self.resources.get_mut(&resource_id) {
                res.backing_gpa = addr;
                res.backing_len = length;
            }
        }

        Ok(self.write_header_only(mem, resp_gpa, resp_len, RESP_OK_NODATA))
    }

    fn set_scanout(&mut self, cmd: &[u8], mem: &GuestMemory, resp_gpa: u64, resp_len: u32) -> Result<u32, CmdError> {
        require_len(cmd, HEADER_LEN + 24)?;
        let resource_id = read_u32(cmd, HEADER_LEN + 20);
        self.scanout_resource_id = Some(resource_id);
        Ok(self.write_header_only(mem, resp_gpa, resp_len, RESP_OK_NODATA))
    }

    fn transfer_to_host_2d(&mut self, cmd: &[u8], mem: &GuestMemory, resp_gpa: u64, resp_len: u32) -> Result<u32, CmdError> {
        require_len(cmd, HEADER_LEN + 32)?;
        let rect_x = read_u32(cmd, HEADER_LEN);
        let rect_y = read_u32(cmd, HEADER_LEN + 4);
        let rect_w = read_u32(cmd, HEADER_LEN + 8);
        let rect_h = read_u32(cmd, HEADER_LEN + 12);
        let resource_id = read_u32(cmd, HEADER_LEN + 24);

        if let Some(res) = self.resources.get(&resource_id).copied() {
            if res.backing_len > 0 {
                self.copy_rect_to_framebuffer(mem, &res, rect_x, rect_y, rect_w, rect_h);
            } else {
                warn!(resource_id, "virtio-gpu: transfer from resource with no backing");
            }
        } else {
            warn!(resource_id, "virtio-gpu: transfer from unknown resource");
        }

        Ok(self.write_header_only(mem, resp_gpa, resp_len, RESP_OK_NODATA))
    }

    fn copy_rect_to_framebuffer(&mut self, mem: &GuestMemory, res: &Resource, x: u32, y: u32, w: u32, h: u32) {
        let src_pitch = res.width as u64 * 4;
        let dst_pitch = self.fb_width as u64 * 4;
        let mut pixel = [0u8; 4];

        for row in 0..h {
            if y + row >= res.height {
                continue;
            }
            for col in 0..w {
                if x + col >= res.width {
                    continue;
                }
                let src_off = res.backing_gpa + row as u64 * src_pitch + col as u64 * 4;
                let dst_off = (y + row) as u64 * dst_pitch + (x + col) as u64 * 4;
                if dst_off + 4 > self.framebuffer.len() as u64 {
                    continue;
                }
                if let Err(e) = mem.read_bytes(src_off, &mut pixel) {
                    warn!(error = %e, src_off, "virtio-gpu: unreachable backing pixel, skipping");
                    continue;
                }
                let dst_off = dst_off as usize;
                self.framebuffer[dst_off..dst_off + 4].copy_from_slice(&pixel);
            }
        }
    }

    fn resource_flush(&mut self, cmd: &[u8], mem: &GuestMemory, resp_gpa: u64, resp_len: u32) -> Result<u32, CmdError> {
        require_len(cmd, HEADER_LEN + 24)?;
        let resource_id = read_u32(cmd, HEADER_LEN + 16);
        if !self.resources.contains_key(&resource_id) {
            warn!(resource_id, "virtio-gpu: flush of unknown resource");
        }
        self.flush_count += 1;

        let path = self.ppm_prefix.join(format!("flush-{:06}.ppm", self.flush_count));
        if let Err(e) = write_ppm(&path, &self.framebuffer, self.fb_width, self.fb_height) {
            warn!(error = %e, path = %path.display(), "virtio-gpu: failed to write PPM snapshot");
        } else {
            debug!(path = %path.display(), "virtio-gpu: wrote PPM snapshot");
        }

        Ok(self.write_header_only(mem, resp_gpa, resp_len, RESP_OK_NODATA))
    }

    fn write_header_only(&self, mem: &GuestMemory, resp_gpa: u64, resp_len: u32, response_code: u32) -> u32 {
        let mut resp = vec![0u8; HEADER_LEN];
        write_u32(&mut resp, 0, response_code);
        write_response(mem, resp_gpa, resp_len, &resp)
    }
}

fn require_len(buf: &[u8], need: usize) -> Result<(), CmdError> {
    if buf.len() < need {
        Err(CmdError::ShortCommand { need, have: buf.len() })
    } else {
        Ok(())
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn write_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

fn write_response(mem: &GuestMemory, resp_gpa: u64, resp_len: u32, resp: &[u8]) -> u32 {
    let n = resp.len().min(resp_len as usize);
    if let Err(e) = mem.write_bytes(resp_gpa, &resp[..n]) {
        warn!(error = %e, resp_gpa, "virtio-gpu: failed to write response buffer");
        return 0;
    }
    n as u32
}

fn write_ppm(path: &Path, framebuffer: &[u8], width: u32, height: u32) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::File::create(path)?;
    write!(file, "P6\n{} {}\n255\n", width, height)?;
    for pixel in framebuffer.chunks_exact(4) {
        // BGRA host framebuffer -> RGB PPM triple.
        file.write_all(&[pixel[2], pixel[1], pixel[0]])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestMemory;

    fn header(cmd_type: u32) -> Vec<u8> {
        let mut h = vec![0u8; HEADER_LEN];
        write_u32(&mut h, 0, cmd_type);
        h
    }

    #[test]
    fn get_display_info_reports_default_scanout() {
        let mem = GuestMemory::new(0x1000, 0x10000).unwrap();
        let mut gpu = GpuDevice::new(std::env::temp_dir());

        let resp_gpa = 0x2000;
        let cmd = header(CMD_GET_DISPLAY_INFO);
        mem.write_bytes(0x1000, &cmd).unwrap();
        let written = gpu.handle_command(&mem, 0x1000, cmd.len() as u32, resp_gpa, 1024);
        assert_eq!(written, (HEADER_LEN + NUM_DISPLAY_ENTRIES * DISPLAY_INFO_ENTRY_LEN) as u32);

        let mut out = vec![0u8; written as usize];
        mem.read_bytes(resp_gpa, &mut out).unwrap();
        assert_eq!(read_u32(&out, 0), RESP_OK_DISPLAY_INFO);
        assert_eq!(read_u32(&out, 24), 0);
        assert_eq!(read_u32(&out, 28), 0);
        assert_eq!(read_u32(&out, 32), 800);
        assert_eq!(read_u32(&out, 36), 600);
        assert_eq!(read_u32(&out, 40), 1);
    }

    #[test]
    fn resource_create_allocates_framebuffer() {
        let mem = GuestMemory::new(0x1000, 0x10000).unwrap();
        let mut gpu = GpuDevice::new(std::env::temp_dir());

        let mut cmd = header(CMD_RESOURCE_CREATE_2D);
        cmd.extend_from_slice(&1u32.to_le_bytes()); // resource_id
        cmd.extend_from_slice(&0u32.to_le_bytes()); // format
        cmd.extend_from_slice(&640u32.to_le_bytes()); // width
        cmd.extend_from_slice(&480u32.to_le_bytes()); // height
        mem.write_bytes(0x1000, &cmd).unwrap();

        gpu.handle_command(&mem, 0x1000, cmd.len() as u32, 0x2000, 1024);

        assert_eq!(gpu.framebuffer_len(), 640 * 480 * 4);
        assert_eq!(gpu.resource_count(), 1);
    }

    #[test]
    fn flush_of_unknown_resource_still_acks() {
        let mem = GuestMemory::new(0x1000, 0x10000).unwrap();
        let mut gpu = GpuDevice::new(std::env::temp_dir());

        let mut flush = header(CMD_RESOURCE_FLUSH);
        flush.extend_from_slice(&0u32.to_le_bytes()); // x
        flush.extend_from_slice(&0u32.to_le_bytes()); // y
        flush.extend_from_slice(&0u32.to_le_bytes()); // w
        flush.extend_from_slice(&0u32.to_le_bytes()); // h
        flush.extend_from_slice(&7u32.to_le_bytes()); // resource_id, never created
        flush.extend_from_slice(&0u32.to_le_bytes()); // padding
        mem.write_bytes(0x1000, &flush).unwrap();

        let written = gpu.handle_command(&mem, 0x1000, flush.len() as u32, 0x2000, 1024);
        assert_eq!(written, HEADER_LEN as u32);
        assert_eq!(gpu.flush_count(), 1);

        let mut out = vec![0u8; HEADER_LEN];
        mem.read_bytes(0x2000, &mut out).unwrap();
        assert_eq!(read_u32(&out, 0), RESP_OK_NODATA);
    }

    #[test]
    fn unknown_command_responds_err_unspec() {
        let mem = GuestMemory::new(0x1000, 0x10000).unwrap();
        let mut gpu = GpuDevice::new(std::env::temp_dir());

        let cmd = header(0xdead);
        mem.write_bytes(0x1000, &cmd).unwrap();
        let written = gpu.handle_command(&mem, 0x1000, cmd.len() as u32, 0x2000, 1024);
        assert_eq!(written, HEADER_LEN as u32);

        let mut out = vec![0u8; HEADER_LEN];
        mem.read_bytes(0x2000, &mut out).unwrap();
        assert_eq!(read_u32(&out, 0), RESP_ERR_UNSPEC);
    }

    #[test]
    fn transfer_then_flush_produces_expected_ppm_pixels() {
        let mem = GuestMemory::new(0x1000, 0x10000).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut gpu = GpuDevice::new(dir.path());

        // RESOURCE_CREATE_2D: id=1, 2x1
        let mut create = header(CMD_RESOURCE_CREATE_2D);
        create.extend_from_slice(&1u32.to_le_bytes());
        create.extend_from_slice(&0u32.to_le_bytes());
        create.extend_from_slice(&2u32.to_le_bytes());
        create.extend_from_slice(&1u32.to_le_bytes());
        mem.write_bytes(0x1000, &create).unwrap();
        gpu.handle_command(&mem, 0x1000, create.len() as u32, 0x3000, 1024);

        // Backing: 8 bytes at 0x4000.
        let backing = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        mem.write_bytes(0x4000, &backing).unwrap();

        let mut attach = header(CMD_RESOURCE_ATTACH_BACKING);
        attach.extend_from_slice(&1u32.to_le_bytes()); // resource_id
        attach.extend_from_slice(&1u32.to_le_bytes()); // nr_entries
        attach.extend_from_slice(&0x4000u64.to_le_bytes()); // addr
        attach.extend_from_slice(&8u32.to_le_bytes()); // length
        attach.extend_from_slice(&0u32.to_le_bytes()); // padding
        mem.write_bytes(0x1000, &attach).unwrap();
        gpu.handle_command(&mem, 0x1000, attach.len() as u32, 0x3000, 1024);

        let mut transfer = header(CMD_TRANSFER_TO_HOST_2D);
        transfer.extend_from_slice(&0u32.to_le_bytes()); // x
        transfer.extend_from_slice(&0u32.to_le_bytes()); // y
        transfer.extend_from_slice(&2u32.to_le_bytes()); // w
        transfer.extend_from_slice(&1u32.to_le_bytes()); // h
        transfer.extend_from_slice(&0u64.to_le_bytes()); // offset
        transfer.extend_from_slice(&1u32.to_le_bytes()); // resource_id
        transfer.extend_from_slice(&0u32.to_le_bytes()); // padding
        mem.write_bytes(0x1000, &transfer).unwrap();
        gpu.handle_command(&mem, 0x1000, transfer.len() as u32, 0x3000, 1024);

        let mut flush = header(CMD_RESOURCE_FLUSH);
        flush.extend_from_slice(&0u32.to_le_bytes());
        flush.extend_from_slice(&0u32.to_le_bytes());
        flush.extend_from_slice(&2u32.to_le_bytes());
        flush.extend_from_slice(&1u32.to_le_bytes());
        flush.extend_from_slice(&1u32.to_le_bytes()); // resource_id
        flush.extend_from_slice(&0u32.to_le_bytes()); // padding
        mem.write_bytes(0x1000, &flush).unwrap();
        gpu.handle_command(&mem, 0x1000, flush.len() as u32, 0x3000, 1024);

        assert_eq!(gpu.flush_count(), 1);

        let ppm = std::fs::read(dir.path().join("flush-000001.ppm")).unwrap();
        let header_end = ppm.iter().enumerate().filter(|(_, &b)| b == b'\n').nth(2).unwrap().0 + 1;
        assert_eq!(&ppm[header_end..], &[0x33, 0x22, 0x11, 0x77, 0x66, 0x55]);
    }

    #[test]
    fn reset_clears_resources_and_scanout() {
        let mem = GuestMemory::new(0x1000, 0x10000).unwrap();
        let mut gpu = GpuDevice::new(std::env::temp_dir());

        let mut create = header(CMD_RESOURCE_CREATE_2D);
        create.extend_from_slice(&1u32.to_le_bytes());
        create.extend_from_slice(&0u32.to_le_bytes());
        create.extend_from_slice(&4u32.to_le_bytes());
        create.extend_from_slice(&4u32.to_le_bytes());
        mem.write_bytes(0x1000, &create).unwrap();
        gpu.handle_command(&mem, 0x1000, create.len() as u32, 0x3000, 1024);
        assert_eq!(gpu.resource_count(), 1);

        gpu.reset();
        assert_eq!(gpu.resource_count(), 0);
        assert!(gpu.scanout_resource_id.is_none());
    }
}
