// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! PL011 subset: only the character-data register is emulated. No FIFO, no
//! status register — the guest driver in this system does not poll status.

use std::io::{self, Write};

/// Offset of the one meaningful register.
const DATA_REG: u64 = 0x00;

pub struct Uart<W: Write = io::Stdout> {
    out: W,
}

impl Uart<io::Stdout> {
    pub fn new() -> Self {
        Uart { out: io::stdout() }
    }
}

impl Default for Uart<io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> Uart<W> {
    #[cfg(test)]
    pub fn with_sink(out: W) -> Self {
        Uart { out }
    }

    #[cfg(test)]
    pub fn sink(&self) -> &W {
        &self.out
    }

    /// All loads return 0; there is nothing in this subset worth reading back.
    pub fn read(&mut self, _offset: u64) -> u32 {
        0
    }

    /// A store to the data register writes its low 8 bits to the host's
    /// output stream. Every other offset is accepted and silently dropped.
    pub fn write(&mut self, offset: u64, val: u32) {
        if offset == DATA_REG {
            let byte = val as u8;
            if let Err(e) = self.out.write_all(&[byte]) {
                tracing::warn!(error = %e, "uart: failed to write byte to stdout");
            }
            let _ = self.out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_to_data_register_echoes_low_byte() {
        let mut buf = Vec::new();
        let mut uart = Uart::with_sink(&mut buf);
        uart.write(0x00, 0x1234_0048);
        assert_eq!(buf, vec![0x48]);
    }

    #[test]
    fn store_to_other_offsets_is_dropped() {
        let mut buf = Vec::new();
        let mut uart = Uart::with_sink(&mut buf);
        uart.write(0x18, 0xff);
        assert!(buf.is_empty());
    }

    #[test]
    fn load_always_returns_zero() {
        let mut buf = Vec::new();
        let mut uart = Uart::with_sink(&mut buf);
        uart.write(0x00, 0x41);
        assert_eq!(uart.read(0x00), 0);
    }
}
