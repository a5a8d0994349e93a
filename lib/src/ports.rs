//! Low-level serial I/O.
//!
//! Single source of truth for putting bytes on a UART. The early klog
//! backend funnels through here; callers are responsible for serialisation
//! (cli/sti, IrqMutex, whatever suits the context).

use x86_64::instructions::port::Port;

pub const COM1: u16 = 0x3F8;

const UART_REG_THR: u16 = 0;
const UART_REG_LSR: u16 = 5;
const UART_LSR_TX_EMPTY: u8 = 0x20;

/// Write one byte to a UART, polling the Line Status Register until the
/// transmit holding register is empty.
///
/// # Safety
///
/// Port I/O. Caller must ensure `base` refers to a valid, initialised UART.
#[inline]
pub unsafe fn serial_write_byte(base: u16, byte: u8) {
    let mut lsr: Port<u8> = Port::new(base + UART_REG_LSR);
    let mut thr: Port<u8> = Port::new(base + UART_REG_THR);

    while lsr.read() & UART_LSR_TX_EMPTY == 0 {
        core::hint::spin_loop();
    }
    thr.write(byte);
}

/// Write a byte slice to a UART, converting `\n` to `\r\n`.
///
/// # Safety
///
/// Same contract as [`serial_write_byte`].
pub unsafe fn serial_write_bytes(base: u16, bytes: &[u8]) {
    for &b in bytes {
        if b == b'\n' {
            serial_write_byte(base, b'\r');
        }
        serial_write_byte(base, b);
    }
}
