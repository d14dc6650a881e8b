//! Kernel console.
//!
//! The console contract is deliberately small: a write-only byte sink
//! under one global lock. On x86_64 bare metal the sink is the 16550
//! UART; the host build writes to stderr so test output interleaves
//! sanely. The `log` facade routes through the same sink.

use core::fmt;

use spin::Mutex;

pub struct Console {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    uart: Option<uart_16550::SerialPort>,
}

impl Console {
    const fn new() -> Self {
        Self {
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            uart: None,
        }
    }

    fn putc(&mut self, byte: u8) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            if self.uart.is_none() {
                // SAFETY: standard COM1 port base.
                let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
                port.init();
                self.uart = Some(port);
            }
            if let Some(uart) = self.uart.as_mut() {
                uart.send(byte);
            }
        }
        #[cfg(not(target_os = "none"))]
        {
            use std::io::Write;
            let _ = std::io::stderr().write_all(&[byte]);
        }
        #[cfg(all(target_os = "none", not(target_arch = "x86_64")))]
        {
            let _ = byte;
        }
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            self.putc(b);
        }
        Ok(())
    }
}

static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = CONSOLE.lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

struct KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            _print(format_args!(
                "[{:>5}] {}\n",
                record.level(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLog = KernelLog;

/// Route the `log` facade to the console; called once at bring-up.
pub fn init_logging() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Info);
}
