//! Console output functionality
//!
//! This module provides the console the hypercall layer prints to: kernel
//! `putchar` output, `dprintf` text and log records all end up on the
//! host's standard error.

use std::fmt;
use std::io::{self, Write};

/// Console interface trait
pub trait Console {
    /// Write a single character
    fn write_char(&self, c: u8);

    /// Write a buffer of characters
    fn write(&self, buf: &[u8]) {
        for &c in buf {
            self.write_char(c);
        }
    }

    /// Flush any buffered output
    fn flush(&self) {}
}

/// Console backed by the host's standard error
pub struct HostConsole;

impl Console for HostConsole {
    fn write_char(&self, c: u8) {
        self.write(&[c]);
    }

    fn write(&self, buf: &[u8]) {
        // Nowhere left to report a failed console write
        let _ = io::stderr().lock().write_all(buf);
    }

    fn flush(&self) {
        let _ = io::stderr().lock().flush();
    }
}

/// Default console instance
static DEFAULT_CONSOLE: HostConsole = HostConsole;

/// Print using format arguments
pub fn print_fmt(args: fmt::Arguments<'_>) {
    write_fmt(&DEFAULT_CONSOLE, args);
}

/// Print a single character
pub fn print_char(c: u8) {
    DEFAULT_CONSOLE.write_char(c);
}

/// Print a buffer
pub fn print_bytes(buf: &[u8]) {
    DEFAULT_CONSOLE.write(buf);
}

/// Flush the console
pub fn flush() {
    DEFAULT_CONSOLE.flush();
}

/// Format `args` onto `console`
pub fn write_fmt(console: &dyn Console, args: fmt::Arguments<'_>) {
    let mut writer = ConsoleWriter { console };
    let _ = fmt::write(&mut writer, args);
}

/// Writer for formatted output
struct ConsoleWriter<'a> {
    console: &'a dyn Console,
}

impl<'a> fmt::Write for ConsoleWriter<'a> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.console.write(s.as_bytes());
        Ok(())
    }
}
