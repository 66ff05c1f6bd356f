/*
 * Copyright (c) 2023 xvanc and contributors
 * SPDX-License-Identifier: BSD-3-Clause
 */

//! Diagnostic console
//!
//! The server has no terminal of its own. Whatever transport the platform provides
//! (a UART, a log buffer shared with the kernel, ...) is installed as a
//! [`ConsoleBackend`] and everything printed is pushed through it byte by byte.

use crate::io;
use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;

pub trait ConsoleBackend: Send + Sync {
    fn transmit(&self, byte: u8) -> io::Result<()>;
}

struct ConsoleWriter<'a> {
    backend: &'a dyn ConsoleBackend,
}

impl fmt::Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.backend.transmit(byte).map_err(|_| fmt::Error)?;
        }
        Ok(())
    }
}

static CONSOLE: Mutex<Option<Arc<dyn ConsoleBackend>>> = Mutex::new(None);

/// Install `backend` as the console, returning the previous one
pub fn install(backend: Arc<dyn ConsoleBackend>) -> Option<Arc<dyn ConsoleBackend>> {
    CONSOLE.lock().replace(backend)
}

pub fn print(args: fmt::Arguments) {
    // Clone the handle so a backend that logs does not deadlock on `CONSOLE`.
    let Some(backend) = CONSOLE.lock().clone() else { return };
    let _ = fmt::write(&mut ConsoleWriter { backend: &*backend }, args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}
