//! Per-request diagnostic printout.
//!
//! Lines are emitted as `tracing` events at `INFO` level with the
//! `psg_client::debug` target, so they can be routed independently of the
//! rest of the crate's logging.

use crate::{args::Args, config::DebugPrintout};
use crossbeam_utils::atomic::AtomicCell;
use std::fmt;

static NEXT_ID: AtomicCell<u64> = AtomicCell::new(1);

#[derive(Debug)]
pub(crate) struct DebugPrinter {
    id: u64,
    level: DebugPrintout,
}

impl DebugPrinter {
    pub(crate) fn new(level: DebugPrintout) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1),
            level,
        }
    }

    fn enabled(&self) -> bool {
        self.level != DebugPrintout::None
    }

    pub(crate) fn submitted(&self, authority: &str, path: &str) {
        if self.enabled() {
            tracing::info!(target: "psg_client::debug", "{}: {}{}", self.id, authority, path);
        }
    }

    pub(crate) fn chunk(&self, args: &Args, data: &[u8]) {
        if !self.enabled() {
            return;
        }

        let binary = args.get("item_type") == Some("blob")
            && args.get("chunk_type") == Some("data")
            && self.level != DebugPrintout::All;

        if binary {
            tracing::info!(
                target: "psg_client::debug",
                "{}: {}\n<BINARY DATA OF {} BYTES>",
                self.id,
                args,
                data.len()
            );
        } else {
            tracing::info!(
                target: "psg_client::debug",
                "{}: {}\n{}",
                self.id,
                args,
                Escaped(data)
            );
        }
    }

    pub(crate) fn closed(&self, error_code: u32) {
        if self.enabled() {
            tracing::info!(
                target: "psg_client::debug",
                "{}: Closed with status {}",
                self.id,
                h2::Reason::from(error_code).description()
            );
        }
    }

    pub(crate) fn retrying(&self, retries: u32, error: &dyn fmt::Display) {
        if self.enabled() {
            tracing::info!(
                target: "psg_client::debug",
                "{}: Retrying ({} retries remaining) after {}",
                self.id,
                retries,
                error
            );
        }
    }

    pub(crate) fn gave_up(&self, error: &dyn fmt::Display) {
        if self.enabled() {
            tracing::info!(target: "psg_client::debug", "{}: Gave up after {}", self.id, error);
        }
    }
}

/// Displays bytes with anything that is not printable ASCII escaped.
struct Escaped<'a>(&'a [u8]);

impl fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in self.0 {
            if byte == b'\n' || (byte.is_ascii() && !byte.is_ascii_control()) {
                fmt::Write::write_char(f, byte as char)?;
            } else {
                for escaped in std::ascii::escape_default(byte) {
                    fmt::Write::write_char(f, escaped as char)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_non_printable_bytes() {
        assert_eq!(Escaped(b"ok\n\x00\xff").to_string(), "ok\n\\x00\\xff");
    }

    #[test]
    fn ids_are_unique() {
        let a = DebugPrinter::new(DebugPrintout::Some);
        let b = DebugPrinter::new(DebugPrintout::Some);

        assert_ne!(a.id, b.id);
    }
}
