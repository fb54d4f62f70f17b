//! Outgoing data buffering for a non-blocking connection.

use std::{
    collections::VecDeque,
    io::{self, Write},
};

#[derive(Debug, Default)]
struct WriteBuffer {
    data: Vec<u8>,
    written: usize,
    in_progress: bool,
}

impl WriteBuffer {
    fn clear(&mut self) {
        self.data.clear();
        self.written = 0;
        self.in_progress = false;
    }

    /// Write as much of the remaining data as the writer accepts without
    /// blocking. Returns `true` once everything has been written.
    fn write_to(&mut self, writer: &mut impl Write) -> io::Result<bool> {
        while self.written < self.data.len() {
            match writer.write(&self.data[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(true)
    }
}

/// A set of buffers absorbing writes that a socket cannot take right away.
///
/// New data is always appended to the current buffer. When a write of the
/// current buffer only partially completes, the buffer is set aside until
/// the socket becomes writable again and another one becomes current. Data
/// is written out strictly in the order it was appended.
#[derive(Debug)]
pub(crate) struct WriteBuffers {
    buffers: Vec<WriteBuffer>,
    current: usize,
    /// Buffers with a write in progress, oldest first.
    pending: VecDeque<usize>,
    hiwater: usize,
}

impl WriteBuffers {
    pub(crate) fn new(hiwater: usize) -> Self {
        Self {
            buffers: vec![WriteBuffer {
                data: Vec::with_capacity(hiwater),
                ..WriteBuffer::default()
            }],
            current: 0,
            pending: VecDeque::new(),
            hiwater,
        }
    }

    /// The buffer to append outgoing data to.
    pub(crate) fn buffer(&mut self) -> &mut Vec<u8> {
        &mut self.buffers[self.current].data
    }

    /// Whether some data is waiting for the socket to become writable.
    pub(crate) fn is_blocked(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Try to write out the current buffer.
    pub(crate) fn write(&mut self, writer: &mut impl Write) -> io::Result<()> {
        if self.buffers[self.current].data.is_empty() {
            return Ok(());
        }

        // Earlier data still has to go out first.
        if self.is_blocked() {
            self.set_aside();
            return Ok(());
        }

        if self.buffers[self.current].write_to(writer)? {
            self.buffers[self.current].clear();
        } else {
            self.set_aside();
        }

        Ok(())
    }

    /// Continue writing after the socket became writable.
    pub(crate) fn on_writable(&mut self, writer: &mut impl Write) -> io::Result<()> {
        while let Some(&index) = self.pending.front() {
            if !self.buffers[index].write_to(writer)? {
                return Ok(());
            }

            tracing::trace!(index, "write buffer completed");
            self.buffers[index].clear();
            self.pending.pop_front();
        }

        self.write(writer)
    }

    /// Drop all buffered data.
    pub(crate) fn reset(&mut self) {
        self.buffers.truncate(1);
        self.buffers[0].clear();
        self.current = 0;
        self.pending.clear();
    }

    /// Queue the current buffer for writing and switch to a free one.
    fn set_aside(&mut self) {
        self.buffers[self.current].in_progress = true;
        self.pending.push_back(self.current);

        self.current = match self.buffers.iter().position(|buffer| !buffer.in_progress) {
            Some(index) => index,
            None => {
                self.buffers.push(WriteBuffer {
                    data: Vec::with_capacity(self.hiwater),
                    ..WriteBuffer::default()
                });
                self.buffers.len() - 1
            }
        };

        tracing::trace!(
            current = self.current,
            buffers = self.buffers.len(),
            "switched write buffer"
        );
    }
}
