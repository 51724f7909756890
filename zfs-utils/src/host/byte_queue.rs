// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

/// A shared FIFO of bytes, standing in for the pipes of a fake child.
///
/// Clones refer to the same underlying buffer: bytes written through one
/// handle are read back through any other.
#[derive(Clone, Debug, Default)]
pub struct ByteQueue {
    buf: Arc<Mutex<VecDeque<u8>>>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains everything currently queued.
    pub fn take_all(&self) -> Vec<u8> {
        self.buf.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Write for ByteQueue {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Read for ByteQueue {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().read(buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clones_share_contents() {
        let mut writer = ByteQueue::new();
        let mut reader = writer.clone();

        writer.write_all(b"stream").unwrap();
        assert_eq!(reader.len(), 6);

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "stream");
        assert!(writer.is_empty());
    }
}
