use std::fmt::{Debug, Formatter};
use std::sync::atomic::{fence, AtomicU8, Ordering};
use std::sync::Arc;

/// A fixed-size byte region shared between the two sides of a [crate::channel::duplex_channel::DuplexChannel].
///
/// Every byte is an `AtomicU8`, so both sides can hold a clone and access the region without a
///  lock. Payload bytes are accessed with relaxed ordering; the cursor protocol publishes them with
///  release / acquire fences around cursor updates.
///
/// Cursors are 4 bytes at odd offsets, so they cannot be stored as a single atomic u32. A cursor
///  is therefore read until two consecutive reads agree, which filters out reads overlapping a
///  concurrent update.
#[derive(Clone)]
pub struct SharedBuffer {
    bytes: Arc<[AtomicU8]>,
}

impl Debug for SharedBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedBuffer{{{} bytes}}", self.bytes.len())
    }
}

impl SharedBuffer {
    pub fn new(len: usize) -> SharedBuffer {
        SharedBuffer {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn load_u8(&self, offs: usize) -> u8 {
        self.bytes[offs].load(Ordering::Acquire)
    }

    pub fn store_u8(&self, offs: usize, value: u8) {
        self.bytes[offs].store(value, Ordering::Release);
    }

    pub fn swap_u8(&self, offs: usize, value: u8) -> u8 {
        self.bytes[offs].swap(value, Ordering::AcqRel)
    }

    pub fn fetch_or_u8(&self, offs: usize, value: u8) {
        self.bytes[offs].fetch_or(value, Ordering::AcqRel);
    }

    fn load_u32_le_once(&self, offs: usize) -> u32 {
        let mut raw = [0u8; 4];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = self.bytes[offs + i].load(Ordering::Acquire);
        }
        u32::from_le_bytes(raw)
    }

    /// load a little endian cursor that the other side may be updating concurrently
    pub fn load_cursor(&self, offs: usize) -> u32 {
        let mut prev = self.load_u32_le_once(offs);
        loop {
            let cur = self.load_u32_le_once(offs);
            if cur == prev {
                fence(Ordering::Acquire);
                return cur;
            }
            prev = cur;
        }
    }

    /// store a little endian cursor, publishing all preceding writes to the region
    pub fn store_cursor(&self, offs: usize, value: u32) {
        fence(Ordering::Release);
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.bytes[offs + i].store(b, Ordering::Release);
        }
    }

    pub fn copy_in(&self, offs: usize, src: &[u8]) {
        for (dst, &b) in self.bytes[offs..offs + src.len()].iter().zip(src) {
            dst.store(b, Ordering::Relaxed);
        }
    }

    pub fn copy_out(&self, offs: usize, dst: &mut [u8]) {
        let len = dst.len();
        for (d, src) in dst.iter_mut().zip(&self.bytes[offs..offs + len]) {
            *d = src.load(Ordering::Relaxed);
        }
    }

    /// a snapshot of the whole region, for diagnostics and tests
    pub fn to_vec(&self) -> Vec<u8> {
        let mut result = vec![0u8; self.len()];
        self.copy_out(0, &mut result);
        result
    }
}
