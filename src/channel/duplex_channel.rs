use bytes::Bytes;
use tracing::trace;

use crate::channel::shared_buffer::SharedBuffer;
use crate::error::ChannelError;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// The location of one half of the shared region. Both cursors describe this half's data region:
///  the side writing the half advances the write cursor, the side draining it advances the read
///  cursor.
///
/// ```ascii
/// base + 0: notify flag (u8)
/// base + 1: read cursor (u32 LE)
/// base + 5: write cursor (u32 LE)
/// base + 9: data region, `data_size` bytes
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Half {
    base: usize,
    data_size: usize,
}

impl Half {
    fn flag(&self) -> usize {
        self.base
    }

    fn read_cursor(&self) -> usize {
        self.base + 1
    }

    fn write_cursor(&self) -> usize {
        self.base + 5
    }

    fn data(&self) -> usize {
        self.base + DuplexChannel::HALF_HEADER_LEN
    }

    /// One byte always stays unused to distinguish 'full' from 'empty', and every message
    ///  carries a length prefix
    fn max_message_len(&self) -> usize {
        self.data_size - 1 - DuplexChannel::LEN_PREFIX_LEN
    }

    fn load_cursor(&self, buffer: &SharedBuffer, offs: usize) -> Result<usize, ChannelError> {
        let cursor = buffer.load_cursor(offs);
        let as_usize: usize = cursor.safe_cast();
        if as_usize >= self.data_size {
            return Err(ChannelError::InvalidCursor { cursor, region: self.data_size });
        }
        Ok(as_usize)
    }

    fn used(&self, buffer: &SharedBuffer) -> Result<usize, ChannelError> {
        let r = self.load_cursor(buffer, self.read_cursor())?;
        let w = self.load_cursor(buffer, self.write_cursor())?;

        if w >= r {
            Ok(w - r)
        }
        else {
            Ok(self.data_size - (r - w))
        }
    }

    fn write_wrapped(&self, buffer: &SharedBuffer, offs: usize, src: &[u8]) -> usize {
        let first = src.len().min(self.data_size - offs);
        buffer.copy_in(self.data() + offs, &src[..first]);
        if src.len() > first {
            buffer.copy_in(self.data(), &src[first..]);
        }
        (offs + src.len()) % self.data_size
    }

    fn read_wrapped(&self, buffer: &SharedBuffer, offs: usize, dst: &mut [u8]) -> usize {
        let first = dst.len().min(self.data_size - offs);
        buffer.copy_out(self.data() + offs, &mut dst[..first]);
        if dst.len() > first {
            buffer.copy_out(self.data(), &mut dst[first..]);
        }
        (offs + dst.len()) % self.data_size
    }
}

/// The sending part of a duplex channel: the only code that writes this side's half.
#[derive(Debug)]
pub struct ChannelWriter {
    buffer: SharedBuffer,
    half: Half,
}

impl ChannelWriter {
    pub fn available_to_write(&self) -> usize {
        self.try_available_to_write().unwrap_or(0)
    }

    fn try_available_to_write(&self) -> Result<usize, ChannelError> {
        Ok(self.half.data_size - 1 - self.half.used(&self.buffer)?)
    }

    /// the biggest message that fits into an empty channel
    pub fn max_message_len(&self) -> usize {
        self.half.max_message_len()
    }

    /// Write a single message with its length prefix. A message that does not fit completely is
    ///  rejected without touching the channel.
    pub fn write_message(&mut self, msg: &[u8]) -> Result<usize, ChannelError> {
        if msg.is_empty() {
            return Err(ChannelError::EmptyMessage);
        }

        let available = self.try_available_to_write()?;
        let required = msg.len().saturating_add(DuplexChannel::LEN_PREFIX_LEN);
        if required > available {
            return Err(ChannelError::Full { required, available });
        }
        let len_prefix: u32 = msg.len().prechecked_cast();

        let w = self.half.load_cursor(&self.buffer, self.half.write_cursor())?;
        let w = self.half.write_wrapped(&self.buffer, w, &len_prefix.to_le_bytes());
        let w = self.half.write_wrapped(&self.buffer, w, msg);

        self.buffer.store_cursor(self.half.write_cursor(), w.prechecked_cast());
        self.buffer.fetch_or_u8(self.half.flag(), 1);

        trace!("wrote {} bytes to shared channel, write cursor now at {}", msg.len(), w);
        Ok(msg.len())
    }

    /// The notify flag of the half this side writes. It is set by our own writes and by the peer
    ///  after it drained messages.
    pub fn take_own_flag(&self) -> bool {
        self.buffer.swap_u8(self.half.flag(), 0) != 0
    }
}

/// The receiving part of a duplex channel: the only code that drains the peer's half.
#[derive(Debug)]
pub struct ChannelReader {
    buffer: SharedBuffer,
    half: Half,
}

impl ChannelReader {
    pub fn available_to_read(&self) -> usize {
        self.half.used(&self.buffer).unwrap_or(0)
    }

    /// the length of the next message, or 0 if not even its length prefix is available yet
    pub fn peek_next_message_size(&self) -> usize {
        match self.peek_len_prefix() {
            Ok(Some((_, len))) => len,
            _ => 0,
        }
    }

    fn peek_len_prefix(&self) -> Result<Option<(usize, usize)>, ChannelError> {
        if self.half.used(&self.buffer)? < DuplexChannel::LEN_PREFIX_LEN {
            return Ok(None);
        }

        let r = self.half.load_cursor(&self.buffer, self.half.read_cursor())?;
        let mut raw = [0u8; DuplexChannel::LEN_PREFIX_LEN];
        let payload_offs = self.half.read_wrapped(&self.buffer, r, &mut raw);
        Ok(Some((payload_offs, u32::from_le_bytes(raw).safe_cast())))
    }

    /// Read the next message into `buf`, returning its length, or `Ok(None)` if no complete
    ///  message is available yet. The read cursor is only advanced when a message is returned.
    pub fn try_read_message(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ChannelError> {
        let available = self.half.used(&self.buffer)?;
        let (payload_offs, len) = match self.peek_len_prefix()? {
            Some(x) => x,
            None => return Ok(None),
        };

        if len == 0 || len > self.half.max_message_len() {
            return Err(ChannelError::Corrupt { declared: len, capacity: self.half.max_message_len() });
        }
        if len > buf.len() {
            return Err(ChannelError::BufferTooSmall { required: len });
        }
        if available < len + DuplexChannel::LEN_PREFIX_LEN {
            return Ok(None);
        }

        let r = self.half.read_wrapped(&self.buffer, payload_offs, &mut buf[..len]);
        self.buffer.store_cursor(self.half.read_cursor(), r.prechecked_cast());
        self.buffer.store_u8(self.half.flag(), 1);

        trace!("read {} bytes from shared channel, read cursor now at {}", len, r);
        Ok(Some(len))
    }

    /// Read the next message into `buf`, returning 0 if nothing was read for whatever reason
    pub fn read_message(&mut self, buf: &mut [u8]) -> usize {
        match self.try_read_message(buf) {
            Ok(Some(len)) => len,
            _ => 0,
        }
    }

    /// Read the next message into a buffer of exactly the right size, so an undersized buffer
    ///  can never stall the channel
    pub fn read_next(&mut self) -> Result<Option<Bytes>, ChannelError> {
        let len = self.peek_next_message_size()
            .min(self.half.max_message_len());

        let mut buf = vec![0u8; len];
        match self.try_read_message(&mut buf)? {
            Some(n) => {
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
            None => Ok(None),
        }
    }

    /// The notify flag of the peer's half, set by the peer when it writes
    pub fn take_peer_flag(&self) -> bool {
        self.buffer.swap_u8(self.half.flag(), 0) != 0
    }
}

/// One side of a bidirectional message channel over a [SharedBuffer]. The region is split into a
///  left and a right half, each a single-producer single-consumer ring: this side writes its own
///  half and drains the peer's.
///
/// Messages are framed with a 4-byte little endian length prefix. [DuplexChannel::split] hands out
///  the writing and reading parts separately so they can be used from different tasks.
#[derive(Debug)]
pub struct DuplexChannel {
    writer: ChannelWriter,
    reader: ChannelReader,
}

impl DuplexChannel {
    pub const HALF_HEADER_LEN: usize = 9;
    pub const LEN_PREFIX_LEN: usize = 4;
    /// Each data region must hold at least a length prefix and a single payload byte, plus the
    ///  byte that always stays unused
    pub const MIN_DATA_LEN: usize = Self::LEN_PREFIX_LEN + 2;
    pub const MIN_REGION_LEN: usize = 2 * (Self::HALF_HEADER_LEN + Self::MIN_DATA_LEN);

    pub fn new(buffer: SharedBuffer, left_is_mine: bool) -> Result<DuplexChannel, ChannelError> {
        let total = buffer.len();
        if total < Self::MIN_REGION_LEN {
            return Err(ChannelError::RegionTooSmall(total));
        }

        let half_len = total / 2;
        let left = Half { base: 0, data_size: half_len - Self::HALF_HEADER_LEN };
        let right = Half { base: half_len, data_size: total - half_len - Self::HALF_HEADER_LEN };
        if u32::try_from(right.data_size).is_err() {
            return Err(ChannelError::RegionTooSmall(total));
        }

        let (mine, peer) = if left_is_mine { (left, right) } else { (right, left) };
        Ok(DuplexChannel {
            writer: ChannelWriter { buffer: buffer.clone(), half: mine },
            reader: ChannelReader { buffer, half: peer },
        })
    }

    /// Both sides of a channel over a freshly allocated region, the first one owning the left half
    pub fn pair(len: usize) -> Result<(DuplexChannel, DuplexChannel), ChannelError> {
        let buffer = SharedBuffer::new(len);
        let left = DuplexChannel::new(buffer.clone(), true)?;
        let right = DuplexChannel::new(buffer, false)?;
        Ok((left, right))
    }

    /// Reset flags and cursors of both halves. Only the side that owns the memory does this, and
    ///  only before the peer starts using it.
    pub fn initialize(&self) {
        let buffer = &self.writer.buffer;
        for half in [self.writer.half, self.reader.half] {
            buffer.store_u8(half.flag(), 0);
            buffer.store_cursor(half.read_cursor(), 0);
            buffer.store_cursor(half.write_cursor(), 0);
        }
    }

    pub fn split(self) -> (ChannelWriter, ChannelReader) {
        (self.writer, self.reader)
    }

    pub fn available_to_write(&self) -> usize {
        self.writer.available_to_write()
    }

    pub fn available_to_read(&self) -> usize {
        self.reader.available_to_read()
    }

    pub fn write_message(&mut self, msg: &[u8]) -> Result<usize, ChannelError> {
        self.writer.write_message(msg)
    }

    pub fn peek_next_message_size(&self) -> usize {
        self.reader.peek_next_message_size()
    }

    pub fn read_message(&mut self, buf: &mut [u8]) -> usize {
        self.reader.read_message(buf)
    }

    pub fn try_read_message(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ChannelError> {
        self.reader.try_read_message(buf)
    }

    pub fn read_next(&mut self) -> Result<Option<Bytes>, ChannelError> {
        self.reader.read_next()
    }

    pub fn take_own_flag(&self) -> bool {
        self.writer.take_own_flag()
    }

    pub fn take_peer_flag(&self) -> bool {
        self.reader.take_peer_flag()
    }
}
