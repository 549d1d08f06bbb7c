//! Streaming frame format
//!
//! During a binary batch the front-end emits one frame per hit:
//!
//! ```text
//! [sample_count:u16 LE][frame_id:u16 LE][timestamp:48-bit LE][tdc_word:u64 LE]
//! [payload: 2 channels x sample_count x u16 LE]
//! ```
//!
//! In the sync-delimited stream each frame is additionally prefixed by a
//! single [`SYNC_BYTE`] that is not counted in `sample_count`.

use byteorder::{ByteOrder, LittleEndian};

use super::error::ProtocolError;

/// Frame delimiter prepended by firmware in the sync-delimited stream.
pub const SYNC_BYTE: u8 = 0x21;

/// Width of the sample-count field.
pub const SAMPLE_COUNT_WIDTH: usize = 2;
/// Width of the frame-id field.
pub const FRAME_ID_WIDTH: usize = 2;
/// Width of the close-packed device timestamp.
pub const TIMESTAMP_WIDTH: usize = 6;
/// Width of the TDC word.
pub const TDC_WIDTH: usize = 8;

/// Fixed header size preceding the ADC payload.
pub const HEADER_SIZE: usize =
    SAMPLE_COUNT_WIDTH + FRAME_ID_WIDTH + TIMESTAMP_WIDTH + TDC_WIDTH;

/// Payload bytes for `n` samples: two ADC channels, two bytes per sample.
pub fn payload_size(n: usize) -> usize {
    2 * 2 * n
}

/// Total frame bytes (header + payload) for `n` samples, excluding any
/// sync byte.
pub fn frame_size(n: usize) -> usize {
    HEADER_SIZE + payload_size(n)
}

/// Unpacked header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sample_count: u16,
    pub frame_id: u16,
    /// 48-bit device timestamp widened to 64 bits.
    pub timestamp: u64,
    pub tdc_word: u64,
}

/// Unpack the fixed 18-byte header.
pub fn unpack_header(header: &[u8]) -> Result<FrameHeader, ProtocolError> {
    if header.len() < HEADER_SIZE {
        return Err(ProtocolError::FrameLength {
            expected: HEADER_SIZE,
            got: header.len(),
        });
    }
    Ok(FrameHeader {
        sample_count: LittleEndian::read_u16(&header[0..2]),
        frame_id: LittleEndian::read_u16(&header[2..4]),
        timestamp: LittleEndian::read_uint(&header[4..10], TIMESTAMP_WIDTH),
        tdc_word: LittleEndian::read_u64(&header[10..18]),
    })
}

/// One discrete measurement record from a batch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sample_count: u16,
    pub frame_id: u16,
    pub timestamp: u64,
    pub tdc_word: u64,
    /// Both ADC channels' samples, in wire order.
    pub samples: Vec<u16>,
}

impl Frame {
    /// Build a frame from a complete header + payload buffer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = unpack_header(buf)?;
        let expected = frame_size(header.sample_count as usize);
        if buf.len() < expected {
            return Err(ProtocolError::FrameLength {
                expected,
                got: buf.len(),
            });
        }
        let samples = unpack_samples(&buf[HEADER_SIZE..expected]);
        Ok(Self {
            sample_count: header.sample_count,
            frame_id: header.frame_id,
            timestamp: header.timestamp,
            tdc_word: header.tdc_word,
            samples,
        })
    }

    /// Total wire bytes this frame occupied, excluding any sync byte.
    pub fn wire_len(&self) -> usize {
        frame_size(self.sample_count as usize)
    }

    /// First ADC channel's samples. The firmware stores the two channels
    /// back to back, one full channel then the other.
    pub fn channel_a(&self) -> &[u16] {
        &self.samples[..self.sample_count as usize]
    }

    /// Second ADC channel's samples.
    pub fn channel_b(&self) -> &[u16] {
        &self.samples[self.sample_count as usize..]
    }
}

/// Unpack a payload of little-endian u16 samples.
pub fn unpack_samples(payload: &[u8]) -> Vec<u16> {
    payload
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect()
}

/// Offline scanner turning a captured batch dump back into frames.
///
/// `sync_delimited` matches the capture mode: when set, every frame must be
/// preceded by [`SYNC_BYTE`]. A truncated final frame yields one
/// `FrameLength` error and ends the iteration.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
    sync_delimited: bool,
    failed: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8], sync_delimited: bool) -> Self {
        Self {
            buf,
            pos: 0,
            sync_delimited,
            failed: false,
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl Iterator for FrameReader<'_> {
    type Item = Result<Frame, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }

        let mut pos = self.pos;
        if self.sync_delimited {
            if self.buf[pos] != SYNC_BYTE {
                self.failed = true;
                return Some(Err(ProtocolError::SyncByte {
                    found: self.buf[pos],
                }));
            }
            pos += 1;
        }

        let rest = &self.buf[pos..];
        if rest.len() < HEADER_SIZE {
            self.failed = true;
            return Some(Err(ProtocolError::FrameLength {
                expected: HEADER_SIZE,
                got: rest.len(),
            }));
        }
        let n = LittleEndian::read_u16(&rest[0..2]) as usize;
        let total = frame_size(n);
        if rest.len() < total {
            self.failed = true;
            return Some(Err(ProtocolError::FrameLength {
                expected: total,
                got: rest.len(),
            }));
        }

        let frame = match Frame::from_bytes(&rest[..total]) {
            Ok(f) => f,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        self.pos = pos + total;
        Some(Ok(frame))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Build the wire bytes of a frame with `n` ramp samples.
    pub(crate) fn frame_bytes(n: u16, frame_id: u16, ts: u64, tdc: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(frame_size(n as usize));
        let mut w = [0u8; 8];
        LittleEndian::write_u16(&mut w[..2], n);
        buf.extend_from_slice(&w[..2]);
        LittleEndian::write_u16(&mut w[..2], frame_id);
        buf.extend_from_slice(&w[..2]);
        LittleEndian::write_uint(&mut w[..6], ts, 6);
        buf.extend_from_slice(&w[..6]);
        LittleEndian::write_u64(&mut w, tdc);
        buf.extend_from_slice(&w);
        for i in 0..(2 * n) {
            LittleEndian::write_u16(&mut w[..2], 0x100 + i);
            buf.extend_from_slice(&w[..2]);
        }
        buf
    }

    #[test]
    fn size_law() {
        // frame_size(n) == 18 + 4n for all n, exactly.
        for n in [0usize, 1, 2, 7, 100, 65535] {
            assert_eq!(frame_size(n), 18 + 4 * n);
            assert_eq!(payload_size(n), 4 * n);
        }
        assert_eq!(HEADER_SIZE, 18);
    }

    #[test]
    fn header_unpacks_little_endian() {
        let buf = frame_bytes(2, 0x0102, 0x0000_a1b2_c3d4_e5f6 & 0xffff_ffff_ffff, 0x1122_3344_5566_7788);
        let header = unpack_header(&buf).unwrap();
        assert_eq!(header.sample_count, 2);
        assert_eq!(header.frame_id, 0x0102);
        assert_eq!(header.timestamp, 0xa1b2_c3d4_e5f6);
        assert_eq!(header.tdc_word, 0x1122_3344_5566_7788);
    }

    #[test]
    fn timestamp_stays_48_bit() {
        let buf = frame_bytes(0, 0, 0xffff_ffff_ffff, 0);
        let header = unpack_header(&buf).unwrap();
        assert_eq!(header.timestamp, 0xffff_ffff_ffff);
    }

    #[test]
    fn frame_from_bytes_splits_channels() {
        let buf = frame_bytes(3, 7, 42, 43);
        let frame = Frame::from_bytes(&buf).unwrap();
        assert_eq!(frame.sample_count, 3);
        assert_eq!(frame.samples.len(), 6);
        assert_eq!(frame.channel_a(), &[0x100, 0x101, 0x102]);
        assert_eq!(frame.channel_b(), &[0x103, 0x104, 0x105]);
        assert_eq!(frame.wire_len(), buf.len());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = frame_bytes(3, 7, 42, 43);
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            Frame::from_bytes(&buf),
            Err(ProtocolError::FrameLength { expected: 30, got: 29 })
        ));
    }

    #[test]
    fn reader_scans_bare_dump() {
        let mut dump = frame_bytes(1, 0, 1, 2);
        dump.extend_from_slice(&frame_bytes(2, 1, 3, 4));
        let frames: Vec<_> = FrameReader::new(&dump, false)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_id, 0);
        assert_eq!(frames[1].sample_count, 2);
    }

    #[test]
    fn reader_scans_sync_delimited_dump() {
        let mut dump = vec![SYNC_BYTE];
        dump.extend_from_slice(&frame_bytes(1, 9, 1, 2));
        dump.push(SYNC_BYTE);
        dump.extend_from_slice(&frame_bytes(0, 10, 3, 4));
        let frames: Vec<_> = FrameReader::new(&dump, true)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].frame_id, 10);
        assert_eq!(frames[1].samples.len(), 0);
    }

    #[test]
    fn reader_reports_truncated_tail_once() {
        let mut dump = frame_bytes(1, 0, 1, 2);
        dump.extend_from_slice(&frame_bytes(2, 1, 3, 4)[..10]);
        let mut reader = FrameReader::new(&dump, false);
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }
}
