//! Streaming batch receive: sinks and frame reassembly strategies
//!
//! A batch turns the transport into an unbounded byte stream. Three
//! interchangeable strategies turn that stream into sink writes:
//!
//! - [`BatchMode::Bulk`] — no framing; every available byte goes to the
//!   sink verbatim. Lowest overhead, frame counter stays at zero.
//! - [`BatchMode::SyncDelimited`] — each frame is prefixed by
//!   [`SYNC_BYTE`]; a small state machine consumes sync byte, sample
//!   count, then the rest of the frame, only ever reading byte counts
//!   that are already available.
//! - [`BatchMode::LegacyPrefix`] — historical firmware framing: a bare
//!   2-byte little-endian sample count, then the frame remainder. A short
//!   remainder is the end-of-stream path.
//!
//! Each strategy is a separate state machine so it can be driven and
//! tested on its own; the session owns the surrounding stop/abort/idle
//! loop.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use super::channel::CommunicationChannel;
use super::error::ProtocolError;
use super::frame::{frame_size, Frame, SYNC_BYTE};

/// Where received batch data goes.
///
/// `raw` receives every captured wire byte in order; `frame` additionally
/// receives each reassembled frame in the framing strategies.
pub trait BatchSink: Send {
    fn raw(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn frame(&mut self, frame: &Frame) -> io::Result<()> {
        let _ = frame;
        Ok(())
    }
}

/// Sink writing raw bytes to a file.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl BatchSink for FileSink {
    fn raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)
    }
}

/// Sink accumulating in memory, keeping reassembled frames as well.
#[derive(Default)]
pub struct MemorySink {
    pub bytes: Vec<u8>,
    pub frames: Vec<Frame>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BatchSink for MemorySink {
    fn raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.frames.push(frame.clone());
        Ok(())
    }
}

/// Sink that discards everything.
pub struct NullSink;

impl BatchSink for NullSink {
    fn raw(&mut self, _bytes: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Binary batch storage/parsing strategy, selected at session construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchMode {
    /// Raw dump, maximum throughput, no per-frame accounting.
    Bulk,
    /// Sync-byte delimited frames.
    SyncDelimited,
    /// Bare sample-count prefixed frames (historical firmware).
    #[default]
    LegacyPrefix,
}

/// Byte and frame counters shared with the foreground thread.
pub(crate) struct BatchCounters<'a> {
    pub bytes: &'a AtomicU64,
    pub frames: &'a AtomicU64,
}

impl BatchCounters<'_> {
    fn add_bytes(&self, n: usize) {
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn add_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of one strategy iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pump {
    /// Bytes were consumed; call again soon.
    Progress,
    /// Nothing available right now.
    Idle,
}

/// One frame-reassembly state machine.
pub(crate) trait FrameAssembler: Send {
    fn pump(
        &mut self,
        chan: &mut dyn CommunicationChannel,
        sink: &mut dyn BatchSink,
        counters: &BatchCounters<'_>,
    ) -> Result<Pump, ProtocolError>;
}

pub(crate) fn assembler_for(
    mode: BatchMode,
    read_timeout: Duration,
    poll_interval: Duration,
) -> Box<dyn FrameAssembler> {
    match mode {
        BatchMode::Bulk => Box::new(BulkAssembler::default()),
        BatchMode::SyncDelimited => Box::new(SyncAssembler::default()),
        BatchMode::LegacyPrefix => Box::new(LegacyAssembler::new(read_timeout, poll_interval)),
    }
}

fn read_available(
    chan: &mut dyn CommunicationChannel,
    buf: &mut [u8],
) -> Result<usize, ProtocolError> {
    let avail = chan.bytes_to_read()? as usize;
    if avail == 0 {
        return Ok(0);
    }
    let want = avail.min(buf.len());
    let n = chan.read(&mut buf[..want])?;
    Ok(n)
}

/// Read exactly `want` bytes, polling availability, giving up once no
/// complete remainder arrives within `timeout`.
fn read_exact_within(
    chan: &mut dyn CommunicationChannel,
    want: usize,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = vec![0u8; want];
    let mut got = 0;
    let start = Instant::now();

    while got < want {
        let avail = chan.bytes_to_read()? as usize;
        if avail > 0 {
            let take = avail.min(want - got);
            let n = chan.read(&mut buf[got..got + take])?;
            got += n;
            continue;
        }
        if start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    buf.truncate(got);
    Ok(buf)
}

/// Raw dump strategy.
#[derive(Default)]
struct BulkAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler for BulkAssembler {
    fn pump(
        &mut self,
        chan: &mut dyn CommunicationChannel,
        sink: &mut dyn BatchSink,
        counters: &BatchCounters<'_>,
    ) -> Result<Pump, ProtocolError> {
        if self.buf.is_empty() {
            self.buf.resize(4096, 0);
        }
        let n = read_available(chan, &mut self.buf)?;
        if n == 0 {
            return Ok(Pump::Idle);
        }
        sink.raw(&self.buf[..n])?;
        counters.add_bytes(n);
        Ok(Pump::Progress)
    }
}

enum SyncState {
    AwaitSync,
    AwaitCount,
    AwaitPayload { count_bytes: [u8; 2], nsamples: usize },
}

/// Sync-byte delimited strategy. Every read is for a byte count already
/// known to be available, so the machine never blocks mid-field.
struct SyncAssembler {
    state: SyncState,
}

impl Default for SyncAssembler {
    fn default() -> Self {
        Self {
            state: SyncState::AwaitSync,
        }
    }
}

impl FrameAssembler for SyncAssembler {
    fn pump(
        &mut self,
        chan: &mut dyn CommunicationChannel,
        sink: &mut dyn BatchSink,
        counters: &BatchCounters<'_>,
    ) -> Result<Pump, ProtocolError> {
        let avail = chan.bytes_to_read()? as usize;

        match self.state {
            SyncState::AwaitSync => {
                if avail < 1 {
                    return Ok(Pump::Idle);
                }
                let mut byte = [0u8; 1];
                chan.read(&mut byte)?;
                counters.add_bytes(1);
                if byte[0] != SYNC_BYTE {
                    tracing::warn!("bad sync byte {:#04x}, resynchronizing", byte[0]);
                    return Ok(Pump::Progress);
                }
                sink.raw(&byte)?;
                self.state = SyncState::AwaitCount;
                Ok(Pump::Progress)
            }
            SyncState::AwaitCount => {
                if avail < 2 {
                    return Ok(Pump::Idle);
                }
                let mut count_bytes = [0u8; 2];
                chan.read(&mut count_bytes)?;
                counters.add_bytes(2);
                let nsamples = LittleEndian::read_u16(&count_bytes) as usize;
                self.state = SyncState::AwaitPayload {
                    count_bytes,
                    nsamples,
                };
                Ok(Pump::Progress)
            }
            SyncState::AwaitPayload {
                count_bytes,
                nsamples,
            } => {
                let need = frame_size(nsamples) - 2;
                if avail < need {
                    return Ok(Pump::Idle);
                }
                let mut rest = vec![0u8; need];
                let mut got = 0;
                while got < need {
                    got += chan.read(&mut rest[got..])?;
                }
                counters.add_bytes(need);

                // Rebuild the full frame from the count bytes already
                // consumed; nothing is re-read.
                let mut full = Vec::with_capacity(2 + need);
                full.extend_from_slice(&count_bytes);
                full.extend_from_slice(&rest);
                let frame = Frame::from_bytes(&full)?;

                sink.raw(&full)?;
                sink.frame(&frame)?;
                counters.add_frame();
                tracing::debug!(
                    frame_id = frame.frame_id,
                    nsamples,
                    "frame reassembled"
                );

                self.state = SyncState::AwaitSync;
                Ok(Pump::Progress)
            }
        }
    }
}

/// Bare 2-byte-prefix strategy. The sample-count word may arrive split;
/// partial words are carried across iterations.
struct LegacyAssembler {
    read_timeout: Duration,
    poll_interval: Duration,
    pending_count: Vec<u8>,
}

impl LegacyAssembler {
    fn new(read_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            read_timeout,
            poll_interval,
            pending_count: Vec::with_capacity(2),
        }
    }
}

impl FrameAssembler for LegacyAssembler {
    fn pump(
        &mut self,
        chan: &mut dyn CommunicationChannel,
        sink: &mut dyn BatchSink,
        counters: &BatchCounters<'_>,
    ) -> Result<Pump, ProtocolError> {
        if self.pending_count.len() < 2 {
            let avail = chan.bytes_to_read()? as usize;
            if avail == 0 {
                return Ok(Pump::Idle);
            }
            let want = (2 - self.pending_count.len()).min(avail);
            let mut buf = [0u8; 2];
            let n = chan.read(&mut buf[..want])?;
            counters.add_bytes(n);
            self.pending_count.extend_from_slice(&buf[..n]);
            if self.pending_count.len() < 2 {
                return Ok(Pump::Progress);
            }
        }

        let nsamples = LittleEndian::read_u16(&self.pending_count) as usize;
        let need = frame_size(nsamples) - 2;
        let rest = read_exact_within(chan, need, self.read_timeout, self.poll_interval)?;
        counters.add_bytes(rest.len());

        if rest.len() != need {
            // Declared length never arrived: flush what we have for
            // forensics and report end-of-stream.
            tracing::error!(
                expected = need,
                got = rest.len(),
                nsamples,
                "frame remainder short, treating as end of stream"
            );
            sink.raw(&self.pending_count)?;
            sink.raw(&rest)?;
            self.pending_count.clear();
            return Err(ProtocolError::FrameLength {
                expected: need,
                got: rest.len(),
            });
        }

        let mut full = Vec::with_capacity(2 + need);
        full.extend_from_slice(&self.pending_count);
        full.extend_from_slice(&rest);
        let frame = Frame::from_bytes(&full)?;

        sink.raw(&full)?;
        sink.frame(&frame)?;
        counters.add_frame();
        self.pending_count.clear();
        Ok(Pump::Progress)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::ScriptedChannel;
    use super::*;
    use crate::protocol::frame::tests::frame_bytes;
    use pretty_assertions::assert_eq;

    const FAST: Duration = Duration::from_millis(20);
    const POLL: Duration = Duration::from_millis(1);

    struct Counts {
        bytes: AtomicU64,
        frames: AtomicU64,
    }

    impl Counts {
        fn new() -> Self {
            Self {
                bytes: AtomicU64::new(0),
                frames: AtomicU64::new(0),
            }
        }

        fn counters(&self) -> BatchCounters<'_> {
            BatchCounters {
                bytes: &self.bytes,
                frames: &self.frames,
            }
        }

        fn snapshot(&self) -> (u64, u64) {
            (
                self.bytes.load(Ordering::Relaxed),
                self.frames.load(Ordering::Relaxed),
            )
        }
    }

    fn drain(
        assembler: &mut dyn FrameAssembler,
        chan: &mut ScriptedChannel,
        sink: &mut MemorySink,
        counts: &Counts,
    ) -> Option<ProtocolError> {
        loop {
            match assembler.pump(chan, sink, &counts.counters()) {
                Ok(Pump::Progress) => continue,
                Ok(Pump::Idle) => {
                    if chan.bytes_to_read().unwrap() == 0 {
                        return None;
                    }
                }
                Err(e) => return Some(e),
            }
        }
    }

    #[test]
    fn bulk_copies_everything_verbatim() {
        let data = frame_bytes(2, 1, 2, 3);
        let mut chan = ScriptedChannel::new([data[..10].to_vec(), data[10..].to_vec()]);
        let mut sink = MemorySink::new();
        let counts = Counts::new();
        let mut assembler = BulkAssembler::default();

        assert!(drain(&mut assembler, &mut chan, &mut sink, &counts).is_none());
        assert_eq!(sink.bytes, data);
        // Bulk mode never parses frames.
        assert_eq!(counts.snapshot(), (26, 0));
        assert!(sink.frames.is_empty());
    }

    #[test]
    fn legacy_reassembles_26_byte_frame() {
        // sample_count=2: 2 count bytes + 16 header remainder + 8 payload.
        let data = frame_bytes(2, 7, 42, 43);
        assert_eq!(data.len(), 26);
        let mut chan = ScriptedChannel::new([data.clone()]);
        let mut sink = MemorySink::new();
        let counts = Counts::new();
        let mut assembler = LegacyAssembler::new(FAST, POLL);

        assert!(drain(&mut assembler, &mut chan, &mut sink, &counts).is_none());
        assert_eq!(counts.snapshot(), (26, 1));
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.frames[0].sample_count, 2);
        assert_eq!(sink.frames[0].frame_id, 7);
        assert_eq!(sink.bytes, data);
    }

    #[test]
    fn legacy_handles_split_count_word() {
        let data = frame_bytes(1, 3, 0, 0);
        let mut chan = ScriptedChannel::new([
            data[..1].to_vec(),
            Vec::new(), // idle round between the two count bytes
            data[1..].to_vec(),
        ]);
        let mut sink = MemorySink::new();
        let counts = Counts::new();
        let mut assembler = LegacyAssembler::new(FAST, POLL);

        assert!(drain(&mut assembler, &mut chan, &mut sink, &counts).is_none());
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(counts.snapshot(), (22, 1));
    }

    #[test]
    fn legacy_short_remainder_flushes_and_errors() {
        let data = frame_bytes(2, 7, 42, 43);
        let partial = data[..20].to_vec();
        let mut chan = ScriptedChannel::new([partial.clone()]);
        let mut sink = MemorySink::new();
        let counts = Counts::new();
        let mut assembler = LegacyAssembler::new(FAST, POLL);

        let err = drain(&mut assembler, &mut chan, &mut sink, &counts);
        assert!(matches!(
            err,
            Some(ProtocolError::FrameLength {
                expected: 24,
                got: 18
            })
        ));
        // Partial bytes flushed for forensics.
        assert_eq!(sink.bytes, partial);
        assert!(sink.frames.is_empty());
    }

    #[test]
    fn sync_reassembles_delimited_frames() {
        let f1 = frame_bytes(1, 1, 10, 11);
        let f2 = frame_bytes(2, 2, 12, 13);
        let mut stream = vec![SYNC_BYTE];
        stream.extend_from_slice(&f1);
        stream.push(SYNC_BYTE);
        stream.extend_from_slice(&f2);

        let mut chan = ScriptedChannel::new([stream.clone()]);
        let mut sink = MemorySink::new();
        let counts = Counts::new();
        let mut assembler = SyncAssembler::default();

        assert!(drain(&mut assembler, &mut chan, &mut sink, &counts).is_none());
        assert_eq!(sink.frames.len(), 2);
        assert_eq!(sink.bytes, stream);
        assert_eq!(counts.snapshot(), (stream.len() as u64, 2));
    }

    #[test]
    fn sync_resynchronizes_on_bad_byte() {
        let frame = frame_bytes(0, 5, 1, 2);
        let mut stream = vec![0x55, 0xaa, SYNC_BYTE];
        stream.extend_from_slice(&frame);

        let mut chan = ScriptedChannel::new([stream]);
        let mut sink = MemorySink::new();
        let counts = Counts::new();
        let mut assembler = SyncAssembler::default();

        assert!(drain(&mut assembler, &mut chan, &mut sink, &counts).is_none());
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.frames[0].frame_id, 5);
        // Noise bytes are counted but never reach the sink.
        assert_eq!(counts.snapshot(), (2 + 1 + frame.len() as u64, 1));
        assert_eq!(sink.bytes[0], SYNC_BYTE);
    }

    #[test]
    fn sync_waits_for_full_payload_availability() {
        let frame = frame_bytes(2, 9, 3, 4);
        let mut chan = ScriptedChannel::new([
            vec![SYNC_BYTE],
            frame[..2].to_vec(),
            // Remainder split across rounds: the machine must idle, not
            // read a partial payload.
            frame[2..10].to_vec(),
            frame[2..].to_vec(),
        ]);
        let mut sink = MemorySink::new();
        let counts = Counts::new();
        let mut assembler = SyncAssembler::default();

        // Pump through sync + count.
        let c = counts.counters();
        assert_eq!(assembler.pump(&mut chan, &mut sink, &c).unwrap(), Pump::Progress);
        assert_eq!(assembler.pump(&mut chan, &mut sink, &c).unwrap(), Pump::Progress);
        // Only 8 of the 24 remainder bytes are available: idle.
        assert_eq!(assembler.pump(&mut chan, &mut sink, &c).unwrap(), Pump::Idle);
    }

    #[test]
    fn memory_sink_records_both_views() {
        let mut sink = MemorySink::new();
        sink.raw(&[1, 2, 3]).unwrap();
        let frame = Frame::from_bytes(&frame_bytes(0, 1, 2, 3)).unwrap();
        sink.frame(&frame).unwrap();
        assert_eq!(sink.bytes, vec![1, 2, 3]);
        assert_eq!(sink.frames.len(), 1);
    }

    #[test]
    fn file_sink_writes_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.dat");
        {
            let mut sink = FileSink::create(&path).unwrap();
            sink.raw(&[0xde, 0xad]).unwrap();
            sink.flush().unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xde, 0xad]);
    }
}
