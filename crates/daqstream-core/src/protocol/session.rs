//! Transport session
//!
//! Owns the byte-stream connection to one front-end, drives the
//! command/response exchange in both comms modes, and runs the streaming
//! batch receive loop.
//!
//! Exchanges are strictly ordered: a command is never written before the
//! previous response's terminal condition (ASCII terminator or expected
//! readback length) has been observed, because the wire carries no request
//! id. During a batch the receive loop runs on its own thread; the only
//! cross-thread interaction is through the atomic flags and counters in
//! [`BatchHandle`].

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::{Catalog, CommandSpec, ResponseCode};
use crate::layout::Value;

use super::batch::{assembler_for, BatchCounters, BatchMode, BatchSink, Pump};
use super::channel::{CommunicationChannel, TcpChannel};
use super::codec::{self, CommandResponse};
use super::error::ProtocolError;
use super::serial;
use super::{
    ASCII_TERMINATOR, AUTOBAUD_PRIME, DEFAULT_BAUD_RATE, DEFAULT_SETTLE_MS, DEFAULT_TIMEOUT_MS,
    READ_CHUNK,
};

// Commands the session treats specially, by catalog name.
const CMD_OK: &str = "ok";
const CMD_ASCIIMODE: &str = "asciimode";
const CMD_BINARYMODE: &str = "binarymode";
const CMD_BAUD: &str = "baud";
const CMD_VERBOSE: &str = "verbose";
const CMD_SEND_BATCH: &str = "send_batch";

/// Wire encoding currently in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommsMode {
    Ascii,
    Binary,
}

/// Session construction parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Line rate used once autobaud is turned off.
    pub baud_rate: u32,
    /// Comms mode the device is assumed to be in at connect time.
    pub mode: CommsMode,
    /// Prefix every command with the autobaud priming character.
    pub autobaud: bool,
    /// Device-side binary verbosity: diagnostic text precedes readbacks.
    pub verbose_binary: bool,
    /// Response / stream-idle timeout.
    pub timeout: Duration,
    /// Settle interval before verbose readbacks and stop-handshake drains.
    pub settle: Duration,
    /// Sleep between availability polls.
    pub poll_interval: Duration,
    /// Binary streaming strategy.
    pub batch_mode: BatchMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            mode: CommsMode::Ascii,
            autobaud: true,
            verbose_binary: false,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
            poll_interval: Duration::from_millis(2),
            batch_mode: BatchMode::default(),
        }
    }
}

/// How a batch receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Terminator seen or stream went idle after a successful start ack.
    Completed,
    /// Stop was requested; the device-side handshake was performed.
    Stopped,
    /// Abort was requested; no handshake, the device may still be mid-stream.
    Aborted,
    /// A frame's declared length never arrived; partial data was flushed.
    Truncated,
}

/// Result of one batch receive.
#[derive(Debug, Clone, Copy)]
pub struct BatchSummary {
    pub outcome: BatchOutcome,
    pub bytes: u64,
    pub frames: u64,
}

/// Cloneable control/observation handle shared with the foreground thread.
///
/// Both request flags are sticky and idempotent: the receive loop acts on
/// each at most once per batch.
#[derive(Clone)]
pub struct BatchHandle {
    stop: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    bytes: Arc<AtomicU64>,
    frames: Arc<AtomicU64>,
}

impl BatchHandle {
    /// Ask the receive loop to stop gracefully (device handshake, then exit).
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Ask the receive loop to exit immediately, skipping the handshake.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_batch_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bytes received since the current batch started.
    pub fn bytes_received(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Frames reassembled since the current batch started.
    pub fn frames_received(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

/// Rolling 3-byte window for ASCII terminator detection; chunking of the
/// incoming stream cannot affect the match.
#[derive(Default)]
struct TailWindow([u8; 3]);

impl TailWindow {
    fn push(&mut self, byte: u8) {
        self.0.rotate_left(1);
        self.0[2] = byte;
    }

    fn extend(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }

    fn terminated(&self) -> bool {
        self.0 == ASCII_TERMINATOR
    }
}

/// A live connection to one front-end.
pub struct Session {
    chan: Box<dyn CommunicationChannel>,
    catalog: Catalog,
    config: SessionConfig,
    mode: CommsMode,
    autobaud: bool,
    baud: u32,
    verbose: bool,
    stop: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    bytes: Arc<AtomicU64>,
    frames: Arc<AtomicU64>,
    stop_acted: bool,
    abort_acted: bool,
}

impl Session {
    /// Open a serial port and bind a session to it.
    pub fn open(
        port_name: &str,
        catalog: Catalog,
        config: SessionConfig,
    ) -> Result<Self, ProtocolError> {
        let chan = serial::open_port(port_name, config.baud_rate)?;
        tracing::info!(port = port_name, baud = config.baud_rate, "session opened");
        Ok(Self::from_channel(Box::new(chan), catalog, config))
    }

    /// Connect to a front-end behind a serial-to-TCP bridge.
    pub fn connect_tcp(
        addr: &str,
        catalog: Catalog,
        config: SessionConfig,
    ) -> Result<Self, ProtocolError> {
        let stream = std::net::TcpStream::connect(addr)?;
        let mut chan = TcpChannel::new(stream);
        chan.set_timeout(Duration::from_millis(100))?;
        tracing::info!(addr, "session connected over TCP");
        Ok(Self::from_channel(Box::new(chan), catalog, config))
    }

    /// Bind a session to an already-open channel.
    pub fn from_channel(
        chan: Box<dyn CommunicationChannel>,
        catalog: Catalog,
        config: SessionConfig,
    ) -> Self {
        Self {
            mode: config.mode,
            autobaud: config.autobaud,
            baud: config.baud_rate,
            verbose: config.verbose_binary,
            chan,
            catalog,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            abort: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            bytes: Arc::new(AtomicU64::new(0)),
            frames: Arc::new(AtomicU64::new(0)),
            stop_acted: false,
            abort_acted: false,
        }
    }

    /// The command catalog this session was built with.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Current comms mode.
    pub fn mode(&self) -> CommsMode {
        self.mode
    }

    pub fn is_ascii(&self) -> bool {
        self.mode == CommsMode::Ascii
    }

    pub fn autobaud(&self) -> bool {
        self.autobaud
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud
    }

    pub fn is_batch_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Control/observation handle for the foreground thread.
    pub fn handle(&self) -> BatchHandle {
        BatchHandle {
            stop: Arc::clone(&self.stop),
            abort: Arc::clone(&self.abort),
            running: Arc::clone(&self.running),
            bytes: Arc::clone(&self.bytes),
            frames: Arc::clone(&self.frames),
        }
    }

    /// Look a command up by name and execute one exchange.
    pub fn send_recv_named(
        &mut self,
        name: &str,
        args: &[Value],
    ) -> Result<CommandResponse, ProtocolError> {
        let spec = self.catalog.by_name(name)?.clone();
        self.send_recv(&spec, args)
    }

    /// Execute one command/response exchange in the current comms mode.
    pub fn send_recv(
        &mut self,
        spec: &CommandSpec,
        args: &[Value],
    ) -> Result<CommandResponse, ProtocolError> {
        if spec.name.eq_ignore_ascii_case(CMD_SEND_BATCH) {
            self.running.store(true, Ordering::SeqCst);
        }

        let response = match self.mode {
            CommsMode::Ascii => self.send_recv_ascii(spec, args)?,
            CommsMode::Binary => self.send_recv_binary(spec, args)?,
        };

        self.apply_side_effects(spec, args)?;
        Ok(response)
    }

    /// Write a fully encoded command, priming autobaud first if enabled.
    fn write_command(&mut self, wire: &[u8]) -> Result<(), ProtocolError> {
        if self.autobaud {
            self.chan.write_all(&[AUTOBAUD_PRIME])?;
        }
        self.chan.write_all(wire)?;
        self.chan.flush()?;
        Ok(())
    }

    /// Mode, verbosity and baud changes take effect only after the exchange
    /// that requested them succeeded.
    fn apply_side_effects(
        &mut self,
        spec: &CommandSpec,
        args: &[Value],
    ) -> Result<(), ProtocolError> {
        let name = &spec.name;
        if name.eq_ignore_ascii_case(CMD_ASCIIMODE) {
            tracing::debug!("comms mode -> ASCII");
            self.mode = CommsMode::Ascii;
        } else if name.eq_ignore_ascii_case(CMD_BINARYMODE) {
            tracing::debug!("comms mode -> BINARY");
            self.mode = CommsMode::Binary;
        } else if name.eq_ignore_ascii_case(CMD_VERBOSE) {
            self.verbose = args.first().and_then(Value::as_int).unwrap_or(0) != 0;
            tracing::debug!(verbose = self.verbose, "binary verbosity changed");
        } else if name.eq_ignore_ascii_case(CMD_BAUD) {
            match args.first().and_then(Value::as_int) {
                Some(b) if b < 0 => {
                    self.autobaud = true;
                    self.baud = self.config.baud_rate;
                    self.chan.set_baud_rate(self.baud)?;
                    tracing::info!(baud = self.baud, "autobaud re-enabled");
                }
                Some(b) => {
                    self.autobaud = false;
                    self.baud = b as u32;
                    self.chan.set_baud_rate(self.baud)?;
                    tracing::info!(baud = self.baud, "fixed baud rate set");
                }
                None => {}
            }
        }
        Ok(())
    }

    fn send_recv_ascii(
        &mut self,
        spec: &CommandSpec,
        args: &[Value],
    ) -> Result<CommandResponse, ProtocolError> {
        let line = codec::encode_ascii(spec, args);
        tracing::debug!(command = %spec.name, "ascii exchange");
        self.write_command(&line)?;

        let mut acc: Vec<u8> = Vec::new();
        let mut tail = TailWindow::default();
        let mut buf = [0u8; READ_CHUNK];
        let mut device_error = false;
        let mut terminated = false;
        let start = Instant::now();

        loop {
            let avail = self.chan.bytes_to_read()? as usize;
            if avail > 0 {
                let n = self.chan.read(&mut buf[..avail.min(READ_CHUNK)])?;
                if acc.is_empty() && n > 0 && buf[0] == b'?' {
                    // Device flagged the command invalid; keep draining so
                    // the error text is complete.
                    device_error = true;
                }
                acc.extend_from_slice(&buf[..n]);
                tail.extend(&buf[..n]);
                if tail.terminated() {
                    terminated = true;
                    break;
                }
            } else {
                if start.elapsed() > self.config.timeout {
                    break;
                }
                std::thread::sleep(self.config.poll_interval);
            }
        }

        if device_error {
            return Err(ProtocolError::InvalidCommand {
                raw: String::from_utf8_lossy(&acc).into_owned(),
            });
        }
        if !terminated {
            tracing::debug!(
                command = %spec.name,
                received = acc.len(),
                "no terminator before timeout"
            );
            return Err(ProtocolError::Timeout);
        }

        Ok(CommandResponse::Ascii {
            text: strip_terminator(&acc),
        })
    }

    fn send_recv_binary(
        &mut self,
        spec: &CommandSpec,
        args: &[Value],
    ) -> Result<CommandResponse, ProtocolError> {
        let wire = codec::encode_binary(spec, args)?;
        tracing::debug!(command = %spec.name, len = wire.len(), "binary exchange");
        self.write_command(&wire)?;

        let expected = spec.ret.packed_size() + 1;
        let readback = if self.verbose {
            // Verbose mode interleaves free-form diagnostics before the
            // readback; wait for everything, then split off the tail.
            std::thread::sleep(self.config.settle);
            let drained = self.read_all_available()?;
            if drained.len() < expected {
                return Err(ProtocolError::ShortReadback {
                    expected,
                    got: drained.len(),
                });
            }
            let preamble = &drained[..drained.len() - expected];
            if preamble.is_empty() {
                tracing::debug!(command = %spec.name, "no verbose preamble");
            } else {
                tracing::debug!(
                    command = %spec.name,
                    "verbose preamble: {}",
                    String::from_utf8_lossy(preamble).trim_end()
                );
            }
            drained[drained.len() - expected..].to_vec()
        } else {
            self.read_exact_single_retry(expected)?
        };

        codec::decode_readback(spec, &readback)
    }

    /// Read every byte currently waiting, in one pass.
    fn read_all_available(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let avail = self.chan.bytes_to_read()? as usize;
        let mut buf = vec![0u8; avail];
        let mut got = 0;
        while got < avail {
            let n = self.chan.read(&mut buf[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        buf.truncate(got);
        Ok(buf)
    }

    /// Fill `buf[off..]`, polling availability until full or timed out.
    fn read_into_within(&mut self, buf: &mut [u8], mut off: usize) -> Result<usize, ProtocolError> {
        let start = Instant::now();
        while off < buf.len() {
            let avail = self.chan.bytes_to_read()? as usize;
            if avail > 0 {
                let take = avail.min(buf.len() - off);
                let n = self.chan.read(&mut buf[off..off + take])?;
                off += n;
            } else if start.elapsed() > self.config.timeout {
                break;
            } else {
                std::thread::sleep(self.config.poll_interval);
            }
        }
        Ok(off)
    }

    /// Read exactly `want` bytes, with one bounded residual retry if the
    /// first read came up short.
    fn read_exact_single_retry(&mut self, want: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0u8; want];
        let got = self.read_into_within(&mut buf, 0)?;
        if got == want {
            return Ok(buf);
        }

        tracing::debug!(want, got, "short readback, retrying residual once");
        let got = self.read_into_within(&mut buf, got)?;
        if got < want {
            return Err(ProtocolError::ShortReadback {
                expected: want,
                got,
            });
        }
        Ok(buf)
    }

    /// Run one streaming batch to completion on the calling thread.
    ///
    /// Issues the batch-start command (`count < 0` requests all buffered
    /// hits; `no_stop` keeps the device waiting for future hits), then
    /// receives until an end condition: terminator/idle (ASCII), idle after
    /// a successful start ack (binary), frame truncation, or an external
    /// stop/abort via [`BatchHandle`].
    pub fn batch_recv(
        &mut self,
        count: i32,
        no_stop: bool,
        sink: &mut dyn BatchSink,
    ) -> Result<BatchSummary, ProtocolError> {
        self.stop_acted = false;
        self.abort_acted = false;
        self.bytes.store(0, Ordering::SeqCst);
        self.frames.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let result = match self.mode {
            CommsMode::Ascii => self.ascii_batch_recv(count, no_stop, sink),
            CommsMode::Binary => self.binary_batch_recv(count, no_stop, sink),
        };

        self.running.store(false, Ordering::SeqCst);
        let outcome = result?;
        let summary = BatchSummary {
            outcome,
            bytes: self.bytes.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
        };
        tracing::info!(
            bytes = summary.bytes,
            frames = summary.frames,
            outcome = ?summary.outcome,
            "batch finished"
        );
        Ok(summary)
    }

    fn ascii_batch_recv(
        &mut self,
        count: i32,
        no_stop: bool,
        sink: &mut dyn BatchSink,
    ) -> Result<BatchOutcome, ProtocolError> {
        let spec = self.catalog.by_name(CMD_SEND_BATCH)?.clone();
        let line = codec::encode_ascii(
            &spec,
            &[Value::Int(count as i64), Value::Int(no_stop as i64)],
        );
        tracing::info!(count, no_stop, "ascii batch started");
        self.write_command(&line)?;

        let mut tail = TailWindow::default();
        let mut buf = [0u8; READ_CHUNK];
        let mut last_data = Instant::now();

        let outcome = loop {
            if self.abort.load(Ordering::SeqCst) && !self.abort_acted {
                self.abort_acted = true;
                tracing::warn!("abort requested");
                break BatchOutcome::Aborted;
            }
            if self.stop.load(Ordering::SeqCst) && !self.stop_acted {
                self.stop_acted = true;
                tracing::warn!("stop requested");
                match self.send_recv_named(CMD_OK, &[]) {
                    Ok(resp) => tail.extend(resp.text().as_bytes()),
                    Err(e) => tracing::warn!("stop exchange failed: {e}"),
                }
                break BatchOutcome::Stopped;
            }

            let avail = self.chan.bytes_to_read()? as usize;
            if avail > 0 {
                let n = self.chan.read(&mut buf[..avail.min(READ_CHUNK)])?;
                sink.raw(&buf[..n])?;
                self.bytes.fetch_add(n as u64, Ordering::Relaxed);
                tail.extend(&buf[..n]);
                last_data = Instant::now();
            } else if tail.terminated() {
                tracing::debug!("end marker detected");
                break BatchOutcome::Completed;
            } else if last_data.elapsed() > self.config.timeout {
                // Timeout here means "no new data", not total duration.
                tracing::debug!("stream idle past timeout");
                break BatchOutcome::Completed;
            } else {
                std::thread::sleep(self.config.poll_interval);
            }
        };

        Ok(outcome)
    }

    fn binary_batch_recv(
        &mut self,
        count: i32,
        no_stop: bool,
        sink: &mut dyn BatchSink,
    ) -> Result<BatchOutcome, ProtocolError> {
        let spec = self.catalog.by_name(CMD_SEND_BATCH)?.clone();
        tracing::info!(
            count,
            no_stop,
            mode = ?self.config.batch_mode,
            "binary batch started"
        );
        let ack = self.send_recv(
            &spec,
            &[Value::Int(count as i64), Value::Int(no_stop as i64)],
        )?;

        let terminal_ok = ack.code() == Some(ResponseCode::Ok);
        match ack.code() {
            Some(code) => tracing::info!(?code, "batch start ack"),
            None => tracing::warn!("batch start ack code unrecognized (verbosity?)"),
        }

        let mut assembler = assembler_for(
            self.config.batch_mode,
            self.config.timeout,
            self.config.poll_interval,
        );
        let mut last_progress = Instant::now();

        let outcome = loop {
            if self.abort.load(Ordering::SeqCst) && !self.abort_acted {
                // Give up without the handshake; the device may be left
                // mid-stream.
                self.abort_acted = true;
                tracing::warn!("abort requested, skipping stop handshake");
                break BatchOutcome::Aborted;
            }
            if self.stop.load(Ordering::SeqCst) && !self.stop_acted {
                self.stop_acted = true;
                tracing::warn!("stop requested");
                self.binary_stop_batch();
                break BatchOutcome::Stopped;
            }

            let step = {
                let counters = BatchCounters {
                    bytes: self.bytes.as_ref(),
                    frames: self.frames.as_ref(),
                };
                assembler.pump(self.chan.as_mut(), sink, &counters)
            };

            match step {
                Ok(Pump::Progress) => last_progress = Instant::now(),
                Ok(Pump::Idle) => {
                    if last_progress.elapsed() > self.config.timeout {
                        if terminal_ok {
                            tracing::debug!("stream idle after successful start ack");
                            break BatchOutcome::Completed;
                        }
                        // The protocol cannot tell "paused" from "finished"
                        // by elapsed time alone; keep waiting.
                        tracing::debug!("stream idle, no terminal response observed");
                        last_progress = Instant::now();
                    }
                    std::thread::sleep(self.config.poll_interval);
                }
                Err(ProtocolError::FrameLength { expected, got }) => {
                    tracing::warn!(expected, got, "frame truncated, stopping batch");
                    self.binary_stop_batch();
                    break BatchOutcome::Truncated;
                }
                Err(e) => return Err(e),
            }
        };

        // Absorb anything still in flight before the next exchange.
        let _ = self.chan.clear_input_buffer();
        Ok(outcome)
    }

    /// Device-side stop handshake: send the idle command in binary, then
    /// drain twice with a settle in between to absorb a frame already in
    /// flight. The last drained byte is logged as a response code but never
    /// drives control flow.
    fn binary_stop_batch(&mut self) {
        let spec = match self.catalog.by_name(CMD_OK) {
            Ok(spec) => spec.clone(),
            Err(e) => {
                tracing::warn!("stop handshake unavailable: {e}");
                return;
            }
        };
        let wire = match codec::encode_binary(&spec, &[]) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::warn!("stop handshake encode failed: {e}");
                return;
            }
        };
        if let Err(e) = self.write_command(&wire) {
            tracing::warn!("stop handshake write failed: {e}");
            return;
        }

        let mut last_byte = None;
        for round in 0..2 {
            std::thread::sleep(self.config.settle);
            match self.read_all_available() {
                Ok(drained) => {
                    tracing::debug!(round, drained = drained.len(), "stop flush");
                    if let Some(&b) = drained.last() {
                        last_byte = Some(b);
                    }
                }
                Err(e) => tracing::warn!("stop flush read failed: {e}"),
            }
        }

        match last_byte.map(ResponseCode::from_byte) {
            Some(Some(code)) => tracing::info!(?code, "stop handshake response"),
            Some(None) => tracing::debug!("stop handshake response unrecognized"),
            None => tracing::debug!("stop handshake produced no response"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Leave the device in its safe default state: ASCII mode, autobaud.
        if self.mode == CommsMode::Binary {
            tracing::info!("reverting device to ASCII mode");
            if let Err(e) = self.send_recv_named(CMD_ASCIIMODE, &[]) {
                tracing::warn!("failed to revert comms mode: {e}");
            }
        }
        if !self.autobaud {
            if let Err(e) = self.send_recv_named(CMD_BAUD, &[Value::Int(-1)]) {
                tracing::warn!("failed to re-enable autobaud: {e}");
            }
        }
    }
}

/// Strip the trailing `OK\n` terminator and at most one trailing newline.
fn strip_terminator(acc: &[u8]) -> String {
    let mut text = acc;
    if text.ends_with(&ASCII_TERMINATOR) {
        text = &text[..text.len() - ASCII_TERMINATOR.len()];
    }
    if text.ends_with(b"\n") {
        text = &text[..text.len() - 1];
    }
    if text.ends_with(b"\r") {
        text = &text[..text.len() - 1];
    }
    String::from_utf8_lossy(text).into_owned()
}
