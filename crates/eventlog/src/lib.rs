//! Framed append-only event traces.
//!
//! A trace is a sequence of [`RecordedEvent`] frames, each a little-endian
//! `u32` length prefix followed by an SBOR-encoded payload:
//!
//! ```text
//! [len: u32-le][payload: SBOR(RecordedEvent)] [len][payload] ...
//! ```
//!
//! Recording every event a node applies, in order, is enough to reproduce
//! its behavior exactly: the state machine is a pure function of its event
//! trace. The reader tolerates a file truncated at a frame boundary (a
//! crash between frames) and reports truncation inside a frame as an error.

use conclave_core::Event;
use conclave_types::NodeId;
use sbor::prelude::*;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Errors from reading or writing a trace.
#[derive(Debug, Error)]
pub enum EventlogError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("trace truncated inside a frame")]
    Truncated,

    #[error("frame encode error: {0}")]
    Encode(String),

    #[error("frame decode error: {0}")]
    Decode(String),
}

/// Upper bound on a frame payload. A length prefix beyond this is corrupt
/// input, not a record worth allocating for.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// One recorded event, tagged with the node that applied it.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct RecordedEvent {
    pub node_id: NodeId,
    pub event: Event,
}

/// Writes framed records to an output stream.
pub struct Recorder<W: Write> {
    out: W,
}

impl<W: Write> Recorder<W> {
    /// Wrap an output stream.
    pub fn new(out: W) -> Self {
        Recorder { out }
    }

    /// Append one record.
    pub fn write(&mut self, record: &RecordedEvent) -> Result<(), EventlogError> {
        let payload =
            sbor::basic_encode(record).map_err(|e| EventlogError::Encode(format!("{:?}", e)))?;
        self.out.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.out.write_all(&payload)?;
        Ok(())
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<(), EventlogError> {
        self.out.flush()?;
        Ok(())
    }

    /// Unwrap the output stream.
    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Reads framed records from an input stream.
pub struct Reader<R: Read> {
    input: R,
}

impl<R: Read> Reader<R> {
    /// Wrap an input stream.
    pub fn new(input: R) -> Self {
        Reader { input }
    }

    /// Read the next record. `Ok(None)` only at a clean frame boundary;
    /// end-of-file inside a frame is [`EventlogError::Truncated`].
    pub fn next_record(&mut self) -> Result<Option<RecordedEvent>, EventlogError> {
        let mut len_buf = [0u8; 4];
        match read_full(&mut self.input, &mut len_buf)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Partial => return Err(EventlogError::Truncated),
            ReadOutcome::Full => {}
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(EventlogError::Decode(format!(
                "frame length {} exceeds the {} byte limit",
                len, MAX_FRAME_LEN
            )));
        }
        let mut payload = vec![0u8; len as usize];
        match read_full(&mut self.input, &mut payload)? {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Partial => return Err(EventlogError::Truncated),
        }
        let record = sbor::basic_decode(&payload)
            .map_err(|e| EventlogError::Decode(format!("{:?}", e)))?;
        Ok(Some(record))
    }
}

/// An [`EventInterceptor`] that records a node's trace through a
/// [`Recorder`]. Plug into the processor to capture a replayable log.
pub struct InterceptingRecorder<W: Write + Send> {
    node_id: NodeId,
    recorder: Recorder<W>,
}

impl<W: Write + Send> InterceptingRecorder<W> {
    /// Record events applied by `node_id` into `out`.
    pub fn new(node_id: NodeId, out: W) -> Self {
        InterceptingRecorder {
            node_id,
            recorder: Recorder::new(out),
        }
    }
}

impl<W: Write + Send> conclave_core::EventInterceptor for InterceptingRecorder<W> {
    fn intercept(&mut self, event: &Event) -> io::Result<()> {
        let record = RecordedEvent {
            node_id: self.node_id,
            event: event.clone(),
        };
        self.recorder
            .write(&record)
            .and_then(|()| self.recorder.flush())
            .map_err(|e| match e {
                EventlogError::Io(io) => io,
                other => io::Error::other(other.to_string()),
            })
    }
}

enum ReadOutcome {
    Full,
    /// Nothing read at all.
    Eof,
    /// Some bytes read, then end-of-file.
    Partial,
}

fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Full)
}
