/// Relay line codec — frames a TCP byte stream into protocol frames.
///
/// Commands and notices are newline-delimited UTF-8 lines. During a file
/// transfer the decoder is switched into counted-payload mode and yields the
/// next `n` bytes on the wire as raw chunks, however many reads they span,
/// before returning to line framing.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum command line length (excluding the terminator).
const MAX_LINE_LENGTH: usize = 8192;

/// Codec error: a framing failure or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error("command line is not valid UTF-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete command line, `\n` (and any `\r`) stripped.
    Line(String),
    /// A slice of a counted file payload.
    Chunk(Bytes),
}

/// One outbound frame: a notice line, or raw payload bytes.
#[derive(Debug, Clone)]
pub enum Outbound {
    Line(String),
    Raw(Bytes),
}

/// Codec over one client connection. `payload_remaining` is the number of
/// raw payload bytes still owed before line framing resumes.
#[derive(Debug, Default)]
pub struct RelayCodec {
    payload_remaining: u64,
}

impl RelayCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch into counted-payload mode: the next `len` bytes on the wire
    /// are raw file data, yielded as [`Frame::Chunk`]s.
    pub fn start_payload(&mut self, len: u64) {
        self.payload_remaining = len;
    }

    pub fn payload_remaining(&self) -> u64 {
        self.payload_remaining
    }
}

impl Decoder for RelayCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if self.payload_remaining > 0 {
            if src.is_empty() {
                return Ok(None);
            }
            let take = src.len().min(self.payload_remaining as usize);
            self.payload_remaining -= take as u64;
            return Ok(Some(Frame::Chunk(src.split_to(take).freeze())));
        }

        match src.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line_bytes = src.split_to(pos);
                src.advance(1); // skip \n
                let line = std::str::from_utf8(&line_bytes)
                    .map_err(|_| CodecError::InvalidUtf8)?
                    .trim_end_matches('\r')
                    .to_owned();
                Ok(Some(Frame::Line(line)))
            }
            None => {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Outbound> for RelayCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), CodecError> {
        match item {
            Outbound::Line(line) => {
                dst.reserve(line.len() + 1);
                dst.put_slice(line.as_bytes());
                dst.put_u8(b'\n');
            }
            Outbound::Raw(bytes) => {
                dst.reserve(bytes.len());
                dst.put_slice(&bytes);
            }
        }
        Ok(())
    }
}
