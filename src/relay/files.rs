/// File relay — counted payload intake and recipient offers.
///
/// A transfer never touches disk: the payload is read into memory once and
/// fanned out to recipients as ref-counted [`Bytes`], living only for the
/// duration of the relay.
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use super::codec::{CodecError, Frame, RelayCodec};

/// Target of a file transfer: a named group or a single user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Group,
    Private,
}

impl TargetKind {
    pub fn parse(s: &str) -> Option<TargetKind> {
        match s {
            "group" => Some(TargetKind::Group),
            "private" => Some(TargetKind::Private),
            _ => None,
        }
    }
}

/// A relayed payload parked on a recipient's handle until that client
/// acknowledges the `FILE:` header with `READY_TO_RECEIVE`.
#[derive(Debug, Clone)]
pub struct FileOffer {
    pub filename: String,
    pub data: Bytes,
}

/// Header line announcing an incoming file to a recipient.
pub fn offer_header(filename: &str, size: usize) -> String {
    format!("FILE:{filename}:{size}")
}

/// Cap on the up-front buffer reservation; the declared size is
/// client-controlled.
const MAX_PREALLOC: u64 = 64 * 1024;

/// Read exactly `size` payload bytes from the sender's stream, however many
/// chunks the transport splits them into. Returns `None` if the connection
/// closes before the payload completes.
pub async fn read_payload<T>(
    framed: &mut Framed<T, RelayCodec>,
    size: u64,
) -> Result<Option<Bytes>, CodecError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed.codec_mut().start_payload(size);
    let mut buf = BytesMut::with_capacity(size.min(MAX_PREALLOC) as usize);
    while (buf.len() as u64) < size {
        match framed.next().await {
            Some(Ok(Frame::Chunk(chunk))) => buf.extend_from_slice(&chunk),
            // The codec only yields chunks while a payload is outstanding.
            Some(Ok(Frame::Line(_))) => continue,
            Some(Err(e)) => return Err(e),
            None => return Ok(None),
        }
    }
    Ok(Some(buf.freeze()))
}
