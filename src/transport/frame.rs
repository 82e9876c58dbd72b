use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{MethodId, RpcIn, RpcOut};
use crate::error::TransportError;

pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Request {
        seq: u64,
        method: MethodId,
        input: RpcIn,
    },

    Reply {
        seq: u64,
        output: RpcOut,
    },

    Fault {
        seq: u64,
        reason: String,
    },
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        let frame = bincode::deserialize(bytes)?;
        Ok(frame)
    }

    pub fn seq(&self) -> u64 {
        match self {
            Frame::Request { seq, .. } | Frame::Reply { seq, .. } | Frame::Fault { seq, .. } => *seq,
        }
    }

    /// Length-prefixed wire form.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let body = self.to_bytes()?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::from_bytes(&body).map(Some)
}
