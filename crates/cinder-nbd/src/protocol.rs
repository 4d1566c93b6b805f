//! NBD transmission phase.
//!
//! Once the kernel has been handed its end of a socket it sends fixed-size
//! request headers (followed by a payload for writes) and expects replies
//! tagged with the request handle. Replies may be sent in any order.
//!
//! ```text
//! request: magic u32 | flags u16 | type u16 | handle u64 | offset u64 | length u32
//! reply:   magic u32 | error u32 | handle u64 [| data]
//! ```

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cinder_block::{Device, ReadonlyDevice};
use cinder_common::{CinderError, CinderResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// Magic number opening every request.
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
/// Magic number opening every simple reply.
pub const REPLY_MAGIC: u32 = 0x6744_6698;

/// Size of a request header.
pub const REQUEST_LEN: usize = 28;
/// Size of a reply header.
pub const REPLY_LEN: usize = 16;

/// Largest request payload accepted.
pub const MAX_REQUEST_LEN: u32 = 32 << 20;

const EIO: u32 = 5;
const EINVAL: u32 = 22;
const ENOTSUP: u32 = 95;

/// Transmission commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Read from the device.
    Read,
    /// Write to the device.
    Write,
    /// Close the connection.
    Disconnect,
    /// Persist completed writes.
    Flush,
    /// Discard a range.
    Trim,
    /// Anything else.
    Unknown(u16),
}

impl From<u16> for Command {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Read,
            1 => Self::Write,
            2 => Self::Disconnect,
            3 => Self::Flush,
            4 => Self::Trim,
            other => Self::Unknown(other),
        }
    }
}

/// A decoded request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Command flags.
    pub flags: u16,
    /// Command.
    pub command: Command,
    /// Opaque tag echoed in the reply.
    pub handle: u64,
    /// Byte offset.
    pub offset: u64,
    /// Byte length.
    pub length: u32,
}

impl Request {
    /// Decode a request header.
    ///
    /// # Errors
    ///
    /// Returns an error if the magic number is wrong.
    pub fn decode(header: &[u8; REQUEST_LEN]) -> CinderResult<Self> {
        let mut buf: &[u8] = &header[..];
        let magic = buf.get_u32();
        if magic != REQUEST_MAGIC {
            return Err(CinderError::Nbd {
                message: format!("bad request magic {magic:#010x}"),
            });
        }

        Ok(Self {
            flags: buf.get_u16(),
            command: Command::from(buf.get_u16()),
            handle: buf.get_u64(),
            offset: buf.get_u64(),
            length: buf.get_u32(),
        })
    }

    /// Encode a request header.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let command = match self.command {
            Command::Read => 0,
            Command::Write => 1,
            Command::Disconnect => 2,
            Command::Flush => 3,
            Command::Trim => 4,
            Command::Unknown(other) => other,
        };

        let mut buf = BytesMut::with_capacity(REQUEST_LEN);
        buf.put_u32(REQUEST_MAGIC);
        buf.put_u16(self.flags);
        buf.put_u16(command);
        buf.put_u64(self.handle);
        buf.put_u64(self.offset);
        buf.put_u32(self.length);
        buf.freeze()
    }
}

/// Encode a reply header followed by `data`.
#[must_use]
pub fn encode_reply(handle: u64, error: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(REPLY_LEN + data.len());
    buf.put_u32(REPLY_MAGIC);
    buf.put_u32(error);
    buf.put_u64(handle);
    buf.extend_from_slice(data);
    buf.freeze()
}

/// Serve requests from `stream` against `device` until the peer disconnects.
///
/// Requests are handled concurrently; replies are written as they complete.
///
/// # Errors
///
/// Returns an error if the stream fails or carries a malformed request.
pub async fn serve<S>(stream: S, device: Arc<dyn Device>) -> CinderResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));
    let mut inflight = JoinSet::new();

    let result = loop {
        let mut header = [0u8; REQUEST_LEN];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e.into()),
        }

        let request = match Request::decode(&header) {
            Ok(request) => request,
            Err(e) => break Err(e),
        };

        if request.length > MAX_REQUEST_LEN {
            break Err(CinderError::Nbd {
                message: format!("request length {} exceeds limit", request.length),
            });
        }

        let payload = if request.command == Command::Write {
            let mut payload = vec![0u8; request.length as usize];
            if let Err(e) = reader.read_exact(&mut payload).await {
                break Err(e.into());
            }
            Bytes::from(payload)
        } else {
            Bytes::new()
        };

        if request.command == Command::Disconnect {
            tracing::debug!("NBD peer requested disconnect");
            break Ok(());
        }

        let device = Arc::clone(&device);
        let writer = Arc::clone(&writer);
        inflight.spawn(async move {
            let reply = handle(&*device, request, payload).await;
            writer.lock().await.write_all(&reply).await
        });

        // Reap finished handlers so the set does not grow without bound.
        while let Some(done) = inflight.try_join_next() {
            if let Err(e) = flatten(done) {
                tracing::warn!(error = %e, "Failed to send NBD reply");
            }
        }
    };

    while let Some(done) = inflight.join_next().await {
        if let Err(e) = flatten(done) {
            tracing::warn!(error = %e, "Failed to send NBD reply");
        }
    }
    writer.lock().await.flush().await?;

    result
}

fn flatten(done: Result<std::io::Result<()>, tokio::task::JoinError>) -> CinderResult<()> {
    done.map_err(|e| CinderError::Internal {
        message: format!("request handler failed: {e}"),
    })?
    .map_err(CinderError::from)
}

async fn handle(device: &dyn Device, request: Request, payload: Bytes) -> Bytes {
    let offset = request.offset;
    let length = u64::from(request.length);

    let outcome = match request.command {
        Command::Read => device.read_at(offset, length).await,
        Command::Write => device.write_at(offset, payload).await.map(|()| Bytes::new()),
        Command::Flush => device.flush().await.map(|()| Bytes::new()),
        // Discards are advisory; the overlay keeps its blocks.
        Command::Trim => Ok(Bytes::new()),
        Command::Disconnect | Command::Unknown(_) => {
            return encode_reply(request.handle, ENOTSUP, &[]);
        }
    };

    match outcome {
        Ok(data) => encode_reply(request.handle, 0, &data),
        Err(e) => {
            tracing::warn!(
                command = ?request.command,
                offset,
                length,
                error = %e,
                "NBD request failed"
            );
            let errno = match e {
                CinderError::OutOfBounds { .. } => EINVAL,
                _ => EIO,
            };
            encode_reply(request.handle, errno, &[])
        }
    }
}
