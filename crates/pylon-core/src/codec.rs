//! Wire framing for [`Message`].
//!
//! Every message travels as one length-prefixed frame:
//!
//! ```text
//! [u32 BE: len][body of len bytes]
//!
//! body = [u8 flags][u16 BE: id len][id][u16 BE: type len][type][payload...]
//! ```
//!
//! Bit 0 of `flags` marks a response. All other bits must be zero.

use crate::message::Message;
use crate::{Result, RpcError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const FLAG_RESPONSE: u8 = 0b0000_0001;

/// Serialize a message into a frame body.
pub fn encode_message(message: &Message) -> Result<Bytes> {
    let id = message.request_id.as_bytes();
    let kind = message.kind.as_bytes();
    let (id_len, kind_len) = header_lengths(message)?;

    let mut body = BytesMut::with_capacity(5 + id.len() + kind.len() + message.payload.len());
    body.put_u8(if message.is_response { FLAG_RESPONSE } else { 0 });
    body.put_u16(id_len);
    body.put_slice(id);
    body.put_u16(kind_len);
    body.put_slice(kind);
    body.put_slice(&message.payload);
    Ok(body.freeze())
}

/// Size of the frame body [`encode_message`] would produce.
///
/// Fails like [`encode_message`] when a header field does not fit its
/// length prefix.
pub fn body_len(message: &Message) -> Result<usize> {
    header_lengths(message)?;
    Ok(5 + message.request_id.len() + message.kind.len() + message.payload.len())
}

fn header_lengths(message: &Message) -> Result<(u16, u16)> {
    let id_len = u16::try_from(message.request_id.len()).map_err(|_| {
        RpcError::protocol(format!("request id too long: {} bytes", message.request_id.len()))
    })?;
    let kind_len = u16::try_from(message.kind.len()).map_err(|_| {
        RpcError::protocol(format!("message type too long: {} bytes", message.kind.len()))
    })?;
    Ok((id_len, kind_len))
}

/// Parse a frame body back into a message.
pub fn decode_message(mut body: Bytes) -> Result<Message> {
    if body.remaining() < 1 {
        return Err(RpcError::protocol("empty frame"));
    }
    let flags = body.get_u8();
    if flags & !FLAG_RESPONSE != 0 {
        return Err(RpcError::protocol(format!("unknown frame flags {:#04x}", flags)));
    }

    let request_id = take_str(&mut body, "request id")?;
    let kind = take_str(&mut body, "message type")?;

    Ok(Message {
        request_id,
        kind,
        payload: body,
        is_response: flags & FLAG_RESPONSE != 0,
    })
}

fn take_str(body: &mut Bytes, field: &str) -> Result<String> {
    if body.remaining() < 2 {
        return Err(RpcError::protocol(format!("truncated {} length", field)));
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return Err(RpcError::protocol(format!("truncated {}", field)));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| RpcError::protocol(format!("invalid UTF-8 in {}", field)))
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_frame_size {
        return Err(RpcError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len, max_frame_size
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Bytes::from(payload)))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| RpcError::protocol(format!("frame of {} bytes is too large", body.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode the next message.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Message>> {
    match read_frame(reader, max_frame_size).await? {
        Some(body) => decode_message(body).map(Some),
        None => Ok(None),
    }
}

/// Encode and write a message.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    let body = encode_message(message)?;
    write_frame(writer, &body).await
}
