// Length-prefixed message framing over QUIC streams, with a payload cap.
use anyhow::{Context, Result, anyhow};
use broker_wire::{Frame, FrameHeader, Message};
use bytes::{Bytes, BytesMut};
use quinn::{ReadExactError, RecvStream, SendStream};

/// Reads one message; `Ok(None)` when the peer finished the stream between frames.
pub async fn read_message(
    recv: &mut RecvStream,
    max_frame_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Option<Message>> {
    let Some(frame) = read_frame(recv, max_frame_bytes, scratch).await? else {
        return Ok(None);
    };
    Message::decode(frame).map(Some).context("decode message")
}

pub async fn write_message(
    send: &mut SendStream,
    message: &Message,
    max_frame_bytes: usize,
) -> Result<()> {
    let frame = message.encode().context("encode message")?;
    if frame.payload.len() > max_frame_bytes {
        return Err(anyhow!(
            "message of {} bytes exceeds max_frame_bytes {max_frame_bytes}",
            frame.payload.len()
        ));
    }
    write_frame(send, &frame).await
}

async fn read_frame(
    recv: &mut RecvStream,
    max_payload_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Option<Frame>> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(ReadExactError::FinishedEarly(read)) => {
            return Err(anyhow!("stream finished inside a frame header after {read} bytes"));
        }
        Err(ReadExactError::ReadError(err)) => return Err(err.into()),
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))
        .context("decode frame header")?;
    let length = usize::try_from(header.length).context("frame length")?;
    if length > max_payload_bytes {
        return Err(anyhow!(
            "frame length {length} exceeds max_payload_bytes {max_payload_bytes}"
        ));
    }
    scratch.clear();
    scratch.resize(length, 0u8);
    recv.read_exact(&mut scratch[..])
        .await
        .context("read frame payload")?;
    Ok(Some(Frame {
        header,
        payload: scratch.split().freeze(),
    }))
}

async fn write_frame(send: &mut SendStream, frame: &Frame) -> Result<()> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    frame.header.encode_into(&mut header_bytes);
    send.write_all(&header_bytes)
        .await
        .context("write frame header")?;
    send.write_all(&frame.payload)
        .await
        .context("write frame payload")?;
    Ok(())
}
