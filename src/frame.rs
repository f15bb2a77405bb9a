/*!
Frame codec

Wire format shared by the control channel and the device handoff:

```text
+----------------------+----------------------+
| length (u16, BE)     | payload (length B)   |
+----------------------+----------------------+
```

Decoding works on an accumulating buffer. A short buffer is never an error:
nothing is consumed and the caller retries once more bytes have arrived.
*/

use thiserror::Error;

/// Size of the length prefix
pub const HEADER_SIZE: usize = 2;

/// Largest payload the length prefix can describe
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too large ({size} bytes, max {max})")]
    TooLarge { size: usize, max: usize },
}

/// One relayed unit of payload, as read from the device or a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
}

impl Frame {
    pub fn new(data: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        let data = data.into();
        if data.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Bytes this frame occupies on a stream transport
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }
}

/// Append the wire representation of `frame` to `dst`.
pub fn encode(frame: &Frame, dst: &mut Vec<u8>) {
    dst.reserve(frame.wire_size());
    // Frame::new guarantees the length fits.
    dst.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    dst.extend_from_slice(frame.as_bytes());
}

pub fn encode_to_vec(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.wire_size());
    encode(frame, &mut out);
    out
}

/// Read the big-endian length prefix at the start of `src`.
pub fn peek_length(src: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_SIZE] = src.get(..HEADER_SIZE)?.try_into().ok()?;
    Some(u16::from_be_bytes(header) as usize)
}

/// Decode one frame from the start of `src`.
///
/// Returns `Ok(None)` while the header or the payload is incomplete. On
/// success returns the frame together with the number of bytes it occupied
/// (`HEADER_SIZE + len`), which the caller must drop from its buffer.
pub fn decode(src: &[u8], max: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    let Some(length) = peek_length(src) else {
        return Ok(None);
    };
    let max = max.min(MAX_FRAME_SIZE);
    if length > max {
        return Err(FrameError::TooLarge { size: length, max });
    }

    let total = HEADER_SIZE + length;
    let Some(payload) = src.get(HEADER_SIZE..total) else {
        return Ok(None);
    };
    Ok(Some((Frame { data: payload.to_vec() }, total)))
}

/// Accumulates bytes from a stream and hands out complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max: usize,
}

impl FrameBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max: max.min(MAX_FRAME_SIZE),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet returned as part of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode(&self.buf, self.max)? {
            Some((frame, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: &[u8]) -> Frame {
        Frame::new(data.to_vec()).unwrap()
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let bytes = encode_to_vec(&frame(&[0xAA; 300]));
        assert_eq!(&bytes[..2], &[0x01, 0x2C]);
        assert_eq!(bytes.len(), 302);
    }

    #[test]
    fn decode_returns_frame_and_consumed_bytes() {
        let original = frame(b"hello mesh");
        let bytes = encode_to_vec(&original);

        let (decoded, consumed) = decode(&bytes, MAX_FRAME_SIZE).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert_eq!(consumed, 2 + original.len());
    }

    #[test]
    fn trickled_input_yields_exactly_one_frame_at_the_end() {
        let original = frame(&(0..=255u8).collect::<Vec<_>>());
        let bytes = encode_to_vec(&original);
        let mut buffer = FrameBuffer::new(MAX_FRAME_SIZE);

        for (i, byte) in bytes.iter().enumerate() {
            buffer.extend(std::slice::from_ref(byte));
            let next = buffer.next_frame().unwrap();
            if i + 1 < bytes.len() {
                assert!(next.is_none(), "spurious frame after {} bytes", i + 1);
                assert_eq!(buffer.buffered(), i + 1);
            } else {
                assert_eq!(next, Some(original.clone()));
            }
        }
        assert_eq!(buffer.buffered(), 0);
    }

    #[test]
    fn incomplete_payload_consumes_nothing() {
        let bytes = encode_to_vec(&frame(b"abcdef"));
        assert_eq!(decode(&bytes[..1], MAX_FRAME_SIZE).unwrap(), None);
        assert_eq!(decode(&bytes[..5], MAX_FRAME_SIZE).unwrap(), None);
    }

    #[test]
    fn zero_length_frame_is_immediately_available() {
        let (decoded, consumed) = decode(&[0x00, 0x00, 0x42], MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert!(decoded.is_empty());
        assert_eq!(consumed, 2);
    }

    #[test]
    fn declared_length_above_bound_is_rejected() {
        let result = decode(&[0x05, 0xDD], 1500);
        assert_eq!(
            result,
            Err(FrameError::TooLarge {
                size: 1501,
                max: 1500
            })
        );
    }

    #[test]
    fn oversized_payload_cannot_become_a_frame() {
        assert!(Frame::new(vec![0u8; MAX_FRAME_SIZE + 1]).is_err());
        assert!(Frame::new(vec![0u8; MAX_FRAME_SIZE]).is_ok());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buffer = FrameBuffer::new(MAX_FRAME_SIZE);
        let mut bytes = encode_to_vec(&frame(b"first"));
        encode(&frame(b""), &mut bytes);
        encode(&frame(b"third"), &mut bytes);
        buffer.extend(&bytes);

        assert_eq!(buffer.next_frame().unwrap(), Some(frame(b"first")));
        assert_eq!(buffer.next_frame().unwrap(), Some(frame(b"")));
        assert_eq!(buffer.next_frame().unwrap(), Some(frame(b"third")));
        assert_eq!(buffer.next_frame().unwrap(), None);
    }
}
