//! SLIP-style byte stuffing and the address-prefixed frame carried on top of it.
//!
//! Wire layout of one frame on a multiplexed (server-facing) connection:
//!
//! ```text
//! escape( u16be address | payload ) END
//! ```
//!
//! Address `0x0000` is the control channel (JSON-RPC), `0xFFFF` is never issued.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const TRANSPOSED_END: u8 = 0xDC;
pub const TRANSPOSED_ESC: u8 = 0xDD;

pub const CONTROL_ADDRESS: u16 = 0x0000;
pub const INVALID_ADDRESS: u16 = 0xFFFF;

/// Upper bound for one escaped frame while it is still being accumulated.
pub const MAX_FRAME_BYTES: usize = 4 << 20; // 4 MiB

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid escape sequence 0x{0:02x}")]
    InvalidEscape(u8),
    #[error("escape byte at end of frame")]
    DanglingEscape,
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("frame exceeds {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(address: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            address,
            payload: payload.into(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.address == CONTROL_ADDRESS
    }
}

/// Escapes `payload` and appends the terminating END byte.
pub fn serialize_data(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 16 + 1);
    for &b in payload {
        match b {
            END => {
                out.push(ESC);
                out.push(TRANSPOSED_END);
            }
            ESC => {
                out.push(ESC);
                out.push(TRANSPOSED_ESC);
            }
            other => out.push(other),
        }
    }
    out.push(END);
    out
}

/// Reverses [`serialize_data`].
///
/// END bytes seen before any payload byte are padding. The first END after
/// payload terminates the frame; anything after it is ignored.
pub fn deserialize_data(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(data.len());
    let mut escaped = false;
    for &b in data {
        if escaped {
            match b {
                TRANSPOSED_END => out.push(END),
                TRANSPOSED_ESC => out.push(ESC),
                other => return Err(FrameError::InvalidEscape(other)),
            }
            escaped = false;
            continue;
        }
        match b {
            END if out.is_empty() => continue,
            END => break,
            ESC => escaped = true,
            other => out.push(other),
        }
    }
    if escaped {
        return Err(FrameError::DanglingEscape);
    }
    Ok(out)
}

pub fn build_frame(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + frame.payload.len());
    out.put_u16(frame.address);
    out.extend_from_slice(&frame.payload);
    out
}

pub fn parse_frame(data: &[u8]) -> Result<Frame, FrameError> {
    if data.len() < 2 {
        return Err(FrameError::TooShort(data.len()));
    }
    let mut rd = data;
    let address = rd.get_u16();
    Ok(Frame {
        address,
        payload: Bytes::copy_from_slice(rd),
    })
}

/// Builds, escapes and terminates one frame, ready for the wire.
pub fn encode_frame(address: u16, payload: &[u8]) -> Bytes {
    let mut raw = Vec::with_capacity(2 + payload.len());
    raw.put_u16(address);
    raw.extend_from_slice(payload);
    Bytes::from(serialize_data(&raw))
}

/// Streaming decoder for one connection's inbound bytes.
///
/// Frame boundaries are independent of how the transport chunks the stream.
#[derive(Debug)]
pub struct SlipDecoder {
    pending: BytesMut,
    max_frame: usize,
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_BYTES)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            max_frame,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Number of raw bytes waiting for an END byte.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Returns the next complete frame, or `None` when more input is needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        loop {
            let Some(pos) = self.pending.iter().position(|&b| b == END) else {
                if self.pending.len() > self.max_frame {
                    let n = self.pending.len();
                    self.pending.clear();
                    return Some(Err(FrameError::TooLarge(n.min(self.max_frame))));
                }
                return None;
            };

            let raw = self.pending.split_to(pos + 1);
            let body = &raw[..pos];
            if body.is_empty() {
                continue;
            }
            if body.len() > self.max_frame {
                return Some(Err(FrameError::TooLarge(self.max_frame)));
            }
            return Some(deserialize_data(body).and_then(|data| parse_frame(&data)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_roundtrip_with_reserved_bytes() {
        let payloads: [&[u8]; 5] = [
            b"",
            b"hello",
            &[END],
            &[ESC, END, ESC, ESC, 0x00, END],
            &[TRANSPOSED_END, TRANSPOSED_ESC, ESC, TRANSPOSED_END],
        ];
        for p in payloads {
            let wire = serialize_data(p);
            assert_eq!(wire.last(), Some(&END));
            assert_eq!(
                wire[..wire.len() - 1].iter().filter(|&&b| b == END).count(),
                0,
                "END must never appear unescaped inside a frame"
            );
            assert_eq!(deserialize_data(&wire).unwrap(), p);
        }
    }

    #[test]
    fn escape_substitution_is_exact() {
        assert_eq!(serialize_data(&[0x01, END, ESC]), vec![0x01, ESC, TRANSPOSED_END, ESC, TRANSPOSED_ESC, END]);
    }

    #[test]
    fn invalid_escape_is_an_error_not_the_raw_tail() {
        let err = deserialize_data(&[0x41, ESC, 0x42, 0x43, END]).unwrap_err();
        assert_eq!(err, FrameError::InvalidEscape(0x42));

        let err = deserialize_data(&[0x41, ESC]).unwrap_err();
        assert_eq!(err, FrameError::DanglingEscape);
    }

    #[test]
    fn leading_end_bytes_are_padding() {
        assert_eq!(deserialize_data(&[END, END, 0x10, 0x20, END]).unwrap(), vec![0x10, 0x20]);
    }

    #[test]
    fn frame_structure_roundtrip() {
        let f = Frame::new(0x1234, Bytes::from_static(&[END, 1, 2, ESC]));
        let raw = build_frame(&f);
        assert_eq!(&raw[..2], &[0x12, 0x34]);
        assert_eq!(parse_frame(&raw).unwrap(), f);

        let empty = Frame::new(7, Bytes::new());
        assert_eq!(parse_frame(&build_frame(&empty)).unwrap(), empty);
    }

    #[test]
    fn parse_frame_rejects_short_input() {
        assert_eq!(parse_frame(&[0x01]).unwrap_err(), FrameError::TooShort(1));
    }

    #[test]
    fn decoder_handles_split_and_coalesced_chunks() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(1, b"hello"));
        wire.extend_from_slice(&encode_frame(2, &[END, ESC]));
        wire.extend_from_slice(&encode_frame(CONTROL_ADDRESS, br#"{"id":1}"#));

        let mut dec = SlipDecoder::new();
        let mut got = Vec::new();
        for b in &wire {
            dec.feed(std::slice::from_ref(b));
            while let Some(f) = dec.next_frame() {
                got.push(f.unwrap());
            }
        }
        assert_eq!(
            got,
            vec![
                Frame::new(1, Bytes::from_static(b"hello")),
                Frame::new(2, Bytes::from_static(&[END, ESC])),
                Frame::new(CONTROL_ADDRESS, Bytes::from_static(br#"{"id":1}"#)),
            ]
        );
        assert!(got[2].is_control());
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn decoder_skips_padding_and_reports_bad_escapes() {
        let mut dec = SlipDecoder::new();
        dec.feed(&[END, END]);
        assert!(dec.next_frame().is_none());

        dec.feed(&[0x00, 0x05, ESC, 0x01, END]);
        assert_eq!(dec.next_frame(), Some(Err(FrameError::InvalidEscape(0x01))));

        dec.feed(&encode_frame(5, b"ok"));
        assert_eq!(dec.next_frame(), Some(Ok(Frame::new(5, Bytes::from_static(b"ok")))));
    }

    #[test]
    fn decoder_bounds_unterminated_input() {
        let mut dec = SlipDecoder::with_max_frame(8);
        dec.feed(&[0x01; 9]);
        assert_eq!(dec.next_frame(), Some(Err(FrameError::TooLarge(8))));
        assert_eq!(dec.buffered(), 0);
    }
}
