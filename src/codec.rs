//! MSP v1 frame codec.
//!
//! Wire format: `"$M" | direction | length | command | payload | checksum`, where the
//! checksum is the XOR of length, command and every payload byte.
//!
//! Decoding reads from any [`Read`] source against a caller supplied deadline. Short
//! reads, `WouldBlock` and `TimedOut` are treated as "no data yet", which matches how
//! `serialport` reports an expired per-read timeout.

use std::io::{self, Read};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

use crate::errors::{MspError, Result};

/// Frame start marker.
pub const PREAMBLE: [u8; 2] = *b"$M";

/// Largest payload an MSP v1 frame can carry.
pub const MAX_PAYLOAD: usize = 255;

/// Header (preamble, direction, length, command) plus trailing checksum.
pub const FRAME_OVERHEAD: usize = 6;

/// Sleep between empty reads while waiting on a deadline.
const IDLE_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Request sent by the host (`<`).
    ToDevice,
    /// Response sent by the flight controller (`>`).
    FromDevice,
}

impl Direction {
    #[inline]
    pub fn byte(self) -> u8 {
        match self {
            Direction::ToDevice => b'<',
            Direction::FromDevice => b'>',
        }
    }
}

/// A validated MSP v1 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
    pub direction: Direction,
}

impl Frame {
    /// Build a frame, rejecting command ids outside `0..=255` and oversized payloads.
    pub fn new(direction: Direction, command: impl Into<i64>, payload: &[u8]) -> Result<Self> {
        let raw = command.into();
        let command = u8::try_from(raw).map_err(|_| MspError::InvalidCommand(raw))?;
        if payload.len() > MAX_PAYLOAD {
            return Err(MspError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            command,
            payload: payload.to_vec(),
            direction,
        })
    }

    pub fn checksum(&self) -> u8 {
        // `new` guarantees the length fits in a byte.
        checksum(self.payload.len() as u8, self.command, &self.payload)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        out.extend_from_slice(&PREAMBLE);
        out.push(self.direction.byte());
        out.push(self.payload.len() as u8);
        out.push(self.command);
        out.extend_from_slice(&self.payload);
        out.push(self.checksum());
        out
    }
}

/// XOR checksum over length, command and payload.
pub fn checksum(len: u8, command: u8, payload: &[u8]) -> u8 {
    payload.iter().fold(len ^ command, |acc, b| acc ^ b)
}

/// Encode a host request frame.
pub fn encode(command: impl Into<i64>, payload: &[u8]) -> Result<Vec<u8>> {
    Frame::new(Direction::ToDevice, command, payload).map(|f| f.to_bytes())
}

/// Encode a flight controller response frame (used by the simulator and tests).
pub fn encode_response(command: impl Into<i64>, payload: &[u8]) -> Result<Vec<u8>> {
    Frame::new(Direction::FromDevice, command, payload).map(|f| f.to_bytes())
}

/// Decode the next response frame (`$M>`) from `src` before `deadline`.
pub fn decode<R: Read + ?Sized>(src: &mut R, deadline: Instant) -> Result<Frame> {
    decode_frame(src, Direction::FromDevice, deadline)
}

/// Decode the next frame travelling in `direction`.
///
/// Bytes preceding the preamble are skipped one at a time. A byte that breaks a
/// partial preamble match is re-examined as a possible new `$`, so at most that one
/// byte is consumed per false candidate.
pub fn decode_frame<R: Read + ?Sized>(
    src: &mut R,
    direction: Direction,
    deadline: Instant,
) -> Result<Frame> {
    let mut byte = [0u8; 1];
    let mut matched = 0usize;
    loop {
        if read_some(src, &mut byte, deadline)?.is_none() {
            return Err(MspError::Timeout);
        }
        let b = byte[0];
        matched = match (matched, b) {
            (0, b'$') => 1,
            (1, b'M') => 2,
            (2, d) if d == direction.byte() => break,
            (_, b'$') => 1,
            _ => 0,
        };
    }

    let mut header = [0u8; 2];
    if !read_exact_until(src, &mut header, deadline)? {
        return Err(MspError::Truncated);
    }
    let [len, command] = header;

    let mut payload = vec![0u8; len as usize];
    if !read_exact_until(src, &mut payload, deadline)? {
        return Err(MspError::Truncated);
    }
    if !read_exact_until(src, &mut byte, deadline)? {
        return Err(MspError::Truncated);
    }

    let expected = checksum(len, command, &payload);
    if expected != byte[0] {
        return Err(MspError::ChecksumMismatch {
            expected,
            actual: byte[0],
        });
    }
    trace!("decoded frame: cmd={} len={}", command, len);
    Ok(Frame {
        command,
        payload,
        direction,
    })
}

/// Read at least one byte, or return `None` once the deadline passes.
fn read_some<R: Read + ?Sized>(
    src: &mut R,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<Option<usize>> {
    loop {
        match src.read(buf) {
            Ok(n) if n > 0 => return Ok(Some(n)),
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(IDLE_POLL);
    }
}

/// Fill `buf` completely; `false` when the deadline passes first.
fn read_exact_until<R: Read + ?Sized>(
    src: &mut R,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match read_some(src, &mut buf[filled..], deadline)? {
            Some(n) => filled += n,
            None => return Ok(false),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(20)
    }

    #[test]
    fn encodes_request_layout() {
        let bytes = encode(42, b"abc").unwrap();
        let csum = 3 ^ 42 ^ b'a' ^ b'b' ^ b'c';
        assert_eq!(bytes, [b'$', b'M', b'<', 3, 42, b'a', b'b', b'c', csum]);
    }

    #[test]
    fn empty_payload_checksum_is_command() {
        let bytes = encode(101, &[]).unwrap();
        assert_eq!(bytes, [b'$', b'M', b'<', 0, 101, 101]);
    }

    #[test]
    fn rejects_out_of_range_command_and_large_payload() {
        assert!(matches!(encode(256, &[]), Err(MspError::InvalidCommand(256))));
        assert!(matches!(encode(-1, &[]), Err(MspError::InvalidCommand(-1))));
        assert!(matches!(
            encode(1, &[0u8; 256]),
            Err(MspError::PayloadTooLarge(256))
        ));
        assert!(encode(255, &[0u8; 255]).is_ok());
    }

    #[test]
    fn decodes_every_command_with_varied_payloads() {
        for cmd in [0u8, 1, 100, 254, 255] {
            for len in [0usize, 1, 7, 255] {
                let payload: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31) ^ cmd).collect();
                let wire = encode_response(cmd, &payload).unwrap();
                assert_eq!(
                    *wire.last().unwrap(),
                    checksum(len as u8, cmd, &payload),
                );
                let frame = decode(&mut wire.as_slice(), soon()).unwrap();
                assert_eq!(frame.command, cmd);
                assert_eq!(frame.payload, payload);
                assert_eq!(frame.direction, Direction::FromDevice);
            }
        }
    }

    #[test]
    fn resyncs_after_corrupted_leading_byte() {
        let mut wire = vec![0xAA];
        wire.extend(encode_response(108, &[1, 2, 3, 4, 5, 6]).unwrap());
        let frame = decode(&mut wire.as_slice(), soon()).unwrap();
        assert_eq!(frame.command, 108);
        assert_eq!(frame.payload, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn false_preamble_does_not_swallow_real_one() {
        // "$M" followed by '$' restarts the match on that '$'.
        let mut wire = b"$M$".to_vec();
        wire.extend(&encode_response(101, &[9]).unwrap()[1..]);
        let frame = decode(&mut wire.as_slice(), soon()).unwrap();
        assert_eq!(frame.command, 101);

        // A request echo ('<') is skipped in favour of the following response.
        let mut wire = encode(110, &[]).unwrap();
        wire.extend(encode_response(110, &[7, 7]).unwrap());
        let frame = decode(&mut wire.as_slice(), soon()).unwrap();
        assert_eq!(frame.payload, vec![7, 7]);
    }

    #[test]
    fn partial_preamble_then_garbage_keeps_scanning() {
        let mut wire = b"$Mx$$M".to_vec();
        wire.push(b'>');
        wire.extend(&[1, 5, 0x10, 1 ^ 5 ^ 0x10]);
        let frame = decode(&mut wire.as_slice(), soon()).unwrap();
        assert_eq!(frame.command, 5);
        assert_eq!(frame.payload, vec![0x10]);
    }

    #[test]
    fn reports_checksum_mismatch() {
        let mut wire = encode_response(101, &[1, 2]).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        match decode(&mut wire.as_slice(), soon()) {
            Err(MspError::ChecksumMismatch { expected, actual }) => {
                assert_eq!(expected, 2 ^ 101 ^ 1 ^ 2);
                assert_eq!(actual, expected ^ 0xFF);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn timeout_without_preamble_and_truncated_mid_frame() {
        let noise = [0u8, 1, 2, 3];
        assert!(matches!(
            decode(&mut noise.as_slice(), soon()),
            Err(MspError::Timeout)
        ));

        let wire = encode_response(101, &[1, 2, 3, 4]).unwrap();
        let short = &wire[..wire.len() - 3];
        assert!(matches!(
            decode(&mut &short[..], soon()),
            Err(MspError::Truncated)
        ));
    }

    #[test]
    fn decodes_requests_when_asked() {
        let wire = encode(160, &[]).unwrap();
        let frame = decode_frame(&mut wire.as_slice(), Direction::ToDevice, soon()).unwrap();
        assert_eq!(frame.command, 160);
        assert_eq!(frame.direction, Direction::ToDevice);
    }
}
