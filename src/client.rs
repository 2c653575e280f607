//! Blocking MSP request/response client.
//!
//! A client exclusively owns one byte-stream [`Link`]. Every request carries an
//! explicit timeout; transient failures (timeout, truncation, checksum) are retried
//! with a short increasing backoff, while caller errors are returned immediately.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};
use serialport::SerialPort;

use crate::codec;
use crate::errors::{MspError, Result};

/// Default per-attempt response timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300);

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRIES: u32 = 3;

/// Backoff unit; attempt `n` waits `n * BACKOFF_STEP` before resending.
pub const BACKOFF_STEP: Duration = Duration::from_millis(20);

/// Settle time between control line toggles in [`MspClient::wake`].
const WAKE_DELAY: Duration = Duration::from_millis(50);

/// Byte-stream connection to a flight controller.
///
/// Reads may return short or empty results; `WouldBlock`/`TimedOut` mean "nothing yet".
/// Closing happens on drop.
pub trait Link: Read + Write + Send {
    /// Drive the DTR and RTS control lines. Links without them report `Unsupported`.
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        let _ = (dtr, rts);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "link has no control lines",
        ))
    }
}

/// A real serial port opened through `serialport`.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Link for SerialLink {
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        self.port.write_data_terminal_ready(dtr)?;
        self.port.write_request_to_send(rts)?;
        Ok(())
    }
}

/// MSP v1 client over an exclusively owned link.
pub struct MspClient {
    link: Box<dyn Link>,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl MspClient {
    pub fn new(link: Box<dyn Link>) -> Self {
        Self {
            link,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            backoff: BACKOFF_STEP,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Toggle DTR/RTS low then high to kick USB virtual COM endpoints.
    ///
    /// Best effort: links without control lines are left untouched.
    pub fn wake(&mut self) {
        let result = self
            .link
            .set_control_lines(false, false)
            .and_then(|_| {
                thread::sleep(WAKE_DELAY);
                self.link.set_control_lines(true, true)
            });
        match result {
            Ok(()) => thread::sleep(WAKE_DELAY),
            Err(e) => debug!("wake skipped: {}", e),
        }
    }

    /// Send `command` with the client's default timeout and retry count.
    pub fn request(&mut self, command: impl Into<i64>, payload: &[u8]) -> Result<Vec<u8>> {
        self.request_with(command, payload, self.timeout, self.retries)
    }

    /// Send `command` and wait for the matching response payload.
    ///
    /// One initial attempt plus up to `retries` retries. Responses for other command
    /// ids are drained and ignored within the same attempt deadline.
    pub fn request_with(
        &mut self,
        command: impl Into<i64>,
        payload: &[u8],
        timeout: Duration,
        retries: u32,
    ) -> Result<Vec<u8>> {
        let frame = codec::Frame::new(codec::Direction::ToDevice, command, payload)?;
        let wire = frame.to_bytes();

        let mut last_error = MspError::Timeout;
        for attempt in 0..=retries {
            if attempt > 0 {
                thread::sleep(self.backoff * attempt);
            }
            self.link.write_all(&wire)?;
            self.link.flush()?;

            match self.read_response(frame.command, timeout) {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_retryable() => {
                    debug!(
                        "MSP command {} failed attempt {}/{}: {}",
                        frame.command,
                        attempt + 1,
                        retries + 1,
                        e
                    );
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(MspError::RequestFailed(Box::new(last_error)))
    }

    fn read_response(&mut self, expected: u8, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let frame = codec::decode(&mut *self.link, deadline)?;
            if frame.command == expected {
                return Ok(frame.payload);
            }
            trace!(
                "discarding response for cmd {} while waiting for {}",
                frame.command,
                expected
            );
        }
    }

    /// Release the underlying connection.
    pub fn close(self) {
        drop(self.link);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedLink;
    use super::*;
    use crate::codec::encode_response;

    fn fast(link: ScriptedLink) -> MspClient {
        MspClient::new(Box::new(link))
            .with_timeout(Duration::from_millis(30))
            .with_backoff(Duration::ZERO)
    }

    #[test]
    fn returns_matching_payload() {
        let link = ScriptedLink::new(vec![encode_response(101, &[1, 2, 3]).unwrap()]);
        let shared = link.shared.clone();
        let mut client = fast(link);
        assert_eq!(client.request(101, &[]).unwrap(), vec![1, 2, 3]);
        let shared = shared.lock();
        assert_eq!(shared.writes, 1);
        assert!(shared.written.starts_with(b"$M<"));
    }

    #[test]
    fn bad_checksum_retries_then_fails() {
        let mut reply = encode_response(101, &[1, 2]).unwrap();
        let last = reply.len() - 1;
        reply[last] ^= 0x55;
        let link = ScriptedLink::always(reply);
        let shared = link.shared.clone();
        let mut client = fast(link);

        let err = client
            .request_with(101, &[], Duration::from_millis(30), 2)
            .unwrap_err();
        match err {
            MspError::RequestFailed(inner) => {
                assert!(matches!(*inner, MspError::ChecksumMismatch { .. }))
            }
            other => panic!("unexpected: {other:?}"),
        }
        // initial attempt plus exactly two retries
        assert_eq!(shared.lock().writes, 3);
    }

    #[test]
    fn silent_device_times_out() {
        let link = ScriptedLink::silent();
        let shared = link.shared.clone();
        let mut client = fast(link).with_retries(1);
        let err = client.request(108, &[]).unwrap_err();
        assert!(matches!(err, MspError::RequestFailed(ref inner) if matches!(**inner, MspError::Timeout)));
        assert_eq!(shared.lock().writes, 2);
    }

    #[test]
    fn cross_talk_is_drained_not_retried() {
        let mut reply = encode_response(108, &[0; 6]).unwrap();
        reply.extend(encode_response(110, &[9; 7]).unwrap());
        let link = ScriptedLink::new(vec![reply]);
        let shared = link.shared.clone();
        let mut client = fast(link);
        assert_eq!(client.request(110, &[]).unwrap(), vec![9; 7]);
        assert_eq!(shared.lock().writes, 1);
    }

    #[test]
    fn recovers_on_retry() {
        let link = ScriptedLink::new(vec![
            b"junk".to_vec(),
            encode_response(102, &[4; 18]).unwrap(),
        ]);
        let mut client = fast(link);
        assert_eq!(client.request(102, &[]).unwrap(), vec![4; 18]);
    }

    #[test]
    fn caller_errors_are_not_retried() {
        let link = ScriptedLink::silent();
        let shared = link.shared.clone();
        let mut client = fast(link);
        assert!(matches!(
            client.request(300, &[]),
            Err(MspError::InvalidCommand(300))
        ));
        assert!(matches!(
            client.request(1, &[0u8; 300]),
            Err(MspError::PayloadTooLarge(300))
        ));
        assert_eq!(shared.lock().writes, 0);
    }

    #[test]
    fn wake_toggles_lines_low_then_high() {
        let link = ScriptedLink::silent();
        let shared = link.shared.clone();
        let mut client = fast(link);
        client.wake();
        assert_eq!(shared.lock().lines, vec![(false, false), (true, true)]);
    }
}
