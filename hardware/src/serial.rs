//! Serial transport for line-oriented instrument protocols.
//!
//! Drivers talk to a [`SerialLink`] instead of a concrete port so the
//! protocol can be exercised against [`MockSerialLink`] in tests.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serialport::SerialPort;

/// Byte stream to an instrument.
///
/// `try_clone_link` must return a handle to the same device that can be
/// written from another thread while the original is blocked in a read.
pub trait SerialLink: Read + Write + Send {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>>;

    /// Discard received bytes that have not been read yet.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        let clone = self.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(clone))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Open a serial port with 8N1 framing and the given read timeout.
pub fn open_port(path: &str, baud_rate: u32, timeout: Duration) -> io::Result<Box<dyn SerialLink>> {
    let port = serialport::new(path, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(timeout)
        .open()
        .map_err(io::Error::from)?;
    Ok(Box::new(port))
}

/// Read bytes up to and including `terminator`.
///
/// Returns whatever was received (without the terminator) when the link
/// times out. An empty result means nothing arrived.
pub fn read_until<R: Read + ?Sized>(link: &mut R, terminator: u8) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match link.read(&mut byte) {
            Ok(0) => return Ok(line),
            Ok(_) if byte[0] == terminator => return Ok(line),
            Ok(_) => line.push(byte[0]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(line),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    replies: HashMap<Vec<u8>, VecDeque<Vec<u8>>>,
    default_reply: Option<Vec<u8>>,
    pending: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    partial: Vec<u8>,
}

/// Scripted serial link.
///
/// Each complete write (ending in CR) is looked up in a reply table and the
/// matching reply is queued for reading. A write can be given a sequence of
/// replies; the last one repeats once the others are used. Clones share the
/// same state, so a test can keep a handle to inspect what a driver wrote.
#[derive(Debug, Clone, Default)]
pub struct MockSerialLink {
    state: Arc<Mutex<MockState>>,
}

impl MockSerialLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reply to `request` with `response` every time.
    pub fn on(&self, request: &str, response: &str) -> &Self {
        self.on_sequence(request, &[response])
    }

    /// Reply to successive `request`s with each of `responses` in turn.
    pub fn on_sequence(&self, request: &str, responses: &[&str]) -> &Self {
        self.lock().replies.insert(
            request.as_bytes().to_vec(),
            responses.iter().map(|r| r.as_bytes().to_vec()).collect(),
        );
        self
    }

    /// Reply used for writes with no entry in the table.
    pub fn on_any(&self, response: &str) -> &Self {
        self.lock().default_reply = Some(response.as_bytes().to_vec());
        self
    }

    /// Queue bytes for reading as if the device had sent them unprompted.
    pub fn inject(&self, bytes: &str) {
        self.lock().pending.extend(bytes.as_bytes());
    }

    /// Every complete command written so far, including its terminator.
    pub fn written(&self) -> Vec<String> {
        self.lock()
            .written
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn clear_written(&self) {
        self.lock().written.clear();
    }
}

impl Read for MockSerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.pending.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timeout"));
        }
        let n = buf.len().min(state.pending.len());
        for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockSerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.lock();
        let state = &mut *guard;
        for &byte in buf {
            state.partial.push(byte);
            if byte != b'\r' {
                continue;
            }
            let command = std::mem::take(&mut state.partial);
            let reply = match state.replies.get_mut(&command) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => state.default_reply.clone(),
            };
            if let Some(reply) = reply {
                state.pending.extend(reply);
            }
            state.written.push(command);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for MockSerialLink {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        Ok(Box::new(self.clone()))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.lock().pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_replies_and_logs() {
        let mock = MockSerialLink::new();
        mock.on("X0IN\r", "x0>\r");

        let mut link = mock.clone();
        link.write_all(b"X0IN\r").unwrap();
        assert_eq!(read_until(&mut link, b'\r').unwrap(), b"x0>");
        assert_eq!(mock.written(), vec!["X0IN\r".to_string()]);
    }

    #[test]
    fn test_mock_sequence_repeats_last() {
        let mock = MockSerialLink::new();
        mock.on_sequence("X0\r", &["x0b\r", "x0f\r"]);
        let mut link = mock.clone();

        let mut replies = Vec::new();
        for _ in 0..3 {
            link.write_all(b"X0\r").unwrap();
            replies.push(read_until(&mut link, b'\r').unwrap());
        }
        assert_eq!(replies, vec![b"x0b".to_vec(), b"x0f".to_vec(), b"x0f".to_vec()]);
    }

    #[test]
    fn test_unscripted_write_times_out_empty() {
        let mut link = MockSerialLink::new();
        link.write_all(b"Z0AB\r").unwrap();
        assert!(read_until(&mut link, b'\r').unwrap().is_empty());
    }

    #[test]
    fn test_clear_input_drops_unread_lines() {
        let mock = MockSerialLink::new();
        mock.on("X0\r", "x0f\r");
        let mut link = mock.clone();

        mock.inject("x0>\ry0>\r");
        link.clear_input().unwrap();
        link.write_all(b"X0\r").unwrap();
        assert_eq!(read_until(&mut link, b'\r').unwrap(), b"x0f");
        assert!(read_until(&mut link, b'\r').unwrap().is_empty());
    }
}
