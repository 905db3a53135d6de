//! Framed host<->radio transport, spec.md §4.1.
//!
//! Every host-ward message is `[kind: u8][len: u8][payload: len bytes]`.
//! While resynchronising, the radio's messages are preceded by the magic
//! `0xAA 'Z' 'A' 'G'`; the reader thread writes the magic and reads until it
//! has observed the magic as a suffix of the bytes read, then moves to
//! synced state and reads header+payload messages back to back. Responses
//! (`kind` bit 7 set, bit 6 clear) and events (`kind & 0xC0 == 0xC0`) are
//! demultiplexed onto separate channels; `request` is a blocking, strictly
//! half-duplex call serialised by `request_lock` (spec.md §4.1/§5).

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::error::TransportError;

const MAGIC: [u8; 4] = [0xAA, b'Z', b'A', b'G'];
const KIND_ERR: u8 = 0x81;
const EVENT_ON_PACKET: u8 = 0xC0;
const EVENT_ON_BUTTON: u8 = 0xC1;

/// External collaborator: a byte-oriented serial link with a read timeout
/// (spec.md §1's "serial byte channel", `open`/blocking `read`/`write`/
/// `flush`). `try_clone_link` gives the reader thread its own duplex handle
/// onto the same underlying port, the way `serialport::SerialPort::try_clone`
/// does.
pub trait SerialLink: Read + Write + Send {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>>;
}

impl SerialLink for Box<dyn serialport::SerialPort> {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        let cloned = serialport::SerialPort::try_clone(self.as_ref())?;
        Ok(Box::new(cloned))
    }
}

/// A request kind; `kind < 0x80` on the wire (spec.md §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestKind(pub u8);

/// An asynchronous event pushed by the radio outside the request/response
/// cycle, spec.md §4.1.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// `on_packet`: the raw MAC frame and its RSSI. The trailing
    /// `rssi`/`link_quality` bytes are stripped and the link quality byte is
    /// discarded, per spec.md §4.1.
    Packet { frame: Vec<u8>, rssi: i8 },
    /// `on_button`.
    Button(u8),
}

#[derive(Debug)]
enum ResponseMsg {
    Ok(Vec<u8>),
    Err,
}

/// Failure from a single blocking [`Transport::request`] call.
#[derive(Debug)]
pub enum RequestError {
    /// The link failed outright; fatal, spec.md §7.
    Transport(TransportError),
    /// The radio answered `kind == err`; recoverable, the caller drops the
    /// operation.
    Response,
}

/// The framed host<->radio link. One reader thread owns the port and
/// demultiplexes responses from events; `request` blocks the calling thread
/// until its response arrives.
pub struct Transport {
    write_half: Mutex<Box<dyn SerialLink>>,
    request_lock: Mutex<()>,
    response_rx: Mutex<Receiver<ResponseMsg>>,
    event_rx: Mutex<Receiver<Event>>,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Transport {
    /// Takes ownership of an already-opened link (configured with its read
    /// timeout by the caller) and spawns the reader thread. The reader
    /// starts sync-lost and writes the magic immediately, per spec.md §4.1.
    pub fn new(link: Box<dyn SerialLink>) -> io::Result<Self> {
        let read_half = link.try_clone_link()?;
        let (response_tx, response_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader_shutdown = shutdown.clone();
        let reader = thread::Builder::new()
            .name("zag-transport-reader".into())
            .spawn(move || reader_loop(read_half, response_tx, event_tx, reader_shutdown))?;

        Ok(Self {
            write_half: Mutex::new(link),
            request_lock: Mutex::new(()),
            response_rx: Mutex::new(response_rx),
            event_rx: Mutex::new(event_rx),
            shutdown,
            reader: Some(reader),
        })
    }

    /// Sends a request and blocks for its response. The write and the
    /// response wait both happen under `request_lock`, so concurrent callers
    /// are serialised into a strictly half-duplex exchange (spec.md §4.1).
    pub fn request(&self, kind: RequestKind, payload: &[u8]) -> Result<Vec<u8>, RequestError> {
        if payload.len() > u8::MAX as usize {
            return Err(RequestError::Transport(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request payload exceeds 255 bytes",
            ))));
        }

        let _guard = self.request_lock.lock().unwrap();

        {
            let mut w = self.write_half.lock().unwrap();
            let header = [kind.0, payload.len() as u8];
            w.write_all(&header).map_err(|e| RequestError::Transport(e.into()))?;
            w.write_all(payload).map_err(|e| RequestError::Transport(e.into()))?;
            w.flush().map_err(|e| RequestError::Transport(e.into()))?;
        }

        trace!("transport request kind=0x{:02x} len={}", kind.0, payload.len());

        let rx = self.response_rx.lock().unwrap();
        match rx.recv() {
            Ok(ResponseMsg::Ok(data)) => Ok(data),
            Ok(ResponseMsg::Err) => Err(RequestError::Response),
            Err(_) => Err(RequestError::Transport(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport reader thread exited",
            )))),
        }
    }

    /// Blocks for the next event up to `timeout`. `None` means timeout, not
    /// failure; the role re-checks its own deadlines either way (spec.md
    /// §5's "event channel (blocking dequeue with timeout)").
    pub fn recv_event(&self, timeout: Duration) -> Option<Event> {
        let rx = self.event_rx.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Flips the cooperative shutdown flag; the reader thread exits at its
    /// next read timeout (spec.md §5).
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.request_shutdown();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

/// Reads one byte, collapsing a timed-out or empty read to `None` rather
/// than an error: both are routine during resync (spec.md §4.1's "on
/// short/empty read, re-write the magic and retry").
fn read_byte(link: &mut dyn SerialLink) -> io::Result<Option<u8>> {
    let mut b = [0u8; 1];
    match link.read(&mut b) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(b[0])),
        Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// Fills `buf` byte-by-byte, treating a timeout or empty read as
/// synchronisation loss (returns `false`) rather than propagating an error:
/// the reader falls back to resync rather than terminating, per spec.md
/// §4.1 ("if a subsequent header cannot be fully read within the serial
/// timeout, Transport returns to sync-lost").
fn read_exact_or_lost(link: &mut dyn SerialLink, buf: &mut [u8]) -> io::Result<bool> {
    for slot in buf.iter_mut() {
        match read_byte(link)? {
            Some(b) => *slot = b,
            None => return Ok(false),
        }
    }
    Ok(true)
}

/// Writes the magic and reads until it has appeared as a suffix of the
/// bytes read. Per spec.md §9's open question, the magic is a
/// synchronisation signal, not a record delimiter: observing it only means
/// "the reader is now aligned with a header boundary", so this function
/// returns as soon as it matches rather than treating everything before it
/// as a discarded "record".
fn resync(link: &mut dyn SerialLink, shutdown: &AtomicBool) -> io::Result<bool> {
    let mut matched = 0usize;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(false);
        }
        link.write_all(&MAGIC)?;
        let _ = link.flush();

        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(false);
            }
            match read_byte(link)? {
                Some(b) => {
                    if b == MAGIC[matched] {
                        matched += 1;
                        if matched == MAGIC.len() {
                            return Ok(true);
                        }
                    } else {
                        matched = if b == MAGIC[0] { 1 } else { 0 };
                    }
                }
                None => break, // short/empty read: re-write the magic and retry
            }
        }
    }
}

fn reader_loop(mut link: Box<dyn SerialLink>, response_tx: Sender<ResponseMsg>, event_tx: Sender<Event>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        match resync(link.as_mut(), &shutdown) {
            Ok(true) => debug!("transport synchronised"),
            Ok(false) => return,
            Err(e) => {
                error!("transport resync failed: {e}");
                return;
            }
        }

        'synced: loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }

            let mut header = [0u8; 2];
            match read_exact_or_lost(link.as_mut(), &mut header) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("transport lost synchronisation reading header");
                    break 'synced;
                }
                Err(e) => {
                    error!("transport read failed: {e}");
                    return;
                }
            }
            let kind = header[0];
            let len = header[1] as usize;

            let mut payload = vec![0u8; len];
            match read_exact_or_lost(link.as_mut(), &mut payload) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("transport lost synchronisation reading payload");
                    break 'synced;
                }
                Err(e) => {
                    error!("transport read failed: {e}");
                    return;
                }
            }

            trace!("transport rx kind=0x{kind:02x} len={len}");

            if kind & 0xC0 == 0xC0 {
                match kind {
                    EVENT_ON_PACKET => {
                        if payload.len() < 2 {
                            warn!("on_packet event shorter than its rssi/link-quality trailer, dropping");
                            continue;
                        }
                        let split = payload.len() - 2;
                        let rssi = payload[split] as i8;
                        let frame = payload[..split].to_vec();
                        if event_tx.send(Event::Packet { frame, rssi }).is_err() {
                            return;
                        }
                    }
                    EVENT_ON_BUTTON => {
                        if let Some(&button) = payload.first() {
                            if event_tx.send(Event::Button(button)).is_err() {
                                return;
                            }
                        }
                    }
                    other => warn!("unknown event kind 0x{other:02x}, dropping"),
                }
            } else if kind & 0x80 != 0 {
                let msg = if kind == KIND_ERR { ResponseMsg::Err } else { ResponseMsg::Ok(payload) };
                if response_tx.send(msg).is_err() {
                    return;
                }
            } else {
                warn!("unexpected reserved kind 0x{kind:02x} from radio, dropping");
            }
        }
    }
}
