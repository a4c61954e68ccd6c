use crate::config::ClientConfig;
use crate::protocol::{Frame, FrameBuffer};
use crate::{ClientError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A decoded frame and the moment it came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub frame: Frame,
    pub received_at: Instant,
}

impl InboundFrame {
    pub fn now(frame: Frame) -> Self {
        Self {
            frame,
            received_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(InboundFrame),
    /// The connection dropped. Posted at most once per transport.
    Closed(String),
}

/// One logical connection to the service.
///
/// Implementations hand inbound frames over in arrival order; `try_recv`
/// never blocks.
pub trait Transport: Send {
    /// Write one encoded frame (length prefix included).
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    fn try_recv(&mut self) -> Option<TransportEvent>;

    fn is_connected(&self) -> bool;

    /// Tear the connection down without posting `Closed`.
    fn close(&mut self);
}

/// TCP connection with a background reader thread.
///
/// The reader owns a clone of the socket and forwards decoded frames through
/// an unbounded channel, so nothing is dropped between the socket and `pump`.
pub struct TcpTransport {
    stream: TcpStream,
    receiver: Receiver<TransportEvent>,
    sender: Sender<TransportEvent>,
    stop_flag: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TcpTransport {
    /// Connect to `host:port` and start the reader thread.
    pub fn connect(host: &str, port: &str, config: &ClientConfig) -> Result<TcpTransport> {
        let port_num: u16 = port
            .trim()
            .parse()
            .map_err(|_| ClientError::Connection(format!("invalid port '{}'", port)))?;

        let addrs = (host, port_num)
            .to_socket_addrs()
            .map_err(|e| ClientError::Connection(format!("cannot resolve {}: {}", host, e)))?;

        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    log::debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        let stream = stream.ok_or_else(|| {
            ClientError::Connection(match last_err {
                Some(e) => format!("cannot connect to {}:{}: {}", host, port, e),
                None => format!("no address found for {}:{}", host, port),
            })
        })?;

        stream.set_nodelay(true)?;
        // Short timeout so the reader notices the stop flag.
        stream.set_read_timeout(Some(Duration::from_millis(100)))?;

        let reader = stream.try_clone()?;
        let (sender, receiver) = crossbeam_channel::unbounded();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(true));

        let thread = {
            let sender = sender.clone();
            let stop_flag = stop_flag.clone();
            let connected = connected.clone();
            let max_frame_len = config.max_frame_len;
            std::thread::Builder::new()
                .name("psm-transport-rx".into())
                .spawn(move || {
                    reader_loop(reader, sender, stop_flag, connected, max_frame_len);
                })
                .map_err(|e| {
                    ClientError::Connection(format!("failed to spawn reader thread: {}", e))
                })?
        };

        Ok(TcpTransport {
            stream,
            receiver,
            sender,
            stop_flag,
            connected,
            thread: Some(thread),
        })
    }

    fn mark_closed(&self, reason: String) {
        if self.connected.swap(false, Ordering::SeqCst) {
            log::warn!("Transport closed: {}", reason);
            let _ = self.sender.send(TransportEvent::Closed(reason));
        }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        // A failed write surfaces through the Closed event, not this call.
        if let Err(e) = self.stream.write_all(frame) {
            self.mark_closed(format!("write failed: {}", e));
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        self.receiver.try_recv().ok()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reads the socket until EOF, error or stop, forwarding frames in order.
fn reader_loop(
    mut stream: TcpStream,
    sender: Sender<TransportEvent>,
    stop_flag: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    max_frame_len: usize,
) {
    let mut frames = FrameBuffer::new(max_frame_len);
    let mut buf = [0u8; 4096];

    log::debug!("Transport reader started");

    let reason = 'read: loop {
        if stop_flag.load(Ordering::Relaxed) {
            log::debug!("Transport reader stopping (stop flag set)");
            return;
        }

        let len = match stream.read(&mut buf) {
            Ok(0) => break 'read "service closed the connection".to_string(),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => break 'read format!("read failed: {}", e),
        };
        let received_at = Instant::now();
        frames.extend(&buf[..len]);

        loop {
            match frames.next_frame() {
                Ok(Some(frame)) => {
                    log::trace!("Received frame {:?}", frame);
                    let event = TransportEvent::Frame(InboundFrame { frame, received_at });
                    if sender.send(event).is_err() {
                        log::debug!("Transport channel disconnected, stopping reader");
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => break 'read format!("malformed frame: {}", e),
            }
        }
    };

    if !stop_flag.load(Ordering::Relaxed) && connected.swap(false, Ordering::SeqCst) {
        log::warn!("Transport closed: {}", reason);
        let _ = sender.send(TransportEvent::Closed(reason));
    }
}
