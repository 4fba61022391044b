use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for a single frame in either direction. Anything larger is a
/// codec error, not a transport error.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub const DEFAULT_WARN_MESSAGES_PER_SECOND: u32 = 250;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// The transport is gone: the peer closed it, the process exited, or
    /// `close()` was called on this side.
    Closed,
    Io(String),
    Codec(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "channel closed"),
            Self::Io(detail) => write!(f, "channel io error: {detail}"),
            Self::Codec(detail) => write!(f, "channel codec error: {detail}"),
        }
    }
}

impl std::error::Error for ChannelError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub warn_messages_per_second: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            warn_messages_per_second: DEFAULT_WARN_MESSAGES_PER_SECOND,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrafficWarning {
    pub messages: u32,
    pub bytes: u64,
}

impl fmt::Display for TrafficWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "outbound channel traffic is high: {} messages ({} bytes) within one second",
            self.messages, self.bytes
        )
    }
}

/// Rolling one-second bucket over outbound sends. Purely diagnostic: it never
/// blocks or drops a frame, and warns at most once per bucket.
struct TrafficMeter {
    threshold: u32,
    bucket_start: Instant,
    messages: u32,
    bytes: u64,
    warned: bool,
}

impl TrafficMeter {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            bucket_start: Instant::now(),
            messages: 0,
            bytes: 0,
            warned: false,
        }
    }

    fn record(&mut self, now: Instant, frame_bytes: usize) -> Option<TrafficWarning> {
        if now.duration_since(self.bucket_start) >= Duration::from_secs(1) {
            self.bucket_start = now;
            self.messages = 0;
            self.bytes = 0;
            self.warned = false;
        }

        self.messages = self.messages.saturating_add(1);
        self.bytes = self.bytes.saturating_add(frame_bytes as u64);

        if self.messages > self.threshold && !self.warned {
            self.warned = true;
            return Some(TrafficWarning {
                messages: self.messages,
                bytes: self.bytes,
            });
        }
        None
    }
}

/// Bidirectional, ordered, length-framed byte pipe between two processes.
/// Frames are u32-LE length prefixed. A dedicated reader thread feeds an mpsc
/// receiver so `receive` can wait with a timeout.
pub struct FramedChannel {
    writer: Mutex<Box<dyn Write + Send>>,
    rx: Mutex<Receiver<Result<Vec<u8>, ChannelError>>>,
    closed: Arc<AtomicBool>,
    meter: Mutex<TrafficMeter>,
    warnings: Mutex<Vec<TrafficWarning>>,
    // Tears down the transport itself so the peer observes EOF and our
    // blocked reader thread wakes up. None for transports without one.
    shutdown: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FramedChannel {
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        config: ChannelConfig,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let rx = spawn_reader_thread(reader, Arc::clone(&closed));
        Self {
            writer: Mutex::new(Box::new(writer)),
            rx: Mutex::new(rx),
            closed,
            meter: Mutex::new(TrafficMeter::new(config.warn_messages_per_second)),
            warnings: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        }
    }

    pub fn from_stream(stream: TcpStream, config: ChannelConfig) -> Result<Self, ChannelError> {
        let reader = stream
            .try_clone()
            .map_err(|err| ChannelError::Io(format!("clone stream failed: {err}")))?;
        let socket = stream
            .try_clone()
            .map_err(|err| ChannelError::Io(format!("clone stream failed: {err}")))?;
        let channel = Self::new(reader, stream, config);
        *lock(&channel.shutdown) = Some(Box::new(move || {
            let _ = socket.shutdown(Shutdown::Both);
        }));
        Ok(channel)
    }

    pub fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if frame.len() > MAX_FRAME_BYTES {
            return Err(ChannelError::Codec(format!(
                "outbound frame of {} bytes exceeds the {} byte limit",
                frame.len(),
                MAX_FRAME_BYTES
            )));
        }

        let write = {
            let mut writer = lock(&self.writer);
            writer
                .write_all(&(frame.len() as u32).to_le_bytes())
                .and_then(|()| writer.write_all(frame))
                .and_then(|()| writer.flush())
        };
        // A failed write means the transport is gone. Callers with calls
        // in flight observe the same Closed error.
        if write.is_err() {
            self.close();
            return Err(ChannelError::Closed);
        }

        if let Some(warning) = lock(&self.meter).record(Instant::now(), frame.len()) {
            lock(&self.warnings).push(warning);
        }
        Ok(())
    }

    pub fn receive(&self, timeout: Duration) -> Result<Option<Vec<u8>>, ChannelError> {
        let rx = lock(&self.rx);
        match rx.recv_timeout(timeout) {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(err)) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(err)
            }
            Err(RecvTimeoutError::Timeout) => {
                if self.closed.load(Ordering::SeqCst) {
                    Err(ChannelError::Closed)
                } else {
                    Ok(None)
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(ChannelError::Closed)
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(shutdown) = lock(&self.shutdown).take() {
            shutdown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn drain_traffic_warnings(&self) -> Vec<TrafficWarning> {
        std::mem::take(&mut *lock(&self.warnings))
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_reader_thread(
    reader: impl Read + Send + 'static,
    closed: Arc<AtomicBool>,
) -> Receiver<Result<Vec<u8>, ChannelError>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut reader = reader;
        loop {
            if closed.load(Ordering::SeqCst) {
                return;
            }

            let mut header = [0u8; 4];
            match read_header(&mut reader, &mut header) {
                Ok(false) => return, // clean EOF at a frame boundary
                Ok(true) => {}
                Err(err) => {
                    let _ = tx.send(Err(ChannelError::Io(format!(
                        "read frame header failed: {err}"
                    ))));
                    return;
                }
            }

            let len = u32::from_le_bytes(header) as usize;
            if len > MAX_FRAME_BYTES {
                let _ = tx.send(Err(ChannelError::Codec(format!(
                    "incoming frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
                ))));
                return;
            }

            let mut frame = vec![0u8; len];
            if let Err(err) = reader.read_exact(&mut frame) {
                let _ = tx.send(Err(ChannelError::Io(format!(
                    "read frame body failed: {err}"
                ))));
                return;
            }

            if tx.send(Ok(frame)).is_err() {
                return;
            }
        }
    });
    rx
}

/// Reads a full header, distinguishing a clean EOF (no bytes at all) from a
/// truncated frame.
fn read_header(reader: &mut impl Read, buf: &mut [u8; 4]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame header",
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    fn channel_pair() -> (FramedChannel, FramedChannel) {
        let (a, b) = tcp_pair();
        (
            FramedChannel::from_stream(a, ChannelConfig::default()).expect("channel a"),
            FramedChannel::from_stream(b, ChannelConfig::default()).expect("channel b"),
        )
    }

    #[test]
    fn frames_arrive_in_send_order() {
        let (a, b) = channel_pair();

        for i in 0..20u8 {
            a.send(&[i, i, i]).expect("send frame");
        }
        for i in 0..20u8 {
            let frame = b
                .receive(Duration::from_secs(2))
                .expect("receive")
                .expect("frame present");
            assert_eq!(frame, vec![i, i, i]);
        }
    }

    #[test]
    fn empty_frame_roundtrips() {
        let (a, b) = channel_pair();
        a.send(&[]).expect("send empty frame");
        let frame = b
            .receive(Duration::from_secs(2))
            .expect("receive")
            .expect("frame present");
        assert!(frame.is_empty());
    }

    #[test]
    fn receive_times_out_without_traffic() {
        let (_a, b) = channel_pair();
        let got = b.receive(Duration::from_millis(20)).expect("receive");
        assert!(got.is_none());
    }

    #[test]
    fn send_after_close_fails_with_closed() {
        let (a, _b) = channel_pair();
        a.close();
        assert_eq!(a.send(b"late"), Err(ChannelError::Closed));
    }

    #[test]
    fn peer_disconnect_surfaces_closed() {
        let (a, b) = channel_pair();
        drop(a);

        // Reader hits EOF, the mpsc sender is dropped, receive reports Closed.
        let mut outcome = Ok(None);
        for _ in 0..100 {
            outcome = b.receive(Duration::from_millis(20));
            if outcome.is_err() {
                break;
            }
        }
        assert_eq!(outcome, Err(ChannelError::Closed));
        assert!(b.is_closed());
    }

    #[test]
    fn close_is_observed_by_the_peer() {
        let (a, b) = channel_pair();
        a.close();

        // The shutdown reaches the peer's socket, not just our writer, so
        // its reader sees EOF instead of waiting forever.
        let mut outcome = Ok(None);
        for _ in 0..100 {
            outcome = b.receive(Duration::from_millis(20));
            if outcome.is_err() {
                break;
            }
        }
        assert_eq!(outcome, Err(ChannelError::Closed));
    }

    #[test]
    fn buffered_frames_survive_peer_disconnect() {
        let (a, b) = channel_pair();
        a.send(b"last words").expect("send");
        drop(a);

        let frame = b
            .receive(Duration::from_secs(2))
            .expect("receive buffered")
            .expect("frame present");
        assert_eq!(frame, b"last words");
    }

    #[test]
    fn oversized_outbound_frame_is_a_codec_error() {
        let (a, _b) = channel_pair();
        let oversized = vec![0u8; MAX_FRAME_BYTES + 1];
        assert!(matches!(a.send(&oversized), Err(ChannelError::Codec(_))));
    }

    #[test]
    fn traffic_meter_warns_once_per_bucket() {
        let mut meter = TrafficMeter::new(3);
        let start = Instant::now();

        assert!(meter.record(start, 10).is_none());
        assert!(meter.record(start, 10).is_none());
        assert!(meter.record(start, 10).is_none());

        let warning = meter.record(start, 10).expect("warning over threshold");
        assert_eq!(warning.messages, 4);
        assert_eq!(warning.bytes, 40);

        // Still over threshold in the same bucket, but already warned.
        assert!(meter.record(start, 10).is_none());
    }

    #[test]
    fn traffic_meter_resets_on_next_bucket() {
        let mut meter = TrafficMeter::new(1);
        let start = Instant::now();

        assert!(meter.record(start, 1).is_none());
        assert!(meter.record(start, 1).is_some());

        let later = start + Duration::from_millis(1500);
        assert!(meter.record(later, 1).is_none());
        assert!(meter.record(later, 1).is_some());
    }

    #[test]
    fn channel_collects_traffic_warnings() {
        let (a_stream, b_stream) = tcp_pair();
        let a = FramedChannel::from_stream(
            a_stream,
            ChannelConfig {
                warn_messages_per_second: 5,
            },
        )
        .expect("channel a");
        let _b = FramedChannel::from_stream(b_stream, ChannelConfig::default()).expect("channel b");

        for _ in 0..10 {
            a.send(b"burst").expect("send");
        }
        let warnings = a.drain_traffic_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].messages > 5);
        assert!(a.drain_traffic_warnings().is_empty());
    }
}
