use crate::channel::{ChannelError, FramedChannel};
use crate::diag::{Diagnostic, DiagnosticSink};
use crate::protocol::{self, HostWireMessage, RemoteCallError};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Wire error code returned when a request names a target nobody registered.
pub const UNKNOWN_REMOTE_TARGET: &str = "unknown_remote_target";

const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(25);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeErrorCode {
    ChannelClosed,
    UnknownRemoteTarget,
    RemoteFault,
    CallTimeout,
    DuplicateReceiver,
    Codec,
}

impl BridgeErrorCode {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::ChannelClosed => "channel_closed",
            Self::UnknownRemoteTarget => "unknown_remote_target",
            Self::RemoteFault => "remote_fault",
            Self::CallTimeout => "call_timeout",
            Self::DuplicateReceiver => "duplicate_receiver",
            Self::Codec => "codec",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeError {
    pub code: BridgeErrorCode,
    pub detail: String,
}

impl BridgeError {
    pub fn new(code: BridgeErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    fn channel_closed(detail: impl Into<String>) -> Self {
        Self::new(BridgeErrorCode::ChannelClosed, detail)
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_tag(), self.detail)
    }
}

impl std::error::Error for BridgeError {}

/// A named capability reachable from the other side of the channel. Dispatch
/// is an explicit method-name match, never reflection.
pub trait RemoteReceiver: Send + Sync {
    fn dispatch(&self, method: &str, args: &[Value]) -> Result<Value, RemoteCallError>;
}

struct RegistryInner {
    channel: Arc<FramedChannel>,
    diagnostics: DiagnosticSink,
    locals: Mutex<HashMap<String, Arc<dyn RemoteReceiver>>>,
    pending: Mutex<HashMap<u64, Sender<Result<Value, BridgeError>>>>,
    next_request_id: AtomicU64,
    closed: AtomicBool,
}

/// Maps string identifiers to local receivers and produces call-capable
/// stand-ins for the other side of one channel. One registry per channel.
#[derive(Clone)]
pub struct RemoteRegistry {
    inner: Arc<RegistryInner>,
}

impl RemoteRegistry {
    pub fn new(channel: Arc<FramedChannel>, diagnostics: DiagnosticSink) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                channel,
                diagnostics,
                locals: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn register_local(
        &self,
        id: impl Into<String>,
        receiver: Arc<dyn RemoteReceiver>,
    ) -> Result<(), BridgeError> {
        let id = id.into();
        let mut locals = lock(&self.inner.locals);
        if locals.contains_key(&id) {
            return Err(BridgeError::new(
                BridgeErrorCode::DuplicateReceiver,
                format!("a receiver is already registered for target: {id}"),
            ));
        }
        locals.insert(id, receiver);
        Ok(())
    }

    pub fn remote(&self, target: impl Into<String>) -> RemoteHandle {
        RemoteHandle {
            inner: Arc::clone(&self.inner),
            target: target.into(),
        }
    }

    /// Spawns the receive loop for this registry's channel. Requests are
    /// dispatched to local receivers, replies complete pending calls, and
    /// every other message kind is handed to `control`.
    pub fn start_pump<F>(&self, control: F) -> thread::JoinHandle<()>
    where
        F: Fn(HostWireMessage) + Send + 'static,
    {
        self.start_pump_with_error(control, |_| {})
    }

    /// Like `start_pump`, but a transport failure is reported through
    /// `on_error` after the pending calls have been failed. A deliberate
    /// local close is not an error and does not reach the callback.
    pub fn start_pump_with_error<F, E>(&self, control: F, on_error: E) -> thread::JoinHandle<()>
    where
        F: Fn(HostWireMessage) + Send + 'static,
        E: FnOnce(ChannelError) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || loop {
            if inner.closed.load(Ordering::SeqCst) {
                inner.fail_pending("registry closed");
                return;
            }
            match inner.channel.receive(PUMP_POLL_INTERVAL) {
                Ok(Some(frame)) => {
                    if let Some(message) = inner.handle_frame(&frame) {
                        control(message);
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    let was_closed = inner.closed.swap(true, Ordering::SeqCst);
                    inner.fail_pending(&err.to_string());
                    if !was_closed {
                        on_error(err);
                    }
                    return;
                }
            }
        })
    }

    /// Marks the registry closed and fails every in-flight call with
    /// `channel_closed`. Later calls fail the same way.
    pub fn close_with_pending_failures(&self, detail: &str) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.channel.close();
        self.inner.fail_pending(detail);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> &Arc<FramedChannel> {
        &self.inner.channel
    }
}

impl RegistryInner {
    fn handle_frame(&self, frame: &[u8]) -> Option<HostWireMessage> {
        let message = match protocol::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                self.diagnostics
                    .push(Diagnostic::warning(None, format!("dropped frame: {err}")));
                return None;
            }
        };

        match message {
            HostWireMessage::Request {
                id,
                target,
                method,
                args,
            } => {
                self.dispatch_request(id, &target, &method, &args);
                None
            }
            HostWireMessage::Reply { id, result, error } => {
                self.complete_reply(id, result, error);
                None
            }
            other => Some(other),
        }
    }

    fn dispatch_request(&self, id: u64, target: &str, method: &str, args: &[Value]) {
        let receiver = lock(&self.locals).get(target).cloned();
        let reply = match receiver {
            Some(receiver) => match receiver.dispatch(method, args) {
                Ok(value) => HostWireMessage::Reply {
                    id,
                    result: Some(value),
                    error: None,
                },
                Err(err) => HostWireMessage::Reply {
                    id,
                    result: None,
                    error: Some(err),
                },
            },
            None => HostWireMessage::Reply {
                id,
                result: None,
                error: Some(RemoteCallError::new(
                    UNKNOWN_REMOTE_TARGET,
                    format!("no receiver registered for target: {target}"),
                )),
            },
        };

        if let Err(err) = self.send_message(&reply) {
            self.diagnostics.push(Diagnostic::warning(
                Some(target),
                format!("send reply for request {id} failed: {err}"),
            ));
        }
    }

    fn complete_reply(&self, id: u64, result: Option<Value>, error: Option<RemoteCallError>) {
        // A reply with no waiter is stale (the caller timed out); drop it.
        let Some(waiter) = lock(&self.pending).remove(&id) else {
            return;
        };
        let outcome = match error {
            Some(err) => {
                let code = if err.code == UNKNOWN_REMOTE_TARGET {
                    BridgeErrorCode::UnknownRemoteTarget
                } else {
                    BridgeErrorCode::RemoteFault
                };
                Err(BridgeError::new(code, err.detail))
            }
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = waiter.send(outcome);
    }

    fn send_message(&self, message: &HostWireMessage) -> Result<(), BridgeError> {
        let frame = protocol::encode(message)
            .map_err(|err| BridgeError::new(BridgeErrorCode::Codec, err.to_string()))?;
        self.channel.send(&frame).map_err(|err| match err {
            ChannelError::Codec(detail) => BridgeError::new(BridgeErrorCode::Codec, detail),
            other => BridgeError::channel_closed(other.to_string()),
        })
    }

    fn fail_pending(&self, detail: &str) {
        let waiters: Vec<_> = lock(&self.pending).drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(BridgeError::channel_closed(detail)));
        }
    }
}

/// Call-capable stand-in for a receiver on the other side of the channel.
/// Every call serializes the method name and arguments into a correlated
/// request and blocks until the matching reply arrives.
pub struct RemoteHandle {
    inner: Arc<RegistryInner>,
    target: String,
}

impl RemoteHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        self.call_with_timeout(method, args, DEFAULT_CALL_TIMEOUT)
    }

    pub fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        if self.inner.closed.load(Ordering::SeqCst) || self.inner.channel.is_closed() {
            return Err(BridgeError::channel_closed(format!(
                "call to {}.{method} on a closed channel",
                self.target
            )));
        }

        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel();
        lock(&self.inner.pending).insert(id, tx);

        let request = HostWireMessage::Request {
            id,
            target: self.target.clone(),
            method: method.to_string(),
            args,
        };
        if let Err(err) = self.inner.send_message(&request) {
            lock(&self.inner.pending).remove(&id);
            return Err(err);
        }

        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.inner.pending).remove(&id);
                Err(BridgeError::new(
                    BridgeErrorCode::CallTimeout,
                    format!(
                        "no reply for {}.{method} within {}ms",
                        self.target,
                        timeout.as_millis()
                    ),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(BridgeError::channel_closed("reply channel disconnected"))
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use serde_json::json;
    use std::net::{TcpListener, TcpStream};

    fn registry_pair() -> (RemoteRegistry, RemoteRegistry, DiagnosticSink, DiagnosticSink) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");

        let a_diag = DiagnosticSink::new();
        let b_diag = DiagnosticSink::new();
        let a = RemoteRegistry::new(
            Arc::new(FramedChannel::from_stream(client, ChannelConfig::default()).expect("a")),
            a_diag.clone(),
        );
        let b = RemoteRegistry::new(
            Arc::new(FramedChannel::from_stream(server, ChannelConfig::default()).expect("b")),
            b_diag.clone(),
        );
        (a, b, a_diag, b_diag)
    }

    struct EchoReceiver;

    impl RemoteReceiver for EchoReceiver {
        fn dispatch(&self, method: &str, args: &[Value]) -> Result<Value, RemoteCallError> {
            match method {
                "echo" => Ok(args.first().cloned().unwrap_or(Value::Null)),
                "fail" => Err(RemoteCallError::new("echo_fault", "asked to fail")),
                other => Err(RemoteCallError::new(
                    "unknown_method",
                    format!("echo has no method: {other}"),
                )),
            }
        }
    }

    #[test]
    fn call_reaches_registered_receiver_and_returns_result() {
        let (a, b, _, _) = registry_pair();
        b.register_local("echo", Arc::new(EchoReceiver))
            .expect("register echo");
        let _a_pump = a.start_pump(|_| {});
        let _b_pump = b.start_pump(|_| {});

        let handle = a.remote("echo");
        let result = handle
            .call_with_timeout("echo", vec![json!("hello")], Duration::from_secs(5))
            .expect("echo call");
        assert_eq!(result, json!("hello"));
    }

    #[test]
    fn unknown_target_yields_error_not_crash() {
        let (a, b, _, _) = registry_pair();
        let _a_pump = a.start_pump(|_| {});
        let _b_pump = b.start_pump(|_| {});

        let err = a
            .remote("missing")
            .call_with_timeout("anything", Vec::new(), Duration::from_secs(5))
            .expect_err("call must fail");
        assert_eq!(err.code, BridgeErrorCode::UnknownRemoteTarget);
        assert!(err.detail.contains("missing"));
    }

    #[test]
    fn unknown_target_does_not_block_other_in_flight_calls() {
        let (a, b, _, _) = registry_pair();
        b.register_local("echo", Arc::new(EchoReceiver))
            .expect("register echo");
        let _a_pump = a.start_pump(|_| {});
        let _b_pump = b.start_pump(|_| {});

        let missing = a.remote("missing");
        let echo = a.remote("echo");

        let worker = thread::spawn(move || {
            missing.call_with_timeout("anything", Vec::new(), Duration::from_secs(5))
        });
        let result = echo
            .call_with_timeout("echo", vec![json!(1)], Duration::from_secs(5))
            .expect("echo call");
        assert_eq!(result, json!(1));

        let err = worker
            .join()
            .expect("join worker")
            .expect_err("missing target fails");
        assert_eq!(err.code, BridgeErrorCode::UnknownRemoteTarget);
    }

    #[test]
    fn receiver_error_is_reported_as_remote_fault() {
        let (a, b, _, _) = registry_pair();
        b.register_local("echo", Arc::new(EchoReceiver))
            .expect("register echo");
        let _a_pump = a.start_pump(|_| {});
        let _b_pump = b.start_pump(|_| {});

        let err = a
            .remote("echo")
            .call_with_timeout("fail", Vec::new(), Duration::from_secs(5))
            .expect_err("fail call");
        assert_eq!(err.code, BridgeErrorCode::RemoteFault);
        assert!(err.detail.contains("asked to fail"));
    }

    #[test]
    fn duplicate_receiver_id_is_rejected() {
        let (a, _b, _, _) = registry_pair();
        a.register_local("echo", Arc::new(EchoReceiver))
            .expect("first registration");
        let err = a
            .register_local("echo", Arc::new(EchoReceiver))
            .expect_err("second registration must fail");
        assert_eq!(err.code, BridgeErrorCode::DuplicateReceiver);
    }

    #[test]
    fn concurrent_calls_to_same_receiver_all_complete() {
        let (a, b, _, _) = registry_pair();
        b.register_local("echo", Arc::new(EchoReceiver))
            .expect("register echo");
        let _a_pump = a.start_pump(|_| {});
        let _b_pump = b.start_pump(|_| {});

        let mut workers = Vec::new();
        for i in 0..8u32 {
            let handle = a.remote("echo");
            workers.push(thread::spawn(move || {
                handle
                    .call_with_timeout("echo", vec![json!(i)], Duration::from_secs(5))
                    .expect("echo call")
            }));
        }
        for (i, worker) in workers.into_iter().enumerate() {
            assert_eq!(worker.join().expect("join"), json!(i as u32));
        }
    }

    #[test]
    fn close_fails_pending_calls_with_channel_closed() {
        let (a, b, _, _) = registry_pair();
        // No receiver and no pump on b: the call stays pending until closed.
        let _b = b;
        let _a_pump = a.start_pump(|_| {});

        let handle = a.remote("slow");
        let registry = a.clone();
        let worker = thread::spawn(move || {
            handle.call_with_timeout("never", Vec::new(), Duration::from_secs(10))
        });

        thread::sleep(Duration::from_millis(100));
        registry.close_with_pending_failures("shutting down");

        let err = worker
            .join()
            .expect("join worker")
            .expect_err("pending call fails");
        assert_eq!(err.code, BridgeErrorCode::ChannelClosed);
    }

    #[test]
    fn calls_after_close_fail_with_channel_closed() {
        let (a, _b, _, _) = registry_pair();
        a.close_with_pending_failures("done");
        let err = a
            .remote("echo")
            .call_with_timeout("echo", Vec::new(), Duration::from_secs(1))
            .expect_err("closed registry rejects calls");
        assert_eq!(err.code, BridgeErrorCode::ChannelClosed);
    }

    #[test]
    fn peer_disconnect_fails_pending_calls() {
        let (a, b, _, _) = registry_pair();
        let _a_pump = a.start_pump(|_| {});

        let handle = a.remote("gone");
        let worker = thread::spawn(move || {
            handle.call_with_timeout("never", Vec::new(), Duration::from_secs(10))
        });

        thread::sleep(Duration::from_millis(100));
        b.channel().close();
        drop(b);

        let err = worker
            .join()
            .expect("join worker")
            .expect_err("pending call fails on disconnect");
        assert_eq!(err.code, BridgeErrorCode::ChannelClosed);
    }

    #[test]
    fn pump_reports_transport_loss_through_the_error_callback() {
        let (a, b, _, _) = registry_pair();
        let seen: Arc<Mutex<Vec<ChannelError>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _a_pump = a.start_pump_with_error(
            |_| {},
            move |err| {
                sink.lock().expect("seen lock").push(err);
            },
        );

        b.channel().close();
        drop(b);

        for _ in 0..100 {
            if !seen.lock().expect("seen lock").is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            seen.lock().expect("seen lock").as_slice(),
            [ChannelError::Closed]
        );
    }

    #[test]
    fn deliberate_close_does_not_reach_the_error_callback() {
        let (a, _b, _, _) = registry_pair();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_pump = Arc::clone(&fired);
        let pump = a.start_pump_with_error(
            |_| {},
            move |_| {
                fired_in_pump.store(true, Ordering::SeqCst);
            },
        );

        a.close_with_pending_failures("shutting down");
        pump.join().expect("pump join");
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn control_messages_are_forwarded_not_dispatched() {
        let (a, b, _, _) = registry_pair();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _b_pump = b.start_pump(move |message| {
            sink.lock()
                .expect("seen lock")
                .push(message.kind_tag().to_string());
        });

        let frame = protocol::encode(&HostWireMessage::Shutdown).expect("encode shutdown");
        a.channel().send(&frame).expect("send shutdown");

        for _ in 0..100 {
            if !seen.lock().expect("seen lock").is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen.lock().expect("seen lock").as_slice(), ["shutdown"]);
    }

    #[test]
    fn undecodable_frame_is_reported_not_fatal() {
        let (a, b, _, b_diag) = registry_pair();
        b.register_local("echo", Arc::new(EchoReceiver))
            .expect("register echo");
        let _a_pump = a.start_pump(|_| {});
        let _b_pump = b.start_pump(|_| {});

        a.channel().send(b"not json").expect("send garbage");

        // The registry keeps serving calls after the bad frame.
        let result = a
            .remote("echo")
            .call_with_timeout("echo", vec![json!(5)], Duration::from_secs(5))
            .expect("echo call");
        assert_eq!(result, json!(5));

        for _ in 0..100 {
            if !b_diag.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let diagnostics = b_diag.snapshot();
        assert!(diagnostics
            .iter()
            .any(|d| d.text.contains("dropped frame")));
    }
}
