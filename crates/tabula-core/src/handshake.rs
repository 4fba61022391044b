use crate::channel::{ChannelConfig, ChannelError, FramedChannel};
use crate::diag::{Diagnostic, DiagnosticSink};
use crate::protocol::{self, HostInitData, HostWireMessage};
use crate::remoting::RemoteRegistry;
use std::fmt;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Environment variable carrying the connection hook for the shared process
/// channel, set by the parent before it spawns this host.
pub const SHARED_PROCESS_HOOK_ENV: &str = "TABULA_SHARED_PROCESS_HOOK";

pub const PARENT_LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakePhase {
    AwaitingInit,
    ChannelsEstablishing,
    Ready,
    Terminated,
}

impl HandshakePhase {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::AwaitingInit => "awaiting_init",
            Self::ChannelsEstablishing => "channels_establishing",
            Self::Ready => "ready",
            Self::Terminated => "terminated",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::AwaitingInit,
            1 => Self::ChannelsEstablishing,
            2 => Self::Ready,
            _ => Self::Terminated,
        }
    }
}

/// Shared phase marker. Termination wins exactly once no matter how many
/// threads race to report it.
#[derive(Clone)]
struct PhaseCell {
    value: Arc<AtomicU8>,
}

impl PhaseCell {
    fn new() -> Self {
        Self {
            value: Arc::new(AtomicU8::new(HandshakePhase::AwaitingInit as u8)),
        }
    }

    fn set(&self, phase: HandshakePhase) {
        self.value.store(phase as u8, Ordering::SeqCst);
    }

    fn get(&self) -> HandshakePhase {
        HandshakePhase::from_u8(self.value.load(Ordering::SeqCst))
    }

    /// Returns true for the one caller that actually performed the switch.
    fn terminate_once(&self) -> bool {
        self.value
            .swap(HandshakePhase::Terminated as u8, Ordering::SeqCst)
            != HandshakePhase::Terminated as u8
    }

    /// Moves `from` to `to` only if nothing else intervened. Terminated is
    /// absorbing: once set, no advance can undo it.
    fn advance(&self, from: HandshakePhase, to: HandshakePhase) -> bool {
        self.value
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    Channel(ChannelError),
    Protocol(String),
    SharedProcess(String),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(err) => write!(f, "handshake channel error: {err}"),
            Self::Protocol(detail) => write!(f, "handshake protocol error: {detail}"),
            Self::SharedProcess(detail) => {
                write!(f, "shared process connection failed: {detail}")
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<ChannelError> for HandshakeError {
    fn from(err: ChannelError) -> Self {
        Self::Channel(err)
    }
}

/// Opens the second channel of the host, the one to the shared services
/// process. Abstracted so the handshake can be driven in-process by tests.
pub trait SharedProcessConnector {
    fn connect(&self, hook: &str) -> Result<Arc<FramedChannel>, HandshakeError>;
}

/// Production connector: the hook is a TCP address published by the parent.
pub struct TcpSharedProcessConnector {
    pub config: ChannelConfig,
}

impl SharedProcessConnector for TcpSharedProcessConnector {
    fn connect(&self, hook: &str) -> Result<Arc<FramedChannel>, HandshakeError> {
        let stream = TcpStream::connect(hook)
            .map_err(|err| HandshakeError::SharedProcess(format!("connect to {hook}: {err}")))?;
        let channel = FramedChannel::from_stream(stream, self.config)
            .map_err(HandshakeError::Channel)?;
        Ok(Arc::new(channel))
    }
}

#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    true
}

type AliveProbe = Box<dyn Fn(u32) -> bool + Send>;
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Drives the startup protocol of the host process: announce readiness, wait
/// for the parent's init payload, wire both channels, then report initialized.
pub struct HostHandshake {
    parent_channel: Arc<FramedChannel>,
    diagnostics: DiagnosticSink,
    probe: AliveProbe,
    exit: ExitHook,
    liveness_interval: Duration,
}

impl HostHandshake {
    pub fn new(parent_channel: Arc<FramedChannel>, diagnostics: DiagnosticSink) -> Self {
        Self {
            parent_channel,
            diagnostics,
            probe: Box::new(pid_is_alive),
            exit: Arc::new(|code| std::process::exit(code)),
            liveness_interval: PARENT_LIVENESS_INTERVAL,
        }
    }

    pub fn with_probe(mut self, probe: impl Fn(u32) -> bool + Send + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_exit(mut self, exit: ExitHook) -> Self {
        self.exit = exit;
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Runs the handshake to completion. Blocks until the parent delivers its
    /// init payload and the shared process channel is wired.
    pub fn establish(
        self,
        connector: &dyn SharedProcessConnector,
        shared_hook: &str,
    ) -> Result<EstablishedHost, HandshakeError> {
        let phase = PhaseCell::new();

        // Readiness goes out before any configuration exists on this side.
        let frame = protocol::encode(&HostWireMessage::Ready)?;
        self.parent_channel.send(&frame)?;

        let init = self.await_init_data()?;
        phase.set(HandshakePhase::ChannelsEstablishing);

        let parent = RemoteRegistry::new(
            Arc::clone(&self.parent_channel),
            self.diagnostics.clone(),
        );
        let shared_channel = connector.connect(shared_hook)?;
        let shared = RemoteRegistry::new(shared_channel, self.diagnostics.clone());

        let guard = TerminationGuard {
            phase: phase.clone(),
            parent: parent.clone(),
            shared: shared.clone(),
            exit: Arc::clone(&self.exit),
            diagnostics: self.diagnostics.clone(),
        };

        let control_guard = guard.clone();
        let control_diag = self.diagnostics.clone();
        let failure_guard = guard.clone();
        parent.start_pump_with_error(
            move |message| match message {
                HostWireMessage::Shutdown => {
                    control_guard.terminate(0, "parent requested shutdown");
                }
                other => control_diag.push(Diagnostic::warning(
                    None,
                    format!(
                        "unexpected control message on parent channel: {}",
                        other.kind_tag()
                    ),
                )),
            },
            // Losing the parent channel is unrecoverable for the host.
            move |err| {
                failure_guard.terminate(1, &format!("parent channel failed: {err}"));
            },
        );

        let shared_diag = self.diagnostics.clone();
        shared.start_pump(move |message| {
            shared_diag.push(Diagnostic::warning(
                None,
                format!("unexpected control message on shared channel: {}", message.kind_tag()),
            ));
        });

        let frame = protocol::encode(&HostWireMessage::Initialized)?;
        parent
            .channel()
            .send(&frame)
            .map_err(HandshakeError::from)?;
        phase.advance(HandshakePhase::ChannelsEstablishing, HandshakePhase::Ready);

        spawn_liveness_watch(
            init.parent_pid,
            self.probe,
            self.liveness_interval,
            guard.clone(),
        );

        Ok(EstablishedHost {
            init,
            parent,
            shared,
            guard,
        })
    }

    /// The first substantive message must be the init payload; anything else
    /// is a protocol violation.
    fn await_init_data(&self) -> Result<HostInitData, HandshakeError> {
        loop {
            let Some(frame) = self.parent_channel.receive(INIT_POLL_INTERVAL)? else {
                continue;
            };
            let message = protocol::decode(&frame)?;
            match message {
                HostWireMessage::InitData { init } => return Ok(init),
                other => {
                    return Err(HandshakeError::Protocol(format!(
                        "expected init_data, received: {}",
                        other.kind_tag()
                    )))
                }
            }
        }
    }
}

fn spawn_liveness_watch(
    parent_pid: u32,
    probe: AliveProbe,
    interval: Duration,
    guard: TerminationGuard,
) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if guard.phase() == HandshakePhase::Terminated {
            return;
        }
        if !probe(parent_pid) {
            guard.terminate(0, "parent process is gone");
            return;
        }
    });
}

/// Tears the host down exactly once: both registries fail their pending calls
/// with channel_closed, then the exit hook runs.
#[derive(Clone)]
pub struct TerminationGuard {
    phase: PhaseCell,
    parent: RemoteRegistry,
    shared: RemoteRegistry,
    exit: ExitHook,
    diagnostics: DiagnosticSink,
}

impl TerminationGuard {
    pub fn phase(&self) -> HandshakePhase {
        self.phase.get()
    }

    pub fn terminate(&self, code: i32, reason: &str) {
        if !self.phase.terminate_once() {
            return;
        }
        self.diagnostics
            .push(Diagnostic::info(None, format!("terminating host: {reason}")));
        self.parent.close_with_pending_failures(reason);
        self.shared.close_with_pending_failures(reason);
        (self.exit)(code);
    }
}

/// A fully wired host: init payload, both registries, and the guard that
/// owns teardown.
pub struct EstablishedHost {
    pub init: HostInitData,
    pub parent: RemoteRegistry,
    pub shared: RemoteRegistry,
    guard: TerminationGuard,
}

impl EstablishedHost {
    pub fn phase(&self) -> HandshakePhase {
        self.guard.phase()
    }

    pub fn guard(&self) -> TerminationGuard {
        self.guard.clone()
    }

    pub fn terminate(&self, code: i32, reason: &str) {
        self.guard.terminate(code, reason);
    }
}

/// Converts plugin panics into reports on stderr. A fault in one plugin is
/// surfaced, never treated as fatal to the host.
pub fn install_fault_reporter() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        eprintln!("extension host fault: {info}");
        previous(info);
    }));
}
