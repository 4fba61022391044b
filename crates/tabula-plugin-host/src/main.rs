use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tabula_core::channel::{ChannelConfig, FramedChannel};
use tabula_core::diag::DiagnosticSink;
use tabula_core::handshake::{
    install_fault_reporter, HostHandshake, TcpSharedProcessConnector, SHARED_PROCESS_HOOK_ENV,
};
use tabula_core::lifecycle::{LifecycleDriver, RemoteActivator};
use tabula_core::registry::PluginRegistry;

const DIAGNOSTIC_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    install_fault_reporter();

    let Ok(shared_hook) = std::env::var(SHARED_PROCESS_HOOK_ENV) else {
        eprintln!("{SHARED_PROCESS_HOOK_ENV} is not set; this process must be spawned by the editor");
        return ExitCode::FAILURE;
    };

    let diagnostics = DiagnosticSink::new();

    // stdout belongs to the parent channel; every human-readable message
    // goes to stderr.
    let parent_channel = Arc::new(FramedChannel::new(
        io::stdin(),
        io::stdout(),
        ChannelConfig::default(),
    ));

    let connector = TcpSharedProcessConnector {
        config: ChannelConfig::default(),
    };
    let host = match HostHandshake::new(Arc::clone(&parent_channel), diagnostics.clone())
        .establish(&connector, &shared_hook)
    {
        Ok(host) => host,
        Err(err) => {
            eprintln!("extension host startup failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let registry = PluginRegistry::new();
    registry.on_registration_done(|done| {
        eprintln!("registered {} plugins", done.plugin_count);
        for message in &done.messages {
            eprintln!("{message}");
        }
    });

    let activator = Arc::new(RemoteActivator::new(host.parent.remote("plugin_activation")));
    let guard = host.guard();
    let diagnostics_at_exit = diagnostics.clone();
    let exit = Arc::new(move |code: i32| {
        for diagnostic in diagnostics_at_exit.drain() {
            eprintln!("{diagnostic}");
        }
        guard.terminate(code, "lifecycle requested exit");
    });
    LifecycleDriver::new(env!("CARGO_PKG_VERSION"), diagnostics.clone(), activator, exit)
        .run(&host.init, &registry);

    // The handshake threads own the session from here; this loop only
    // surfaces diagnostics until the guard exits the process.
    loop {
        thread::sleep(DIAGNOSTIC_FLUSH_INTERVAL);
        for warning in parent_channel.drain_traffic_warnings() {
            eprintln!("{warning}");
        }
        for warning in host.shared.channel().drain_traffic_warnings() {
            eprintln!("{warning}");
        }
        for diagnostic in diagnostics.drain() {
            eprintln!("{diagnostic}");
        }
    }
}
