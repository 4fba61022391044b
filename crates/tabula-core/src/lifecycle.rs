use crate::diag::{Diagnostic, DiagnosticSink};
use crate::discovery::{self, ScanResult, ScanRoots, WILDCARD_ACTIVATION_EVENT, WORKSPACE_CONTAINS_PREFIX};
use crate::handshake::ExitHook;
use crate::protocol::HostInitData;
use crate::registry::PluginRegistry;
use crate::remoting::RemoteHandle;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// How long a finished test run may keep flushing output before the process
/// exits.
pub const TEST_RUN_EXIT_GRACE: Duration = Duration::from_millis(800);

pub const INVALID_TEST_RUNNER: &str = "does not point to a valid extension test runner";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationError {
    pub event: String,
    pub detail: String,
}

impl fmt::Display for ActivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "activation for {} failed: {}", self.event, self.detail)
    }
}

impl std::error::Error for ActivationError {}

/// Triggers plugin activation for one event string. Activation is idempotent
/// per event on the far side; the driver additionally never sends the same
/// event twice.
pub trait PluginActivator: Send + Sync {
    fn activate_by_event(&self, event: &str) -> Result<(), ActivationError>;
}

/// Production activator: forwards activation over the parent channel to the
/// side that owns the plugin code.
pub struct RemoteActivator {
    handle: RemoteHandle,
}

impl RemoteActivator {
    pub fn new(handle: RemoteHandle) -> Self {
        Self { handle }
    }
}

impl PluginActivator for RemoteActivator {
    fn activate_by_event(&self, event: &str) -> Result<(), ActivationError> {
        self.handle
            .call("activate_by_event", vec![Value::String(event.to_string())])
            .map(|_| ())
            .map_err(|err| ActivationError {
                event: event.to_string(),
                detail: err.to_string(),
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestRunnerError {
    pub detail: String,
}

impl fmt::Display for TestRunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.detail)
    }
}

impl std::error::Error for TestRunnerError {}

/// A loaded test runner. `run` reports completion through `done` exactly once.
pub trait PluginTestRunner: Send {
    fn run(&mut self, development_path: &Path, done: Box<dyn FnOnce(Result<(), String>) + Send>);
}

/// Resolves a configured tests path to a runnable test runner.
pub trait TestRunnerLoader {
    fn load(&self, tests_path: &Path) -> Result<Box<dyn PluginTestRunner>, TestRunnerError>;
}

/// Production loader: the tests path must be an executable file. It is run as
/// a child process with the development path as its only argument.
pub struct ProcessTestRunnerLoader;

impl TestRunnerLoader for ProcessTestRunnerLoader {
    fn load(&self, tests_path: &Path) -> Result<Box<dyn PluginTestRunner>, TestRunnerError> {
        let metadata = std::fs::metadata(tests_path).map_err(|err| TestRunnerError {
            detail: format!("{} {INVALID_TEST_RUNNER}: {err}", tests_path.display()),
        })?;
        if !metadata.is_file() {
            return Err(TestRunnerError {
                detail: format!("{} {INVALID_TEST_RUNNER}: not a file", tests_path.display()),
            });
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(TestRunnerError {
                    detail: format!(
                        "{} {INVALID_TEST_RUNNER}: not executable",
                        tests_path.display()
                    ),
                });
            }
        }
        Ok(Box::new(ProcessTestRunner {
            program: tests_path.to_path_buf(),
        }))
    }
}

struct ProcessTestRunner {
    program: PathBuf,
}

impl PluginTestRunner for ProcessTestRunner {
    fn run(&mut self, development_path: &Path, done: Box<dyn FnOnce(Result<(), String>) + Send>) {
        let outcome = Command::new(&self.program)
            .arg(development_path)
            .status()
            .map_err(|err| format!("spawn {} failed: {err}", self.program.display()))
            .and_then(|status| {
                if status.success() {
                    Ok(())
                } else {
                    Err(format!("test runner reported failure: {status}"))
                }
            });
        done(outcome);
    }
}

/// Runs the staged startup sequence of the host: discover plugins, publish
/// the registry, activate eager plugins, and in test mode run the configured
/// test runner and exit with its verdict.
pub struct LifecycleDriver {
    host_version: String,
    diagnostics: DiagnosticSink,
    activator: std::sync::Arc<dyn PluginActivator>,
    runner_loader: Box<dyn TestRunnerLoader>,
    exit: ExitHook,
    exit_grace: Duration,
}

impl LifecycleDriver {
    pub fn new(
        host_version: impl Into<String>,
        diagnostics: DiagnosticSink,
        activator: std::sync::Arc<dyn PluginActivator>,
        exit: ExitHook,
    ) -> Self {
        Self {
            host_version: host_version.into(),
            diagnostics,
            activator,
            runner_loader: Box::new(ProcessTestRunnerLoader),
            exit,
            exit_grace: TEST_RUN_EXIT_GRACE,
        }
    }

    pub fn with_runner_loader(mut self, loader: Box<dyn TestRunnerLoader>) -> Self {
        self.runner_loader = loader;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn run(&self, init: &HostInitData, registry: &PluginRegistry) {
        let scan = self.discover(init);
        self.register(registry, scan);
        self.activate_eagerly(init, registry);
        self.maybe_run_tests(init);
    }

    fn discover(&self, init: &HostInitData) -> ScanResult {
        let roots = ScanRoots {
            builtin: init.environment.builtin_plugins_path.clone(),
            user_install: init.environment.user_plugins_path.clone(),
            development: init.environment.plugin_development_path.clone(),
        };
        match discovery::scan(&self.host_version, &roots) {
            Ok(scan) => scan,
            Err(err) => {
                self.diagnostics
                    .push(Diagnostic::error(None, format!("plugin scan failed: {err:#}")));
                ScanResult::default()
            }
        }
    }

    fn register(&self, registry: &PluginRegistry, scan: ScanResult) {
        if let Err(err) = registry.register_plugins(scan.plugins) {
            self.diagnostics
                .push(Diagnostic::error(None, err.to_string()));
            return;
        }
        registry.registration_done(scan.messages);
    }

    /// Wildcard plugins first, then plugins whose watched workspace file is
    /// actually present. File probes run in parallel; each satisfied event is
    /// activated once even when several probes resolve it.
    fn activate_eagerly(&self, init: &HostInitData, registry: &PluginRegistry) {
        let mut activated: HashSet<String> = HashSet::new();

        // The wildcard request always goes out; with no declaring plugin it
        // is a no-op on the far side.
        self.activate_once(WILDCARD_ACTIVATION_EVENT, &mut activated);

        let Some(workspace) = &init.workspace else {
            return;
        };
        let files = registry.workspace_contains_files();
        if files.is_empty() {
            return;
        }

        let (tx, rx) = mpsc::channel();
        for file in files {
            let tx = tx.clone();
            let candidate = workspace.root.join(&file);
            thread::spawn(move || {
                let present = candidate.exists();
                let _ = tx.send((file, present));
            });
        }
        drop(tx);

        for (file, present) in rx {
            if !present {
                continue;
            }
            let event = format!("{WORKSPACE_CONTAINS_PREFIX}{file}");
            self.activate_once(&event, &mut activated);
        }
    }

    fn activate_once(&self, event: &str, activated: &mut HashSet<String>) {
        if !activated.insert(event.to_string()) {
            return;
        }
        if let Err(err) = self.activator.activate_by_event(event) {
            self.diagnostics
                .push(Diagnostic::error(None, err.to_string()));
        }
    }

    /// Test mode needs both a tests path and a development path. The run's
    /// verdict becomes the process exit code after a short output grace.
    fn maybe_run_tests(&self, init: &HostInitData) {
        let (Some(tests_path), Some(dev_path)) = (
            &init.environment.plugin_tests_path,
            &init.environment.plugin_development_path,
        ) else {
            return;
        };

        let mut runner = match self.runner_loader.load(tests_path) {
            Ok(runner) => runner,
            Err(err) => {
                self.diagnostics
                    .push(Diagnostic::error(None, err.to_string()));
                (self.exit)(1);
                return;
            }
        };

        let (tx, rx) = mpsc::channel();
        runner.run(
            dev_path,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        let outcome = rx.recv().unwrap_or_else(|_| {
            Err("test runner dropped its completion callback".to_string())
        });

        let code = match outcome {
            Ok(()) => 0,
            Err(detail) => {
                self.diagnostics
                    .push(Diagnostic::error(None, format!("test run failed: {detail}")));
                1
            }
        };
        thread::sleep(self.exit_grace);
        (self.exit)(code);
    }
}
