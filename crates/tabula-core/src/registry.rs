use crate::diag::Diagnostic;
use crate::discovery::PluginDescriptor;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    AlreadyPublished,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyPublished => write!(f, "plugin registry was already published"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Summary handed to registration listeners once the scan settles.
#[derive(Clone, Debug)]
pub struct RegistrationDone {
    pub plugin_count: usize,
    pub messages: Vec<Diagnostic>,
}

type RegistrationListener = Box<dyn FnMut(&RegistrationDone) + Send>;

#[derive(Default)]
struct RegistryState {
    plugins: Vec<PluginDescriptor>,
    published: bool,
    listeners: Vec<RegistrationListener>,
}

/// Write-once collection of the plugins known to this host process. The
/// registry is created empty, populated exactly once after discovery, and
/// shared by reference with every consumer afterwards.
#[derive(Default)]
pub struct PluginRegistry {
    inner: Mutex<RegistryState>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the discovered set. A second call is a logic error and is
    /// rejected without mutating the registry.
    pub fn register_plugins(&self, plugins: Vec<PluginDescriptor>) -> Result<(), RegistryError> {
        let mut state = self.lock();
        if state.published {
            return Err(RegistryError::AlreadyPublished);
        }
        state.plugins = plugins;
        state.published = true;
        Ok(())
    }

    /// Notifies every listener that registration settled. Listeners run
    /// outside the registry lock so they may query it freely.
    pub fn registration_done(&self, messages: Vec<Diagnostic>) {
        let (mut listeners, done) = {
            let mut state = self.lock();
            let done = RegistrationDone {
                plugin_count: state.plugins.len(),
                messages,
            };
            (std::mem::take(&mut state.listeners), done)
        };
        for listener in &mut listeners {
            listener(&done);
        }
        self.lock().listeners.extend(listeners);
    }

    pub fn on_registration_done(&self, listener: impl FnMut(&RegistrationDone) + Send + 'static) {
        self.lock().listeners.push(Box::new(listener));
    }

    pub fn is_published(&self) -> bool {
        self.lock().published
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.lock().plugins.clone()
    }

    pub fn descriptor(&self, id: &str) -> Option<PluginDescriptor> {
        self.lock().plugins.iter().find(|p| p.id == id).cloned()
    }

    pub fn plugin_count(&self) -> usize {
        self.lock().plugins.len()
    }

    /// Distinct relative file names any registered plugin watches for via
    /// `workspaceContains:` events.
    pub fn workspace_contains_files(&self) -> BTreeSet<String> {
        self.lock()
            .plugins
            .iter()
            .flat_map(|p| {
                p.workspace_contains_files()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Plugin ids whose manifest declares the given activation event.
    pub fn ids_for_event(&self, event: &str) -> Vec<String> {
        self.lock()
            .plugins
            .iter()
            .filter(|p| p.manifest.activation_events.iter().any(|e| e == event))
            .map(|p| p.id.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
