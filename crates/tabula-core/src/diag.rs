use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// A user-facing message collected while scanning, activating or bridging.
/// Diagnostics are values, not control flow: they are accumulated and
/// surfaced, never thrown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    #[serde(default)]
    pub source: Option<String>,
    pub text: String,
}

impl Diagnostic {
    pub fn new(severity: Severity, source: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            severity,
            source: source.map(str::to_string),
            text: text.into(),
        }
    }

    pub fn error(source: Option<&str>, text: impl Into<String>) -> Self {
        Self::new(Severity::Error, source, text)
    }

    pub fn warning(source: Option<&str>, text: impl Into<String>) -> Self {
        Self::new(Severity::Warning, source, text)
    }

    pub fn info(source: Option<&str>, text: impl Into<String>) -> Self {
        Self::new(Severity::Info, source, text)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "[{}] {}: {}", self.severity.as_tag(), source, self.text),
            None => write!(f, "[{}] {}", self.severity.as_tag(), self.text),
        }
    }
}

/// Shared collector for diagnostics produced on any thread of the host
/// process. The owner drains it and forwards messages to the UI side.
#[derive(Clone, Default)]
pub struct DiagnosticSink {
    inner: Arc<Mutex<Vec<Diagnostic>>>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, diagnostic: Diagnostic) {
        self.lock().push(diagnostic);
    }

    pub fn extend(&self, diagnostics: Vec<Diagnostic>) {
        self.lock().extend(diagnostics);
    }

    pub fn drain(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.lock())
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Diagnostic>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
