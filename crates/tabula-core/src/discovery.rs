use crate::diag::Diagnostic;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAME: &str = "plugin.json";
pub const WILDCARD_ACTIVATION_EVENT: &str = "*";
pub const WORKSPACE_CONTAINS_PREFIX: &str = "workspaceContains:";

/// Where a descriptor came from. Precedence is encoded in `rank`, not in
/// scan order, so concurrent scanning of the three roots would produce the
/// same merge result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginSource {
    Builtin,
    UserInstall,
    Development,
}

impl PluginSource {
    pub const fn rank(self) -> u8 {
        match self {
            Self::Builtin => 0,
            Self::UserInstall => 1,
            Self::Development => 2,
        }
    }

    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::UserInstall => "user_install",
            Self::Development => "development",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub activation_events: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Immutable record of one discovered plugin. Never mutated after
/// publication; a later-scanned higher-precedence source supersedes it
/// wholesale.
#[derive(Clone, Debug, PartialEq)]
pub struct PluginDescriptor {
    pub id: String,
    pub install_path: PathBuf,
    pub source: PluginSource,
    pub manifest: PluginManifest,
}

impl PluginDescriptor {
    pub fn declares_wildcard(&self) -> bool {
        self.manifest
            .activation_events
            .iter()
            .any(|event| event == WILDCARD_ACTIVATION_EVENT)
    }

    /// Relative file names named by `workspaceContains:` activation events.
    pub fn workspace_contains_files(&self) -> impl Iterator<Item = &str> {
        self.manifest
            .activation_events
            .iter()
            .filter_map(|event| event.strip_prefix(WORKSPACE_CONTAINS_PREFIX))
    }
}

#[derive(Clone, Debug)]
pub struct ScanRoots {
    pub builtin: PathBuf,
    pub user_install: Option<PathBuf>,
    pub development: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanResult {
    pub plugins: Vec<PluginDescriptor>,
    pub messages: Vec<Diagnostic>,
}

/// Scans the well-known plugin locations and merges descriptors by id with
/// precedence builtin < user-install < development. Per-manifest failures
/// become diagnostics and exclude only that manifest; only an unreadable
/// builtin root fails the scan as a whole.
pub fn scan(host_version: &str, roots: &ScanRoots) -> Result<ScanResult> {
    let mut merged: HashMap<String, PluginDescriptor> = HashMap::new();
    let mut messages = Vec::new();

    let builtin = scan_plugin_collection(&roots.builtin, PluginSource::Builtin, &mut messages)
        .with_context(|| format!("scan builtin plugins at {}", roots.builtin.display()))?;
    merge_descriptors(&mut merged, builtin, &mut messages);

    if let Some(user_root) = &roots.user_install {
        match scan_plugin_collection(user_root, PluginSource::UserInstall, &mut messages) {
            Ok(found) => merge_descriptors(&mut merged, found, &mut messages),
            Err(err) => messages.push(Diagnostic::error(
                None,
                format!("scan user plugins at {} failed: {err:#}", user_root.display()),
            )),
        }
    }

    if let Some(dev_root) = &roots.development {
        match scan_development_root(dev_root, &mut messages) {
            Ok(found) => {
                for descriptor in &found {
                    messages.push(Diagnostic::info(
                        Some(&descriptor.id),
                        format!(
                            "loading development plugin from {} (host {host_version})",
                            descriptor.install_path.display()
                        ),
                    ));
                }
                merge_descriptors(&mut merged, found, &mut messages);
            }
            Err(err) => messages.push(Diagnostic::error(
                None,
                format!(
                    "scan development plugins at {} failed: {err:#}",
                    dev_root.display()
                ),
            )),
        }
    }

    let mut plugins: Vec<PluginDescriptor> = merged.into_values().collect();
    plugins.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(ScanResult { plugins, messages })
}

fn merge_descriptors(
    merged: &mut HashMap<String, PluginDescriptor>,
    incoming: Vec<PluginDescriptor>,
    messages: &mut Vec<Diagnostic>,
) {
    for descriptor in incoming {
        match merged.get(&descriptor.id) {
            Some(existing) if descriptor.source.rank() < existing.source.rank() => {
                messages.push(Diagnostic::warning(
                    Some(&descriptor.id),
                    format!(
                        "plugin at {} ignored: lower precedence than the copy at {}",
                        descriptor.install_path.display(),
                        existing.install_path.display()
                    ),
                ));
            }
            Some(existing) => {
                messages.push(Diagnostic::warning(
                    Some(&descriptor.id),
                    format!(
                        "plugin at {} overrides the copy at {}",
                        descriptor.install_path.display(),
                        existing.install_path.display()
                    ),
                ));
                merged.insert(descriptor.id.clone(), descriptor);
            }
            None => {
                merged.insert(descriptor.id.clone(), descriptor);
            }
        }
    }
}

/// Scans the immediate subdirectories of `root` for manifests.
fn scan_plugin_collection(
    root: &Path,
    source: PluginSource,
    messages: &mut Vec<Diagnostic>,
) -> Result<Vec<PluginDescriptor>> {
    let entries = fs::read_dir(root).with_context(|| "read plugin directory")?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                messages.push(Diagnostic::warning(
                    None,
                    format!("skipping unreadable entry under {}: {err}", root.display()),
                ));
                continue;
            }
        };
        let path = entry.path();
        if !path.is_dir() || !path.join(MANIFEST_FILE_NAME).is_file() {
            continue;
        }
        match load_manifest(&path, source, messages) {
            Ok(descriptor) => found.push(descriptor),
            Err(diagnostic) => messages.push(diagnostic),
        }
    }
    Ok(found)
}

/// Development mode accepts either one manifest at the given path or
/// multiple manifests in its immediate subdirectories.
fn scan_development_root(
    root: &Path,
    messages: &mut Vec<Diagnostic>,
) -> Result<Vec<PluginDescriptor>> {
    if root.join(MANIFEST_FILE_NAME).is_file() {
        return match load_manifest(root, PluginSource::Development, messages) {
            Ok(descriptor) => Ok(vec![descriptor]),
            Err(diagnostic) => {
                messages.push(diagnostic);
                Ok(Vec::new())
            }
        };
    }
    scan_plugin_collection(root, PluginSource::Development, messages)
}

fn load_manifest(
    dir: &Path,
    source: PluginSource,
    messages: &mut Vec<Diagnostic>,
) -> Result<PluginDescriptor, Diagnostic> {
    let path = dir.join(MANIFEST_FILE_NAME);
    let raw = fs::read_to_string(&path).map_err(|err| {
        Diagnostic::error(None, format!("read manifest {} failed: {err}", path.display()))
    })?;

    let stripped = strip_json_comments(&raw);
    let manifest: PluginManifest = serde_json::from_str(&stripped).map_err(|err| {
        Diagnostic::error(None, format!("parse manifest {} failed: {err}", path.display()))
    })?;

    if manifest.name.trim().is_empty() {
        return Err(Diagnostic::error(
            None,
            format!("manifest {} is missing a plugin name", path.display()),
        ));
    }

    for event in &manifest.activation_events {
        if event != WILDCARD_ACTIVATION_EVENT && !event.starts_with(WORKSPACE_CONTAINS_PREFIX) {
            messages.push(Diagnostic::warning(
                Some(&manifest.name),
                format!("unrecognized activation event will never fire: {event}"),
            ));
        }
    }

    Ok(PluginDescriptor {
        id: manifest.name.clone(),
        install_path: dir.to_path_buf(),
        source,
        manifest,
    })
}

/// Removes `//` and `/* */` comments outside of string literals so manifests
/// written by hand may carry annotations.
pub fn strip_json_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' => match chars.peek() {
                Some('/') => {
                    while let Some(&next) = chars.peek() {
                        if next == '\n' {
                            break;
                        }
                        chars.next();
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for next in chars.by_ref() {
                        if prev == '*' && next == '/' {
                            break;
                        }
                        prev = next;
                    }
                    out.push(' ');
                }
                _ => out.push(c),
            },
            _ => out.push(c),
        }
    }
    out
}
