//! Tool permission evaluation and filesystem path validation.
//!
//! Every tool belongs to a fixed [`ToolCategory`]. Before the agent loop
//! executes a tool call, [`PermissionManager::check`] consults that category,
//! any persisted always/deny rules the user has previously set, and — for
//! filesystem tools — [`PathValidator`] to reject path traversal and access
//! to sensitive files.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Fixed classification every tool is assigned at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Read-only, no side effects (e.g. `read_file`, `glob`, `grep`).
    Safe,
    /// Has side effects but is low-risk; prompts the user once per rule.
    Ask,
    /// Makes outbound network calls.
    Network,
    /// Can modify or delete local state (e.g. `write_file`, `bash`).
    Dangerous,
}

impl ToolCategory {
    /// Whether this category is allowed to run without consulting any
    /// persisted rule at all.
    pub fn always_allowed(&self) -> bool {
        matches!(self, ToolCategory::Safe)
    }
}

/// The outcome of evaluating a tool call against the permission manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny,
    /// No persisted rule covers this call; the caller must ask the user.
    Ask,
}

/// A persisted allow/deny rule scoped to a tool name.
///
/// Rules persist across runs in a JSON file under the session's config
/// directory so a user is not re-prompted for a tool they've already
/// approved or rejected outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub tool_name: String,
    pub allow: bool,
}

/// Evaluates and persists tool permission decisions.
///
/// Holds the fixed category for every registered tool name plus the set of
/// always/deny rules the user has made permanent. All state is behind a
/// single [`RwLock`] — contention is not a concern since permission checks
/// happen once per tool call, never in a hot loop.
pub struct PermissionManager {
    categories: HashMap<String, ToolCategory>,
    rules: RwLock<HashMap<String, bool>>,
    rules_path: Option<PathBuf>,
}

impl PermissionManager {
    /// Creates a manager with no persisted rules file; rules only live for
    /// the lifetime of the process.
    pub fn new() -> Self {
        Self {
            categories: HashMap::new(),
            rules: RwLock::new(HashMap::new()),
            rules_path: None,
        }
    }

    /// Creates a manager that persists rules to `path`, loading any existing
    /// rules from it immediately.
    pub fn with_rules_file(path: impl Into<PathBuf>) -> Result<Self> {
        let rules_path = path.into();
        let mut rules = HashMap::new();

        if rules_path.exists() {
            let data = std::fs::read_to_string(&rules_path)
                .map_err(|e| Error::config(format!("failed to read permission rules: {e}")))?;
            let parsed: Vec<PermissionRule> = serde_json::from_str(&data)
                .map_err(|e| Error::config(format!("failed to parse permission rules: {e}")))?;
            for rule in parsed {
                rules.insert(rule.tool_name, rule.allow);
            }
        }

        Ok(Self {
            categories: HashMap::new(),
            rules: RwLock::new(rules),
            rules_path: Some(rules_path),
        })
    }

    /// Registers the fixed category for a tool. Tools not registered default
    /// to [`ToolCategory::Ask`] when checked.
    pub fn register(&mut self, tool_name: impl Into<String>, category: ToolCategory) {
        self.categories.insert(tool_name.into(), category);
    }

    /// Evaluates whether `tool_name` may run right now.
    ///
    /// Order of evaluation:
    /// 1. Category is [`ToolCategory::Safe`] → always [`PermissionDecision::Allow`].
    /// 2. A persisted rule exists → [`PermissionDecision::Allow`] or [`PermissionDecision::Deny`]
    ///    per the rule.
    /// 3. No rule and category is not Safe → [`PermissionDecision::Ask`], leaving the
    ///    caller to prompt the user and call [`PermissionManager::remember`] with
    ///    the outcome.
    pub fn check(&self, tool_name: &str) -> PermissionDecision {
        let category = self
            .categories
            .get(tool_name)
            .copied()
            .unwrap_or(ToolCategory::Ask);

        if category.always_allowed() {
            return PermissionDecision::Allow;
        }

        let rules = self.rules.read().expect("permission rules lock poisoned");
        match rules.get(tool_name) {
            Some(true) => PermissionDecision::Allow,
            Some(false) => PermissionDecision::Deny,
            None => PermissionDecision::Ask,
        }
    }

    /// Records a user's always-allow or always-deny decision for `tool_name`
    /// and persists it to the rules file if one is configured.
    pub fn remember(&self, tool_name: impl Into<String>, allow: bool) -> Result<()> {
        let tool_name = tool_name.into();
        {
            let mut rules = self.rules.write().expect("permission rules lock poisoned");
            rules.insert(tool_name, allow);
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.rules_path else {
            return Ok(());
        };

        let rules = self.rules.read().expect("permission rules lock poisoned");
        let serialized: Vec<PermissionRule> = rules
            .iter()
            .map(|(tool_name, allow)| PermissionRule {
                tool_name: tool_name.clone(),
                allow: *allow,
            })
            .collect();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::config(format!("failed to create config dir: {e}")))?;
        }
        let data = serde_json::to_string_pretty(&serialized)?;
        std::fs::write(path, data)
            .map_err(|e| Error::config(format!("failed to write permission rules: {e}")))?;
        Ok(())
    }
}

impl Default for PermissionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Substrings that identify a protected file regardless of how the path to
/// it is spelled.
const PROTECTED_SUBSTRINGS: &[&str] = &[".ssh", ".aws", ".gnupg", "credentials", ".netrc"];

/// Validates filesystem paths requested by tools against a project root.
///
/// Resolves symlinks and `..` components before checking, so a path that
/// *looks* contained but resolves outside the root (via a symlink, or a
/// `..` sequence) is still rejected.
pub struct PathValidator {
    root: PathBuf,
}

impl PathValidator {
    /// Creates a validator rooted at `root`. `root` is canonicalized
    /// immediately so later comparisons are apples-to-apples.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(|e| Error::invalid_input(format!("invalid project root: {e}")))?;
        Ok(Self { root })
    }

    /// Validates `requested` (which may be relative to the root or already
    /// absolute) and returns its canonical, guaranteed-contained form.
    ///
    /// Rejects:
    /// - paths that escape the root after resolving `..` and symlinks
    /// - paths containing any [`PROTECTED_SUBSTRINGS`] entry
    pub fn validate(&self, requested: impl AsRef<Path>) -> Result<PathBuf> {
        let requested = requested.as_ref();
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let lossy = candidate.to_string_lossy().to_lowercase();
        if PROTECTED_SUBSTRINGS.iter().any(|s| lossy.contains(s)) {
            return Err(Error::invalid_input(format!(
                "access to protected path denied: {}",
                candidate.display()
            )));
        }

        let resolved = resolve_lexically(&candidate);
        if !resolved.starts_with(&self.root) {
            return Err(Error::invalid_input(format!(
                "path escapes project root: {}",
                requested.display()
            )));
        }

        // Canonicalize for real if the path exists (catches symlink escapes);
        // a not-yet-created file (e.g. about to be written) is validated
        // lexically only, since canonicalize() requires existence.
        if let Ok(canon) = resolved.canonicalize() {
            if !canon.starts_with(&self.root) {
                return Err(Error::invalid_input(format!(
                    "path escapes project root via symlink: {}",
                    requested.display()
                )));
            }
            return Ok(canon);
        }

        Ok(resolved)
    }
}

/// Resolves `..` and `.` components without touching the filesystem, so it
/// works for paths that don't exist yet.
fn resolve_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
