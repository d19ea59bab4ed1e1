use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use filefate_core::FileFlags;

use crate::error::FileError;

/// What a run does after a per-file failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    Abort,
    /// Continue only past config and missingok files.
    #[default]
    Default,
    Continue,
}

impl ErrorPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Default => "default",
            Self::Continue => "continue",
        }
    }

    pub(crate) fn continues_install(self, flags: FileFlags, error: &FileError) -> bool {
        if error.is_storage_full() {
            return false;
        }
        match self {
            Self::Abort => false,
            Self::Continue => true,
            Self::Default => flags.config || flags.missingok,
        }
    }

    pub(crate) fn continues_erase(self, error: &FileError) -> bool {
        self != Self::Abort && !error.is_storage_full()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunOptions {
    pub error_policy: ErrorPolicy,
    pub verify_digests: bool,
    pub exclude_docs: bool,
    #[serde(skip)]
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::Default,
            verify_digests: true,
            exclude_docs: false,
            cancel: None,
        }
    }
}

impl RunOptions {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse run policy TOML")
    }

    /// Loads a policy file, falling back to defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw)
                .with_context(|| format!("invalid run policy: {}", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read run policy: {}", path.display()))
            }
        }
    }

    pub fn with_cancel(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|token| token.load(Ordering::Relaxed))
    }
}
