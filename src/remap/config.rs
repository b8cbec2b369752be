//! Rule file: TOML description of which keys map to what, where.
//!
//! ```toml
//! key_release = "ignore"
//!
//! [[remap]]
//! from = "C-b"
//! to = "Left"
//!
//! [[window]]
//! class_not = ["urxvt"]
//! [[window.remap]]
//! from = "C-k"
//! to = ["Shift-End", "C-x"]
//! ```

use std::io::{self, Read};
use std::path::PathBuf;

use serde::Deserialize;

use crate::keys::KeyError;

/// Path meaning "read the rule file from standard input".
pub const STDIN_PATH: &str = "-";

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid key {expression:?}: {source}")]
    Key {
        expression: String,
        source: KeyError,
    },
    #[error("invalid window name pattern: {0}")]
    Regex(#[from] regex::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What the dispatcher does with key releases of grabbed keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleasePolicy {
    /// Releases are dropped; remaps act on press only.
    #[default]
    Ignore,
    /// Releases are routed to the remap handler like presses.
    Forward,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub key_release: ReleasePolicy,
    /// Fall back to `WM_NAME` when `_NET_WM_NAME` is empty.
    #[serde(default = "default_true")]
    pub window_name_fallback: bool,
    #[serde(default, rename = "remap")]
    pub remaps: Vec<RemapEntry>,
    #[serde(default, rename = "window")]
    pub windows: Vec<WindowEntry>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemapEntry {
    /// Key expression to grab, e.g. `C-b`.
    pub from: String,
    #[serde(default)]
    pub to: OneOrMany<OutputEntry>,
    /// Shell command to launch, detached.
    pub execute: Option<String>,
}

/// An output key: a bare expression is pressed and released.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OutputEntry {
    Key(String),
    Press { press: String },
    Release { release: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowEntry {
    /// Match windows whose WM_CLASS class or instance is listed.
    #[serde(default)]
    pub class_only: OneOrMany<String>,
    /// Match windows whose WM_CLASS class and instance are not listed.
    #[serde(default)]
    pub class_not: OneOrMany<String>,
    /// Regex on the window title.
    pub name: Option<String>,
    /// Match windows owned by one of these processes (`/proc/<pid>/comm`).
    #[serde(default)]
    pub process: OneOrMany<String>,
    #[serde(default)]
    pub remap: Vec<RemapEntry>,
}

/// A single value or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(v) => vec![v],
            Self::Many(v) => v,
        }
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            Self::One(v) => std::slice::from_ref(v),
            Self::Many(v) => v,
        }
    }
}

impl Config {
    /// Load the rule file at `path`, or from stdin for `-`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let read_err = |source| ConfigError::Read {
            path: PathBuf::from(path),
            source,
        };

        let contents = if path == STDIN_PATH {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf).map_err(read_err)?;
            buf
        } else {
            std::fs::read_to_string(path).map_err(read_err)?
        };

        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }
}
