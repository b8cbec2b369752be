//! Rule-driven remap handler built from a [`Config`].

use std::collections::BTreeSet;
use std::io;
use std::process::{Command, Stdio};

use regex::Regex;

use super::config::{Config, OutputEntry, RemapEntry, WindowEntry};
use super::{ConfigError, KeyAction, ReleasePolicy, RemapDecision, RemapError, RemapHandler};
use crate::keys::{Direction, KeyIdentity, expression};
use crate::window::WindowInfo;

/// Process name lookup, `/proc/<pid>/comm` in production.
pub type ProcessLookup = fn(u32) -> Option<String>;

/// Launcher for `execute` rules.
pub type Launcher = fn(&str) -> io::Result<()>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Output {
    Key(KeyAction),
    Execute(String),
}

#[derive(Debug, Clone)]
struct Remap {
    from: KeyIdentity,
    outputs: Vec<Output>,
}

#[derive(Debug)]
struct WindowMatcher {
    class_only: Vec<String>,
    class_not: Vec<String>,
    name: Option<Regex>,
    process: Vec<String>,
}

impl WindowMatcher {
    fn matches(&self, window: &WindowInfo, process_name: ProcessLookup) -> bool {
        if !self.class_only.is_empty() && !self.class_only.iter().any(|c| window.has_class(c)) {
            return false;
        }
        if self.class_not.iter().any(|c| window.has_class(c)) {
            return false;
        }
        if let Some(re) = &self.name {
            match &window.name {
                Some(name) if re.is_match(name) => {}
                _ => return false,
            }
        }
        if !self.process.is_empty() {
            let comm = window.pid.and_then(process_name);
            match comm {
                Some(comm) if self.process.contains(&comm) => {}
                _ => return false,
            }
        }
        true
    }
}

pub struct RuleHandler {
    global: Vec<Remap>,
    windows: Vec<(WindowMatcher, Vec<Remap>)>,
    release: ReleasePolicy,
    process_name: ProcessLookup,
    launcher: Launcher,
}

impl RuleHandler {
    /// Compile every key expression and pattern in `config`.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let global = compile_remaps(&config.remaps)?;
        let windows = config
            .windows
            .iter()
            .map(|entry| Ok((compile_matcher(entry)?, compile_remaps(&entry.remap)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        tracing::info!(
            global = global.len(),
            window_blocks = windows.len(),
            "rules loaded"
        );

        Ok(Self {
            global,
            windows,
            release: config.key_release,
            process_name: proc_comm,
            launcher: spawn_detached,
        })
    }

    pub fn with_process_lookup(mut self, lookup: ProcessLookup) -> Self {
        self.process_name = lookup;
        self
    }

    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Remaps active for `window`, window-scoped ones first.
    fn active<'a>(&'a self, window: &'a WindowInfo) -> impl Iterator<Item = &'a Remap> + 'a {
        self.windows
            .iter()
            .filter(move |(matcher, _)| matcher.matches(window, self.process_name))
            .flat_map(|(_, remaps)| remaps.iter())
            .chain(self.global.iter())
    }

    /// The remap for `key`: an exact match first, then an `Any-` rule on
    /// the same keysym.
    fn find<'a>(&'a self, key: &KeyIdentity, window: &'a WindowInfo) -> Option<&'a Remap> {
        self.active(window)
            .find(|remap| remap.from == *key)
            .or_else(|| {
                self.active(window).find(|remap| {
                    remap.from.modifiers.is_any() && remap.from.keysym == key.keysym
                })
            })
    }

    fn run(&self, remap: &Remap) -> Result<RemapDecision, RemapError> {
        let mut decision = RemapDecision::swallow();
        for output in &remap.outputs {
            match output {
                Output::Key(action) => decision.push(*action),
                Output::Execute(command) => {
                    tracing::info!(command, "executing");
                    (self.launcher)(command).map_err(|e| {
                        RemapError::Handler(format!("failed to execute {command:?}: {e}"))
                    })?;
                }
            }
        }
        Ok(decision)
    }
}

impl RemapHandler for RuleHandler {
    fn grabs_for(&self, window: &WindowInfo) -> BTreeSet<KeyIdentity> {
        self.active(window).map(|remap| remap.from).collect()
    }

    fn handle_key(
        &mut self,
        key: &KeyIdentity,
        direction: Direction,
        window: &WindowInfo,
    ) -> Result<RemapDecision, RemapError> {
        match self.find(key, window) {
            Some(remap) => match direction {
                Direction::Press => {
                    tracing::debug!(%key, "remap matched");
                    self.run(remap)
                }
                Direction::Release => Ok(RemapDecision::swallow()),
            },
            None => {
                // Grabbed for some other window; hand it back unchanged.
                tracing::debug!(%key, %direction, "no rule, passing through");
                Ok(match self.release {
                    ReleasePolicy::Ignore => RemapDecision::tap(*key),
                    ReleasePolicy::Forward => RemapDecision {
                        actions: vec![KeyAction {
                            key: *key,
                            direction,
                        }],
                    },
                })
            }
        }
    }

    fn handle_property_change(&mut self, window: &WindowInfo) -> Result<(), RemapError> {
        tracing::trace!(
            class = window.class.as_deref().unwrap_or(""),
            name = window.name.as_deref().unwrap_or(""),
            "window changed"
        );
        Ok(())
    }

    fn handle_mapping_change(&mut self) -> Result<(), RemapError> {
        Ok(())
    }
}

fn parse_key(expression: &str) -> Result<KeyIdentity, ConfigError> {
    expression::parse(expression).map_err(|source| ConfigError::Key {
        expression: expression.to_string(),
        source,
    })
}

fn compile_remaps(entries: &[RemapEntry]) -> Result<Vec<Remap>, ConfigError> {
    entries.iter().map(compile_remap).collect()
}

fn compile_remap(entry: &RemapEntry) -> Result<Remap, ConfigError> {
    let from = parse_key(&entry.from)?;

    let mut outputs = Vec::new();
    for output in entry.to.as_slice() {
        match output {
            OutputEntry::Key(exp) => {
                let key = parse_key(exp)?;
                outputs.push(Output::Key(KeyAction::press(key)));
                outputs.push(Output::Key(KeyAction::release(key)));
            }
            OutputEntry::Press { press } => {
                outputs.push(Output::Key(KeyAction::press(parse_key(press)?)));
            }
            OutputEntry::Release { release } => {
                outputs.push(Output::Key(KeyAction::release(parse_key(release)?)));
            }
        }
    }
    if let Some(command) = &entry.execute {
        outputs.push(Output::Execute(command.clone()));
    }

    if outputs.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "remap from {:?} has neither `to` nor `execute`",
            entry.from
        )));
    }
    Ok(Remap { from, outputs })
}

fn compile_matcher(entry: &WindowEntry) -> Result<WindowMatcher, ConfigError> {
    let matcher = WindowMatcher {
        class_only: entry.class_only.as_slice().to_vec(),
        class_not: entry.class_not.as_slice().to_vec(),
        name: entry.name.as_deref().map(Regex::new).transpose()?,
        process: entry.process.as_slice().to_vec(),
    };

    if matcher.class_only.is_empty()
        && matcher.class_not.is_empty()
        && matcher.name.is_none()
        && matcher.process.is_empty()
    {
        return Err(ConfigError::Invalid(
            "window block needs class_only, class_not, name or process".into(),
        ));
    }
    Ok(matcher)
}

fn proc_comm(pid: u32) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    Some(comm.trim_end().to_string())
}

/// Run `command` through the shell, detached from this process.
///
/// The outer shell backgrounds a `nohup` child and exits immediately;
/// only its status is waited for, so no zombies are left behind.
fn spawn_detached(command: &str) -> io::Result<()> {
    let script = format!(
        "nohup /bin/sh -c {} >/dev/null 2>&1 &",
        shell_quote(command)
    );
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;

    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("shell exited with {status}")))
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
