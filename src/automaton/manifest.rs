// src/automaton/manifest.rs

//! The automaton manifest: a YAML document describing the states, their
//! shell snippets and the permitted transitions. A second, "plugin" form
//! names python functions instead of shell snippets; the loader synthesises
//! an equivalent shell per state that imports and calls the function.

use crate::core::errors::KontrolError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Deserialize, Debug)]
struct RawManifest {
    initial: String,
    terminal: String,
    /// Python module backing the plugin form; required when any state names
    /// a `func` instead of carrying a `shell`.
    module: Option<String>,
    states: Vec<RawState>,
}

#[derive(Deserialize, Debug)]
struct RawState {
    tag: String,
    shell: Option<String>,
    func: Option<String>,
    next: Option<Vec<String>>,
}

/// One validated state: its shell snippet plus the glob patterns naming the
/// transitions permitted from it.
#[derive(Debug, Clone)]
pub struct StateDef {
    pub tag: String,
    pub shell: String,
    pub next: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub initial: String,
    pub terminal: String,
    pub states: HashMap<String, StateDef>,
}

impl Manifest {
    /// Loads and validates a manifest file.
    pub fn load(path: &Path) -> Result<Self, KontrolError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, KontrolError> {
        let raw: RawManifest = serde_yaml::from_str(raw)
            .map_err(|e| KontrolError::InvalidManifest(e.to_string()))?;

        if raw.states.is_empty() {
            return Err(KontrolError::InvalidManifest(
                "you need to specify at least one state".to_string(),
            ));
        }

        let mut states = HashMap::new();
        for state in raw.states {
            if state.tag.is_empty() {
                return Err(KontrolError::InvalidManifest("empty state tag".to_string()));
            }
            let shell = match (state.shell, &state.func) {
                (Some(shell), None) => shell,
                (None, Some(func)) => {
                    let module = raw.module.as_deref().ok_or_else(|| {
                        KontrolError::InvalidManifest(format!(
                            "state \"{}\" names a func but the manifest has no module",
                            state.tag
                        ))
                    })?;
                    wrap_function(module, func)
                }
                _ => {
                    return Err(KontrolError::InvalidManifest(format!(
                        "state \"{}\" must carry exactly one of shell/func",
                        state.tag
                    )));
                }
            };
            let next = state.next.unwrap_or_default();
            if next.iter().any(String::is_empty) {
                return Err(KontrolError::InvalidManifest(format!(
                    "state \"{}\" has an empty transition pattern",
                    state.tag
                )));
            }
            if states
                .insert(
                    state.tag.clone(),
                    StateDef {
                        tag: state.tag.clone(),
                        shell,
                        next,
                    },
                )
                .is_some()
            {
                return Err(KontrolError::InvalidManifest(format!(
                    "duplicate state \"{}\"",
                    state.tag
                )));
            }
        }

        for tag in [&raw.initial, &raw.terminal] {
            if !states.contains_key(tag) {
                return Err(KontrolError::InvalidManifest(format!(
                    "unknown state \"{tag}\""
                )));
            }
        }

        Ok(Self {
            initial: raw.initial,
            terminal: raw.terminal,
            states,
        })
    }
}

/// Synthesises the shell snippet for a plugin state: spawn an interpreter,
/// import the named function and call it, passing $INPUT through when the
/// function takes one argument.
fn wrap_function(module: &str, func: &str) -> String {
    format!(
        r#"python - <<-EOF
import inspect
import os
from {module} import {func}
spec = inspect.getfullargspec({func})
if len(spec.args) == 1:
    {func}(os.environ.get('INPUT'))
else:
    {func}()
EOF
"#
    )
}
