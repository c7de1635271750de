// src/config.rs

//! Runtime configuration, parsed from the `$KONTROL_*` environment.
//!
//! Values may arrive either as raw strings or JSON (the deployment tooling
//! emits both), so scalars are accepted in both spellings. Startup aborts on
//! any missing or malformed variable; nothing here is recoverable at runtime.

use crate::core::errors::KontrolError;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Annotation naming the comma-separated master list.
pub const MASTER_ANNOTATION: &str = "kontrol.unity3d.com/master";

/// The fixed HTTP endpoint port.
pub const HTTP_PORT: u16 = 8000;

/// Pod labels carried into every keepalive.
#[derive(Deserialize, Debug, Clone)]
pub struct Labels {
    pub app: String,
    pub role: String,
}

/// The set of `$KONTROL_MODE` tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mode {
    pub slave: bool,
    pub master: bool,
    pub debug: bool,
    pub verbose: bool,
    pub rpc: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub id: String,
    pub etcd: String,
    pub ip: String,
    pub labels: Labels,
    pub annotations: HashMap<String, String>,
    pub mode: Mode,
    /// Callback coalescing window, in seconds.
    pub damper: u64,
    /// Pod record TTL, in seconds. Keepalives fire every `0.75 × ttl`.
    pub ttl: u64,
    /// Failover TTL, in seconds: lock TTL, refresh cadence and watch timeout.
    pub fover: u64,
    /// Callback script, master side.
    pub callback: Option<String>,
    /// Optional JSON payload file, slave side.
    pub payload: Option<String>,
    /// RPC transport port; the listener and forwarder run when set.
    pub port: Option<u16>,
    pub namespace: String,
    /// `/kontrol/<namespace>/<app>`, the KV prefix for every key we own.
    pub prefix: String,
}

impl Config {
    /// Reads every `$KONTROL_*` variable plus `$NAMESPACE` from the process
    /// environment.
    pub fn from_env() -> Result<Self, KontrolError> {
        let mut vars: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with("KONTROL_"))
            .collect();
        if let Ok(namespace) = std::env::var("NAMESPACE") {
            vars.insert("NAMESPACE".to_string(), namespace);
        }
        for (key, value) in &vars {
            info!(" - ${} -> {}", key, value);
        }
        Self::from_map(vars)
    }

    /// Parses and validates a raw variable map. Split out of [`from_env`] so
    /// tests never have to mutate the process environment.
    pub fn from_map(vars: HashMap<String, String>) -> Result<Self, KontrolError> {
        let required = |key: &str| -> Result<String, KontrolError> {
            vars.get(key)
                .cloned()
                .ok_or_else(|| KontrolError::MissingEnv(key.to_string()))
        };

        let mode = parse_mode(&required("KONTROL_MODE")?)?;

        let mut id = required("KONTROL_ID")?;
        let mut etcd = required("KONTROL_ETCD")?;
        let mut ip = required("KONTROL_IP")?;
        let mut labels: Labels = parse_json("KONTROL_LABELS", &required("KONTROL_LABELS")?)?;
        let mut annotations: HashMap<String, String> =
            parse_json("KONTROL_ANNOTATIONS", &required("KONTROL_ANNOTATIONS")?)?;

        if mode.debug {
            // Local test drive: everything points at the loopback (or at
            // $KONTROL_HOST when the container runs behind an alias).
            let host = vars
                .get("KONTROL_HOST")
                .cloned()
                .unwrap_or_else(|| "127.0.0.1".to_string());
            debug!("switching debug mode on (host ip @ {})", host);
            etcd = host.clone();
            ip = host.clone();
            id = "local".to_string();
            labels = Labels {
                app: "test".to_string(),
                role: "test".to_string(),
            };
            annotations.insert(MASTER_ANNOTATION.to_string(), host);
        }

        if mode.slave && !annotations.contains_key(MASTER_ANNOTATION) {
            return Err(KontrolError::InvalidEnv(
                "KONTROL_ANNOTATIONS".to_string(),
                format!("\"{MASTER_ANNOTATION}\" missing"),
            ));
        }

        let namespace = required("NAMESPACE")?;
        let prefix = format!("/kontrol/{}/{}", namespace, labels.app);

        if mode.rpc && !vars.contains_key("KONTROL_PORT") {
            return Err(KontrolError::MissingEnv("KONTROL_PORT".to_string()));
        }

        Ok(Self {
            id,
            etcd,
            ip,
            mode,
            damper: parse_seconds("KONTROL_DAMPER", &required("KONTROL_DAMPER")?)?,
            ttl: parse_seconds("KONTROL_TTL", &required("KONTROL_TTL")?)?,
            fover: parse_seconds("KONTROL_FOVER", &required("KONTROL_FOVER")?)?,
            callback: vars.get("KONTROL_CALLBACK").cloned(),
            payload: vars.get("KONTROL_PAYLOAD").cloned(),
            port: match vars.get("KONTROL_PORT") {
                Some(raw) => Some(
                    raw.trim().parse::<u16>().map_err(|_| {
                        KontrolError::InvalidEnv("KONTROL_PORT".to_string(), raw.clone())
                    })?,
                ),
                None => None,
            },
            labels,
            annotations,
            namespace,
            prefix,
        })
    }

    /// The comma-separated master list out of the annotations. Empty when
    /// the annotation is absent (master-only deployments).
    pub fn masters(&self) -> Vec<String> {
        self.annotations
            .get(MASTER_ANNOTATION)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|token| !token.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn parse_mode(raw: &str) -> Result<Mode, KontrolError> {
    let mut mode = Mode::default();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token {
            "slave" => mode.slave = true,
            "master" => mode.master = true,
            "debug" => mode.debug = true,
            "verbose" => mode.verbose = true,
            "rpc" => mode.rpc = true,
            other => return Err(KontrolError::InvalidMode(other.to_string())),
        }
    }
    if mode.debug {
        mode.master = true;
        mode.slave = true;
    }
    Ok(mode)
}

/// Accepts both `30` and `"30"` (the tooling JSON-encodes some values).
fn parse_seconds(key: &str, raw: &str) -> Result<u64, KontrolError> {
    raw.trim()
        .trim_matches('"')
        .parse::<u64>()
        .map_err(|_| KontrolError::InvalidEnv(key.to_string(), raw.to_string()))
}

fn parse_json<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, KontrolError> {
    serde_json::from_str(raw).map_err(|e| KontrolError::InvalidEnv(key.to_string(), e.to_string()))
}
