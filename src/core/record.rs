// src/core/record.rs

//! The pod record published under `/<prefix>/pods/<key>` and carried by the
//! keepalive PUT body.

use serde::{Deserialize, Serialize};

fn is_false(v: &bool) -> bool {
    !v
}

/// One reporting pod. Fields are declared in canonical order so that
/// `serde_json::to_string` yields the exact JSON hashed by the leader's
/// membership digest: two identical memberships always serialize identically.
///
/// `seq` is absent on the wire until the sequencer assigns it; `down` is
/// present only on the final keepalive of a pod going away.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PodRecord {
    pub app: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub down: bool,
    pub id: String,
    pub ip: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}
