// src/core/store/etcd.rs

//! A thin adapter over the etcd v2 keys API.
//!
//! Only the handful of verbs the actors use are mapped. Watches ride on the
//! `?wait=true` long poll with a client-side timeout, which etcd reports as a
//! plain request timeout; that is surfaced as [`KvError::WatchTimeout`] and
//! treated as benign by the leader.

use super::{KvError, KvNode, KvStore};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const ETCD_PORT: u16 = 2379;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize, Debug)]
struct EtcdResponse {
    node: Option<EtcdNode>,
}

#[derive(Deserialize, Debug)]
struct EtcdNode {
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    nodes: Option<Vec<EtcdNode>>,
    #[serde(rename = "createdIndex")]
    created_index: Option<u64>,
}

pub struct EtcdStore {
    client: reqwest::Client,
    base: String,
}

impl EtcdStore {
    /// Points the adapter at a single etcd host (port 2379).
    pub fn new(host: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("http://{host}:{ETCD_PORT}/v2/keys"),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}{}", self.base, key)
    }

    fn collect_leaves(node: &EtcdNode, out: &mut Vec<KvNode>) {
        if node.dir {
            if let Some(children) = &node.nodes {
                for child in children {
                    Self::collect_leaves(child, out);
                }
            }
        } else if let (Some(key), Some(value)) = (&node.key, &node.value) {
            out.push(KvNode {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }

    async fn form_put(&self, key: &str, form: &[(&str, String)]) -> Result<StatusCode, KvError> {
        let resp = self
            .client
            .put(self.url(key))
            .timeout(REQUEST_TIMEOUT)
            .form(form)
            .send()
            .await
            .map_err(|e| KvError::Store(e.to_string()))?;
        Ok(resp.status())
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl.as_secs().to_string()));
        }
        let status = self.form_put(key, &form).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(KvError::Store(format!("PUT {key} -> {status}")))
        }
    }

    async fn append(
        &self,
        dir: &str,
        stem: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<String, KvError> {
        // etcd's in-order POST only mints numeric children, so the unique
        // index is drawn from a POST under `<dir>/_seq` and the lock key is
        // then written as `<stem>-<index>`. Uniqueness of the index is what
        // keeps the two-step append race-free.
        let resp = self
            .client
            .post(self.url(&format!("{dir}/_seq")))
            .timeout(REQUEST_TIMEOUT)
            .form(&[("value", ""), ("ttl", "60")])
            .send()
            .await
            .map_err(|e| KvError::Store(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(KvError::Store(format!("POST {dir}/_seq -> {}", resp.status())));
        }
        let body: EtcdResponse = resp
            .json()
            .await
            .map_err(|e| KvError::Store(e.to_string()))?;
        let index = body
            .node
            .and_then(|node| node.created_index)
            .ok_or_else(|| KvError::Store("append reply missing createdIndex".to_string()))?;

        let key = format!("{}/{}-{:020}", dir.trim_end_matches('/'), stem, index);
        self.put(&key, value, ttl).await?;
        Ok(key)
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let form = vec![
            ("ttl", ttl.as_secs().to_string()),
            ("refresh", "true".to_string()),
            ("prevExist", "true".to_string()),
        ];
        let status = self.form_put(key, &form).await?;
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(KvError::NotFound)
        } else {
            Err(KvError::Store(format!("refresh {key} -> {status}")))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let resp = self
            .client
            .get(self.url(key))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| KvError::Store(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(KvError::Store(format!("GET {key} -> {}", resp.status())));
        }
        let body: EtcdResponse = resp
            .json()
            .await
            .map_err(|e| KvError::Store(e.to_string()))?;
        Ok(body.node.and_then(|node| node.value))
    }

    async fn list(&self, dir: &str) -> Result<Vec<KvNode>, KvError> {
        let resp = self
            .client
            .get(format!("{}?recursive=true", self.url(dir)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| KvError::Store(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(KvError::Store(format!("GET {dir} -> {}", resp.status())));
        }
        let body: EtcdResponse = resp
            .json()
            .await
            .map_err(|e| KvError::Store(e.to_string()))?;
        let mut out = Vec::new();
        if let Some(node) = &body.node {
            Self::collect_leaves(node, &mut out);
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let resp = self
            .client
            .delete(self.url(key))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| KvError::Store(e.to_string()))?;
        debug!("DELETE {} -> {}", key, resp.status());
        Ok(())
    }

    async fn watch(&self, key: &str, timeout: Duration) -> Result<(), KvError> {
        let resp = self
            .client
            .get(format!("{}?wait=true", self.url(key)))
            .timeout(timeout)
            .send()
            .await;
        match resp {
            Ok(_) => Ok(()),
            Err(e) if e.is_timeout() => Err(KvError::WatchTimeout),
            Err(e) => Err(KvError::Store(e.to_string())),
        }
    }
}
