//! Coordination store client
//!
//! [`KvStore`] is the minimal primitive set the rest of the system is built
//! from: get, set-with-TTL, create-if-absent, compare-and-swap,
//! compare-and-delete and delete-subtree. [`EtcdStore`] implements it against
//! the etcd v2 keys API over plain HTTP.

use crate::common::{Error, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Percent-encoding set for store keys placed in URL paths. Slashes stay;
/// they are the key hierarchy.
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'%')
    .add(b'?')
    .add(b'#')
    .add(b'&');

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One stored key as observed by a get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// Full key path
    pub key: String,
    /// Raw value
    pub value: String,
    /// Remaining lease in seconds, if the key carries one
    pub ttl: Option<i64>,
}

impl KvEntry {
    /// Last path segment of the key; the repositories key their maps by it.
    pub fn leaf(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Async coordination-store contract.
///
/// Object-safe so components hold an `Arc<dyn KvStore>` and tests inject
/// [`crate::store::MemoryStore`].
pub trait KvStore: Send + Sync + 'static {
    /// Read `key`; with `recursive` the entries below it.
    fn get<'a>(&'a self, key: &'a str, recursive: bool) -> BoxFuture<'a, Result<Vec<KvEntry>>>;

    /// Write `key`, replacing any previous value, with an optional lease.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<u64>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Write `key` only if it does not exist; `Error::KeyExists` otherwise.
    fn create<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<u64>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Replace `key` only while its current value equals `prev_value`,
    /// refreshing the lease; `Error::CompareFailed` otherwise.
    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        prev_value: &'a str,
        value: &'a str,
        ttl: Option<u64>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Delete `key` only while its current value equals `prev_value`;
    /// `Error::CompareFailed` otherwise.
    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        prev_value: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    /// Delete `key`; with `recursive` the whole subtree.
    fn delete<'a>(&'a self, key: &'a str, recursive: bool) -> BoxFuture<'a, Result<()>>;
}

// etcd v2 error codes
const CODE_KEY_NOT_FOUND: u64 = 100;
const CODE_COMPARE_FAILED: u64 = 101;
const CODE_NODE_EXIST: u64 = 105;

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: Option<String>,
    value: Option<String>,
    ttl: Option<i64>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    node: EtcdNode,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
    message: String,
}

/// etcd v2 keys-API client.
pub struct EtcdStore {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl EtcdStore {
    pub fn new(endpoints: Vec<String>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::InvalidConfig("no store endpoints".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
        })
    }

    fn url(&self, endpoint: &str, key: &str) -> String {
        let encoded = utf8_percent_encode(key, KEY_ENCODE_SET);
        format!("{}/v2/keys{}", endpoint, encoded)
    }

    /// Run `build` against each endpoint until one answers; connection-level
    /// failures rotate to the next endpoint, anything else surfaces.
    async fn request(
        &self,
        build: impl Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut last_err: Option<Error> = None;
        for endpoint in &self.endpoints {
            match build(&self.client, endpoint).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    tracing::debug!("store endpoint {} unreachable: {}", endpoint, e);
                    last_err = Some(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Store("no endpoints".into())))
    }

    async fn decode_error(key: &str, resp: reqwest::Response) -> Error {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<EtcdErrorBody>(&body) {
            Ok(err) => match err.error_code {
                CODE_KEY_NOT_FOUND => Error::KeyNotFound(key.to_string()),
                CODE_COMPARE_FAILED => Error::CompareFailed(key.to_string()),
                CODE_NODE_EXIST => Error::KeyExists(key.to_string()),
                code => Error::Store(format!("{}: code {} ({})", key, code, err.message)),
            },
            Err(_) => Error::Store(format!("{}: status {}", key, status)),
        }
    }

    fn flatten(node: EtcdNode, out: &mut Vec<KvEntry>) {
        if node.dir {
            for child in node.nodes {
                Self::flatten(child, out);
            }
        } else if let (Some(key), Some(value)) = (node.key, node.value) {
            out.push(KvEntry {
                key,
                value,
                ttl: node.ttl,
            });
        }
    }

    async fn read(&self, key: &str, recursive: bool) -> Result<Vec<KvEntry>> {
        let resp = self
            .request(|client, ep| {
                client
                    .get(self.url(ep, key))
                    .query(&[("recursive", if recursive { "true" } else { "false" })])
            })
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(key, resp).await);
        }
        let parsed: EtcdResponse = resp.json().await?;
        let mut entries = Vec::new();
        Self::flatten(parsed.node, &mut entries);
        Ok(entries)
    }

    async fn put(&self, key: &str, form: Vec<(&'static str, String)>) -> Result<()> {
        let resp = self
            .request(|client, ep| client.put(self.url(ep, key)).form(&form))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(key, resp).await);
        }
        Ok(())
    }

    async fn remove(&self, key: &str, query: Vec<(&'static str, String)>) -> Result<()> {
        let resp = self
            .request(|client, ep| client.delete(self.url(ep, key)).query(&query))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::decode_error(key, resp).await);
        }
        Ok(())
    }
}

impl KvStore for EtcdStore {
    fn get<'a>(&'a self, key: &'a str, recursive: bool) -> BoxFuture<'a, Result<Vec<KvEntry>>> {
        Box::pin(self.read(key, recursive))
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<u64>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut form = vec![("value", value.to_string())];
            if let Some(ttl) = ttl {
                form.push(("ttl", ttl.to_string()));
            }
            self.put(key, form).await
        })
    }

    fn create<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Option<u64>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut form = vec![
                ("value", value.to_string()),
                ("prevExist", "false".to_string()),
            ];
            if let Some(ttl) = ttl {
                form.push(("ttl", ttl.to_string()));
            }
            self.put(key, form).await
        })
    }

    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        prev_value: &'a str,
        value: &'a str,
        ttl: Option<u64>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut form = vec![
                ("value", value.to_string()),
                ("prevValue", prev_value.to_string()),
            ];
            if let Some(ttl) = ttl {
                form.push(("ttl", ttl.to_string()));
            }
            self.put(key, form).await
        })
    }

    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        prev_value: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.remove(key, vec![("prevValue", prev_value.to_string())]))
    }

    fn delete<'a>(&'a self, key: &'a str, recursive: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if recursive {
                self.remove(key, vec![("recursive", "true".to_string())]).await
            } else {
                self.remove(key, vec![]).await
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf() {
        let entry = KvEntry {
            key: "/services/dbarray/states/abc-123".to_string(),
            value: "{}".to_string(),
            ttl: None,
        };
        assert_eq!(entry.leaf(), "abc-123");
    }

    #[test]
    fn test_url_keeps_hierarchy() {
        let store = EtcdStore::new(vec!["http://127.0.0.1:2379/".to_string()]).unwrap();
        let url = store.url("http://127.0.0.1:2379", "/services/dbarray/states/a b");
        assert_eq!(url, "http://127.0.0.1:2379/v2/keys/services/dbarray/states/a%20b");
    }

    #[test]
    fn test_error_body_decoding() {
        let body = r#"{"errorCode":100,"message":"Key not found","cause":"/x","index":12}"#;
        let err: EtcdErrorBody = serde_json::from_str(body).unwrap();
        assert_eq!(err.error_code, 100);
    }

    #[test]
    fn test_flatten_directory_listing() {
        let body = r#"{
            "action": "get",
            "node": {
                "key": "/services/dbarray/announcements",
                "dir": true,
                "nodes": [
                    {"key": "/services/dbarray/announcements/a", "value": "1", "ttl": 4},
                    {"key": "/services/dbarray/announcements/b", "value": "2"}
                ]
            }
        }"#;
        let parsed: EtcdResponse = serde_json::from_str(body).unwrap();
        let mut entries = Vec::new();
        EtcdStore::flatten(parsed.node, &mut entries);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].leaf(), "a");
        assert_eq!(entries[0].ttl, Some(4));
        assert_eq!(entries[1].ttl, None);
    }

    #[test]
    fn test_empty_endpoints_rejected() {
        assert!(EtcdStore::new(vec![]).is_err());
    }
}
