//! etcd v2 keys API client
//!
//! Talks to `/v2/keys` over HTTP and maps etcd error bodies onto
//! [`MsgFilterError`] so that "key not found" and "key already exists" can be
//! told apart from transport failures.

use std::time::Duration;

use async_trait::async_trait;
use msgfilter_common::{MsgFilterError, Result};
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::client::KvStore;
use crate::model::{KvRead, KvRecord, WatchAction, WatchEvent};

/// etcd error code: key not found
pub const ERROR_CODE_KEY_NOT_FOUND: i64 = 100;

/// etcd error code: key already exists (prevExist=false failed)
pub const ERROR_CODE_NODE_EXIST: i64 = 105;

const KEYS_PATH: [&str; 2] = ["v2", "keys"];

/// Response header carrying the cluster's current index
const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

/// Configuration for the etcd client
#[derive(Clone, Debug)]
pub struct EtcdConfig {
    /// Base endpoint, e.g. `http://127.0.0.1:2379`
    pub endpoint: String,
    /// Timeout for get/create/delete; watches are never timed out
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoint: msgfilter_common::DEFAULT_ETCD_ENDPOINT.to_string(),
            request_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl EtcdConfig {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Successful etcd keys API response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdResponse {
    action: String,
    #[serde(default)]
    node: Option<KvRecord>,
    #[serde(default)]
    prev_node: Option<KvRecord>,
    /// Taken from the `X-Etcd-Index` header, not the body
    #[serde(skip)]
    etcd_index: Option<u64>,
}

/// etcd error body, e.g. `{"errorCode":100,"message":"Key not found",...}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
}

/// Store client backed by an etcd v2 cluster
pub struct EtcdKvStore {
    client: Client,
    base: Url,
    config: EtcdConfig,
}

impl EtcdKvStore {
    pub fn new(config: EtcdConfig) -> Result<Self> {
        let base = Url::parse(&config.endpoint).map_err(|e| {
            MsgFilterError::ConfigError(format!(
                "invalid etcd endpoint {}: {}",
                config.endpoint, e
            ))
        })?;
        if base.cannot_be_a_base() {
            return Err(MsgFilterError::ConfigError(format!(
                "invalid etcd endpoint {}",
                config.endpoint
            )));
        }

        // No client-wide timeout: watches are long polls
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| MsgFilterError::InternalError(e.to_string()))?;

        Ok(Self {
            client,
            base,
            config,
        })
    }

    /// Build `/v2/keys/<key>` with every key segment percent-encoded
    fn key_url(&self, key: &str) -> Result<Url> {
        if key.is_empty() {
            return Err(MsgFilterError::InvalidKey(key.to_string()));
        }

        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                MsgFilterError::ConfigError(format!("invalid etcd endpoint {}", self.base))
            })?;
            segments.pop_if_empty().extend(KEYS_PATH);
            segments.extend(key.trim_start_matches('/').split('/'));
        }
        Ok(url)
    }

    async fn execute(&self, request: RequestBuilder, key: &str) -> Result<Option<EtcdResponse>> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let index = etcd_index(response.headers());
        let body = response.bytes().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(decode_error(status, &body, key));
        }
        // etcd may close an idle watch with an empty body
        if body.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice::<EtcdResponse>(&body)
            .map(|response| {
                Some(EtcdResponse {
                    etcd_index: index,
                    ..response
                })
            })
            .map_err(|e| MsgFilterError::Store {
                code: i64::from(status.as_u16()),
                message: format!("malformed etcd response: {}", e),
            })
    }

    /// Execute and return the response node with the `X-Etcd-Index` header
    async fn execute_node(
        &self,
        request: RequestBuilder,
        key: &str,
    ) -> Result<(KvRecord, Option<u64>)> {
        self.execute(request, key)
            .await?
            .and_then(|response| response.node.map(|node| (node, response.etcd_index)))
            .ok_or_else(|| MsgFilterError::Store {
                code: 0,
                message: format!("etcd response for {} carried no node", key),
            })
    }
}

fn etcd_index(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(ETCD_INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn transport_error(e: reqwest::Error) -> MsgFilterError {
    MsgFilterError::StoreUnavailable(e.to_string())
}

/// Map a non-2xx etcd response onto the error taxonomy
fn decode_error(status: StatusCode, body: &[u8], key: &str) -> MsgFilterError {
    match serde_json::from_slice::<EtcdErrorBody>(body) {
        Ok(error) => match error.error_code {
            ERROR_CODE_KEY_NOT_FOUND => MsgFilterError::NotFound(key.to_string()),
            ERROR_CODE_NODE_EXIST => MsgFilterError::AlreadyExists(key.to_string()),
            code => MsgFilterError::Store {
                code,
                message: if error.cause.is_empty() {
                    error.message
                } else {
                    format!("{} ({})", error.message, error.cause)
                },
            },
        },
        Err(_) if status.is_server_error() => {
            MsgFilterError::StoreUnavailable(format!("etcd returned HTTP {}", status))
        }
        Err(_) => MsgFilterError::Store {
            code: i64::from(status.as_u16()),
            message: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

fn into_event(response: EtcdResponse, key: &str) -> WatchEvent {
    let action = WatchAction::from(response.action);
    match response.node.or(response.prev_node) {
        Some(node) => WatchEvent::new(action, node),
        None => WatchEvent {
            action,
            key: key.to_string(),
            index: 0,
            record: None,
        },
    }
}

#[async_trait]
impl KvStore for EtcdKvStore {
    async fn get(&self, key: &str) -> Result<KvRead> {
        let url = self.key_url(key)?;
        let request = self.client.get(url).timeout(self.config.request_timeout);
        let (record, index) = self.execute_node(request, key).await?;

        // Without the header the record's own index is the best lower bound
        if index.is_none() {
            debug!(key = %key, "etcd response carried no {} header", ETCD_INDEX_HEADER);
        }
        Ok(KvRead::new(record, index.unwrap_or_default()))
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<KvRecord> {
        let url = self.key_url(key)?;
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = ttl.filter(|ttl| !ttl.is_zero()) {
            form.push(("ttl", ttl.as_secs().max(1).to_string()));
        }

        let request = self
            .client
            .put(url)
            .query(&[("prevExist", "false")])
            .form(&form)
            .timeout(self.config.request_timeout);
        let (record, _) = self.execute_node(request, key).await?;
        debug!(key = %key, index = record.modified_index, "Created key");
        Ok(record)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.key_url(key)?;
        let request = self.client.delete(url).timeout(self.config.request_timeout);
        self.execute(request, key).await.map(|_| ())
    }

    async fn watch_after(&self, key: &str, after_index: u64) -> Result<WatchEvent> {
        let url = self.key_url(key)?;
        let wait_index = (after_index + 1).to_string();

        loop {
            let request = self
                .client
                .get(url.clone())
                .query(&[("wait", "true"), ("waitIndex", wait_index.as_str())]);
            match self.execute(request, key).await? {
                Some(response) => return Ok(into_event(response, key)),
                None => {
                    warn!(key = %key, "etcd closed watch without an event, re-watching");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: &str) -> EtcdKvStore {
        EtcdKvStore::new(EtcdConfig::new(endpoint)).unwrap()
    }

    #[test]
    fn test_key_url() {
        let store = store("http://127.0.0.1:2379");
        assert_eq!(
            store.key_url("/lock/hello").unwrap().as_str(),
            "http://127.0.0.1:2379/v2/keys/lock/hello"
        );
    }

    #[test]
    fn test_key_url_encodes_payload() {
        let store = store("http://127.0.0.1:2379/");
        assert_eq!(
            store.key_url("/data/a b?c#d").unwrap().as_str(),
            "http://127.0.0.1:2379/v2/keys/data/a%20b%3Fc%23d"
        );
    }

    #[test]
    fn test_key_url_rejects_empty_key() {
        let store = store("http://127.0.0.1:2379");
        assert!(matches!(
            store.key_url(""),
            Err(MsgFilterError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_invalid_endpoint() {
        let result = EtcdKvStore::new(EtcdConfig::new("not a url"));
        assert!(matches!(result, Err(MsgFilterError::ConfigError(_))));
    }

    #[test]
    fn test_decode_not_found() {
        let body = br#"{"errorCode":100,"message":"Key not found","cause":"/data/x","index":12}"#;
        assert_eq!(
            decode_error(StatusCode::NOT_FOUND, body, "/data/x"),
            MsgFilterError::NotFound("/data/x".to_string())
        );
    }

    #[test]
    fn test_decode_node_exist() {
        let body =
            br#"{"errorCode":105,"message":"Key already exists","cause":"/lock/x","index":3}"#;
        assert_eq!(
            decode_error(StatusCode::PRECONDITION_FAILED, body, "/lock/x"),
            MsgFilterError::AlreadyExists("/lock/x".to_string())
        );
    }

    #[test]
    fn test_decode_other_etcd_error() {
        let body = br#"{"errorCode":401,"message":"The event in requested index is outdated and cleared","cause":"the requested history has been cleared [5/1]","index":1005}"#;
        let err = decode_error(StatusCode::BAD_REQUEST, body, "/lock/x");
        assert!(matches!(err, MsgFilterError::Store { code: 401, .. }));
        assert!(err.is_history_cleared());
    }

    #[test]
    fn test_decode_unparseable_bodies() {
        assert!(matches!(
            decode_error(StatusCode::BAD_GATEWAY, b"<html>", "/k"),
            MsgFilterError::StoreUnavailable(_)
        ));
        assert_eq!(
            decode_error(StatusCode::FORBIDDEN, b"denied", "/k"),
            MsgFilterError::Store {
                code: 403,
                message: "denied".to_string()
            }
        );
    }

    #[test]
    fn test_etcd_index_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(etcd_index(&headers), None);

        headers.insert(ETCD_INDEX_HEADER, "1042".parse().unwrap());
        assert_eq!(etcd_index(&headers), Some(1042));

        headers.insert(ETCD_INDEX_HEADER, "soon".parse().unwrap());
        assert_eq!(etcd_index(&headers), None);
    }

    #[test]
    fn test_into_event() {
        let body = r#"{
            "action": "expire",
            "node": {"key": "/lock/x", "modifiedIndex": 15, "createdIndex": 8},
            "prevNode": {"key": "/lock/x", "value": "holder", "modifiedIndex": 8, "createdIndex": 8}
        }"#;
        let response: EtcdResponse = serde_json::from_str(body).unwrap();
        let event = into_event(response, "/lock/x");
        assert_eq!(event.action, WatchAction::Expire);
        assert_eq!(event.index, 15);
        assert!(event.action.releases_key());
    }
}
