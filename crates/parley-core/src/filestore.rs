//! Remote file-store collaborator.
//!
//! The store speaks JSON-RPC 2.0 over an authenticated channel; payloads are
//! base64-encoded and buffered whole in memory (no streaming).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Receipt for a completed write: content tag plus stored byte size.
#[derive(Debug, Clone)]
pub struct WriteReceipt {
    pub etag: String,
    pub size: i64,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read_file(&self, path: &str) -> anyhow::Result<Vec<u8>>;

    async fn write_file(&self, path: &str, data: Vec<u8>) -> anyhow::Result<WriteReceipt>;
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    method: &'a str,
    params: P,
    id: i64,
}

#[derive(Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct ReadParams<'a> {
    path: &'a str,
}

#[derive(Deserialize)]
struct ReadResult {
    data: String,
}

#[derive(Serialize)]
struct WriteParams<'a> {
    path: &'a str,
    content: BytesContent,
}

#[derive(Serialize)]
struct BytesContent {
    #[serde(rename = "__type__")]
    kind: &'static str,
    data: String,
}

#[derive(Deserialize)]
struct WriteResult {
    etag: String,
    size: i64,
}

/// File-store client with bearer-token auth and monotonic request ids.
pub struct RemoteFileStore {
    base_url: Url,
    token: String,
    http: reqwest::Client,
    next_id: AtomicI64,
}

impl RemoteFileStore {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.parse().context("parse file-store base URL")?,
            token: token.into(),
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("build file-store http client")?,
            next_id: AtomicI64::new(1),
        })
    }

    async fn call<P, R>(&self, path: &str, method: &str, params: P) -> anyhow::Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let req = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let url = self
            .base_url
            .join(path)
            .with_context(|| format!("join file-store URL {path}"))?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        let resp = resp
            .error_for_status()
            .with_context(|| format!("{path} status"))?;
        let body: RpcResponse<R> = resp
            .json()
            .await
            .with_context(|| format!("decode {path} response"))?;
        if let Some(err) = body.error {
            anyhow::bail!("rpc error {}: {}", err.code, err.message);
        }
        body.result
            .ok_or_else(|| anyhow::anyhow!("empty rpc result"))
    }
}

#[async_trait]
impl FileStore for RemoteFileStore {
    async fn read_file(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let result: ReadResult = self.call("/api/nfs/read", "read", ReadParams { path }).await?;
        BASE64
            .decode(result.data.as_bytes())
            .context("decode file content")
    }

    async fn write_file(&self, path: &str, data: Vec<u8>) -> anyhow::Result<WriteReceipt> {
        let content = BytesContent {
            kind: "bytes",
            data: BASE64.encode(&data),
        };
        let result: WriteResult = self
            .call("/api/nfs/write", "write", WriteParams { path, content })
            .await?;
        Ok(WriteReceipt {
            etag: result.etag,
            size: result.size,
        })
    }
}
