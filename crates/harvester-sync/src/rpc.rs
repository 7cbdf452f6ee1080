//! JSON-RPC 2.0 adapters for the destination entity service and the source
//! file service.
//!
//! Payloads are the serde forms of the types in [`crate::service`]. File
//! content does not go through JSON-RPC: it is a plain GET of
//! `<dss-url>/<code>/<path>?sessionID=<token>`, streamed chunk by chunk.
//! Attachment content is a GET of
//! `<as-url>/attachments/<KIND>/<permId>/<file>?version=<n>&sessionID=<token>`.

use crate::config::HarvesterConfig;
use crate::error::{HarvestError, ServiceError};
use crate::graph::SpaceListing;
use crate::http::build_client;
use crate::service::{
    Attachment, AttachmentChanges, DataSetFile, EntityService, LocalDataSet, LocalEntity,
    OperationBatch, OperationResult, RemoteFileService, SessionToken,
};
use async_trait::async_trait;
use bytes::Bytes;
use harvester_manifest::EntityKind;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use url::Url;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    client: Client,
    endpoint: Url,
}

impl JsonRpcClient {
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ServiceError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: uuid::Uuid::new_v4().to_string(),
            method,
            params,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ServiceError::Status {
                status: response.status().as_u16(),
                url: self.endpoint.to_string(),
            });
        }
        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse {
                method: method.to_string(),
                message: e.to_string(),
            })?;
        if let Some(err) = body.error {
            return Err(ServiceError::Remote {
                method: method.to_string(),
                message: format!("{} (code {})", err.message, err.code),
            });
        }
        serde_json::from_value(body.result.unwrap_or(Value::Null)).map_err(|e| {
            ServiceError::InvalidResponse {
                method: method.to_string(),
                message: e.to_string(),
            }
        })
    }

    async fn login(&self, user: &str, pass: &str) -> Result<SessionToken, ServiceError> {
        let token: Option<String> = self.call("login", json!([user, pass])).await?;
        token.ok_or_else(|| ServiceError::Authentication {
            user: user.to_string(),
            message: "login returned no session token".to_string(),
        })
    }
}

fn parse_url(key: &str, value: &str) -> Result<Url, HarvestError> {
    Url::parse(value).map_err(|e| HarvestError::Config(format!("`{key}`: {e}")))
}

// ============================================================================
// Entity service
// ============================================================================

pub struct RpcEntityService {
    rpc: JsonRpcClient,
    user: String,
    pass: String,
}

impl RpcEntityService {
    pub fn new(rpc: JsonRpcClient, user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            rpc,
            user: user.into(),
            pass: pass.into(),
        }
    }

    /// The destination application server.
    pub fn from_config(config: &HarvesterConfig) -> Result<Self, HarvestError> {
        let client = build_client(
            config.harvester.http_timeout(),
            config.destination.trust_any_certificate,
        )?;
        let endpoint = parse_url("destination.openbis-url", &config.destination.openbis_url)?;
        Ok(Self::new(
            JsonRpcClient::new(client, endpoint),
            config.destination.user.clone(),
            config.destination.pass.clone(),
        ))
    }
}

#[async_trait]
impl EntityService for RpcEntityService {
    async fn login(&self) -> Result<SessionToken, ServiceError> {
        self.rpc.login(&self.user, &self.pass).await
    }

    async fn list_space(&self, session: &str, space: &str) -> Result<Option<SpaceListing>, ServiceError> {
        self.rpc.call("listSpace", json!([session, space])).await
    }

    async fn try_get_project(&self, session: &str, identifier: &str) -> Result<Option<LocalEntity>, ServiceError> {
        self.rpc.call("tryGetProject", json!([session, identifier])).await
    }

    async fn try_get_experiment(&self, session: &str, identifier: &str) -> Result<Option<LocalEntity>, ServiceError> {
        self.rpc.call("tryGetExperiment", json!([session, identifier])).await
    }

    async fn try_get_experiment_by_perm_id(
        &self,
        session: &str,
        perm_id: &str,
    ) -> Result<Option<LocalEntity>, ServiceError> {
        self.rpc
            .call("tryGetExperimentByPermId", json!([session, perm_id]))
            .await
    }

    async fn try_get_sample(&self, session: &str, identifier: &str) -> Result<Option<LocalEntity>, ServiceError> {
        self.rpc.call("tryGetSample", json!([session, identifier])).await
    }

    async fn try_get_material(
        &self,
        session: &str,
        code: &str,
        material_type: &str,
    ) -> Result<Option<LocalEntity>, ServiceError> {
        self.rpc
            .call("tryGetMaterial", json!([session, code, material_type]))
            .await
    }

    async fn try_get_data_set(&self, session: &str, code: &str) -> Result<Option<LocalDataSet>, ServiceError> {
        self.rpc.call("tryGetDataSet", json!([session, code])).await
    }

    async fn perform_entity_operations(
        &self,
        session: &str,
        batch: OperationBatch,
    ) -> Result<OperationResult, ServiceError> {
        self.rpc
            .call("performEntityOperations", json!([session, batch]))
            .await
    }

    async fn list_attachments(
        &self,
        session: &str,
        kind: EntityKind,
        identifier: &str,
    ) -> Result<Vec<Attachment>, ServiceError> {
        self.rpc
            .call("listAttachments", json!([session, kind, identifier]))
            .await
    }

    async fn update_attachments(
        &self,
        session: &str,
        kind: EntityKind,
        identifier: &str,
        changes: AttachmentChanges,
    ) -> Result<(), ServiceError> {
        let _: Value = self
            .rpc
            .call("updateAttachments", json!([session, kind, identifier, changes]))
            .await?;
        Ok(())
    }
}

// ============================================================================
// Remote file service
// ============================================================================

pub struct RpcRemoteFileService {
    rpc: JsonRpcClient,
    client: Client,
    dss_url: Url,
    user: String,
    pass: String,
}

impl RpcRemoteFileService {
    pub fn new(
        rpc: JsonRpcClient,
        client: Client,
        dss_url: Url,
        user: impl Into<String>,
        pass: impl Into<String>,
    ) -> Self {
        Self {
            rpc,
            client,
            dss_url,
            user: user.into(),
            pass: pass.into(),
        }
    }

    /// Logs in against the source application server, lists and downloads
    /// from the source data store.
    pub fn from_config(config: &HarvesterConfig) -> Result<Self, HarvestError> {
        let client = build_client(
            config.harvester.http_timeout(),
            config.data_source.trust_any_certificate,
        )?;
        let as_url = parse_url("data-source.openbis-url", &config.data_source.openbis_url)?;
        let dss_url = parse_url("data-source.dss-url", &config.data_source.dss_url)?;
        Ok(Self::new(
            JsonRpcClient::new(client.clone(), as_url),
            client,
            dss_url,
            config.data_source.auth_user.clone(),
            config.data_source.auth_pass.clone(),
        ))
    }

    fn file_url(&self, session: &str, code: &str, path: &str) -> Result<Url, ServiceError> {
        let mut url = self.dss_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                ServiceError::Transport(format!("`{}` cannot be a base URL", self.dss_url))
            })?;
            segments.pop_if_empty().push(code);
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
        }
        url.query_pairs_mut().append_pair("sessionID", session);
        Ok(url)
    }

    fn attachment_url(
        &self,
        session: &str,
        kind: EntityKind,
        perm_id: &str,
        attachment: &Attachment,
    ) -> Result<Url, ServiceError> {
        let base = self.rpc.endpoint();
        let mut url = base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ServiceError::Transport(format!("`{base}` cannot be a base URL")))?;
            segments
                .pop_if_empty()
                .push("attachments")
                .push(kind.label())
                .push(perm_id)
                .push(&attachment.file_name);
        }
        url.query_pairs_mut()
            .append_pair("version", &attachment.version.to_string())
            .append_pair("sessionID", session);
        Ok(url)
    }
}

#[async_trait]
impl RemoteFileService for RpcRemoteFileService {
    async fn login(&self) -> Result<SessionToken, ServiceError> {
        self.rpc.login(&self.user, &self.pass).await
    }

    async fn search_files(&self, session: &str, code: &str) -> Result<Vec<DataSetFile>, ServiceError> {
        self.rpc
            .call("listFilesForDataSet", json!([session, code]))
            .await
    }

    async fn download_file(
        &self,
        session: &str,
        code: &str,
        file: &DataSetFile,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, ServiceError> {
        let url = self.file_url(session, code, &file.path)?;
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;
        Ok(written)
    }

    async fn list_attachments(
        &self,
        session: &str,
        kind: EntityKind,
        perm_id: &str,
    ) -> Result<Vec<Attachment>, ServiceError> {
        self.rpc
            .call("listAttachments", json!([session, kind, perm_id]))
            .await
    }

    async fn download_attachment(
        &self,
        session: &str,
        kind: EntityKind,
        perm_id: &str,
        attachment: &Attachment,
    ) -> Result<Bytes, ServiceError> {
        let url = self.attachment_url(session, kind, perm_id, attachment)?;
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?)
    }
}
