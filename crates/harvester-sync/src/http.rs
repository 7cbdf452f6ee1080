//! Authenticated resource-list fetch over HTTP.

use crate::config::HarvesterConfig;
use crate::error::{HarvestError, ServiceError};
use crate::service::ManifestSource;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

/// Shared client construction for every endpoint the harvester talks to.
pub fn build_client(timeout: Duration, trust_any_certificate: bool) -> Result<Client, ServiceError> {
    if trust_any_certificate {
        tracing::warn!("TLS certificate validation is disabled for this endpoint");
    }
    Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(trust_any_certificate)
        .build()
        .map_err(|e| ServiceError::Transport(format!("failed to create HTTP client: {e}")))
}

pub struct HttpManifestSource {
    client: Client,
    url: Url,
    realm: String,
    user: String,
    pass: String,
}

impl HttpManifestSource {
    pub fn new(
        url: Url,
        realm: impl Into<String>,
        user: impl Into<String>,
        pass: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            client,
            url,
            realm: realm.into(),
            user: user.into(),
            pass: pass.into(),
        }
    }

    pub fn from_config(config: &HarvesterConfig) -> Result<Self, HarvestError> {
        let client = build_client(
            config.harvester.http_timeout(),
            config.data_source.trust_any_certificate,
        )?;
        Ok(Self::new(
            config.resource_list_url()?,
            config.data_source.auth_realm.clone(),
            config.data_source.auth_user.clone(),
            config.data_source.auth_pass.clone(),
            client,
        ))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch(&self) -> Result<Bytes, ServiceError> {
        tracing::debug!(url = %self.url, realm = %self.realm, "fetching resource list");
        let response = self
            .client
            .get(self.url.clone())
            .basic_auth(&self.user, Some(&self.pass))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.bytes().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ServiceError::Authentication {
                user: self.user.clone(),
                message: format!(
                    "realm `{}` rejected the credentials (HTTP {})",
                    self.realm,
                    response.status().as_u16()
                ),
            }),
            status => Err(ServiceError::Status {
                status: status.as_u16(),
                url: self.url.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_targets_the_remote_space_listing() {
        let client = build_client(Duration::from_secs(1), true).unwrap();
        let url = Url::parse("https://source:8444/re-sync?verb=resourcelist.xml&space=SRC").unwrap();
        let source = HttpManifestSource::new(url.clone(), "OAI-PMH", "admin", "secret", client);
        assert_eq!(source.url(), &url);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        let client = build_client(Duration::from_millis(500), false).unwrap();
        let url = Url::parse("http://127.0.0.1:1/re-sync").unwrap();
        let source = HttpManifestSource::new(url, "OAI-PMH", "admin", "secret", client);
        assert!(source.fetch().await.is_err());
    }
}
