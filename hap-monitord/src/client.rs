use std::time::Duration;
use async_trait::async_trait;
use reqwest::StatusCode;
use shared::protocol::{AUTHORIZATION_HEADER, STATUS_HAP_INSUFFICIENT_AUTHORIZATION, STATUS_UNAUTHORIZED};
use shared::types::{AccessoriesResponse, CharacteristicsResponse, CharacteristicsWriteRequest};
use crate::error::{HapError, Result};
use crate::registry::Instance;

/// Plain request/response access to an accessory server.
#[async_trait]
pub trait AccessoryClient: Send + Sync {
    /// `GET /accessories`
    async fn get_accessories(&self, instance: &Instance, timeout: Duration) -> Result<AccessoriesResponse>;

    /// `GET /characteristics?id=aid.iid,...`
    async fn get_characteristics(&self, instance: &Instance, ids: &[(u64, u64)]) -> Result<CharacteristicsResponse>;

    /// `PUT /characteristics` authorized with `pin`
    async fn put_characteristics(
        &self,
        instance: &Instance,
        request: &CharacteristicsWriteRequest,
        pin: &str,
        timeout: Duration,
    ) -> Result<()>;
}

pub struct HttpClient {
    http: reqwest::Client,
    default_timeout: Duration,
}

impl HttpClient {
    pub fn new(default_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|source| HapError::Transport { url: String::new(), source })?;
        Ok(Self { http, default_timeout })
    }
}

fn map_send_error(url: &str, source: reqwest::Error) -> HapError {
    if source.is_timeout() {
        HapError::Timeout { url: url.to_string() }
    } else {
        HapError::Transport { url: url.to_string(), source }
    }
}

/// `aid.iid,aid.iid` as used by the `id` query parameter.
pub fn format_ids(ids: &[(u64, u64)]) -> String {
    ids.iter()
        .map(|(aid, iid)| format!("{}.{}", aid, iid))
        .collect::<Vec<String>>()
        .join(",")
}

fn is_unauthorized(status: StatusCode) -> bool {
    status.as_u16() == STATUS_UNAUTHORIZED || status.as_u16() == STATUS_HAP_INSUFFICIENT_AUTHORIZATION
}

#[async_trait]
impl AccessoryClient for HttpClient {
    async fn get_accessories(&self, instance: &Instance, timeout: Duration) -> Result<AccessoriesResponse> {
        let url = format!("{}/accessories", instance.base_url());
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e))?;

        if !response.status().is_success() {
            return Err(HapError::Status { url, code: response.status().as_u16() });
        }

        let payload: serde_json::Value = response.json().await.map_err(|e| map_send_error(&url, e))?;
        if payload.get("accessories").is_none() {
            return Err(HapError::InvalidSnapshot(format!("{} has no accessories field", url)));
        }
        Ok(serde_json::from_value(payload)?)
    }

    async fn get_characteristics(&self, instance: &Instance, ids: &[(u64, u64)]) -> Result<CharacteristicsResponse> {
        let url = format!("{}/characteristics", instance.base_url());
        let response = self
            .http
            .get(&url)
            .query(&[("id", format_ids(ids))])
            .timeout(self.default_timeout)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e))?;

        // 207 Multi-Status carries per-characteristic status and is still a usable body
        if !response.status().is_success() {
            return Err(HapError::Status { url, code: response.status().as_u16() });
        }
        response.json().await.map_err(|e| map_send_error(&url, e))
    }

    async fn put_characteristics(
        &self,
        instance: &Instance,
        request: &CharacteristicsWriteRequest,
        pin: &str,
        timeout: Duration,
    ) -> Result<()> {
        let url = format!("{}/characteristics", instance.base_url());
        let response = self
            .http
            .put(&url)
            .header(AUTHORIZATION_HEADER, pin)
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e))?;

        let status = response.status();
        if is_unauthorized(status) {
            return Err(HapError::Unauthorized { instance: instance.label(), pin: pin.to_string() });
        }
        if !status.is_success() {
            return Err(HapError::Status { url, code: status.as_u16() });
        }
        Ok(())
    }
}
