//! REST client for the Azure DevOps style `_apis` surface.
//!
//! Implements the transport traits the reconciliation core is written
//! against. No retrying happens here; every call is a single request.

use async_trait::async_trait;
use azdo_reconcile_core::{MembershipClient, Method, RemoteError, RemoteTransport};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use crate::config::RestConfig;
use crate::error::{RestError, Result};

const MAX_LOG_BODY_CHARS: usize = 512;
const STATUS_NOT_FOUND: u16 = 404;

/// Error body shape returned by the service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    type_key: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipList {
    #[serde(default)]
    value: Vec<GraphMembership>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMembership {
    member_descriptor: String,
}

/// Client for one organization, authenticated with a personal access token.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    api_version: String,
    headers: HeaderMap,
}

impl RestClient {
    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("API response error ({}): {}", status, preview);
    }

    pub fn new(config: RestConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            headers: Self::headers(&config.personal_access_token)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version,
        })
    }

    /// JSON content type plus Basic auth with an empty user name.
    fn headers(token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let credentials = STANDARD.encode(format!(":{}", token));
        let auth_value = HeaderValue::from_str(&format!("Basic {}", credentials))
            .map_err(|_| RestError::auth("Invalid personal access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    /// `{base}/_apis/{path}?api-version=..[&extra]`
    fn url(&self, path: &str, extra_query: Option<&str>) -> String {
        let mut url = format!(
            "{}/_apis/{}?api-version={}",
            self.base_url,
            path.trim_start_matches('/'),
            urlencoding::encode(&self.api_version)
        );
        if let Some(query) = extra_query {
            url.push('&');
            url.push_str(query);
        }
        url
    }

    fn resource_path(resource_type: &str, resource_id: Option<&str>) -> String {
        let collection = resource_type.trim_matches('/');
        match resource_id {
            Some(id) => format!("{}/{}", collection, urlencoding::encode(id)),
            None => collection.to_string(),
        }
    }

    fn membership_path(group: &str, member: &str) -> String {
        format!(
            "graph/memberships/{}/{}",
            urlencoding::encode(member),
            urlencoding::encode(group)
        )
    }

    /// Send a request and return the raw body of a successful response.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String> {
        let response = request.headers(self.headers.clone()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                let code = error
                    .type_key
                    .or_else(|| error.error_code.filter(|code| *code != 0).map(|code| code.to_string()));
                return Err(RestError::api(status.as_u16(), code, error.message));
            }
            return Err(RestError::api(
                status.as_u16(),
                None,
                format!("Request failed: {}", body),
            ));
        }
        Ok(body)
    }

    /// Parse a JSON body; an empty body reads as `null`.
    fn parse_value(body: &str) -> Result<Value> {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(body).map_err(|e| {
            log::error!("Failed to deserialize response. Error: {}", e);
            RestError::from(e)
        })
    }

    async fn call_json(
        &self,
        method: Method,
        resource_type: &str,
        resource_id: Option<&str>,
        body: Option<Value>,
    ) -> Result<Value> {
        if resource_id.is_none() && method != Method::Create {
            return Err(RestError::invalid_request(format!(
                "{} {} requires a resource id",
                method, resource_type
            )));
        }
        let url = self.url(&Self::resource_path(resource_type, resource_id), None);
        debug!("{} {}", method, url);

        let request = match method {
            Method::Create => self.client.post(&url),
            Method::Get => self.client.get(&url),
            Method::Update => self.client.patch(&url),
            Method::Delete => self.client.delete(&url),
        };
        let request = match body {
            Some(body) => request.json(&body),
            None => request,
        };

        let body = self.send(request).await?;
        Self::parse_value(&body)
    }

    /// GET /_apis/graph/memberships/{group}?direction=down
    async fn list_direct_members(&self, group: &str) -> Result<HashSet<String>> {
        let url = self.url(
            &format!("graph/memberships/{}", urlencoding::encode(group)),
            Some("direction=down"),
        );
        let body = self.send(self.client.get(&url)).await?;
        let list: MembershipList = serde_json::from_str(&body)?;
        Ok(list
            .value
            .into_iter()
            .map(|membership| membership.member_descriptor)
            .collect())
    }

    /// PUT /_apis/graph/memberships/{member}/{group}
    async fn put_membership(&self, group: &str, member: &str) -> Result<()> {
        let url = self.url(&Self::membership_path(group, member), None);
        self.send(self.client.put(&url)).await?;
        Ok(())
    }

    /// DELETE /_apis/graph/memberships/{member}/{group}
    ///
    /// Removing a member that is already gone succeeds.
    async fn delete_membership(&self, group: &str, member: &str) -> Result<()> {
        let url = self.url(&Self::membership_path(group, member), None);
        match self.send(self.client.delete(&url)).await {
            Ok(_) => Ok(()),
            Err(err) if err.status_code() == Some(STATUS_NOT_FOUND) => {
                debug!("{} already not a member of {}", member, group);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl RemoteTransport for RestClient {
    async fn call(
        &self,
        method: Method,
        resource_type: &str,
        resource_id: Option<&str>,
        body: Option<Value>,
    ) -> std::result::Result<Value, RemoteError> {
        self.call_json(method, resource_type, resource_id, body)
            .await
            .map_err(RemoteError::from)
    }
}

#[async_trait]
impl MembershipClient for RestClient {
    async fn list_members(&self, group: &str) -> std::result::Result<HashSet<String>, RemoteError> {
        self.list_direct_members(group).await.map_err(RemoteError::from)
    }

    async fn add_member(&self, group: &str, member: &str) -> std::result::Result<(), RemoteError> {
        self.put_membership(group, member).await.map_err(RemoteError::from)
    }

    async fn remove_member(&self, group: &str, member: &str) -> std::result::Result<(), RemoteError> {
        self.delete_membership(group, member)
            .await
            .map_err(RemoteError::from)
    }
}
