//! HTTP collaborator for the user endpoints of the backend.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION},
    Client, RequestBuilder,
};
use shared::{
    domain::{LoginCredentials, NewUser, UserChanges},
    protocol::{UserEnvelope, UserRequest},
};
use tracing::debug;

use crate::{config::Settings, error::SessionError};

/// Implementations return the decoded body as-is, `errors` payload included.
#[async_trait]
pub trait UserApi: Send + Sync {
    async fn login(
        &self,
        credentials: &LoginCredentials,
        auth: Option<&str>,
    ) -> Result<UserEnvelope, SessionError>;
    async fn register(&self, user: &NewUser, auth: Option<&str>)
        -> Result<UserEnvelope, SessionError>;
    async fn update(
        &self,
        changes: &UserChanges,
        auth: Option<&str>,
    ) -> Result<UserEnvelope, SessionError>;
    async fn current_user(&self, auth: &str) -> Result<UserEnvelope, SessionError>;
}

pub struct HttpUserApi {
    http: Client,
    base_url: String,
    auth_scheme: String,
}

impl HttpUserApi {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let base_url = settings.base_url()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &settings.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid default header name '{name}'"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for default header '{name}'"))?;
            headers.insert(name, value);
        }

        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            auth_scheme: settings.auth_scheme.trim().to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder, auth: Option<&str>) -> RequestBuilder {
        match auth {
            Some(token) => request.header(AUTHORIZATION, format!("{} {token}", self.auth_scheme)),
            None => request,
        }
    }

    /// Sends the request and decodes the body whatever the status: the
    /// backend reports validation failures as `errors` on 4xx responses.
    async fn send(request: RequestBuilder) -> Result<UserEnvelope, SessionError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        debug!(%status, bytes = body.len(), "user endpoint responded");
        serde_json::from_slice(&body).map_err(|err| {
            SessionError::Transport(format!("invalid response body (status {status}): {err}"))
        })
    }
}

#[async_trait]
impl UserApi for HttpUserApi {
    async fn login(
        &self,
        credentials: &LoginCredentials,
        auth: Option<&str>,
    ) -> Result<UserEnvelope, SessionError> {
        let request = self
            .http
            .post(self.endpoint("users/login"))
            .json(&UserRequest { user: credentials });
        Self::send(self.authorize(request, auth)).await
    }

    async fn register(
        &self,
        user: &NewUser,
        auth: Option<&str>,
    ) -> Result<UserEnvelope, SessionError> {
        let request = self
            .http
            .post(self.endpoint("users"))
            .json(&UserRequest { user });
        Self::send(self.authorize(request, auth)).await
    }

    async fn update(
        &self,
        changes: &UserChanges,
        auth: Option<&str>,
    ) -> Result<UserEnvelope, SessionError> {
        let request = self
            .http
            .put(self.endpoint("user"))
            .json(&UserRequest { user: changes });
        Self::send(self.authorize(request, auth)).await
    }

    async fn current_user(&self, auth: &str) -> Result<UserEnvelope, SessionError> {
        let request = self.http.get(self.endpoint("user"));
        Self::send(self.authorize(request, Some(auth))).await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
