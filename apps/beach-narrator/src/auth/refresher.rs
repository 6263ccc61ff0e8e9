use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::error::AuthError;

/// Exchanges the long-lived credential for a fresh access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, credential: &str) -> Result<RefreshedToken, AuthError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Rotated long-lived credential, when the gateway issues one.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    client: Client,
    gateway: Url,
}

impl HttpTokenRefresher {
    pub fn new(gateway: Url, timeout: Duration) -> Result<Self, AuthError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, gateway })
    }

    fn url(&self, path: &str) -> Result<Url, AuthError> {
        self.gateway
            .join(path)
            .map_err(|err| AuthError::Gateway(format!("invalid auth gateway path '{path}': {err}")))
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, credential: &str) -> Result<RefreshedToken, AuthError> {
        #[derive(Serialize)]
        struct RefreshRequest<'a> {
            refresh_token: &'a str,
        }

        let url = self.url("token/refresh")?;
        let response = self
            .client
            .post(url)
            .json(&RefreshRequest {
                refresh_token: credential,
            })
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(map_request_error);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidCredentials);
        }

        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or(ErrorBody {
            error: None,
            detail: Some(text.clone()),
        });
        Err(AuthError::Gateway(format!(
            "token refresh failed ({status}): {}",
            body.detail
                .or(body.error)
                .unwrap_or_else(|| "unknown error".into())
        )))
    }
}

fn map_request_error(err: reqwest::Error) -> AuthError {
    if err.is_timeout() {
        AuthError::Timeout
    } else {
        AuthError::Http(err)
    }
}
