//! Dispatch middleware for every outbound request.
//!
//! `Dispatcher` is the single point where requests are built and sent. It
//! attaches the current credential as a bearer token, turns HTTP failures
//! into `QueryError`s, backs off on rate limiting and escalates a 401 into a
//! forced sign-out.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client, Method, RequestBuilder, StatusCode, Url};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{Endpoint, QueryError};
use crate::auth::{Credential, Session, SessionExpiry};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Every endpoint path is appended to this URL
    pub base_url: Url,
    pub timeout: Duration,
    pub rate_limit_retries: u32,
    pub initial_backoff: Duration,
}

impl DispatchConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            rate_limit_retries: MAX_RATE_LIMIT_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct Dispatcher {
    client: Client,
    config: DispatchConfig,
    session: Session,
    expiry: SessionExpiry,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, session: Session, expiry: SessionExpiry) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            config,
            session,
            expiry,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.config.base_url
    }

    /// Send one request for `endpoint` and return the transformed response body.
    pub async fn execute(&self, endpoint: &Endpoint, args: &Value) -> Result<Value, QueryError> {
        let mut fields = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => {
                return Err(QueryError::Validation(format!(
                    "{}: arguments must be an object",
                    endpoint.name()
                )))
            }
        };
        let url = endpoint.path().expand(&self.config.base_url, &mut fields)?;

        let mut retries = 0;
        let mut backoff = self.config.initial_backoff;

        loop {
            // Read per attempt so a retry picks up a refreshed credential
            let credential = self.session.credential();
            let response = self
                .request(endpoint.method(), url.clone(), &fields, credential.as_ref())
                .send()
                .await
                .map_err(|e| {
                    warn!(endpoint = endpoint.name(), error = %e, "Request failed");
                    QueryError::from(e)
                })?;

            let status = response.status();
            debug!(
                endpoint = endpoint.name(),
                method = %endpoint.method(),
                status = status.as_u16(),
                authenticated = credential.is_some(),
                "Response received"
            );

            if status.is_success() {
                let body = response.text().await?;
                let value = if body.trim().is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&body).map_err(|e| {
                        QueryError::InvalidResponse(format!("{}: {}", endpoint.name(), e))
                    })?
                };
                return endpoint.transform_response(value);
            }

            if status == StatusCode::TOO_MANY_REQUESTS && retries < self.config.rate_limit_retries {
                retries += 1;
                warn!(
                    endpoint = endpoint.name(),
                    retry = retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2; // Exponential backoff
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            let err = QueryError::from_status(status, &body);
            if err == QueryError::AuthExpired {
                if let Err(e) = self.expiry.expire(credential.as_ref()).await {
                    warn!(error = %e, "Failed to persist forced sign-out");
                }
            }
            return Err(err);
        }
    }

    fn request(
        &self,
        method: &Method,
        url: Url,
        fields: &Map<String, Value>,
        credential: Option<&Credential>,
    ) -> RequestBuilder {
        let mut request = self
            .client
            .request(method.clone(), url)
            .header(header::ACCEPT, "application/json");

        if *method == Method::GET || *method == Method::DELETE {
            let params = query_params(fields);
            if !params.is_empty() {
                request = request.query(&params);
            }
        } else {
            request = request.json(fields);
        }

        if let Some(credential) = credential {
            request = request.bearer_auth(credential.as_str());
        }
        request
    }
}

/// Flatten argument fields into query pairs. Arrays repeat the key, nulls are skipped.
fn query_params(fields: &Map<String, Value>) -> Vec<(String, String)> {
    let mut params = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        match value {
            Value::Null => {}
            Value::String(s) => params.push((name.clone(), s.clone())),
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(s) => params.push((name.clone(), s.clone())),
                        Value::Null => {}
                        other => params.push((name.clone(), other.to_string())),
                    }
                }
            }
            other => params.push((name.clone(), other.to_string())),
        }
    }
    params
}
