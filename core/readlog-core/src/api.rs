//! Authenticated API client seam.
//!
//! The coordinator only needs `call(endpoint, request) -> response`. Transport
//! problems (DNS, timeouts, connection resets) come back as `Err`; anything the
//! server answered, including non-2xx statuses, comes back as an
//! [`ApiResponse`] with `success: false` and an error code.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use readlog_protocol::{codes, ApiRequest, ApiResponse, Method, API_VERSION, MAX_BODY_BYTES};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::config::TrackerConfig;
use crate::error::{ReadlogError, Result};

pub trait ApiClient: Send + Sync {
    fn call(&self, endpoint: &str, request: ApiRequest) -> Result<ApiResponse>;
}

/// Fresh correlation id for one outbound call.
pub fn new_request_id() -> String {
    ulid::Ulid::new().to_string()
}

pub struct HttpApiClient {
    base_url: String,
    client: Client,
}

impl HttpApiClient {
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        let base_url = config.api_base_url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(StdDuration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("readlog/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ReadlogError::Transport {
                endpoint: base_url.clone(),
                details: err.to_string(),
            })?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn status_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::UNAUTHORIZED => codes::UNAUTHORIZED,
        StatusCode::TOO_MANY_REQUESTS => codes::RATE_LIMITED,
        _ => codes::HTTP_ERROR,
    }
}

impl ApiClient for HttpApiClient {
    fn call(&self, endpoint: &str, request: ApiRequest) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if let Some(token) = &request.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(request_id) = &request.request_id {
            builder = builder.header("x-request-id", request_id);
        }
        builder = builder.header("x-api-version", API_VERSION.to_string());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let transport = |err: reqwest::Error| ReadlogError::Transport {
            endpoint: endpoint.to_string(),
            details: err.to_string(),
        };
        let response = builder.send().map_err(transport)?;
        let status = response.status();
        let body = response.text().map_err(transport)?;
        debug!(
            endpoint,
            status = status.as_u16(),
            bytes = body.len(),
            request_id = ?request.request_id,
            "API call returned"
        );

        if body.len() > MAX_BODY_BYTES {
            return Err(ReadlogError::InvalidPayload {
                endpoint: endpoint.to_string(),
                details: format!("response body of {} bytes exceeds limit", body.len()),
            });
        }

        match serde_json::from_str::<ApiResponse>(&body) {
            Ok(parsed) if status.is_success() => Ok(parsed),
            Ok(parsed) if parsed.error.is_some() => Ok(ApiResponse {
                success: false,
                ..parsed
            }),
            Ok(_) => Ok(ApiResponse::failure(
                status_code(status),
                format!("HTTP {}", status),
            )),
            Err(err) if status.is_success() => Err(ReadlogError::InvalidPayload {
                endpoint: endpoint.to_string(),
                details: err.to_string(),
            }),
            Err(_) => Ok(ApiResponse::failure(
                status_code(status),
                format!("HTTP {}", status),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub endpoint: String,
    pub method: Method,
    pub body: Option<Value>,
    pub token: Option<String>,
}

/// Replays queued responses per endpoint and records every call.
///
/// Endpoints are matched without their query string. When an endpoint's queue
/// is empty the fallback response (if any) is returned; otherwise the call
/// fails as a transport error.
#[derive(Default)]
pub struct ScriptedApiClient {
    queued: Mutex<HashMap<String, VecDeque<Result<ApiResponse>>>>,
    fallback: Mutex<HashMap<String, ApiResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
}

fn route(endpoint: &str) -> &str {
    endpoint.split('?').next().unwrap_or(endpoint)
}

impl ScriptedApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, endpoint: &str, response: ApiResponse) {
        self.push_result(endpoint, Ok(response));
    }

    pub fn push_ok(&self, endpoint: &str, data: Value) {
        self.push(endpoint, ApiResponse::ok(data));
    }

    pub fn push_transport_error(&self, endpoint: &str) {
        self.push_result(
            endpoint,
            Err(ReadlogError::Transport {
                endpoint: endpoint.to_string(),
                details: "connection reset".to_string(),
            }),
        );
    }

    fn push_result(&self, endpoint: &str, result: Result<ApiResponse>) {
        self.queued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(route(endpoint).to_string())
            .or_default()
            .push_back(result);
    }

    /// Response returned whenever the endpoint's queue is empty.
    pub fn respond_always(&self, endpoint: &str, response: ApiResponse) {
        self.fallback
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(route(endpoint).to_string(), response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn calls_to(&self, endpoint: &str, method: Method) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| route(&call.endpoint) == route(endpoint) && call.method == method)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl ApiClient for ScriptedApiClient {
    fn call(&self, endpoint: &str, request: ApiRequest) -> Result<ApiResponse> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(RecordedCall {
                endpoint: endpoint.to_string(),
                method: request.method,
                body: request.body.clone(),
                token: request.token.clone(),
            });

        let key = route(endpoint);
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        if let Some(result) = queued {
            return result;
        }
        if let Some(response) = self
            .fallback
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
        {
            return Ok(response.clone());
        }
        Err(ReadlogError::Transport {
            endpoint: endpoint.to_string(),
            details: "no scripted response".to_string(),
        })
    }
}
