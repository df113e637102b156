//! Templated HTTP probe validator
//!
//! Renders a request (URL, method, headers, body) per data key, executes
//! it, and accepts the key when the response matches the expectation
//! block. Either the request body or the response body can replace the
//! key's data.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{check_template, render_template, DataMsg, TemplateVars, Validator, ValidatorConfig};
use crate::error::Error;
use crate::fetcher::DataMap;

/// Registry name of the HTTP validator.
pub const METHOD_HTTP: &str = "http";

const SUPPORTED_METHODS: [&str; 5] = ["GET", "POST", "PUT", "HEAD", "OPTIONS"];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A templated name/value pair (headers, expected headers).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NameValue {
    /// Pair name (template)
    pub name: String,
    /// Pair value (template)
    pub value: String,
}

/// Outbound proxy configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpProxyConfig {
    /// Proxy for plain-HTTP requests
    pub http: String,
    /// Proxy for HTTPS requests
    pub https: String,
}

/// The templated request to send.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpRequestConfig {
    /// URL template
    pub url: String,
    /// HTTP method: GET, POST, PUT, HEAD, OPTIONS
    pub method: String,
    /// Header templates
    pub headers: Vec<NameValue>,
    /// Body template; not allowed with GET
    pub body: String,
    /// Proxy configuration
    pub proxy: Option<HttpProxyConfig>,
    /// Skip TLS certificate verification
    pub insecure_skip_verify: bool,
}

/// Response expectations; an empty block accepts any 2xx response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpExpect {
    /// Exact status code; unset means any 2xx
    pub response_code: Option<u16>,
    /// Expected response body (template); empty accepts any body
    pub response_body: String,
    /// Headers the response must carry (templates)
    pub response_headers: Vec<NameValue>,
}

/// HTTP validator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpValidatorConfig {
    /// Render the request but do not execute it; the key always passes
    pub dry_run: bool,
    /// Use the rendered request body as the key's new data
    pub request_body_as_data: bool,
    /// Use the response body as the key's new data
    pub response_body_as_data: bool,
    /// The request to send
    pub request: HttpRequestConfig,
    /// The response expectations
    pub expect: HttpExpect,
}

/// Build an HTTP validator from its config.
pub fn new_http_validator(config: &ValidatorConfig) -> Result<Box<dyn Validator>, Error> {
    let http = config
        .http
        .as_ref()
        .ok_or_else(|| Error::config("no http validator configuration provided"))?;

    let method = http.request.method.to_uppercase();
    if !SUPPORTED_METHODS.contains(&method.as_str()) {
        return Err(Error::config(format!(
            "unsupported http method {:?}",
            http.request.method
        )));
    }

    if http.request_body_as_data && http.response_body_as_data {
        return Err(Error::config(
            "only one of the request body or response body can be used as data, not both",
        ));
    }

    if !http.request.body.is_empty() && method == "GET" {
        return Err(Error::config("http body is not allowed with method GET"));
    }

    check_template(&http.request.url)?;
    check_template(&http.request.body)?;
    check_template(&http.expect.response_body)?;
    for pair in http.request.headers.iter().chain(&http.expect.response_headers) {
        check_template(&pair.name)?;
        check_template(&pair.value)?;
    }

    let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
    if http.request.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(proxy) = &http.request.proxy {
        if !proxy.http.is_empty() {
            builder = builder.proxy(
                reqwest::Proxy::http(&proxy.http)
                    .map_err(|e| Error::config(format!("invalid http proxy: {e}")))?,
            );
        }
        if !proxy.https.is_empty() {
            builder = builder.proxy(
                reqwest::Proxy::https(&proxy.https)
                    .map_err(|e| Error::config(format!("invalid https proxy: {e}")))?,
            );
        }
    }
    let client = builder
        .build()
        .map_err(|e| Error::config(format!("failed to build http client: {e}")))?;

    Ok(Box::new(HttpValidator {
        data_keys: config.data_keys.clone(),
        config: http.clone(),
        method,
        client,
    }))
}

#[derive(Debug)]
struct HttpValidator {
    data_keys: Vec<String>,
    config: HttpValidatorConfig,
    method: String,
    client: reqwest::Client,
}

impl HttpValidator {
    fn render_pairs(
        pairs: &[NameValue],
        vars: &TemplateVars<'_>,
    ) -> Result<HashMap<String, String>, Error> {
        let mut rendered = HashMap::with_capacity(pairs.len());
        for pair in pairs {
            rendered.insert(
                render_template(&pair.name, vars)?,
                render_template(&pair.value, vars)?,
            );
        }
        Ok(rendered)
    }

    async fn validate_key(&self, key: &str, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let vars = TemplateVars {
            data_keys: &self.data_keys,
            data_key: key,
            data: payload,
        };

        let url = render_template(&self.config.request.url, &vars)?;
        let headers = Self::render_pairs(&self.config.request.headers, &vars)?;
        let body = if self.config.request.body.is_empty() {
            String::new()
        } else {
            render_template(&self.config.request.body, &vars)?
        };

        if self.config.dry_run {
            debug!(url = %url, method = %self.method, "dry-run, skipping http probe");
            if self.config.request_body_as_data {
                return Ok(body.into_bytes());
            }
            return Ok(payload.to_vec());
        }

        let method = reqwest::Method::from_bytes(self.method.as_bytes())
            .map_err(|e| Error::config(format!("invalid http method: {e}")))?;
        let mut request = self.client.request(method, &url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::sync(format!("http probe request failed: {e}")))?;

        let status = response.status();
        match self.config.expect.response_code {
            Some(code) if status.as_u16() != code => {
                return Err(Error::sync(format!(
                    "unexpected response code {status}, want {code}"
                )));
            }
            None if !status.is_success() => {
                return Err(Error::sync(format!("unexpected response code {status}")));
            }
            _ => {}
        }

        for (name, value) in Self::render_pairs(&self.config.expect.response_headers, &vars)? {
            let got = response
                .headers()
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if got != value {
                return Err(Error::sync(format!(
                    "unexpected response header {name:?}: got {got:?}, want {value:?}"
                )));
            }
        }

        let response_body = response
            .bytes()
            .await
            .map_err(|e| Error::sync(format!("failed to read response body: {e}")))?;

        if !self.config.expect.response_body.is_empty() {
            let expected = render_template(&self.config.expect.response_body, &vars)?;
            if response_body.as_ref() != expected.as_bytes() {
                return Err(Error::sync("unexpected response body"));
            }
        }

        if self.config.request_body_as_data {
            return Ok(body.into_bytes());
        }
        if self.config.response_body_as_data {
            return Ok(response_body.to_vec());
        }
        Ok(payload.to_vec())
    }
}

#[async_trait]
impl Validator for HttpValidator {
    async fn validate(&self, data: &DataMap) -> DataMsg {
        let mut msg = DataMsg::default();
        for key in &self.data_keys {
            let Some(payload) = data.get(key) else {
                continue;
            };
            match self.validate_key(key, payload).await {
                Ok(out) => {
                    msg.data.insert(key.clone(), out);
                }
                Err(err) => {
                    msg.errors.insert(key.clone(), err);
                }
            }
        }
        msg
    }
}
