//! Remote source selection, credentials, and the blocking HTTP gateway.
//!
//! The two upstream APIs are a closed set: Upbit (signed bearer auth) and
//! CoinAPI (static API key). Everything above this module talks to a
//! [`HttpGateway`] and never sees reqwest directly.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default location of the credentials file, matching the upstream layout.
pub const DEFAULT_KEYS_PATH: &str = "./keys.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteSource {
    Upbit,
    CoinApi,
}

impl RemoteSource {
    pub fn host(self) -> &'static str {
        match self {
            Self::Upbit => "api.upbit.com",
            Self::CoinApi => "rest.coinapi.io",
        }
    }

    /// The auth header this source expects.
    ///
    /// Upbit wants a signed HS256 JWT carrying the access key; signing lives
    /// outside this crate, so the bearer here is the bare access key.
    // TODO: thread a pre-signed JWT through once Upbit order endpoints land.
    pub fn auth_header(self, credentials: &Credentials) -> (&'static str, String) {
        match self {
            Self::Upbit => (
                "Authorization",
                format!("Bearer {}", credentials.upbit_access),
            ),
            Self::CoinApi => ("X-CoinAPI-Key", credentials.coinapi_access.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub upbit_access: String,
    pub upbit_secret: String,
    pub coinapi_access: String,
}

impl Credentials {
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ClientError::KeyFileNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ClientError::Io(err)
            }
        })?;

        serde_json::from_str(&raw).map_err(|err| ClientError::KeyFileParse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("api key file {path} not found")]
    KeyFileNotFound { path: PathBuf },
    #[error("failed to parse api key file {path}: {message}")]
    KeyFileParse { path: PathBuf, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
}

/// Builds a fully-encoded `https` URL for the given source, path, and query.
pub fn build_url(
    source: RemoteSource,
    path: &str,
    query: &[(&str, String)],
) -> Result<String, ClientError> {
    let base = format!("https://{}/{}", source.host(), path.trim_start_matches('/'));
    let mut url =
        reqwest::Url::parse(&base).map_err(|err| ClientError::InvalidUrl(err.to_string()))?;

    if !query.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(query.iter().map(|(key, value)| (*key, value.as_str())));
    }

    Ok(url.into())
}

/// Raw response from the remote fetch capability: a status code plus the
/// uninterpreted body. Parsing happens in the fetch pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: String,
}

impl GatewayResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait HttpGateway {
    fn get(&self, url: &str) -> Result<GatewayResponse, ClientError>;
}

/// Blocking reqwest gateway with a per-request deadline and the source's auth
/// header applied to every call.
pub struct ReqwestGateway {
    client: reqwest::blocking::Client,
    auth_header: (&'static str, String),
}

impl ReqwestGateway {
    pub fn new(
        source: RemoteSource,
        credentials: &Credentials,
        timeout_ms: u64,
    ) -> Result<Self, ClientError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| ClientError::HttpClientBuild(err.to_string()))?;

        Ok(Self {
            client,
            auth_header: source.auth_header(credentials),
        })
    }
}

impl HttpGateway for ReqwestGateway {
    fn get(&self, url: &str) -> Result<GatewayResponse, ClientError> {
        let (header_name, header_value) = &self.auth_header;
        let response = self
            .client
            .get(url)
            .header(*header_name, header_value)
            .send()
            .map_err(|err| ClientError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status().as_u16();
        let body = response.text().map_err(|err| ClientError::HttpRequest {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        Ok(GatewayResponse { status, body })
    }
}
