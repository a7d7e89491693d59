//! S3-compatible remote store
//!
//! objects live at `<bucket>/<hex digest>`, manifests at
//! `<bucket>/manifests/<lookup-key>.json`. requests are signed with SigV4
//! using static credentials; path-style addressing is the default because
//! most self-hosted S3 implementations (minio, garage, ceph) need it.

use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use reqwest::blocking::{Body, Client, Response};
use reqwest::{Method, StatusCode, Url};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hash::digest_bytes;
use crate::store::sigv4::{self, Credentials, EMPTY_PAYLOAD_SHA256, UNSIGNED_PAYLOAD};
use crate::store::{ObjectReader, ObjectStore, Payload, StoreKey};

/// connection parameters for an S3-compatible endpoint
#[derive(Clone, Debug)]
pub struct S3Options {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub credentials: Credentials,
    /// `http://host/bucket/key` instead of `http://bucket.host/key`
    pub path_style: bool,
    /// how long transient failures are retried before giving up
    pub retry_window: Duration,
    /// per-request timeout
    pub timeout: Duration,
}

pub struct S3Store {
    client: Client,
    endpoint: Url,
    options: S3Options,
}

impl S3Store {
    pub fn new(options: S3Options) -> Result<Self> {
        let endpoint = Url::parse(&options.endpoint).map_err(|e| Error::InvalidEndpoint {
            endpoint: options.endpoint.clone(),
            message: e.to_string(),
        })?;
        if endpoint.host_str().is_none() {
            return Err(Error::InvalidEndpoint {
                endpoint: options.endpoint.clone(),
                message: "missing host".to_string(),
            });
        }

        let client = Client::builder().timeout(options.timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            options,
        })
    }

    /// url for `key` inside the bucket, or the bucket itself when `key` is None
    pub fn url_for(&self, key: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint.clone();
        let base = url.path().trim_end_matches('/').to_string();
        let bucket = &self.options.bucket;

        if self.options.path_style {
            let path = match key {
                Some(key) => format!("{base}/{bucket}/{key}"),
                None => format!("{base}/{bucket}"),
            };
            url.set_path(&path);
        } else {
            let host = self.endpoint.host_str().unwrap_or_default();
            url.set_host(Some(&format!("{bucket}.{host}")))
                .map_err(|e| Error::InvalidEndpoint {
                    endpoint: self.options.endpoint.clone(),
                    message: e.to_string(),
                })?;
            url.set_path(&format!("{base}/{}", key.unwrap_or("")));
        }
        Ok(url)
    }

    /// send a signed request, retrying transient failures with backoff
    fn execute(&self, method: Method, url: &Url, payload: Option<&Payload>) -> Result<Response> {
        self.execute_with(method, url, payload, EMPTY_PAYLOAD_SHA256)
    }

    fn execute_with(
        &self,
        method: Method,
        url: &Url,
        payload: Option<&Payload>,
        payload_sha256: &str,
    ) -> Result<Response> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_elapsed_time(Some(self.options.retry_window))
            .build();

        let attempt = || -> std::result::Result<Response, backoff::Error<Error>> {
            let response = match self.send_once(&method, url, payload, payload_sha256) {
                Ok(response) => response,
                Err(e) => {
                    let transient = matches!(&e, Error::Http(inner) if inner.is_connect() || inner.is_timeout());
                    if transient {
                        warn!(%url, error = %e, "store unreachable, retrying");
                        return Err(backoff::Error::transient(e));
                    }
                    return Err(backoff::Error::permanent(e));
                }
            };

            let status = response.status();
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                warn!(%url, status = status.as_u16(), "transient store error, retrying");
                return Err(backoff::Error::transient(remote_error(url, response)));
            }
            Ok(response)
        };

        backoff::retry(policy, attempt).map_err(|e| match e {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => err,
        })
    }

    fn send_once(
        &self,
        method: &Method,
        url: &Url,
        payload: Option<&Payload>,
        payload_sha256: &str,
    ) -> Result<Response> {
        let signed = sigv4::sign(
            &self.options.credentials,
            &self.options.region,
            method.as_str(),
            url,
            payload_sha256,
            Utc::now(),
        )?;

        debug!(method = %method, %url, "store request");
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header("authorization", signed.authorization)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256);

        if let Some(payload) = payload {
            let body = match payload {
                Payload::Bytes(bytes) => Body::from(bytes.clone()),
                Payload::File { .. } => Body::sized(payload.open()?, payload.len()),
            };
            request = request.body(body);
        }

        Ok(request.send()?)
    }
}

impl ObjectStore for S3Store {
    fn describe(&self) -> String {
        format!(
            "s3:{}/{}",
            self.endpoint.as_str().trim_end_matches('/'),
            self.options.bucket
        )
    }

    fn check_access(&self) -> Result<()> {
        let url = self.url_for(None)?;
        let response = self.execute(Method::HEAD, &url, None)?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::Remote {
                status: 404,
                key: self.options.bucket.clone(),
                message: "bucket does not exist".to_string(),
            }),
            _ => Err(remote_error(&url, response)),
        }
    }

    fn exists(&self, key: &StoreKey) -> Result<bool> {
        let url = self.url_for(Some(&key.remote_key()))?;
        let response = self.execute(Method::HEAD, &url, None)?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(remote_error(&url, response)),
        }
    }

    fn put(&self, key: &StoreKey, payload: &Payload) -> Result<()> {
        let url = self.url_for(Some(&key.remote_key()))?;
        // the store rejects a body that does not hash to the declared value,
        // so an object can never be stored under the wrong digest
        let payload_sha256 = match (key, payload) {
            (StoreKey::Object(digest), _) => digest.to_hex(),
            (StoreKey::Manifest(_), Payload::Bytes(bytes)) => digest_bytes(bytes).to_hex(),
            (StoreKey::Manifest(_), Payload::File { .. }) => UNSIGNED_PAYLOAD.to_string(),
        };
        let response = self.execute_with(Method::PUT, &url, Some(payload), &payload_sha256)?;
        if response.status().is_success() {
            debug!(%key, bytes = payload.len(), "uploaded");
            Ok(())
        } else {
            Err(remote_error(&url, response))
        }
    }

    fn get(&self, key: &StoreKey) -> Result<Option<ObjectReader>> {
        let url = self.url_for(Some(&key.remote_key()))?;
        let response = self.execute(Method::GET, &url, None)?;
        match response.status() {
            s if s.is_success() => Ok(Some(Box::new(response))),
            StatusCode::NOT_FOUND => {
                let status = response.status().as_u16();
                let body = response.text().unwrap_or_default();
                // a missing bucket is a configuration problem, not a cache miss
                match error_code(&body) {
                    Some("NoSuchBucket") => Err(Error::Remote {
                        status,
                        key: url.path().to_string(),
                        message: "NoSuchBucket".to_string(),
                    }),
                    _ => Ok(None),
                }
            }
            _ => Err(remote_error(&url, response)),
        }
    }
}

/// build an error from a non-success response, consuming its body
fn remote_error(url: &Url, response: Response) -> Error {
    let status = response.status().as_u16();
    let body = response.text().unwrap_or_default();
    let message = match error_code(&body) {
        Some(code) => code.to_string(),
        None if body.is_empty() => StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("request failed")
            .to_string(),
        None => body.chars().take(200).collect(),
    };
    Error::Remote {
        status,
        key: url.path().to_string(),
        message,
    }
}

/// `<Code>` element of an S3 XML error document
fn error_code(body: &str) -> Option<&str> {
    let start = body.find("<Code>")? + "<Code>".len();
    let end = body[start..].find("</Code>")? + start;
    Some(body[start..end].trim())
}
