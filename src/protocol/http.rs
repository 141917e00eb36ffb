//! reqwest-backed [`BeaconTransport`].
//!
//! Status and new-session probes are `GET`s, beacon chunks are `POST`ed as
//! plain text. Every request carries the monitor query parameters
//! (`type=m`, server id, application id, agent version, platform and
//! technology type) and asks for a JSON answer.

use async_trait::async_trait;
use log::debug;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use std::time::Duration;
use url::Url;

use super::response::{ResponseAttributes, StatusResponse};
use super::transport::{BeaconRequest, BeaconTransport};
use super::{AGENT_TECHNOLOGY_TYPE, AGENT_VERSION, PLATFORM_TYPE};
use crate::config::OpenKitConfig;
use crate::error::TransportError;

const CLIENT_IP_HEADER: &str = "X-Client-IP";

pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    application_id: String,
}

impl HttpTransport {
    pub fn new(config: &OpenKitConfig) -> Result<Self, TransportError> {
        let endpoint = Url::parse(&config.endpoint_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", config.endpoint_url, e)))?;
        let client = Client::builder().timeout(config.sending.http_timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            application_id: config.application_id.clone(),
        })
    }

    /// Full request URL including the monitor query parameters.
    pub fn request_url(&self, request: &BeaconRequest) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("type", "m")
                .append_pair("srvid", &request.server_id().to_string())
                .append_pair("app", &self.application_id)
                .append_pair("va", AGENT_VERSION)
                .append_pair("pt", &PLATFORM_TYPE.to_string())
                .append_pair("tt", AGENT_TECHNOLOGY_TYPE)
                .append_pair("resp", "json");
            if matches!(request, BeaconRequest::NewSession { .. }) {
                query.append_pair("ns", "1");
            }
        }
        url
    }
}

#[async_trait]
impl BeaconTransport for HttpTransport {
    async fn send(&self, request: BeaconRequest) -> Result<StatusResponse, TransportError> {
        let url = self.request_url(&request);
        debug!("Sending {} request to {}", request.kind(), url);

        let response = match request {
            BeaconRequest::Status { .. } | BeaconRequest::NewSession { .. } => {
                self.client.get(url).send().await?
            }
            BeaconRequest::Beacon {
                client_ip, payload, ..
            } => {
                let mut builder = self
                    .client
                    .post(url)
                    .header(CONTENT_TYPE, "text/plain; charset=UTF-8")
                    .body(payload);
                if let Some(ip) = client_ip {
                    builder = builder.header(CLIENT_IP_HEADER, ip);
                }
                builder.send().await?
            }
        };

        let code = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await?;

        // error bodies carry no capture directives
        let attributes = if code >= 400 {
            ResponseAttributes::undefined()
        } else {
            ResponseAttributes::parse(&body)?
        };

        let mut status = StatusResponse::new(code, attributes);
        status.retry_after = retry_after;
        Ok(status)
    }
}

/// `Retry-After` in delta-seconds form. HTTP dates are not supported and fall
/// back to the default delay.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
