//! Device discovery and client registration on the relay server.

use std::time::Duration;

use url::Url;

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::protocol::{Paths, RegisterClientRequest, RobotList, RobotSummary};
use crate::retry::{RetryPolicy, with_retry};

/// HTTP client for the relay server's robot registry.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    robots_url: Url,
    register_url: Url,
    timeout: Duration,
    list_policy: RetryPolicy,
    register_policy: RetryPolicy,
}

impl RegistryClient {
    pub fn new(config: &LinkConfig) -> LinkResult<Self> {
        let timeout = config.timeouts.http_timeout();
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            robots_url: config.api_url(Paths::ROBOTS)?,
            register_url: config.api_url(Paths::REGISTER_CLIENT)?,
            timeout,
            list_policy: RetryPolicy::query(),
            register_policy: RetryPolicy::idempotent(),
        })
    }

    /// Replace both retry policies.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.list_policy = policy.clone();
        self.register_policy = policy;
        self
    }

    /// `GET /api/robots?online=1`
    pub async fn list_online_robots(&self) -> LinkResult<Vec<RobotSummary>> {
        let mut url = self.robots_url.clone();
        url.query_pairs_mut().append_pair("online", "1");

        let (http, timeout, url) = (&self.http, self.timeout, &url);
        let list: RobotList = with_retry(&self.list_policy, || async move {
            let response = http
                .get(url.clone())
                .send()
                .await
                .map_err(|e| LinkError::from_http(e, timeout))?;
            let response = check_status(response).await?;
            response
                .json::<RobotList>()
                .await
                .map_err(|e| LinkError::ProtocolError {
                    reason: format!("invalid robot list: {e}"),
                })
        })
        .await?;

        tracing::debug!(count = list.robots.len(), "Listed online robots");
        Ok(list.robots)
    }

    /// `POST /api/clients/register`
    pub async fn register_client(&self, client_id: &str) -> LinkResult<()> {
        let body = RegisterClientRequest { client_id };
        let (http, timeout, url, body) = (&self.http, self.timeout, &self.register_url, &body);
        with_retry(&self.register_policy, || async move {
            let response = http
                .post(url.clone())
                .json(body)
                .send()
                .await
                .map_err(|e| LinkError::from_http(e, timeout))?;
            check_status(response).await.map(drop)
        })
        .await?;

        tracing::info!(client_id, "Client registered");
        Ok(())
    }
}

/// Server errors are transient (`Http`); anything else non-2xx is not.
async fn check_status(response: reqwest::Response) -> LinkResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let text = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(LinkError::Http(format!("{url} answered {status}: {text}")))
    } else {
        Err(LinkError::ProtocolError {
            reason: format!("{url} answered {status}: {text}"),
        })
    }
}
