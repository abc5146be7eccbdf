use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, TypedValue};

use super::{CmabAttributes, CmabConfig, CmabError, RetryConfig};

/// Network boundary of the bandit: asks the prediction endpoint for a variation.
#[async_trait]
pub trait CmabClient: Send + Sync {
    /// Fetch the variation id chosen for `user_id` in the CMAB experiment `rule_id`.
    async fn fetch_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &CmabAttributes,
        cmab_uuid: &str,
    ) -> Result<String, CmabError>;
}

/// [`CmabClient`] talking JSON over HTTP with bounded exponential-backoff retries.
pub struct HttpCmabClient {
    http: reqwest::Client,
    endpoint: Url,
    request_timeout: Duration,
    retry: RetryConfig,
}

#[derive(Debug, Serialize)]
struct PredictionRequest<'a> {
    instances: [PredictionInstance<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictionInstance<'a> {
    visitor_id: &'a str,
    experiment_id: &'a str,
    attributes: Vec<PredictionAttribute<'a>>,
    #[serde(rename = "cmabUUID")]
    cmab_uuid: &'a str,
}

#[derive(Debug, Serialize)]
struct PredictionAttribute<'a> {
    id: &'a str,
    value: &'a TypedValue,
    #[serde(rename = "type")]
    attribute_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    variation_id: String,
}

impl HttpCmabClient {
    pub fn new(config: &CmabConfig) -> Result<HttpCmabClient, Error> {
        HttpCmabClient::with_http_client(config, reqwest::Client::new())
    }

    /// Create a client reusing an existing `reqwest` client (connection pool, proxies, TLS
    /// settings).
    pub fn with_http_client(
        config: &CmabConfig,
        http: reqwest::Client,
    ) -> Result<HttpCmabClient, Error> {
        let endpoint = Url::parse(&config.prediction_endpoint).map_err(Error::InvalidEndpoint)?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::InvalidEndpoint(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }

        Ok(HttpCmabClient {
            http,
            endpoint,
            request_timeout: config.request_timeout,
            retry: config.retry.clone(),
        })
    }

    fn url_for(&self, rule_id: &str) -> Url {
        let mut url = self.endpoint.clone();
        // Checked at construction that the endpoint can be a base.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(rule_id);
        }
        url
    }

    async fn send(&self, url: &Url, request: &PredictionRequest<'_>) -> Result<String, CmabError> {
        let response = self
            .http
            .post(url.clone())
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CmabError::HttpStatus(status.as_u16()));
        }

        let body = response.bytes().await?;
        let response: PredictionResponse =
            serde_json::from_slice(&body).map_err(|_| CmabError::InvalidResponse)?;

        response
            .predictions
            .into_iter()
            .next()
            .map(|prediction| prediction.variation_id)
            .ok_or(CmabError::InvalidResponse)
    }
}

#[async_trait]
impl CmabClient for HttpCmabClient {
    async fn fetch_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &CmabAttributes,
        cmab_uuid: &str,
    ) -> Result<String, CmabError> {
        let url = self.url_for(rule_id);
        let request = PredictionRequest {
            instances: [PredictionInstance {
                visitor_id: user_id,
                experiment_id: rule_id,
                attributes: attributes
                    .iter()
                    .map(|(id, value)| PredictionAttribute {
                        id,
                        value,
                        attribute_type: "custom_attribute",
                    })
                    .collect(),
                cmab_uuid,
            }],
        };

        let mut retry = 0;
        loop {
            match self.send(&url, &request).await {
                Ok(variation_id) => {
                    log::debug!(target: "decision_core",
                                rule_id,
                                user_id,
                                variation_id = variation_id.as_str();
                                "fetched prediction");
                    return Ok(variation_id);
                }
                Err(err) if !err.is_retryable() => {
                    log::warn!(target: "decision_core", rule_id, user_id; "prediction request failed: {err}");
                    return Err(err);
                }
                Err(err) if retry >= self.retry.max_retries => {
                    log::warn!(target: "decision_core", rule_id, user_id; "prediction request failed, giving up: {err}");
                    return Err(CmabError::RetriesExhausted {
                        attempts: retry + 1,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.retry.backoff(retry);
                    log::info!(target: "decision_core",
                               rule_id,
                               user_id,
                               retry,
                               delay:? = delay;
                               "prediction request failed, retrying: {err}");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}
