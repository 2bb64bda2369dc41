//! HTTP relay
//!
//! Consumes tunneled requests from `{username}_request_bus`, replays them
//! against the local target named by the `internal-target-uri` header and
//! publishes the response on the `response` exchange with the request's
//! correlation id. A request that fails anywhere gets no response; the remote
//! caller is expected to time out.

pub mod headers;
pub mod rewrite;

use crate::envelope::{parse_uri, require};
use crate::error::{RelayError, RelayResult};
use reqwest::header::LOCATION;
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnelbus_bus::{spawn_serial_consumer, Delivery, MessageBus, OutboundMessage};
use tunnelbus_proto::headers::{DESTINATION_HOST, INTERNAL_TARGET_URI};
use tunnelbus_proto::topology::{
    http_request_queue, RESPONSE_BINDING_KEY, RESPONSE_EXCHANGE, RESPONSE_QUEUE,
};
use tunnelbus_proto::{HttpRequestModel, HttpResponseModel};
use url::Url;

use self::headers::{build_request_headers, collect_response_headers, media_type};
use self::rewrite::{local_url, redirect_target, rewrite_urls};

/// Media types whose bodies get internal URLs rewritten
const REWRITTEN_MEDIA_TYPES: [&str; 2] = ["text/html", "text/javascript"];

pub struct HttpRelay {
    bus: Arc<dyn MessageBus>,
    client: reqwest::Client,
}

impl HttpRelay {
    pub fn new(bus: Arc<dyn MessageBus>) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .max_tls_version(reqwest::tls::Version::TLS_1_2)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        Ok(Self { bus, client })
    }

    /// Declare the HTTP topology and start consuming the user's request queue
    pub async fn start_for_user(
        self: &Arc<Self>,
        username: &str,
        cancel: CancellationToken,
    ) -> RelayResult<JoinHandle<()>> {
        self.bus
            .declare_topic(RESPONSE_EXCHANGE, RESPONSE_QUEUE, RESPONSE_BINDING_KEY)
            .await?;

        let queue = http_request_queue(username);
        self.bus.declare_queue(&queue).await?;
        let deliveries = self.bus.consume(&queue).await?;

        info!(username, queue = %queue, "HTTP relay started");

        let relay = Arc::clone(self);
        Ok(spawn_serial_consumer(
            queue,
            deliveries,
            cancel,
            move |delivery| {
                let relay = relay.clone();
                async move { relay.handle_delivery(delivery).await }
            },
        ))
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let correlation_id = delivery.correlation_id.clone().unwrap_or_default();

        if let Err(e) = self.relay(&delivery).await {
            warn!(correlation_id = %correlation_id, "Dropping HTTP request: {}", e);
        }
    }

    async fn relay(&self, delivery: &Delivery) -> RelayResult<()> {
        let internal = parse_uri(require(&delivery.headers, INTERNAL_TARGET_URI)?)?;
        let host = require(&delivery.headers, DESTINATION_HOST)?;
        let request: HttpRequestModel = tunnelbus_proto::decode(&delivery.body)?;

        debug!(
            host,
            method = %request.method,
            url = %request.request_url,
            "Relaying HTTP request"
        );

        let response = self.forward(&request, &internal).await?;
        let status = response.http_status_code;

        let body = tunnelbus_proto::encode(&response).map_err(RelayError::Serialization)?;
        let mut message = OutboundMessage::new(body);
        if let Some(id) = &delivery.correlation_id {
            message = message.with_correlation_id(id.clone());
        }

        self.bus
            .publish(RESPONSE_EXCHANGE, RESPONSE_BINDING_KEY, message)
            .await?;

        debug!(host, status, "Published HTTP response");
        Ok(())
    }

    /// Issue `request` against the local target and build the tunneled response
    pub async fn forward(
        &self,
        request: &HttpRequestModel,
        internal: &Url,
    ) -> RelayResult<HttpResponseModel> {
        let public = parse_uri(&request.request_url)?;
        let target = local_url(&public, internal).map_err(|e| RelayError::InvalidUri {
            uri: request.request_url.clone(),
            reason: e.to_string(),
        })?;

        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| RelayError::InvalidMethod(request.method.clone()))?;
        let has_body = carries_body(&method);

        let mut builder = self
            .client
            .request(method, target.clone())
            .headers(build_request_headers(&request.headers, internal, has_body));
        if has_body {
            builder = builder.body(request.bytes.clone().unwrap_or_default());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                RelayError::LocalConnect {
                    target: target.to_string(),
                    reason: e.to_string(),
                }
            } else {
                RelayError::LocalRequest(e)
            }
        })?;

        build_response(response, &public, internal).await
    }
}

fn carries_body(method: &Method) -> bool {
    ![Method::GET, Method::HEAD, Method::DELETE, Method::TRACE].contains(method)
}

async fn build_response(
    response: reqwest::Response,
    public: &Url,
    internal: &Url,
) -> RelayResult<HttpResponseModel> {
    let status = response.status();
    let headers = collect_response_headers(response.headers());

    if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND {
        let redirect_url = match response.headers().get(LOCATION).and_then(|v| v.to_str().ok()) {
            Some(location) => Some(
                redirect_target(location, public, internal)
                    .map_err(|e| RelayError::InvalidUri {
                        uri: location.to_string(),
                        reason: e.to_string(),
                    })?
                    .to_string(),
            ),
            None => None,
        };

        return Ok(HttpResponseModel {
            http_status_code: status.as_u16(),
            headers,
            is_success_status_code: false,
            is_redirected: true,
            redirect_url,
            ..Default::default()
        });
    }

    let content_type = media_type(response.headers());
    let bytes = response.bytes().await?.to_vec();

    let string_content = match content_type.as_deref() {
        Some(media) if REWRITTEN_MEDIA_TYPES.contains(&media) => {
            Some(rewrite_urls(&String::from_utf8_lossy(&bytes), internal, public))
        }
        _ => None,
    };

    Ok(HttpResponseModel {
        http_status_code: status.as_u16(),
        content_type,
        headers,
        string_content,
        bytes: Some(bytes),
        is_success_status_code: status.is_success(),
        is_redirected: false,
        redirect_url: None,
    })
}
