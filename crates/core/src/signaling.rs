//! Signaling Gateway
//!
//! The single request/response exchange of a local offer for a remote answer.
//! [`HttpSignalingGateway`] speaks the `/api/offer` contract of the voice
//! server; tests and other deployments can supply their own gateway.

use crate::error::SignalingError;
use crate::transport::{SdpKind, SessionDescription};
use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// The remote description returned by the signaling service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingAnswer {
    pub description: SessionDescription,
    /// Server-side identifier of the peer connection.
    pub pc_id: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    /// Exchanges `offer` for the remote answer. `pc_id` names an existing
    /// server-side connection to renegotiate, if any.
    async fn exchange(
        &self,
        offer: SessionDescription,
        pc_id: Option<String>,
    ) -> Result<SignalingAnswer, SignalingError>;
}

#[derive(Serialize, Debug)]
struct OfferRequest {
    sdp: String,
    #[serde(rename = "type")]
    kind: SdpKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pc_id: Option<String>,
    restart_pc: bool,
}

#[derive(Deserialize, Debug)]
struct AnswerBody {
    sdp: String,
    #[serde(rename = "type")]
    kind: SdpKind,
    #[serde(default)]
    pc_id: Option<String>,
}

/// Posts offers to `{server_url}/api/offer` with a bearer credential.
pub struct HttpSignalingGateway {
    client: reqwest::Client,
    offer_url: String,
    credential: SecretString,
}

impl HttpSignalingGateway {
    /// # Arguments
    ///
    /// * `server_url` - Base URL of the voice server, e.g. `http://localhost:8000`.
    /// * `credential` - Access token issued by the login flow; never logged.
    pub fn new(server_url: &str, credential: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            offer_url: format!("{}/api/offer", server_url.trim_end_matches('/')),
            credential,
        }
    }

    pub fn offer_url(&self) -> &str {
        &self.offer_url
    }
}

#[async_trait]
impl SignalingGateway for HttpSignalingGateway {
    #[instrument(skip_all, fields(url = %self.offer_url))]
    async fn exchange(
        &self,
        offer: SessionDescription,
        pc_id: Option<String>,
    ) -> Result<SignalingAnswer, SignalingError> {
        let request = OfferRequest {
            sdp: offer.sdp,
            kind: offer.kind,
            pc_id,
            restart_pc: false,
        };
        debug!(sdp_len = request.sdp.len(), "Sending offer");

        let response = self
            .client
            .post(&self.offer_url)
            .bearer_auth(self.credential.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SignalingError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SignalingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let answer: AnswerBody = serde_json::from_str(&body)
            .map_err(|e| SignalingError::MalformedAnswer(e.to_string()))?;
        if answer.kind != SdpKind::Answer {
            return Err(SignalingError::MalformedAnswer(format!(
                "expected an answer, got an {}",
                answer.kind
            )));
        }
        if answer.sdp.trim().is_empty() {
            return Err(SignalingError::MalformedAnswer("empty sdp".to_string()));
        }
        debug!(pc_id = ?answer.pc_id, "Received answer");

        Ok(SignalingAnswer {
            description: SessionDescription::answer(answer.sdp),
            pc_id: answer.pc_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        http::{HeaderMap, StatusCode as HttpStatus},
        response::{IntoResponse, Response},
        routing::post,
    };
    use serde_json::{Value, json};

    /// Serves `/api/offer` with `handler` and returns the base URL.
    async fn serve<H, T>(handler: H) -> String
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        let app = Router::new().route("/api/offer", post(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn gateway(url: &str, token: &str) -> HttpSignalingGateway {
        HttpSignalingGateway::new(url, SecretString::from(token.to_string()))
    }

    async fn echo_answer(headers: HeaderMap, Json(body): Json<Value>) -> Response {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if auth != "Bearer good-token" {
            return HttpStatus::UNAUTHORIZED.into_response();
        }
        assert_eq!(body["type"], "offer");
        assert_eq!(body["restart_pc"], false);
        assert!(body.get("pc_id").is_none());
        Json(json!({
            "sdp": format!("answer-for:{}", body["sdp"].as_str().unwrap()),
            "type": "answer",
            "pc_id": "pc-42"
        }))
        .into_response()
    }

    #[test]
    fn test_offer_url_joins_base() {
        let gateway = gateway("http://localhost:8000/", "t");
        assert_eq!(gateway.offer_url(), "http://localhost:8000/api/offer");
    }

    #[tokio::test]
    async fn test_exchange_returns_answer() {
        let url = serve(echo_answer).await;
        let answer = gateway(&url, "good-token")
            .exchange(SessionDescription::offer("v=0 local"), None)
            .await
            .unwrap();

        assert_eq!(answer.description, SessionDescription::answer("answer-for:v=0 local"));
        assert_eq!(answer.pc_id.as_deref(), Some("pc-42"));
    }

    #[tokio::test]
    async fn test_exchange_rejected_credential() {
        let url = serve(echo_answer).await;
        let err = gateway(&url, "bad-token")
            .exchange(SessionDescription::offer("v=0"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::Unauthorized));
    }

    #[tokio::test]
    async fn test_exchange_server_error_status() {
        let url = serve(|| async { (HttpStatus::INTERNAL_SERVER_ERROR, "pipeline down") }).await;
        let err = gateway(&url, "good-token")
            .exchange(SessionDescription::offer("v=0"), None)
            .await
            .unwrap_err();
        match err {
            SignalingError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "pipeline down");
            }
            other => panic!("Expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exchange_malformed_body() {
        let url = serve(|| async { "this is not json" }).await;
        let err = gateway(&url, "good-token")
            .exchange(SessionDescription::offer("v=0"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::MalformedAnswer(_)));

        let url = serve(|| async { Json(json!({"sdp": "v=0", "type": "offer"})) }).await;
        let err = gateway(&url, "good-token")
            .exchange(SessionDescription::offer("v=0"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::MalformedAnswer(_)));
    }

    #[tokio::test]
    async fn test_exchange_unreachable_server() {
        // Bind and drop a listener to find a port with nothing behind it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = gateway(&format!("http://{}", addr), "good-token")
            .exchange(SessionDescription::offer("v=0"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::Request(_)));
    }
}
