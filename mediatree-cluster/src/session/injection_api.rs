//! Control API of injection nodes

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use mediatree_core::models::NodeInfo;
use mediatree_core::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub session_id: String,
    pub room_id: u32,
    pub audio_ssrc: u32,
    pub video_ssrc: u32,
}

/// Where the injection is sending RTP for the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub host: String,
    pub audio_port: u16,
    pub video_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    /// Path of the WHIP endpoint, relative to the injection API
    pub endpoint: String,
    pub room_id: u32,
    pub audio_ssrc: u32,
    pub video_ssrc: u32,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InjectionApi: Send + Sync {
    /// Open a publisher room for the session; only 200 and 201 are success
    async fn create_session(
        &self,
        injection: &NodeInfo,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse>;

    async fn destroy_session(&self, injection: &NodeInfo, session_id: &str) -> Result<()>;
}

/// [`InjectionApi`] over HTTP
#[derive(Clone)]
pub struct HttpInjectionApi {
    client: reqwest::Client,
}

impl HttpInjectionApi {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl InjectionApi for HttpInjectionApi {
    async fn create_session(
        &self,
        injection: &NodeInfo,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        let url = format!("{}/session", injection.internal_api_base());
        debug!(url = %url, session_id = %request.session_id, "Creating session on injection");

        let response = self.client.post(&url).json(request).send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!(
                "injection {} answered {status} to session create: {body}",
                injection.node_id
            )));
        }

        Ok(response.json().await?)
    }

    async fn destroy_session(&self, injection: &NodeInfo, session_id: &str) -> Result<()> {
        let url = format!(
            "{}/session/{session_id}/destroy",
            injection.internal_api_base()
        );
        let response = self.client.post(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "injection {} answered {} to session destroy",
                injection.node_id,
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_node, mesh};
    use mediatree_core::models::NodeKind;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn injection_at(server: &MockServer) -> NodeInfo {
        let (mesh, _) = mesh();
        let mut info = add_node(&mesh, "inj-1", NodeKind::Injection).await;
        info.internal_host = server.address().ip().to_string();
        info.internal_api_port = server.address().port();
        info
    }

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            session_id: "sess-A".to_string(),
            room_id: 1000,
            audio_ssrc: 10000,
            video_ssrc: 10001,
        }
    }

    fn api() -> HttpInjectionApi {
        HttpInjectionApi::new(Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_create_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .and(body_json(json!({
                "sessionId": "sess-A",
                "roomId": 1000,
                "audioSsrc": 10000,
                "videoSsrc": 10001
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "sessionId": "sess-A",
                "endpoint": "/whip/endpoint/sess-A",
                "roomId": 1000,
                "audioSsrc": 10000,
                "videoSsrc": 10001,
                "recipients": [{"host": "relay-root-1", "audioPort": 5002, "videoPort": 5004}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let injection = injection_at(&server).await;
        let response = api().create_session(&injection, &request()).await.unwrap();
        assert_eq!(response.endpoint, "/whip/endpoint/sess-A");
        assert_eq!(response.recipients[0].host, "relay-root-1");
    }

    #[tokio::test]
    async fn test_only_200_and_201_are_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({})))
            .mount(&server)
            .await;

        let injection = injection_at(&server).await;
        let err = api().create_session(&injection, &request()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("202"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let injection = injection_at(&server).await;
        assert!(matches!(
            api().create_session(&injection, &request()).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/sess-A/destroy"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/gone/destroy"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let injection = injection_at(&server).await;
        api().destroy_session(&injection, "sess-A").await.unwrap();
        assert!(api().destroy_session(&injection, "gone").await.is_err());
    }
}
