//! Hosted-backend bindings: REST data access over reqwest and realtime
//! channels over websockets. These implement the backend traits; everything
//! above them is transport-agnostic.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use shared::{
    domain::{EntityKind, RecordId, Topic},
    error::ApiError,
    protocol::{ChangeEvent, Credential, EntityRecord, RefreshRequest},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, error::ProtocolError, Message},
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    backend::{AuthBackend, DataBackend, EventStream, RealtimeBackend, ReadFilter},
    error::CoreError,
};

/// REST client for the hosted backend's auth and data surfaces.
#[derive(Clone)]
pub struct HostedBackend {
    http: reqwest::Client,
    base_url: Url,
}

impl HostedBackend {
    pub fn new(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    fn endpoint(&self, path: &str) -> Result<Url, CoreError> {
        self.base_url
            .join(path)
            .map_err(|err| CoreError::Transport(format!("bad endpoint {path}: {err}")))
    }
}

#[async_trait]
impl AuthBackend for HostedBackend {
    async fn get_session(&self) -> Result<Option<Credential>, CoreError> {
        let response = self
            .http
            .get(self.endpoint("auth/session")?)
            .send()
            .await
            .map_err(transport_err)?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let credential = response.json::<Credential>().await.map_err(transport_err)?;
                Ok(Some(credential))
            }
            _ => Err(decode_error(response).await),
        }
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Credential, CoreError> {
        let response = self
            .http
            .post(self.endpoint("auth/refresh")?)
            .json(&RefreshRequest {
                refresh_token: refresh_token.to_owned(),
            })
            .send()
            .await
            .map_err(transport_err)?;
        match response.status() {
            // A rejected refresh token cannot be retried into a session.
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CoreError::SessionExpired),
            status if status.is_success() => {
                response.json::<Credential>().await.map_err(transport_err)
            }
            _ => Err(decode_error(response).await),
        }
    }
}

#[async_trait]
impl DataBackend for HostedBackend {
    async fn create(
        &self,
        credential: &Credential,
        entity: EntityKind,
        payload: &serde_json::Value,
    ) -> Result<EntityRecord, CoreError> {
        let response = self
            .http
            .post(self.endpoint(entity.as_path())?)
            .bearer_auth(&credential.access_token)
            .json(payload)
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        response.json::<EntityRecord>().await.map_err(transport_err)
    }

    async fn read(
        &self,
        credential: &Credential,
        entity: EntityKind,
        filter: ReadFilter,
    ) -> Result<Vec<EntityRecord>, CoreError> {
        let mut url = self.endpoint(entity.as_path())?;
        match filter {
            ReadFilter::Topic(topic) => {
                url.query_pairs_mut()
                    .append_pair("topic", &topic.to_string());
            }
            ReadFilter::ById(id) => {
                let id = server_id(id)?;
                url.query_pairs_mut().append_pair("id", &id.to_string());
            }
            ReadFilter::Latest { limit } => {
                url.query_pairs_mut()
                    .append_pair("order", "created_at.desc")
                    .append_pair("limit", &limit.to_string());
            }
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        response
            .json::<Vec<EntityRecord>>()
            .await
            .map_err(transport_err)
    }

    async fn update(
        &self,
        credential: &Credential,
        entity: EntityKind,
        id: RecordId,
        payload: &serde_json::Value,
    ) -> Result<EntityRecord, CoreError> {
        let id = server_id(id)?;
        let response = self
            .http
            .patch(self.endpoint(&format!("{}/{id}", entity.as_path()))?)
            .bearer_auth(&credential.access_token)
            .json(payload)
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        response.json::<EntityRecord>().await.map_err(transport_err)
    }

    async fn delete(
        &self,
        credential: &Credential,
        entity: EntityKind,
        id: RecordId,
    ) -> Result<(), CoreError> {
        let id = server_id(id)?;
        let response = self
            .http
            .delete(self.endpoint(&format!("{}/{id}", entity.as_path()))?)
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        Ok(())
    }
}

/// Websocket binding of the realtime surface: one socket per topic, change
/// events as JSON text frames.
#[derive(Clone)]
pub struct WsRealtime {
    http: reqwest::Client,
    base_url: Url,
}

impl WsRealtime {
    pub fn new(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }
}

#[async_trait]
impl RealtimeBackend for WsRealtime {
    async fn open_channel(
        &self,
        credential: &Credential,
        topic: Topic,
    ) -> Result<EventStream, CoreError> {
        let mut url = derive_ws_url(&self.base_url)?;
        url.set_path("realtime");
        url.query_pairs_mut()
            .append_pair("topic", &topic.to_string())
            .append_pair("access_token", &credential.access_token);

        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| CoreError::Channel(err.to_string()))?;
        debug!(%topic, "websocket connected");

        let events = socket
            .take_while(|frame| {
                // A closed or reset socket ends the stream; the dispatch
                // loop treats exhaustion as a drop and resyncs.
                let live = !matches!(frame, Err(err) if is_disconnect(err));
                std::future::ready(live)
            })
            .filter_map(move |frame| async move {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ChangeEvent>(&text) {
                        Ok(event) => Some(Ok(event)),
                        Err(err) => {
                            warn!(%topic, %err, "dropping unparseable realtime frame");
                            None
                        }
                    },
                    // Pings are answered by the library; other frame kinds
                    // carry nothing for us.
                    Ok(_) => None,
                    Err(err) => Some(Err(CoreError::Channel(err.to_string()))),
                }
            })
            .boxed();
        Ok(events)
    }

    async fn snapshot(
        &self,
        credential: &Credential,
        topic: Topic,
    ) -> Result<Vec<EntityRecord>, CoreError> {
        let url = self
            .base_url
            .join(&format!("topics/{topic}/records"))
            .map_err(|err| CoreError::Transport(err.to_string()))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        response
            .json::<Vec<EntityRecord>>()
            .await
            .map_err(transport_err)
    }
}

fn is_disconnect(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

/// Maps the REST base url onto its websocket counterpart.
fn derive_ws_url(base_url: &Url) -> Result<Url, CoreError> {
    let mut url = base_url.clone();
    let scheme = match base_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(CoreError::Transport(format!(
                "cannot derive websocket url from scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| CoreError::Transport("websocket scheme rejected".into()))?;
    Ok(url)
}

/// Mutating calls address server-issued ids only; a local temporary id means
/// the entity was never confirmed.
fn server_id(id: RecordId) -> Result<i64, CoreError> {
    match id {
        RecordId::Server(id) => Ok(id),
        RecordId::Local(temp_id) => Err(CoreError::Transport(format!(
            "record {temp_id} has no server id yet"
        ))),
    }
}

fn transport_err(err: reqwest::Error) -> CoreError {
    CoreError::Transport(err.to_string())
}

async fn decode_error(response: reqwest::Response) -> CoreError {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(api) => CoreError::Transport(format!("{status}: {api}")),
        Err(_) => CoreError::Transport(format!("unexpected status {status}")),
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
