//! HTTP client the node agent uses to talk to the coordinator.

use thiserror::Error;

use crate::api::{GreenResponse, TableResponse};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The coordinator answered with a non-success status.
    #[error("coordinator returned {status}: {message}")]
    Api { status: u16, message: String },
}

pub struct CoordinatorClient {
    base_url: String,
    http: reqwest::Client,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    /// `GET /gettable/node/{node_id}/`: the agent's routing-table refresh.
    pub async fn fetch_table(&self, node_id: &str) -> Result<TableResponse, ClientError> {
        let url = format!("{}/gettable/node/{}/", self.base_url, node_id);
        let response = self.http.get(url).send().await?;
        Ok(Self::checked(response).await?.json().await?)
    }

    /// `POST /green/{node_id}/`: ships one frame per edge as multipart
    /// parts named by edge id and returns the fresh schedule.
    pub async fn calculate_green(
        &self,
        node_id: &str,
        images: Vec<(String, Vec<u8>)>,
    ) -> Result<GreenResponse, ClientError> {
        let mut form = reqwest::multipart::Form::new();
        for (edge_id, bytes) in images {
            let part =
                reqwest::multipart::Part::bytes(bytes).file_name(format!("{edge_id}.jpg"));
            form = form.part(edge_id, part);
        }

        let url = format!("{}/green/{}/", self.base_url, node_id);
        let response = self.http.post(url).multipart(form).send().await?;
        Ok(Self::checked(response).await?.json().await?)
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        Err(ClientError::Api { status, message })
    }
}
