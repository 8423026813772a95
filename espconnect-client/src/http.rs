//! Plain HTTP requests, used to fetch and upload project documents.

use crate::error::ClientError;
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::debug;

/// Status and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub text: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    bearer: Option<String>,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            bearer: None,
        })
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, ClientError> {
        self.send(Method::GET, url, None).await
    }

    pub async fn post(&self, url: &str, body: Option<String>) -> Result<HttpResponse, ClientError> {
        self.send(Method::POST, url, body).await
    }

    pub async fn put(&self, url: &str, body: Option<String>) -> Result<HttpResponse, ClientError> {
        self.send(Method::PUT, url, body).await
    }

    pub async fn delete(&self, url: &str) -> Result<HttpResponse, ClientError> {
        self.send(Method::DELETE, url, None).await
    }

    /// Fetches `url` and fails unless the status is 2xx.
    pub async fn fetch_text(&self, url: &str) -> Result<String, ClientError> {
        let response = self.get(url).await?;
        if !response.is_success() {
            return Err(ClientError::Server {
                text: format!("GET {} failed with status {}", url, response.status),
                details: Vec::new(),
            });
        }
        Ok(response.text)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<String>,
    ) -> Result<HttpResponse, ClientError> {
        debug!(%method, url, "http request");
        let mut request = self.client.request(method, url);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok(HttpResponse { status, text })
    }
}
