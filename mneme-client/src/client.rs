use futures::stream::Stream;
use futures::{
    StreamExt,
    stream::{self},
};
use reqwest::multipart;
use serde::{Serialize, de::DeserializeOwned};
use std::pin::Pin;
use tracing::{Level, event, instrument};

use crate::error::ApiError;
use crate::events::{self, StreamEvent};

pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Thin reqwest wrapper carrying the backend base URL and bearer token.
///
/// All methods take a path relative to the base URL. Non-success statuses
/// become `ApiError::Status` with the body text preserved for diagnostics.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        ApiClient {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Attach a bearer token to every subsequent request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error body".to_string());
        Err(ApiError::Status { status, body })
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn get<T>(&self, path: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let response = self.authorize(self.http.get(self.url(path))).send().await?;
        let text = Self::check(response).await?.text().await?;
        event!(Level::TRACE, response = text);
        Ok(serde_json::from_str::<T>(&text)?)
    }

    #[instrument(level = "trace", skip(self, request))]
    pub async fn post<S, T>(&self, path: &str, request: &S) -> Result<T, ApiError>
    where
        S: Serialize + Sized,
        T: DeserializeOwned,
    {
        let response = self
            .authorize(self.http.post(self.url(path)).json(request))
            .send()
            .await?;
        let text = Self::check(response).await?.text().await?;
        event!(Level::TRACE, response = text);
        Ok(serde_json::from_str::<T>(&text)?)
    }

    /// POST with a JSON body, discarding any response body (204-style routes).
    #[instrument(level = "trace", skip(self, request))]
    pub async fn post_no_content<S>(&self, path: &str, request: &S) -> Result<(), ApiError>
    where
        S: Serialize + Sized,
    {
        let response = self
            .authorize(self.http.post(self.url(path)).json(request))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// POST without a body, discarding any response body.
    #[instrument(level = "trace", skip(self))]
    pub async fn post_empty(&self, path: &str) -> Result<(), ApiError> {
        let response = self.authorize(self.http.post(self.url(path))).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    /// POST a form-urlencoded body (the token endpoint wants a form, not JSON).
    #[instrument(level = "trace", skip(self, form))]
    pub async fn post_form<S, T>(&self, path: &str, form: &S) -> Result<T, ApiError>
    where
        S: Serialize + Sized,
        T: DeserializeOwned,
    {
        let response = self
            .authorize(self.http.post(self.url(path)).form(form))
            .send()
            .await?;
        let text = Self::check(response).await?.text().await?;
        Ok(serde_json::from_str::<T>(&text)?)
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let response = self
            .authorize(self.http.delete(self.url(path)))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// DELETE with a JSON body (the document-deletion route takes one).
    #[instrument(level = "trace", skip(self, request))]
    pub async fn delete_json<S>(&self, path: &str, request: &S) -> Result<(), ApiError>
    where
        S: Serialize + Sized,
    {
        let response = self
            .authorize(self.http.delete(self.url(path)).json(request))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Multipart file upload with optional extra text fields.
    #[instrument(level = "trace", skip(self, bytes, fields))]
    pub async fn post_multipart<T>(
        &self,
        path: &str,
        file_name: &str,
        bytes: Vec<u8>,
        fields: &[(&str, String)],
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let part = multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let mut form = multipart::Form::new().part("file", part);
        for (key, value) in fields {
            form = form.text(key.to_string(), value.clone());
        }

        let response = self
            .authorize(self.http.post(self.url(path)).multipart(form))
            .send()
            .await?;
        let text = Self::check(response).await?.text().await?;
        event!(Level::TRACE, response = text);
        Ok(serde_json::from_str::<T>(&text)?)
    }

    /// POST a query and consume the chunked response incrementally.
    ///
    /// The body is newline-delimited `data: <json>` records; records may span
    /// multiple reads, so a partial trailing line is buffered across chunks
    /// and only complete lines are parsed. The buffer holds raw bytes: a
    /// read boundary can fall inside a multi-byte UTF-8 sequence, so text
    /// conversion happens per complete line, never per chunk. Malformed
    /// records are skipped. A transport error mid-stream ends the stream
    /// after an `Error` event.
    #[instrument(level = "trace", skip(self, request))]
    pub async fn post_stream<S>(
        &self,
        path: &str,
        request: &S,
    ) -> Result<BoxedStream<StreamEvent>, ApiError>
    where
        S: Serialize + Sized,
    {
        let response = self
            .authorize(self.http.post(self.url(path)).json(request))
            .send()
            .await?;
        let response = Self::check(response).await?;

        let bytes = response.bytes_stream();

        // Use scan to maintain state (line buffer) across chunks
        let buffered_stream = bytes.scan(Vec::new(), move |buffer: &mut Vec<u8>, chunk| {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    // The connection dropped mid-body; surface it in-band
                    // and let the consumer decide how much was usable.
                    return futures::future::ready(Some(vec![StreamEvent::Error(format!(
                        "stream read failed: {}",
                        e
                    ))]));
                }
            };

            buffer.extend_from_slice(&chunk);
            futures::future::ready(Some(drain_complete_lines(buffer)))
        });

        Ok(Box::pin(buffered_stream.flat_map(stream::iter)))
    }
}

/// Split off every complete line in `buffer` and parse each as a record.
///
/// Bytes after the last newline stay in the buffer for the next chunk, so
/// both records and UTF-8 sequences may straddle read boundaries freely.
fn drain_complete_lines(buffer: &mut Vec<u8>) -> Vec<StreamEvent> {
    let mut decoded: Vec<StreamEvent> = vec![];
    let mut consumed = 0;

    while let Some(pos) = buffer[consumed..].iter().position(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(&buffer[consumed..consumed + pos]);
        consumed += pos + 1;

        if let Some(ev) = events::parse_record(&line) {
            decoded.push(ev);
        }
    }

    buffer.drain(..consumed);
    decoded
}
