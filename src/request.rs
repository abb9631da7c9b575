use crate::types::*;
use bytes::Bytes;
use std::sync::OnceLock;
use tokio::sync::{mpsc, watch};
use url::Url;

#[derive(Debug, Clone, derive_more::Display)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "DELETE")]
    Delete,
    #[display(fmt = "HEAD")]
    Head,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "OPTIONS")]
    Options,
    #[display(fmt = "{}", _0)]
    Other(String),
}

/// Bytes to send after the request head. Streaming bodies are pulled one
/// chunk at a time so the driver can mark the final chunk with END_STREAM.
#[derive(Debug)]
pub enum RequestBody {
    Empty,
    Full(Bytes),
    Streaming(mpsc::Receiver<Bytes>),
}

impl RequestBody {
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        match self {
            Self::Empty => None,
            Self::Full(_) => {
                let Self::Full(bytes) = std::mem::replace(self, Self::Empty) else {
                    unreachable!()
                };
                Some(bytes)
            }
            Self::Streaming(rx) => rx.recv().await,
        }
    }

    /// Headers implied by the body, merged in only when the caller did not
    /// set them itself.
    pub(crate) fn content_headers(&self) -> Headers {
        match self {
            Self::Full(bytes) => vec![("content-length".to_owned(), bytes.len().to_string())],
            Self::Empty | Self::Streaming(_) => Vec::new(),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Self::Empty
        } else {
            Self::Full(bytes)
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub body: RequestBody,
    /// Cap on the compressed response header block for this exchange.
    pub max_header_size: usize,
    /// Cap on the response body for this exchange.
    pub max_body_size: usize,
}

impl Request {
    pub fn new(method: Method, url: Url, headers: Option<Headers>, body: RequestBody) -> Self {
        Self {
            method,
            url,
            headers: headers.unwrap_or_default(),
            body,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    #[inline]
    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url, None, RequestBody::Empty)
    }

    #[inline]
    pub fn post(url: Url, headers: Option<Headers>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::Post, url, headers, body.into().into())
    }

    #[cfg(feature = "json")]
    pub fn post_json<T: serde::Serialize>(url: Url, body: &T) -> serde_json::Result<Self> {
        let body = serde_json::to_vec(body)?;
        Ok(Self::new(
            Method::Post,
            url,
            Some(vec![(
                "content-type".to_owned(),
                "application/json".to_owned(),
            )]),
            Bytes::from(body).into(),
        ))
    }

    /// The wire header list: the four pseudo-headers first, then the caller's
    /// headers lowercased and in order, then body-implied headers the caller
    /// did not set. `host` and `connection` never survive; HTTP/2 forbids
    /// them.
    pub(crate) fn header_list(&self) -> Result<Headers, Error> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| Error::InvalidRequest("request URL has no host".into()))?;
        let authority = match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };
        let mut path = self.url.path().to_owned();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = self.url.query() {
            path.push('?');
            path.push_str(query);
        }

        let mut list: Headers = vec![
            (":method".to_owned(), self.method.to_string()),
            (":scheme".to_owned(), self.url.scheme().to_owned()),
            (":path".to_owned(), path),
            (":authority".to_owned(), authority),
        ];
        for (name, value) in &self.headers {
            let name = name.to_ascii_lowercase();
            if name == "host" || name == "connection" || name.starts_with(':') {
                continue;
            }
            list.push((name, value.clone()));
        }
        for (name, value) in self.body.content_headers() {
            if !list.iter().any(|(existing, _)| existing == &name) {
                list.push((name, value));
            }
        }
        Ok(list)
    }
}

/// Cooperative cancellation handle for a single request.
///
/// Dropping the [`CancellationSource`] without firing it leaves the request
/// running to completion.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// A token that never fires, for callers without a cancellation path.
    #[must_use]
    pub fn none() -> Self {
        static NEVER: OnceLock<watch::Sender<bool>> = OnceLock::new();
        Self {
            rx: NEVER.get_or_init(|| watch::channel(false).0).subscribe(),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the source
    /// is dropped unfired.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    #[must_use]
    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}
