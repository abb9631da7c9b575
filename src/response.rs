use crate::types::*;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

/// Response body as an ordered chunk stream fed by the frame processor.
/// The channel closing cleanly marks END_STREAM.
#[derive(Debug)]
pub struct Body {
    rx: Option<mpsc::UnboundedReceiver<Result<Bytes, Error>>>,
}

impl Body {
    pub(crate) fn empty() -> Self {
        Self { rx: None }
    }

    pub(crate) fn channel() -> (mpsc::UnboundedSender<Result<Bytes, Error>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx: Some(rx) })
    }

    /// Next body chunk in arrival order; `None` once the stream ended.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, Error>> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

#[derive(Debug)]
pub struct Response {
    headers: Headers,
    body: Body,
}

impl Response {
    pub(crate) fn new(headers: Headers, body: Body) -> Self {
        Self { headers, body }
    }

    /// First header with the given name, case-insensitively.
    pub fn header(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_ref())
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn status(&self) -> u16 {
        // The frame processor rejects responses without :status.
        self.header(":status")
            .expect("no status in response")
            .parse()
            .expect("non-number status")
    }

    #[must_use]
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Collect the remaining body into one buffer.
    pub async fn bytes(mut self) -> Result<Bytes, Error> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.body.chunk().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }

    pub async fn text(self) -> Result<String, Error> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    #[cfg(feature = "json")]
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> anyhow::Result<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
