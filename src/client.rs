use crate::{
    connection::{Connection, ConnectionInfo, TlsInfo},
    request::{Cancellation, Request},
    response::Response,
};
use anyhow::{anyhow, bail};
use log::trace;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{self, OwnedTrustAnchor, RootCertStore, ServerName},
    TlsConnector,
};
use url::Url;

/// Front door for one-off requests: TCP connect, TLS with `h2` ALPN, then an
/// HTTP/2 connection handshake per request. Pooling belongs to a layer above.
pub struct Client {
    rustls_config: Arc<rustls::ClientConfig>,
}

impl Client {
    pub async fn get(&self, url: Url) -> anyhow::Result<Response> {
        self.request(Request::get(url)).await
    }

    pub async fn request(&self, request: Request) -> anyhow::Result<Response> {
        trace!("{} {}", request.method, request.url);
        let connection = self.connect(&request.url).await?;
        let response = connection.request(request, Cancellation::none()).await?;
        trace!("response: {}", response.status());
        Ok(response)
    }

    pub async fn connect(&self, url: &Url) -> anyhow::Result<Connection> {
        if url.scheme() != "https" {
            bail!("only https URLs are supported, got {:?}", url.scheme());
        }
        let host = url.host_str().ok_or_else(|| anyhow!("connect host name"))?;
        let stream = TcpStream::connect(&*url.socket_addrs(|| None)?).await?;
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();

        let server_name =
            ServerName::try_from(host).map_err(|_| anyhow!("invalid DNS name {}", host))?;
        let connector = TlsConnector::from(self.rustls_config.clone());
        let stream = connector.connect(server_name, stream).await?;

        let (_, session) = stream.get_ref();
        if session.alpn_protocol() != Some(b"h2") {
            bail!("server did not negotiate HTTP/2");
        }
        let info = ConnectionInfo {
            local_addr,
            remote_addr,
            tls: Some(TlsInfo {
                alpn_protocol: session.alpn_protocol().map(<[u8]>::to_vec),
                protocol_version: session
                    .protocol_version()
                    .map(|version| format!("{:?}", version)),
            }),
        };
        Ok(Connection::handshake(stream, info).await?)
    }
}

impl Default for Client {
    fn default() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let mut config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![vec![b'h', b'2']];
        Self {
            rustls_config: Arc::new(config),
        }
    }
}
