//! HTTPS accept loop.
//!
//! `axum::serve` has no TLS hook, so each connection is terminated with
//! rustls here and served by hyper. The verified client chain, when the
//! peer sent one, rides along on every request as a [`PeerCertificate`]
//! extension.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::pki::tls::PeerCertificate;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve `router` over TLS until `shutdown` fires, then drain open
/// connections.
pub async fn serve_tls(
    listener: TcpListener,
    tls: Arc<ServerConfig>,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    let mut connections = JoinSet::new();
    tracing::info!(addr = %listener.local_addr()?, "HTTPS listener started");

    loop {
        let (tcp, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!(%remote, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(%remote, "TLS handshake timed out");
                    return;
                }
            };
            let peer = stream
                .get_ref()
                .1
                .peer_certificates()
                .filter(|chain| !chain.is_empty())
                .map(|chain| PeerCertificate(chain.to_vec()));

            let service = hyper::service::service_fn(move |mut req: hyper::Request<Incoming>| {
                if let Some(peer) = &peer {
                    req.extensions_mut().insert(peer.clone());
                }
                router.clone().oneshot(req)
            });

            let builder = Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
            tokio::pin!(conn);
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(%remote, error = %e, "Connection ended with error");
                    }
                }
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    let _ = conn.await;
                }
            }
        });

        // Reap finished connections so the set does not grow unbounded.
        while connections.try_join_next().is_some() {}
    }

    tracing::info!(open = connections.len(), "HTTPS listener stopping");
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Connections still open after drain timeout, aborting");
        connections.abort_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::{SinkExt, StreamExt};
    use rcgen::{CertificateParams, DnType, KeyPair};
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;
    use tokio_rustls::client::TlsStream;

    use super::*;
    use crate::config::HttpConfig;
    use crate::db::memory::MemoryStore;
    use crate::pki::CertificateAuthority;
    use crate::pki::tls::{ListenerIdentity, server_config};
    use crate::server::{AppState, router, testing};

    struct Running {
        state: AppState,
        addr: std::net::SocketAddr,
        handle: tokio::task::JoinHandle<std::io::Result<()>>,
    }

    async fn start() -> Running {
        let state = testing::state(Arc::new(MemoryStore::new()));
        let identity = ListenerIdentity::resolve(&HttpConfig::default(), state.registration.ca()).unwrap();
        let tls = server_config(state.registration.ca(), identity).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(serve_tls(
            listener,
            tls,
            router(state.clone(), None),
            state.shutdown.clone(),
        ));
        Running { state, addr, handle }
    }

    fn client_config(
        ca: &CertificateAuthority,
        client: Option<(CertificateDer<'static>, PrivateKeyDer<'static>)>,
    ) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(ca.der().to_vec())).unwrap();
        let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots);
        let mut config = match client {
            Some((cert, key)) => builder.with_client_auth_cert(vec![cert], key).unwrap(),
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    async fn connect(addr: std::net::SocketAddr, config: Arc<ClientConfig>) -> TlsStream<TcpStream> {
        let tcp = TcpStream::connect(addr).await.unwrap();
        TlsConnector::from(config)
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_without_client_certificate() {
        let running = start().await;
        let mut tls = connect(running.addr, client_config(running.state.registration.ca(), None)).await;

        tls.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        // The peer may close without close_notify; what was read is enough.
        let _ = tls.read_to_end(&mut raw).await;
        let response = String::from_utf8_lossy(&raw);
        assert!(response.starts_with("HTTP/1.1 200"), "got {:?}", response);
        assert!(response.ends_with("ok"));

        running.state.shutdown.cancel();
        running.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn agent_session_over_mutual_tls() {
        let running = start().await;
        let registration = &running.state.registration;

        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "server-5");
        let csr = params.serialize_request(&key).unwrap().pem().unwrap();
        let issued = registration.issue(5, Duration::from_secs(60)).await.unwrap();
        let node = registration.register_node(5, &issued.token, &csr).await.unwrap();

        let client_cert = CertificateDer::from_pem_slice(node.certificate.as_bytes()).unwrap();
        let client_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let tls = connect(
            running.addr,
            client_config(registration.ca(), Some((client_cert, client_key))),
        )
        .await;

        let (mut ws, _) = tokio_tungstenite::client_async("ws://localhost/ws/agent", tls)
            .await
            .unwrap();
        ws.send(tokio_tungstenite::tungstenite::Message::Text(
            r#"{"type":"heartbeat","payload":{"timestamp":"2026-01-01T00:00:00Z","version":"1.0.0"}}"#.into(),
        ))
        .await
        .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(reply.to_text().unwrap().contains("\"type\":\"heartbeat_ack\""));
        assert!(running.state.hub.is_connected(5).await);

        running.state.shutdown.cancel();
        running.handle.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while running.state.hub.is_connected(5).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
