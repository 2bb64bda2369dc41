#![allow(dead_code)]

use futures::StreamExt;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tunnelbus_bus::{Delivery, DeliveryStream};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Serve `app` on an ephemeral local port
pub async fn serve(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Next delivery of a stream, failing the test after [`TIMEOUT`]
pub async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery stream ended")
        .expect("delivery error")
}

/// Assert nothing arrives on `stream` for a short while
pub async fn assert_silent(stream: &mut DeliveryStream) {
    let next = tokio::time::timeout(Duration::from_millis(150), stream.next()).await;
    assert!(next.is_err(), "unexpected delivery");
}

/// A port nothing listens on
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// TLS acceptor with a freshly generated self-signed certificate for localhost
pub fn self_signed_acceptor() -> TlsAcceptor {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = cert.serialize_der().unwrap();
    let key_der = cert.serialize_private_key_der();

    let certs = vec![CertificateDer::from(cert_der)];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();

    TlsAcceptor::from(Arc::new(config))
}
