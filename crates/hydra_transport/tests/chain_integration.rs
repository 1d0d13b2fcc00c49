//! Integration test: a blocked CDN front falls back to the LAN mesh.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use hydra_transport::resolve::{HostResolver, StaticResolver};
use hydra_transport::{FrontingTransport, MeshTransport, Transport, TransportManager};

const FRONT: &str = "front.test";
const HIDDEN: &str = "hidden-service.test";

/// TLS stub that answers every request with the given status.
async fn spawn_blocked_cdn(cert: hydra_tls::HostCert, status: StatusCode) -> u16 {
    let config = hydra_tls::server_config(&cert.cert_pem, &cert.key_pem).unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let service = service_fn(move |_req: http::Request<Incoming>| async move {
                    Ok::<_, std::convert::Infallible>(
                        Response::builder()
                            .status(status)
                            .body(Full::new(Bytes::new()))
                            .unwrap(),
                    )
                });
                hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .await
                    .ok();
            });
        }
    });

    port
}

#[tokio::test]
async fn blocked_front_falls_back_to_mesh_peer() {
    let ca = hydra_tls::DevCa::generate().unwrap();
    let cert = ca.issue_host_cert(&[FRONT]).unwrap();
    let cdn_port = spawn_blocked_cdn(cert, StatusCode::BAD_GATEWAY).await;

    let resolvers: Vec<Arc<dyn HostResolver>> = vec![Arc::new(StaticResolver::new(vec![
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    ]))];
    let fronting = FrontingTransport::new(FRONT, HIDDEN)
        .unwrap()
        .with_port(cdn_port)
        .with_tls_config(Arc::new(hydra_tls::ca_client_config(&ca.cert_pem).unwrap()))
        .with_resolvers(resolvers);

    // First peer's port is closed; second peer accepts and reads to EOF.
    let closed = {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let live_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let live_addr = live_listener.local_addr().unwrap();
    let received = tokio::spawn(async move {
        let (mut stream, _) = live_listener.accept().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    });

    let mesh = Arc::new(MeshTransport::new(
        vec![format!("127.0.0.1:{closed}"), live_addr.to_string()],
        0,
    ));

    let manager = TransportManager::new(vec![
        Arc::new(fronting) as Arc<dyn Transport>,
        mesh as Arc<dyn Transport>,
    ]);

    let cancel = CancellationToken::new();
    manager.send(&cancel, b"fallback payload").await.unwrap();

    assert_eq!(manager.current_transport().await.unwrap().name(), "mesh");
    assert_eq!(received.await.unwrap(), b"fallback payload".to_vec());
}
