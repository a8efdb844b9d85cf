#![expect(missing_docs, reason = "testing")]
#![expect(clippy::unwrap_used, reason = "testing")]

use {
    rpgsync_fetch::{
        download::{Fetcher, TRANSPORT_ERROR_BASE, TransportErrorCode, parse_last_modified},
        http::{HttpFetcher, SessionPool},
        reqwest,
    },
    std::{fs, net::SocketAddr},
    tempfile::TempDir,
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    },
};

fn fetcher() -> HttpFetcher {
    HttpFetcher::with_pool(SessionPool::with_client_builder(2, || {
        reqwest::Client::builder().no_proxy()
    }))
}

/// Answers a single request with `response` and closes the connection.
async fn serve_once(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut tcp, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = tcp.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        tcp.write_all(response.as_bytes()).await.unwrap();
        tcp.shutdown().await.unwrap();
    });
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn success_is_streamed_to_file() {
    let addr = serve_once(
        "HTTP/1.1 200 OK\r\n\
         Content-Length: 5\r\n\
         Last-Modified: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
         Connection: close\r\n\
         \r\n\
         hello",
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("System/Window.png");

    let fetcher = fetcher();
    let outcome = fetcher
        .fetch(&format!("http://{addr}/2kki/System/Window.png"), &dest)
        .await;

    assert_eq!(200, outcome.status);
    assert_eq!(
        parse_last_modified("Sun, 06 Nov 1994 08:49:37 GMT"),
        outcome.last_modified.as_deref().and_then(parse_last_modified)
    );
    assert_eq!("hello", fs::read_to_string(&dest).unwrap());
    assert!(!dir.path().join("System/Window.png.part").exists());
    assert_eq!(1, fetcher.pool().idle());
}

#[tokio::test(flavor = "multi_thread")]
async fn error_status_writes_nothing() {
    let addr = serve_once(
        "HTTP/1.1 404 Not Found\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n",
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("missing.png");

    let outcome = fetcher()
        .fetch(&format!("http://{addr}/missing.png"), &dest)
        .await;

    assert_eq!(404, outcome.status);
    assert!(!dest.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connection_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let dir = TempDir::new().unwrap();

    let outcome = fetcher()
        .fetch(&format!("http://{addr}/a.png"), &dir.path().join("a.png"))
        .await;

    assert_eq!(TransportErrorCode::ConnectionFailure.status(), outcome.status);
}

#[tokio::test(flavor = "multi_thread")]
async fn truncated_body_keeps_cached_file() {
    let addr = serve_once(
        "HTTP/1.1 200 OK\r\n\
         Content-Length: 100\r\n\
         Connection: close\r\n\
         \r\n\
         hello",
    )
    .await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("Music/theme.ogg");
    fs::create_dir_all(dest.parent().unwrap()).unwrap();
    fs::write(&dest, "cached").unwrap();

    let outcome = fetcher()
        .fetch(&format!("http://{addr}/Music/theme.ogg"), &dest)
        .await;

    assert!(outcome.status >= TRANSPORT_ERROR_BASE);
    assert_eq!("cached", fs::read_to_string(&dest).unwrap());
    assert!(!dir.path().join("Music/theme.ogg.part").exists());
}
