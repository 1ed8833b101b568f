//! Extension wait utility: block until the extension has connected and
//! reported at least one page, for the human-gated step of clicking the
//! extension icon after the relay comes up.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct ExtensionStatusBody {
    connected: bool,
    #[serde(rename = "pageCount")]
    page_count: usize,
}

/// Poll `GET http://host:port/extension-status` every `poll_interval` until
/// it reports `connected && pageCount > 0`, or `timeout` elapses.
pub async fn wait_for_extension(host: &str, port: u16, poll_interval: Duration, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://{host}:{port}/extension-status");
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<ExtensionStatusBody>().await {
                    Ok(body) if body.connected && body.page_count > 0 => return Ok(()),
                    Ok(body) => debug!(connected = body.connected, pages = body.page_count, "extension not ready yet"),
                    Err(e) => debug!(error = %e, "malformed extension-status body"),
                }
            }
            Ok(resp) => debug!(status = %resp.status(), "extension-status probe got non-success status"),
            Err(e) => debug!(error = %e, "extension-status probe failed"),
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::ExtensionNotConnected { port });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use http_body_util::Full;
    use hyper::body::{Bytes, Incoming};
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder as ConnBuilder;
    use tokio::net::TcpListener;

    async fn serve_once(addr: SocketAddr, body: &'static str) {
        let listener = TcpListener::bind(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let io = TokioIo::new(stream);
        let service = service_fn(move |_req: Request<Incoming>| async move {
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
        });
        let _ = ConnBuilder::new(TokioExecutor::new()).serve_connection(io, service).await;
    }

    #[tokio::test]
    async fn succeeds_once_extension_reports_a_page() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = tokio::spawn(serve_once(addr, r#"{"connected":true,"pageCount":1,"pages":[]}"#));
        let result =
            wait_for_extension("127.0.0.1", addr.port(), Duration::from_millis(10), Duration::from_secs(2)).await;
        assert!(result.is_ok());
        let _ = server.await;
    }

    #[tokio::test]
    async fn times_out_when_nothing_answers() {
        let result =
            wait_for_extension("127.0.0.1", 1, Duration::from_millis(10), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::ExtensionNotConnected { .. })));
    }
}
