use async_trait::async_trait;
use reqwest::header::CONTENT_LENGTH;
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Network seam for the image cache.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Download the full body of `url`. Non-success statuses, empty bodies and bodies
    /// shorter than the advertised length are errors.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn fetch_error(url: &str, reason: impl ToString) -> PipelineError {
    PipelineError::Fetch {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(fetch_error(url, format!("HTTP {}", status.as_u16())));
        }
        let advertised: Option<u64> = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());

        let bytes = resp.bytes().await.map_err(|e| fetch_error(url, e))?.to_vec();
        if bytes.is_empty() {
            return Err(fetch_error(url, "empty body"));
        }
        if let Some(expected) = advertised {
            if (bytes.len() as u64) < expected {
                return Err(fetch_error(
                    url,
                    format!("truncated body: {} of {} bytes", bytes.len(), expected),
                ));
            }
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves canned raw HTTP responses keyed by request path, one per connection.
    async fn serve(routes: Vec<(&'static str, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let response = routes
                    .iter()
                    .find(|(p, _)| *p == path)
                    .map(|(_, r)| *r)
                    .unwrap_or("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn bad_responses_are_fetch_errors() {
        let base = serve(vec![
            ("/ok.jpg", "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\njpeg"),
            ("/missing.jpg", "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"),
            ("/empty.jpg", "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"),
            ("/short.jpg", "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nonly-a-few"),
        ])
        .await;
        let fetcher = HttpFetcher::new("sf311-test", 5).unwrap();

        assert_eq!(fetcher.fetch(&format!("{}/ok.jpg", base)).await.unwrap(), b"jpeg");

        let err = fetcher.fetch(&format!("{}/missing.jpg", base)).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 404"), "{}", err);

        let err = fetcher.fetch(&format!("{}/empty.jpg", base)).await.unwrap_err();
        assert!(err.to_string().contains("empty body"), "{}", err);

        let err = fetcher.fetch(&format!("{}/short.jpg", base)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Fetch { .. }), "{}", err);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_fetch_error() {
        let fetcher = HttpFetcher::new("sf311-test", 2).unwrap();
        let err = fetcher.fetch("http://127.0.0.1:1/none.jpg").await.unwrap_err();
        assert!(matches!(err, PipelineError::Fetch { .. }));
    }
}
