//! Transport seam: performs the network call for a request descriptor.
//!
//! A [`Transport`] never fails with `Err`. Connection refusals, timeouts and
//! other dispatch failures come back as [`ResponseOutcome::TransportError`]
//! so the orchestrator can turn them into an `ERROR` verdict.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use volley_types::{
    Headers, HttpRequest, HttpResponse, RequestBody, ResponseOutcome, TransportError,
    TransportErrorKind,
};

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(&self, request: &HttpRequest) -> ResponseOutcome;
}

/// Dispatch through `transport`, stamping the elapsed wall time onto the outcome.
pub async fn dispatch_timed(transport: &dyn Transport, request: &HttpRequest) -> ResponseOutcome {
    tracing::debug!(method = %request.method, url = %request.url, "Dispatching request");
    let started = Instant::now();
    let mut outcome = transport.dispatch(request).await;
    outcome.set_response_time_ms(started.elapsed().as_millis() as u64);
    if let Some(error) = outcome.error() {
        tracing::warn!(
            method = %request.method,
            url = %request.url,
            kind = ?error.kind,
            error = %error.message,
            "Error performing request"
        );
    }
    outcome
}

// ---------------------------------------------------------------------------
// ReqwestTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl ReqwestTransport {
    /// `default_timeout` applies to requests that carry no timeout of their own.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_timeout,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn build(&self, request: &HttpRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            TransportError::new(
                TransportErrorKind::Request,
                format!("Invalid HTTP method '{}': {e}", request.method),
            )
        })?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout.unwrap_or(self.default_timeout));

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        builder = match &request.body {
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Text(text)) => builder.body(text.clone()),
            Some(RequestBody::Bytes(bytes)) => builder.body(bytes.clone()),
            Some(RequestBody::Form(fields)) => builder.form(fields),
            None => builder,
        };

        Ok(builder)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

fn classify(error: &reqwest::Error) -> TransportErrorKind {
    if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_connect() {
        TransportErrorKind::Connect
    } else if error.is_body() || error.is_decode() {
        TransportErrorKind::Body
    } else if error.is_builder() || error.is_request() {
        TransportErrorKind::Request
    } else {
        TransportErrorKind::Other
    }
}

fn transport_error(error: reqwest::Error) -> TransportError {
    TransportError::new(classify(&error), error.to_string())
}

fn extract_headers(header_map: &reqwest::header::HeaderMap) -> Headers {
    // header values with opaque bytes are skipped
    header_map
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)))
        .collect()
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn dispatch(&self, request: &HttpRequest) -> ResponseOutcome {
        let builder = match self.build(request) {
            Ok(b) => b,
            Err(e) => return ResponseOutcome::transport_error(e),
        };

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => return ResponseOutcome::transport_error(transport_error(e)),
        };

        let status = response.status().as_u16();
        let headers = extract_headers(response.headers());
        match response.bytes().await {
            Ok(body) => ResponseOutcome::Received(HttpResponse::new(status, headers, body.to_vec())),
            Err(e) => ResponseOutcome::transport_error(transport_error(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct SlowTransport;

    #[async_trait]
    impl Transport for SlowTransport {
        async fn dispatch(&self, _request: &HttpRequest) -> ResponseOutcome {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ResponseOutcome::Received(HttpResponse::json(200, &json!({"ok": true})))
        }
    }

    /// Serve exactly one canned HTTP/1.1 response on an ephemeral port.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nX-Trace: t-1\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn dispatch_timed_stamps_response_time() {
        let request = HttpRequest::get("http://localhost/slow");
        let outcome = dispatch_timed(&SlowTransport, &request).await;
        assert!(outcome.response_time_ms() >= 20);
        assert_eq!(outcome.status(), Some(200));
    }

    #[tokio::test]
    async fn reqwest_transport_reads_status_headers_and_json() {
        let base = serve_once("201 Created", r#"{"id":42}"#).await;
        let transport = ReqwestTransport::default();
        let request = HttpRequest::post(format!("{base}/users")).with_json(json!({"name": "jon"}));

        let outcome = dispatch_timed(&transport, &request).await;
        let response = outcome.response().expect("response expected");
        assert_eq!(response.status, 201);
        assert_eq!(response.headers.get("X-Trace"), Some("t-1"));
        assert_eq!(response.json, Some(json!({"id": 42})));
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ReqwestTransport::default();
        let outcome = transport.dispatch(&HttpRequest::get(format!("http://{addr}/"))).await;
        let error = outcome.error().expect("transport error expected");
        assert_eq!(error.kind, TransportErrorKind::Connect);
    }

    #[tokio::test]
    async fn request_timeout_surfaces_as_timeout_marker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let transport = ReqwestTransport::default();
        let request =
            HttpRequest::get(format!("http://{addr}/hang")).with_timeout(Duration::from_millis(50));
        let outcome = transport.dispatch(&request).await;
        assert_eq!(outcome.error().unwrap().kind, TransportErrorKind::Timeout);
    }

    #[tokio::test]
    async fn invalid_method_is_rejected_before_sending() {
        let transport = ReqwestTransport::default();
        let request = HttpRequest::new("BAD METHOD", "http://localhost/");
        let outcome = transport.dispatch(&request).await;
        assert_eq!(outcome.error().unwrap().kind, TransportErrorKind::Request);
    }
}
