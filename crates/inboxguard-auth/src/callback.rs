//! Loopback HTTP listener for the OAuth redirect.
//!
//! After consent the authorization server redirects the browser to
//! `http://127.0.0.1:<port>/callback?code=...&state=...`. The
//! [`CallbackServer`] binds first so the redirect URI (with the actual port)
//! can go into the authorization URL, then waits for that single request,
//! answers with a small HTML page and hands back the code and state.
//!
//! Raw [`tokio::net::TcpListener`]; no HTTP framework.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{AuthError, Result};

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>InboxGuard connected</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #f5f5f5;
            color: #333;
        }
        .card { text-align: center; padding: 3rem; background: white; border-radius: 12px; }
        h1 { color: #22c55e; margin-bottom: 0.5rem; }
    </style>
</head>
<body>
    <div class="card">
        <h1>Account connected</h1>
        <p>You can close this tab and return to InboxGuard.</p>
    </div>
</body>
</html>"#;

const FAILURE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>InboxGuard sign-in failed</title></head>
<body>
    <h1>Sign-in was not completed</h1>
    <p>Return to InboxGuard and try connecting the account again.</p>
</body>
</html>"#;

/// Code and state extracted from the redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

/// What a single inbound request turned out to be.
#[derive(Debug)]
enum CallbackRequest {
    /// The redirect we are waiting for.
    Redirect(CallbackParams),
    /// Something else the browser asked for (favicon, wrong path).
    Unrelated,
}

/// A one-shot HTTP listener for the OAuth redirect.
pub struct CallbackServer {
    listener: TcpListener,
    addr: SocketAddr,
    path: String,
}

impl CallbackServer {
    /// Bind the listener. Port `0` lets the OS choose.
    ///
    /// `path` is the redirect path, e.g. `/callback`.
    pub async fn bind(host: &str, port: u16, path: &str) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "callback server listening for OAuth redirect");
        Ok(Self {
            listener,
            addr,
            path: path.to_string(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The redirect URI to register in the authorization URL.
    pub fn redirect_uri(&self) -> String {
        format!("http://{}{}", self.addr, self.path)
    }

    /// Wait for the redirect, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::CallbackTimeout`] if nothing arrives in time.
    /// - [`AuthError::FlowFailed`] if the server reported an error (for
    ///   example the user denied consent) or the redirect is malformed.
    pub async fn wait(self, timeout: Duration) -> Result<CallbackParams> {
        match tokio::time::timeout(timeout, self.accept_redirect()).await {
            Ok(inner) => inner,
            Err(_) => Err(AuthError::CallbackTimeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Accept connections until the redirect arrives.
    async fn accept_redirect(&self) -> Result<CallbackParams> {
        loop {
            let (mut stream, peer) = self.listener.accept().await?;
            tracing::debug!(peer = %peer, "accepted callback connection");

            // Redirects are small GET requests.
            let mut buf = [0u8; 8192];
            let n = stream.read(&mut buf).await?;
            let request = String::from_utf8_lossy(&buf[..n]);

            match Self::parse_callback_request(&request, &self.path) {
                Ok(CallbackRequest::Redirect(params)) => {
                    respond(&mut stream, "200 OK", SUCCESS_HTML).await?;
                    tracing::info!("callback received, authorization code extracted");
                    return Ok(params);
                }
                Ok(CallbackRequest::Unrelated) => {
                    respond(&mut stream, "404 Not Found", "").await?;
                }
                Err(e) => {
                    respond(&mut stream, "400 Bad Request", FAILURE_HTML).await?;
                    return Err(e);
                }
            }
        }
    }

    /// Parse the request line of an HTTP GET.
    ///
    /// Expected format: `GET /callback?code=xxx&state=yyy HTTP/1.1`
    fn parse_callback_request(request: &str, expected_path: &str) -> Result<CallbackRequest> {
        let request_line = request
            .lines()
            .next()
            .ok_or_else(|| AuthError::FlowFailed {
                reason: "empty HTTP request".to_string(),
            })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() < 2 {
            return Err(AuthError::FlowFailed {
                reason: format!("malformed HTTP request line: {request_line}"),
            });
        }

        let (path, query) = match parts[1].split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (parts[1], None),
        };
        if path != expected_path {
            return Ok(CallbackRequest::Unrelated);
        }
        let query = query.ok_or_else(|| AuthError::FlowFailed {
            reason: "callback request has no query string".to_string(),
        })?;

        let mut code: Option<String> = None;
        let mut state: Option<String> = None;
        let mut error: Option<String> = None;
        let mut error_description: Option<String> = None;

        for param in query.split('&') {
            if let Some((key, value)) = param.split_once('=') {
                let decoded = percent_decode(value);
                match key {
                    "code" => code = Some(decoded),
                    "state" => state = Some(decoded),
                    "error" => error = Some(decoded),
                    "error_description" => error_description = Some(decoded),
                    _ => {}
                }
            }
        }

        if let Some(error) = error {
            let reason = match error_description {
                Some(description) => {
                    format!("authorization server returned error: {error} ({description})")
                }
                None => format!("authorization server returned error: {error}"),
            };
            return Err(AuthError::FlowFailed { reason });
        }

        let code = code.ok_or_else(|| AuthError::FlowFailed {
            reason: "callback missing 'code' parameter".to_string(),
        })?;
        let state = state.ok_or_else(|| AuthError::FlowFailed {
            reason: "callback missing 'state' parameter".to_string(),
        })?;

        Ok(CallbackRequest::Redirect(CallbackParams { code, state }))
    }
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Percent-decoding for query values; `+` is a space. Decoded bytes are
/// reassembled as UTF-8.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                output.push((hex_value(bytes[i + 1]) << 4) | hex_value(bytes[i + 2]));
                i += 3;
            }
            b'+' => {
                output.push(b' ');
                i += 1;
            }
            b => {
                output.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&output).into_owned()
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(request: &str) -> Result<CallbackParams> {
        match CallbackServer::parse_callback_request(request, "/callback")? {
            CallbackRequest::Redirect(params) => Ok(params),
            CallbackRequest::Unrelated => panic!("request treated as unrelated"),
        }
    }

    #[test]
    fn parse_callback_request_standard() {
        let request =
            "GET /callback?code=abc123&state=xyz789 HTTP/1.1\r\nHost: 127.0.0.1:8400\r\n\r\n";
        let params = parse(request).unwrap();
        assert_eq!(params.code, "abc123");
        assert_eq!(params.state, "xyz789");
    }

    #[test]
    fn parse_callback_request_with_google_extras() {
        let request = "GET /callback?state=s456&code=4%2F0Ad&scope=email+openid&authuser=0&prompt=consent HTTP/1.1\r\n\r\n";
        let params = parse(request).unwrap();
        assert_eq!(params.code, "4/0Ad");
        assert_eq!(params.state, "s456");
    }

    #[test]
    fn other_paths_are_unrelated() {
        let request = "GET /favicon.ico HTTP/1.1\r\n\r\n";
        assert!(matches!(
            CallbackServer::parse_callback_request(request, "/callback").unwrap(),
            CallbackRequest::Unrelated
        ));
    }

    #[test]
    fn parse_callback_request_missing_code() {
        let err = parse("GET /callback?state=xyz HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("missing 'code' parameter"));
    }

    #[test]
    fn parse_callback_request_missing_state() {
        let err = parse("GET /callback?code=abc HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("missing 'state' parameter"));
    }

    #[test]
    fn parse_callback_request_no_query() {
        let err = parse("GET /callback HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("no query string"));
    }

    #[test]
    fn access_denied_is_reported() {
        let err = parse(
            "GET /callback?error=access_denied&error_description=User+cancelled&state=xyz HTTP/1.1\r\n\r\n",
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("access_denied"));
        assert!(msg.contains("User cancelled"));
    }

    #[test]
    fn parse_callback_request_empty_or_malformed() {
        assert!(CallbackServer::parse_callback_request("", "/callback").is_err());
        assert!(CallbackServer::parse_callback_request("NOTHTTP", "/callback").is_err());
    }

    #[test]
    fn percent_decode_cases() {
        assert_eq!(percent_decode("hello"), "hello");
        assert_eq!(percent_decode("hello%20world"), "hello world");
        assert_eq!(percent_decode("a%2Fb"), "a/b");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("caf%C3%A9"), "café");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(percent_decode(""), "");
    }

    #[tokio::test]
    async fn callback_server_receives_redirect() {
        let server = CallbackServer::bind("127.0.0.1", 0, "/callback").await.unwrap();
        let port = server.local_addr().port();
        assert_eq!(
            server.redirect_uri(),
            format!("http://127.0.0.1:{port}/callback")
        );

        let client_task = tokio::spawn(async move {
            // A stray favicon request first; the server must keep waiting.
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream
                .write_all(b"GET /favicon.ico HTTP/1.1\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).contains("404"));

            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let request = format!(
                "GET /callback?code=test_code_42&state=test_state_99 HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(request.as_bytes()).await.unwrap();

            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let response = String::from_utf8_lossy(&buf[..n]);
            assert!(response.contains("200 OK"));
            assert!(response.contains("return to InboxGuard"));
        });

        let params = server.wait(Duration::from_secs(5)).await.unwrap();
        client_task.await.unwrap();

        assert_eq!(params.code, "test_code_42");
        assert_eq!(params.state, "test_state_99");
    }

    #[tokio::test]
    async fn callback_server_timeout() {
        let server = CallbackServer::bind("127.0.0.1", 0, "/callback").await.unwrap();
        let result = server.wait(Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(AuthError::CallbackTimeout { timeout_secs: 1 })
        ));
    }
}
