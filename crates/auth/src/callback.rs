//! Loopback listener that receives the OAuth authorization redirect.
//!
//! The listener is bound before the browser opens. Requests for paths other
//! than the redirect path (favicon probes and the like) get a 404 and the
//! listener keeps waiting.

use keygate_types::{GatewayError, Result};
use reqwest::Url;
use std::{collections::HashMap, net::Ipv4Addr, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

/// How long to wait for the browser redirect.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on any one request line the listener will buffer.
const MAX_LINE: u64 = 8 * 1024;

/// What the authorization server sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Authorized { code: String, state: String },
    Denied { error: String, description: Option<String> },
}

impl Redirect {
    fn from_query(mut query: HashMap<String, String>) -> Result<Self> {
        if let Some(error) = query.remove("error") {
            return Ok(Self::Denied {
                error,
                description: query.remove("error_description"),
            });
        }
        let code = query
            .remove("code")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| GatewayError::Validation("redirect carries no authorization code".into()))?;
        Ok(Self::Authorized {
            code,
            state: query.remove("state").unwrap_or_default(),
        })
    }

    fn page(&self) -> String {
        let (title, body) = match self {
            Self::Authorized { .. } => ("keygate: signed in", "The credential is stored. Return to the terminal."),
            Self::Denied { .. } => ("keygate: sign-in refused", "The provider refused access. See the terminal for details."),
        };
        format!("<!doctype html><title>{title}</title><p>{body}</p>")
    }
}

/// A bound loopback listener waiting for one redirect.
#[derive(Debug)]
pub struct CallbackServer {
    listener: TcpListener,
    path: String,
}

impl CallbackServer {
    /// Binds `127.0.0.1` on the port of `redirect_uri`.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] for a redirect URI that is not an http
    /// loopback address with a port, or when the port is taken.
    pub async fn bind(redirect_uri: &str) -> Result<Self> {
        let url = parse_redirect_uri(redirect_uri)?;
        let port = url.port().unwrap_or_default();
        Self::bind_port(port, url.path()).await
    }

    /// Binds `port` directly. Port 0 picks a free one.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] when the port is taken, [`GatewayError::Network`]
    /// for other bind failures.
    pub async fn bind_port(port: u16, path: &str) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => {
                    GatewayError::Config(format!("redirect port {port} is held by another process"))
                }
                _ => GatewayError::Network(format!("binding redirect port {port}: {e}")),
            })?;
        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }

    /// The port actually bound.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Network`] if the socket address cannot be read.
    pub fn port(&self) -> Result<u16> {
        self.listener
            .local_addr()
            .map(|a| a.port())
            .map_err(|e| GatewayError::Network(e.to_string()))
    }

    /// Serves connections until one hits the redirect path or `timeout`
    /// elapses.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Network`] on timeout or socket failure,
    /// [`GatewayError::Validation`] for a redirect without a code.
    pub async fn wait(self, timeout: Duration) -> Result<Redirect> {
        tokio::time::timeout(timeout, self.serve())
            .await
            .map_err(|_| GatewayError::Network(format!("no OAuth redirect within {}s", timeout.as_secs())))?
    }

    async fn serve(&self) -> Result<Redirect> {
        loop {
            let (conn, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| GatewayError::Network(format!("accepting redirect: {e}")))?;
            match self.handle(conn).await {
                Ok(Some(redirect)) => return Ok(redirect),
                Ok(None) => tracing::debug!(%peer, "ignored request off the redirect path"),
                Err(e @ GatewayError::Validation(_)) => return Err(e),
                Err(e) => tracing::debug!(%peer, error = %e, "dropped redirect connection"),
            }
        }
    }

    async fn handle(&self, conn: TcpStream) -> Result<Option<Redirect>> {
        let mut reader = BufReader::new(conn);
        let line = read_line(&mut reader).await?;
        // Drain headers so closing the socket does not reset the browser.
        while !read_line(&mut reader).await?.trim().is_empty() {}
        let target = line.split_ascii_whitespace().nth(1).unwrap_or("/");
        let url = Url::parse("http://127.0.0.1/")
            .and_then(|base| base.join(target))
            .map_err(|e| GatewayError::Network(format!("unparseable request target: {e}")))?;

        let mut conn = reader.into_inner();
        if url.path() != self.path {
            respond(&mut conn, "404 Not Found", "").await;
            return Ok(None);
        }
        let query = url.query_pairs().into_owned().collect();
        let redirect = Redirect::from_query(query);
        let page = redirect
            .as_ref()
            .map_or_else(|_| "<p>Malformed redirect.</p>".to_string(), Redirect::page);
        let status = if redirect.is_ok() { "200 OK" } else { "400 Bad Request" };
        respond(&mut conn, status, &page).await;
        redirect.map(Some)
    }
}

async fn read_line(reader: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    reader
        .take(MAX_LINE)
        .read_line(&mut line)
        .await
        .map_err(|e| GatewayError::Network(format!("reading redirect request: {e}")))?;
    Ok(line)
}

async fn respond(conn: &mut TcpStream, status: &str, body: &str) {
    let reply = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let written = match conn.write_all(reply.as_bytes()).await {
        Ok(()) => conn.shutdown().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        tracing::debug!(error = %e, "writing redirect reply");
    }
}

fn parse_redirect_uri(redirect_uri: &str) -> Result<Url> {
    let url = Url::parse(redirect_uri)
        .map_err(|e| GatewayError::Config(format!("invalid redirect_uri {redirect_uri}: {e}")))?;
    let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1"));
    if url.scheme() == "http" && loopback && url.port().is_some() {
        Ok(url)
    } else {
        Err(GatewayError::Config(format!(
            "redirect_uri {redirect_uri} is not an http loopback address with a port"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn send(port: u16, request_line: &str) -> String {
        let mut conn = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        conn.write_all(format!("{request_line}\r\nHost: localhost\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut reply = String::new();
        conn.read_to_string(&mut reply).await.unwrap();
        reply
    }

    #[test]
    fn test_redirect_uri_validation() {
        assert_eq!(parse_redirect_uri("http://localhost:54545/callback").unwrap().port(), Some(54545));
        assert!(parse_redirect_uri("http://127.0.0.1:8080/cb").is_ok());
        assert!(parse_redirect_uri("https://example.com/callback").is_err());
        assert!(parse_redirect_uri("http://localhost/callback").is_err());
        assert!(parse_redirect_uri("not a url").is_err());
    }

    #[test]
    fn test_redirect_from_query() {
        let q = |pairs: &[(&str, &str)]| pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        assert_eq!(
            Redirect::from_query(q(&[("code", "a+b"), ("state", "s")])).unwrap(),
            Redirect::Authorized { code: "a+b".into(), state: "s".into() }
        );
        assert_eq!(
            Redirect::from_query(q(&[("error", "access_denied")])).unwrap(),
            Redirect::Denied { error: "access_denied".into(), description: None }
        );
        assert!(Redirect::from_query(q(&[("state", "s")])).is_err());
    }

    #[tokio::test]
    async fn test_wait_receives_code() {
        let server = CallbackServer::bind_port(0, "/callback").await.unwrap();
        let port = server.port().unwrap();
        let waiting = tokio::spawn(server.wait(Duration::from_secs(5)));

        let reply = send(port, "GET /callback?code=c%2B1&state=s1 HTTP/1.1").await;
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.contains("signed in"));
        assert_eq!(
            waiting.await.unwrap().unwrap(),
            Redirect::Authorized { code: "c+1".into(), state: "s1".into() }
        );
    }

    #[tokio::test]
    async fn test_wait_skips_other_paths() {
        let server = CallbackServer::bind_port(0, "/callback").await.unwrap();
        let port = server.port().unwrap();
        let waiting = tokio::spawn(server.wait(Duration::from_secs(5)));

        assert!(send(port, "GET /favicon.ico HTTP/1.1").await.starts_with("HTTP/1.1 404"));
        send(port, "GET /callback?error=access_denied&error_description=no HTTP/1.1").await;
        assert_eq!(
            waiting.await.unwrap().unwrap(),
            Redirect::Denied { error: "access_denied".into(), description: Some("no".into()) }
        );
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let server = CallbackServer::bind_port(0, "/callback").await.unwrap();
        let err = server.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let held = CallbackServer::bind_port(0, "/").await.unwrap();
        let err = CallbackServer::bind_port(held.port().unwrap(), "/").await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
