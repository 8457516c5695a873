//! Production interregion transport: plain HTTP/1.1 over TCP.
//!
//! The interregion surface is small enough (five request shapes, all
//! fire-one-request-read-one-response) that the channel speaks HTTP
//! directly over a [`tokio::net::TcpStream`] instead of carrying a client
//! library. Every request sends `Connection: close` and reads to EOF.

use std::io::{Read, Write};
use std::time::Duration;

use lattice_grid::{RegionHandle, RegionInfo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{AgentDescriptor, ChannelError, ChildAgentUpdate, InterregionChannel};

/// Ceiling on the viewer-connection wait. The destination's own internal
/// wait is 10 seconds, so in the common case its timeout fires first and
/// we see a response rather than a dead socket.
const VIEWER_WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Ceiling on every other interregion request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP-based [`InterregionChannel`].
pub struct HttpInterregionChannel {
    /// Shared grid secret sent as the authorization header on every
    /// request.
    send_key: String,
}

impl HttpInterregionChannel {
    #[must_use]
    pub fn new(send_key: String) -> Self {
        Self { send_key }
    }

    async fn request(
        &self,
        region: &RegionInfo,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<u16, ChannelError> {
        let authority = authority_of(&region.http_uri)?;
        let head = request_head(method, path, authority, &self.send_key, body);

        let response = tokio::time::timeout(timeout, async {
            let mut stream = TcpStream::connect(authority).await?;
            stream.write_all(head.as_bytes()).await?;
            if let Some(body) = body {
                stream.write_all(body).await?;
            }

            let mut response = Vec::new();
            stream.read_to_end(&mut response).await?;
            Ok::<_, std::io::Error>(response)
        })
        .await
        .map_err(|_| ChannelError::Timeout)??;

        let status = parse_status(&response)?;
        debug!(%method, %path, authority, status, "interregion request");
        Ok(status)
    }

    /// Same request shape over a blocking socket, for teardown paths
    /// running outside the runtime.
    fn request_blocking(
        &self,
        region: &RegionInfo,
        method: &str,
        path: &str,
    ) -> Result<u16, ChannelError> {
        let authority = authority_of(&region.http_uri)?;
        let head = request_head(method, path, authority, &self.send_key, None);

        let mut stream = std::net::TcpStream::connect(authority)?;
        stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
        stream.set_write_timeout(Some(REQUEST_TIMEOUT))?;
        stream.write_all(head.as_bytes())?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        parse_status(&response)
    }

    fn expect_ok(status: u16, what: &str) -> Result<(), ChannelError> {
        if status == 200 {
            Ok(())
        } else {
            Err(ChannelError::Rejected(format!(
                "{what} answered HTTP {status}"
            )))
        }
    }
}

impl InterregionChannel for HttpInterregionChannel {
    async fn create_remote_child(
        &self,
        region: &RegionInfo,
        agent: &AgentDescriptor,
    ) -> Result<(), ChannelError> {
        let body = serde_json::to_vec(agent)
            .map_err(|e| ChannelError::MalformedResponse(e.to_string()))?;
        let path = format!("/agent2/{}", agent.avatar_id);
        let status = self
            .request(region, "POST", &path, Some(&body), REQUEST_TIMEOUT)
            .await?;
        Self::expect_ok(status, "create child")
    }

    async fn close_remote_child(
        &self,
        region: &RegionInfo,
        avatar_id: Uuid,
    ) -> Result<(), ChannelError> {
        let path = format!("/agent2/{}/{}", avatar_id, region.handle().raw());
        let status = self
            .request(region, "DELETE", &path, None, REQUEST_TIMEOUT)
            .await?;
        Self::expect_ok(status, "close child")
    }

    fn close_remote_child_blocking(&self, region: &RegionInfo, avatar_id: Uuid) {
        let path = format!("/agent2/{}/{}", avatar_id, region.handle().raw());
        if let Err(e) = self.request_blocking(region, "DELETE", &path) {
            warn!(neighbor = %region.handle(), %avatar_id, error = %e, "close child failed");
        }
    }

    async fn transfer_entity(
        &self,
        destination: &RegionInfo,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let status = self
            .request(destination, "POST", "/object2/", Some(payload), REQUEST_TIMEOUT)
            .await?;
        Self::expect_ok(status, "entity transfer")
    }

    async fn wait_for_viewer_connection(
        &self,
        region: &RegionInfo,
        avatar_id: Uuid,
        handle: RegionHandle,
    ) -> Result<(), ChannelError> {
        let path = format!("/agent2/{}/{}", avatar_id, handle.raw());
        let status = self
            .request(region, "GET", &path, None, VIEWER_WAIT_TIMEOUT)
            .await?;
        Self::expect_ok(status, "viewer wait")
    }

    async fn send_child_update(
        &self,
        region: &RegionInfo,
        update: &ChildAgentUpdate,
    ) -> Result<(), ChannelError> {
        let body = serde_json::to_vec(update)
            .map_err(|e| ChannelError::MalformedResponse(e.to_string()))?;
        let path = format!("/agent2/{}", update.avatar_id);
        let status = self
            .request(region, "PUT", &path, Some(&body), REQUEST_TIMEOUT)
            .await?;
        Self::expect_ok(status, "child update")
    }
}

/// Strip the scheme off an HTTP URI, leaving `host:port`.
fn authority_of(http_uri: &str) -> Result<&str, ChannelError> {
    let rest = http_uri
        .strip_prefix("http://")
        .ok_or_else(|| ChannelError::MalformedResponse(format!("unsupported uri: {http_uri}")))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(ChannelError::MalformedResponse(format!(
            "empty authority in uri: {http_uri}"
        )));
    }
    Ok(authority)
}

fn request_head(
    method: &str,
    path: &str,
    authority: &str,
    send_key: &str,
    body: Option<&[u8]>,
) -> String {
    let mut head = format!(
        "{method} {path} HTTP/1.1\r\nHost: {authority}\r\nAuthorization: {send_key}\r\nConnection: close\r\n"
    );
    if let Some(body) = body {
        head.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n",
            body.len()
        ));
    }
    head.push_str("\r\n");
    head
}

/// Pull the status code out of an HTTP/1.x response.
fn parse_status(response: &[u8]) -> Result<u16, ChannelError> {
    let text = std::str::from_utf8(response)
        .map_err(|_| ChannelError::MalformedResponse("non-utf8 response".into()))?;
    let line = text
        .lines()
        .next()
        .ok_or_else(|| ChannelError::MalformedResponse("empty response".into()))?;

    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(ChannelError::MalformedResponse(format!(
            "bad status line: {line}"
        )));
    }

    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| ChannelError::MalformedResponse(format!("bad status line: {line}")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_authority_strips_scheme_and_path() {
        assert_eq!(
            authority_of("http://sim.example:9000/").unwrap(),
            "sim.example:9000"
        );
        assert_eq!(
            authority_of("http://10.0.0.5:9001").unwrap(),
            "10.0.0.5:9001"
        );
    }

    #[test]
    fn test_authority_rejects_https() {
        assert!(authority_of("https://sim.example:9000/").is_err());
    }

    #[test]
    fn test_parse_status_ok() {
        assert_eq!(parse_status(b"HTTP/1.1 200 OK\r\n\r\n").unwrap(), 200);
        assert_eq!(
            parse_status(b"HTTP/1.0 404 Not Found\r\nX: y\r\n\r\nbody").unwrap(),
            404
        );
    }

    #[test]
    fn test_parse_status_garbage() {
        assert!(parse_status(b"").is_err());
        assert!(parse_status(b"SSH-2.0-OpenSSH\r\n").is_err());
    }

    #[test]
    fn test_request_head_includes_auth_and_length() {
        let head = request_head("POST", "/agent2/x", "sim:9000", "key123", Some(b"{}"));
        assert!(head.contains("POST /agent2/x HTTP/1.1\r\n"));
        assert!(head.contains("Authorization: key123\r\n"));
        assert!(head.contains("Content-Length: 2\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_wait_for_viewer_against_local_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let region = RegionInfo {
            loc_x: 1001,
            loc_y: 1000,
            endpoint: addr,
            http_uri: format!("http://{addr}"),
        };

        let channel = HttpInterregionChannel::new("secret".into());
        let avatar = Uuid::new_v4();
        channel
            .wait_for_viewer_connection(&region, avatar, region.handle())
            .await
            .unwrap();
    }
}
