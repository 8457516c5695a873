//! The inbound `/agent2` service peers call on this region.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long an inbound viewer-wait request is parked before answering
/// 504. Callers use a longer client-side ceiling, so this timeout fires
/// first.
const VIEWER_WAIT_INTERNAL: Duration = Duration::from_secs(10);

/// Which avatars' viewers have connected to this region.
///
/// The wait endpoint parks on this until the viewer shows up or the
/// internal timeout fires.
#[derive(Default)]
pub struct ViewerRegistry {
    connected: Mutex<HashSet<Uuid>>,
    arrival: Notify,
}

impl ViewerRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark an avatar's viewer as connected and wake any parked waits.
    pub async fn viewer_connected(&self, avatar_id: Uuid) {
        self.connected.lock().await.insert(avatar_id);
        self.arrival.notify_waiters();
    }

    pub async fn viewer_disconnected(&self, avatar_id: Uuid) {
        self.connected.lock().await.remove(&avatar_id);
    }

    async fn wait_for(&self, avatar_id: Uuid, ceiling: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + ceiling;
        loop {
            // Enable the waiter before checking so an arrival between
            // the check and the await still wakes us.
            let notified = self.arrival.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.connected.lock().await.contains(&avatar_id) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

/// Accept loop for the agent service. Runs until the task is aborted.
pub async fn serve(listener: TcpListener, registry: Arc<ViewerRegistry>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "agent service accept failed");
                continue;
            }
        };
        debug!(%peer, "agent service connection");

        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, registry).await {
                debug!(error = %e, "agent service connection closed");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    registry: Arc<ViewerRegistry>,
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    // Read until the header terminator; request bodies are ignored, every
    // route here keys off the path alone.
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 8192 {
            break;
        }
    }

    let status = route(&buf, &registry).await;
    let response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        reason(status)
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn route(request: &[u8], registry: &ViewerRegistry) -> u16 {
    let Some((method, path)) = request_line(request) else {
        return 400;
    };

    let mut parts = path.trim_start_matches('/').split('/');
    if parts.next() != Some("agent2") {
        return 404;
    }
    let Some(avatar_id) = parts.next().and_then(|s| Uuid::parse_str(s).ok()) else {
        return 400;
    };
    let handle_segment = parts.next();

    match (method, handle_segment) {
        // Viewer wait: park until the avatar's viewer connects here.
        ("GET", Some(_)) => {
            if registry.wait_for(avatar_id, VIEWER_WAIT_INTERNAL).await {
                info!(%avatar_id, "viewer wait satisfied");
                200
            } else {
                warn!(%avatar_id, "viewer wait timed out");
                504
            }
        }
        ("POST", None) => {
            info!(%avatar_id, "child presence created");
            200
        }
        ("PUT", None) => {
            debug!(%avatar_id, "child update received");
            200
        }
        ("DELETE", Some(_)) => {
            info!(%avatar_id, "child presence closed");
            registry.viewer_disconnected(avatar_id).await;
            200
        }
        _ => 404,
    }
}

fn request_line(request: &[u8]) -> Option<(&str, &str)> {
    let text = std::str::from_utf8(request).ok()?;
    let line = text.lines().next()?;
    let mut words = line.split_whitespace();
    Some((words.next()?, words.next()?))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}
