//! Reachability probe over plain TCP.
//!
//! Parses the invite data as [`InviteInfo`], connects to the advertised
//! address and introduces itself with one line carrying the local id. A peer
//! counts as reachable once that line is written.
//!
//! # Feature gate
//!
//! Only available with the `tcp-probe` feature (enabled by default).

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::Result;
use crate::protocol::InviteInfo;
use crate::service::ReachabilityProbe;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`ReachabilityProbe`] that opens a TCP connection to the invited peer.
///
/// ```rust,no_run
/// # async fn example() -> match_rendezvous::Result<()> {
/// use match_rendezvous::protocol::InviteInfo;
/// use match_rendezvous::services::TcpReachabilityProbe;
/// use match_rendezvous::ReachabilityProbe;
///
/// let invite = InviteInfo::new("127.0.0.1", 7777).to_invite_string()?;
/// let reachable = TcpReachabilityProbe::new().probe(&invite, "me").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpReachabilityProbe {
    connect_timeout: Duration,
}

impl Default for TcpReachabilityProbe {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl TcpReachabilityProbe {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

#[async_trait]
impl ReachabilityProbe for TcpReachabilityProbe {
    async fn probe(&self, invite_data: &str, local_id: &str) -> Result<bool> {
        let invite = InviteInfo::parse(invite_data)?;
        let address = invite.address();
        debug!(%address, "probing peer");

        let mut stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(%address, "peer refused connection: {e}");
                    return Ok(false);
                }
                Err(_) => {
                    debug!(%address, "peer connect timed out");
                    return Ok(false);
                }
            };

        stream.write_all(format!("{local_id}\n").as_bytes()).await?;
        stream.shutdown().await?;
        Ok(true)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::RendezvousError;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reachable_peer_receives_local_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut line = String::new();
            tokio::io::BufReader::new(socket)
                .read_line(&mut line)
                .await
                .unwrap();
            line
        });

        let invite = InviteInfo::new("127.0.0.1", port).to_invite_string().unwrap();
        assert!(TcpReachabilityProbe::new().probe(&invite, "client-7").await.unwrap());
        assert_eq!(accept.await.unwrap(), "client-7\n");
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        // Bind then drop to find a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let invite = InviteInfo::new("127.0.0.1", port).to_invite_string().unwrap();
        let probe = TcpReachabilityProbe::new().with_connect_timeout(Duration::from_secs(1));
        assert!(!probe.probe(&invite, "me").await.unwrap());
    }

    #[tokio::test]
    async fn malformed_invite_is_an_error() {
        let err = TcpReachabilityProbe::new()
            .probe("not json", "me")
            .await
            .unwrap_err();
        assert!(matches!(err, RendezvousError::Serialization(_)));
    }
}
