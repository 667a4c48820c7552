//! Overflow forwarding to peer compile servers.
//!
//! Peers are tried one per job in round-robin order. Any outcome other than
//! a successful response is reported as a [`ForwardError`] and the caller
//! compiles locally instead; the client never sees forwarding failures.

use scs_common::protocol::{self, ProtocolError};
use scs_common::{JobState, ProtocolVersion};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Bounded wait for the TCP connect to a peer.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait for a peer's complete response, compile time included.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no fallback servers configured")]
    NoPeers,

    #[error("connect to {peer} failed: {source}")]
    Connect {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {peer} timed out")]
    ConnectTimeout { peer: String },

    #[error("exchange with {peer} failed: {source}")]
    Protocol {
        peer: String,
        #[source]
        source: ProtocolError,
    },

    #[error("{peer} answered {state}")]
    Rejected { peer: String, state: JobState },
}

/// A response adopted from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarded {
    pub peer: String,
    pub payload: Vec<u8>,
    /// The peer reported DONE. v1 responses carry no state, so their payload
    /// may just as well be error text.
    pub confirmed: bool,
}

#[derive(Debug)]
pub struct FallbackRouter {
    peers: Vec<String>,
    next: AtomicUsize,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl FallbackRouter {
    pub fn new(peers: Vec<String>) -> Self {
        Self {
            peers,
            next: AtomicUsize::new(0),
            connect_timeout: CONNECT_TIMEOUT,
            response_timeout: RESPONSE_TIMEOUT,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Next peer in round-robin order.
    pub fn next_peer(&self) -> Option<&str> {
        if self.peers.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.peers.len();
        Some(&self.peers[idx])
    }

    /// Send `raw` unchanged to the next peer and return its payload.
    ///
    /// v2+ responses are adopted only with state DONE; a complete v1
    /// response carries no state and is always adopted.
    pub async fn forward(
        &self,
        raw: &[u8],
        version: ProtocolVersion,
    ) -> Result<Forwarded, ForwardError> {
        let peer = self.next_peer().ok_or(ForwardError::NoPeers)?.to_string();
        debug!(%peer, bytes = raw.len(), "forwarding job");

        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(&peer)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ForwardError::Connect { peer, source }),
            Err(_) => return Err(ForwardError::ConnectTimeout { peer }),
        };
        let _ = stream.set_nodelay(true);

        let exchange = async {
            protocol::write_request(&mut stream, raw).await?;
            let response =
                protocol::read_response(&mut stream, version, self.response_timeout).await?;
            Ok::<_, ProtocolError>(response)
        };
        let response = match exchange.await {
            Ok(response) => response,
            Err(source) => return Err(ForwardError::Protocol { peer, source }),
        };
        // v2.1 servers hold the socket until we close our side.
        let _ = stream.shutdown().await;

        match response.state {
            None | Some(JobState::Done) => Ok(Forwarded {
                peer,
                payload: response.payload,
                confirmed: response.state.is_some(),
            }),
            Some(state) => Err(ForwardError::Rejected { peer, state }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A peer that answers every connection with `state` and `payload`.
    async fn fake_peer(state: JobState, payload: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let raw = protocol::read_request(&mut stream, protocol::RECEIVE_TIMEOUT)
                    .await
                    .unwrap();
                assert!(!raw.is_empty());
                protocol::write_response(&mut stream, ProtocolVersion::V2, state, payload)
                    .await
                    .unwrap();
            }
        });
        addr
    }

    async fn unreachable_peer() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[test]
    fn round_robin_cycles_peers() {
        let _guard = scs_common::test_guard!();
        let router = FallbackRouter::new(vec!["a:1".into(), "b:2".into()]);
        let order: Vec<_> = (0..4).map(|_| router.next_peer().unwrap().to_string()).collect();
        assert_eq!(order, ["a:1", "b:2", "a:1", "b:2"]);
        assert!(FallbackRouter::new(Vec::new()).next_peer().is_none());
    }

    #[tokio::test]
    async fn done_response_is_adopted() {
        let _guard = scs_common::test_guard!();
        let peer = fake_peer(JobState::Done, b"remote-bytecode").await;
        let router = FallbackRouter::new(vec![peer.clone()]);
        let got = router.forward(b"<Compile/>", ProtocolVersion::V2).await.unwrap();
        assert_eq!(got.peer, peer);
        assert_eq!(got.payload, b"remote-bytecode");
        assert!(got.confirmed);
    }

    #[tokio::test]
    async fn error_response_is_rejected() {
        let _guard = scs_common::test_guard!();
        let peer = fake_peer(JobState::ErrorCompile, b"x.fx(1): error").await;
        let router = FallbackRouter::new(vec![peer]);
        let err = router.forward(b"<Compile/>", ProtocolVersion::V2).await.unwrap_err();
        assert!(matches!(
            err,
            ForwardError::Rejected {
                state: JobState::ErrorCompile,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_peer_fails_to_connect() {
        let _guard = scs_common::test_guard!();
        let router = FallbackRouter::new(vec![unreachable_peer().await]);
        let err = router.forward(b"<Compile/>", ProtocolVersion::V2).await.unwrap_err();
        assert!(matches!(
            err,
            ForwardError::Connect { .. } | ForwardError::ConnectTimeout { .. }
        ));
    }

    #[tokio::test]
    async fn no_peers_is_an_error() {
        let _guard = scs_common::test_guard!();
        let router = FallbackRouter::new(Vec::new());
        let err = router.forward(b"<Compile/>", ProtocolVersion::V1).await.unwrap_err();
        assert!(matches!(err, ForwardError::NoPeers));
    }
}
