//! TCP accept loop and per-connection job handling.
//!
//! Each connection carries exactly one job: read a request frame, run it,
//! write one response frame. Every failure past the read is reported to the
//! client as an error state inside a normal response.

use scs_common::protocol::{self, ProtocolError, RECEIVE_TIMEOUT};
use scs_common::{JobState, JobStatus, ProtocolVersion, Request};
use std::future::Future;
use std::net::IpAddr;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::dispatch;

/// Serve one connection. Returns the state reported to the client.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: IpAddr,
    ctx: ServerContext,
) -> Result<JobState, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let raw = match protocol::read_request(&mut stream, RECEIVE_TIMEOUT).await {
        Ok(raw) => raw,
        Err(ProtocolError::ConnectionClosed) => return Err(ProtocolError::ConnectionClosed),
        Err(err) => {
            warn!(%peer, "bad request frame: {err}");
            let _ = protocol::write_response(
                &mut stream,
                ProtocolVersion::V2,
                JobState::Error,
                err.to_string().as_bytes(),
            )
            .await;
            return Err(err);
        }
    };

    // Decided before parsing consumes the payload; v2 when unreadable.
    let envelope = Request::sniff_version(&raw).unwrap_or(ProtocolVersion::V2);
    let mut status = JobStatus::new();

    let (version, payload) = match Request::parse(raw) {
        Ok(request) => match dispatch::execute(&ctx, &request, peer).await {
            Ok(outcome) => {
                status.set(outcome.state);
                (request.version, outcome.payload)
            }
            Err(err) => {
                status.set(err.state());
                debug!(%peer, state = %err.state(), "job failed: {err}");
                (request.version, err.payload())
            }
        },
        Err(err) => {
            status.set(err.state());
            warn!(%peer, state = %err.state(), "rejected request: {err}");
            (envelope, err.to_string().into_bytes())
        }
    };

    let state = status.get();
    protocol::write_response(&mut stream, version, state, &payload).await?;
    if version.awaits_peer_shutdown()
        && let Err(err) = protocol::await_peer_shutdown(&mut stream, RECEIVE_TIMEOUT).await
    {
        debug!(%peer, "peer did not close after response: {err}");
    }

    info!(
        %peer,
        %version,
        %state,
        bytes = payload.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "job finished"
    );
    Ok(state)
}

/// Accept connections until `shutdown` resolves.
///
/// Jobs already running when the loop stops are left to finish on their
/// own tasks.
pub async fn serve<F>(listener: TcpListener, ctx: ServerContext, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, addr.ip(), ctx).await {
                            debug!(peer = %addr, "connection ended with error: {err}");
                        }
                    });
                }
                Err(err) => warn!("accept failed: {err}"),
            },
        }
    }
}
