//! Byte relays between loopback TCP sockets and SSH channels.

use russh::server::{Handle, Msg};
use russh::Channel;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Accept loop for a reverse forward: every local connection to `listener`
/// becomes a `forwarded-tcpip` channel back to the device.
pub(super) async fn accept_forwarded(
    listener: TcpListener,
    handle: Handle,
    address: String,
    port: u32,
    stop: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(port, "Forward accept failed: {e}");
                    break;
                }
            },
        };
        let handle = handle.clone();
        let address = address.clone();
        tokio::spawn(async move {
            match handle
                .channel_open_forwarded_tcpip(
                    address,
                    port,
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await
            {
                Ok(channel) => pipe(stream, channel).await,
                Err(e) => debug!(port, "Device refused forwarded channel: {e}"),
            }
        });
    }
    debug!(port, "Reverse forward closed");
}

/// Connect a `direct-tcpip` channel to `host:port`.
pub(super) async fn relay_direct(channel: Channel<Msg>, host: String, port: u16) {
    match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => pipe(stream, channel).await,
        Err(e) => {
            debug!(port, "Direct target unreachable: {e}");
            let _ = channel.close().await;
        }
    }
}

async fn pipe(mut stream: TcpStream, channel: Channel<Msg>) {
    let mut channel = channel.into_stream();
    match tokio::io::copy_bidirectional(&mut stream, &mut channel).await {
        Ok((up, down)) => debug!(up, down, "Relay finished"),
        Err(e) => debug!("Relay ended: {e}"),
    }
}
