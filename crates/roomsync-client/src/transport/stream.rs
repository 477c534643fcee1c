//! Length-prefixed frames over TCP or Unix sockets.

use std::io;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use roomsync_protocol::{length_prefixed, payload_len};

use super::channel::{Channel, Link};
use crate::config::Endpoint;
use crate::error::ClientResult;

/// Socket channel for an [`Endpoint`].
#[derive(Debug, Clone)]
pub struct StreamChannel {
    endpoint: Endpoint,
}

impl StreamChannel {
    /// Creates a channel for the given endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Returns the endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Channel for StreamChannel {
    fn name(&self) -> &'static str {
        match self.endpoint {
            Endpoint::Tcp(_) => "tcp",
            Endpoint::Unix(_) => "unix",
        }
    }

    fn open(&self) -> BoxFuture<'_, io::Result<Link>> {
        Box::pin(async move {
            match &self.endpoint {
                Endpoint::Tcp(addr) => {
                    let stream = TcpStream::connect(addr).await?;
                    stream.set_nodelay(true)?;
                    debug!(addr = %addr, "tcp stream connected");
                    Ok(spawn_link(stream))
                }
                #[cfg(unix)]
                Endpoint::Unix(path) => {
                    let stream = tokio::net::UnixStream::connect(path).await?;
                    debug!(path = %path.display(), "unix stream connected");
                    Ok(spawn_link(stream))
                }
                #[cfg(not(unix))]
                Endpoint::Unix(path) => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unix sockets unavailable: {}", path.display()),
                )),
            }
        })
    }
}

/// Turns a byte stream into a [`Link`] driven by a reader and a writer task.
///
/// Either task ending takes the other down with it.
pub fn spawn_link<S>(stream: S) -> Link
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (writer_gone_tx, mut writer_gone) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let _writer_gone_tx = writer_gone_tx;
        while let Some(payload) = out_rx.recv().await {
            let framed = match length_prefixed(&payload) {
                Ok(framed) => framed,
                Err(e) => {
                    warn!(error = %e, "dropping outbound frame");
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(&framed).await {
                debug!(error = %e, "stream write failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            let read = tokio::select! {
                read = read_payload(&mut read_half) => read,
                _ = &mut writer_gone => break,
                () = in_tx.closed() => break,
            };
            match read {
                Ok(Some(payload)) => {
                    if in_tx.send(payload).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("stream closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "stream read failed");
                    break;
                }
            }
        }
    });

    Link {
        outbound: out_tx,
        inbound: in_rx,
    }
}

/// Reads one length-prefixed payload. `Ok(None)` on a clean close.
async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R) -> ClientResult<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = payload_len(prefix)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomsync_protocol::MAX_MESSAGE_SIZE;

    #[tokio::test]
    async fn frames_cross_a_duplex_stream() {
        let (client_io, mut host_io) = tokio::io::duplex(4096);
        let mut link = spawn_link(client_io);

        link.outbound.send(b"{\"kind\":\"heartbeat\"}".to_vec()).unwrap();
        let mut prefix = [0u8; 4];
        host_io.read_exact(&mut prefix).await.unwrap();
        let len = u32::from_be_bytes(prefix) as usize;
        let mut body = vec![0u8; len];
        host_io.read_exact(&mut body).await.unwrap();
        assert_eq!(body, b"{\"kind\":\"heartbeat\"}");

        let reply = length_prefixed(b"{\"kind\":\"roomLeft\"}").unwrap();
        host_io.write_all(&reply).await.unwrap();
        assert_eq!(link.inbound.recv().await.unwrap(), b"{\"kind\":\"roomLeft\"}");
    }

    #[tokio::test]
    async fn peer_close_ends_the_link() {
        let (client_io, host_io) = tokio::io::duplex(64);
        let mut link = spawn_link(client_io);
        drop(host_io);
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn oversized_prefix_ends_the_link() {
        let (client_io, mut host_io) = tokio::io::duplex(64);
        let mut link = spawn_link(client_io);
        host_io
            .write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_payload_reports_clean_close() {
        let mut empty: &[u8] = &[];
        assert!(read_payload(&mut empty).await.unwrap().is_none());
    }

    #[test]
    fn channel_names() {
        let tcp = StreamChannel::new(Endpoint::default());
        assert_eq!(tcp.name(), "tcp");
        let unix = StreamChannel::new(Endpoint::Unix("/tmp/x.sock".into()));
        assert_eq!(unix.name(), "unix");
    }
}
