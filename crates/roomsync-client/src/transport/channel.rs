//! Physical channel abstraction.

use std::io;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

/// One established connection, as a pair of byte queues.
///
/// Each queue item is one encoded frame. The link is lost once `inbound`
/// ends; dropping `outbound` tells the channel to close its side.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Link {
    /// Two links wired back to back: what one sends the other receives.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Something that can open links to the host.
pub trait Channel: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Opens a fresh link.
    fn open(&self) -> BoxFuture<'_, io::Result<Link>>;
}
