use crate::error::{Result, SnapError};
use crate::types::ServerSnapshot;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Receiver for published snapshots
///
/// Yields every snapshot in publication order. A receiver that falls too far
/// behind gets a [`SnapError::ChannelError`] and then resumes from the oldest
/// snapshot still buffered; [`StateStore::current`](crate::StateStore::current)
/// always has the latest one.
pub struct SnapshotReceiver {
    rx: broadcast::Receiver<Arc<ServerSnapshot>>,
}

impl SnapshotReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<Arc<ServerSnapshot>>) -> Self {
        Self { rx }
    }

    /// Receive the next snapshot
    ///
    /// Returns [`SnapError::ConnectionClosed`] once the store is gone.
    pub async fn recv(&mut self) -> Result<Arc<ServerSnapshot>> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => SnapError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                SnapError::ChannelError(format!("Lagged by {} snapshots", n))
            }
        })
    }

    /// Try to receive a snapshot without blocking
    ///
    /// Returns `None` if no snapshot is available.
    pub fn try_recv(&mut self) -> Result<Option<Arc<ServerSnapshot>>> {
        match self.rx.try_recv() {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(SnapError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(SnapError::ChannelError(format!("Lagged by {} snapshots", n)))
            }
        }
    }
}
