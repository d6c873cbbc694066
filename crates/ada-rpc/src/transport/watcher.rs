//! Background watcher that owns reads on a watched transport.

use super::{ReadAccess, Transport};
use crate::codec::Codec;
use crate::error::Result;
use crate::message::Envelope;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives every message read by a transport's watcher.
///
/// Invocations are sequential: the watcher reads the next message only after
/// `handle` returns. A message that arrived but could not be decoded is passed
/// as `Err`, so a server can still answer it.
#[async_trait]
pub trait MessageHandler<C: Codec>: Send + Sync + 'static {
    async fn handle(&self, transport: &Transport<C>, message: Result<Envelope>);
}

pub(super) async fn run<C, H>(transport: Transport<C>, handler: Arc<H>)
where
    C: Codec,
    H: MessageHandler<C> + ?Sized,
{
    let stop = transport.inner.stop.clone();
    let interval = transport.poll_interval;
    info!("Watching {:?} transport {}", transport.role(), transport.token());

    while !stop.is_cancelled() {
        let frames = match transport.poll_frames(ReadAccess::Concurrent, interval).await {
            Ok(Some(frames)) => frames,
            Ok(None) => continue,
            Err(_) if stop.is_cancelled() => break,
            Err(e) => {
                warn!("Watcher receive failed: {}", e);
                tokio::time::sleep(interval).await;
                continue;
            }
        };
        let message = transport.decode(frames);
        handler.handle(&transport, message).await;
    }

    // Release the socket even when the stop came from a dropped owner rather
    // than close().
    transport.inner.socket.lock().await.take();
    debug!("Watcher for {} stopped", transport.token());
}
