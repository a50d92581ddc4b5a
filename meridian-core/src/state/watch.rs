//! Background watchers that fan store feeds into [`State`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::State;
use crate::signal::ChangeSender;

/// Mirror one store feed into `state` until cancelled.
///
/// Each delivery replaces the whole collection; the change token is sent
/// only after the write lock is released.
pub(super) async fn watch_feed<T: Send + 'static>(
    state: Arc<State>,
    collection: &'static str,
    mut updates: mpsc::Receiver<Vec<T>>,
    apply: fn(&State, Vec<T>),
    changes: ChangeSender,
    cancel: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            next = updates.recv() => match next {
                Some(batch) => batch,
                None => {
                    warn!(collection, "store feed closed, watcher stopping");
                    break;
                }
            },
        };

        let count = batch.len();
        apply(&state, batch);
        debug!(collection, count, "collection replaced");

        if !changes.notify_or_cancel(&cancel).await {
            break;
        }
    }
    debug!(collection, "watcher stopped");
}
