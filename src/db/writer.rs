//! Batched history writer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{HistoryRow, Store};

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const FLUSH_ROWS: usize = 500;

/// Accumulate history rows and write them in batches until the channel closes.
pub async fn run_history_writer(mut rx: mpsc::Receiver<HistoryRow>, store: Arc<Store>) {
    let mut buffer: Vec<HistoryRow> = Vec::with_capacity(FLUSH_ROWS);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            row = rx.recv() => {
                match row {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= FLUSH_ROWS {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<HistoryRow>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_history(buffer) {
        tracing::error!("History: failed to flush {} rows: {}", buffer.len(), e);
    }

    buffer.clear();
}
