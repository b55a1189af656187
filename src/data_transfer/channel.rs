// =====================================================
// DATA TRANSFER CHANNEL
// =====================================================
//
// Many sink workers pull rows from one forward-only cursor. The cursor sits
// behind a single fetcher permit: whichever consumer finds the queue empty
// and wins the permit advances the cursor for up to `fetch_size` rows and
// publishes them to the shared queue. Nobody else touches the cursor
// meanwhile; they keep polling the queue.

use crate::data_transfer::result::TaskResult;
use crate::datasource::RowCursor;
use crate::error::{Result, TransferError};
use crate::metadata::RowMetadata;
use crate::value::Row;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_FETCH_SIZE: usize = 10_000;
pub const DEFAULT_PERMIT_WAIT: Duration = Duration::from_millis(10);

pub struct DataTransferChannel {
    metadata: Arc<RowMetadata>,
    queue_tx: Sender<Row>,
    queue_rx: Receiver<Row>,
    /// The fetcher permit; holding the lock means owning the cursor.
    cursor: Mutex<Box<dyn RowCursor>>,
    exhausted: AtomicBool,
    fetch_size: usize,
    permit_wait: Duration,
    result: Arc<TaskResult>,
}

impl DataTransferChannel {
    pub fn new(
        cursor: Box<dyn RowCursor>,
        fetch_size: usize,
        permit_wait: Duration,
        result: Arc<TaskResult>,
    ) -> Result<Self> {
        let metadata = RowMetadata::new(cursor.columns().to_vec())?;
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            metadata: Arc::new(metadata),
            queue_tx,
            queue_rx,
            cursor: Mutex::new(cursor),
            exhausted: AtomicBool::new(false),
            fetch_size: fetch_size.max(1),
            permit_wait,
            result,
        })
    }

    pub fn metadata(&self) -> &Arc<RowMetadata> {
        &self.metadata
    }

    #[cfg(test)]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Next row for this consumer, or `None` once the queue is drained and
    /// the cursor is exhausted. A cursor failure is returned to the consumer
    /// that was fetching; the channel then counts as exhausted.
    pub fn transfer(&self) -> Result<Option<Row>> {
        loop {
            if let Ok(row) = self.queue_rx.try_recv() {
                return Ok(Some(row));
            }

            // rows published before the flag are visible once it is seen
            if self.exhausted.load(Ordering::Acquire) {
                return Ok(self.queue_rx.try_recv().ok());
            }

            if let Some(mut cursor) = self.cursor.try_lock_for(self.permit_wait) {
                let fetched = self.fetch(&mut **cursor);
                drop(cursor);
                fetched?;

                if let Ok(row) = self.queue_rx.try_recv() {
                    return Ok(Some(row));
                }
            }
        }
    }

    fn fetch(&self, cursor: &mut dyn RowCursor) -> Result<()> {
        if self.exhausted.load(Ordering::Acquire) {
            return Ok(());
        }

        let columns = self.metadata.column_count();
        for _ in 0..self.fetch_size {
            if cursor.is_closed() {
                self.mark_exhausted();
                return Ok(());
            }
            match cursor.advance() {
                Ok(Some(row)) => {
                    if row.len() != columns {
                        cursor.close();
                        self.mark_exhausted();
                        return Err(TransferError::Metadata(format!(
                            "Cursor produced a row with {} values for {} columns",
                            row.len(),
                            columns
                        )));
                    }
                    self.result.add_retrieved(1);
                    // the receiver lives as long as the channel
                    let _ = self.queue_tx.send(row);
                }
                Ok(None) => {
                    self.mark_exhausted();
                    return Ok(());
                }
                Err(e) => {
                    cursor.close();
                    self.mark_exhausted();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn mark_exhausted(&self) {
        self.exhausted.store(true, Ordering::Release);
    }

    /// Closes the cursor. Rows still queued remain available.
    pub fn close(&self) {
        let mut cursor = self.cursor.lock();
        if !cursor.is_closed() {
            cursor.close();
        }
        self.mark_exhausted();
    }
}
