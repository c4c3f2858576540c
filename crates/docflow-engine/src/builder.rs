//! The Builder contract: a three-phase transformation over stores.
//!
//! A builder extracts work items from its sources (`get_items`), transforms
//! them without I/O (`process_item`), and loads results into its targets in
//! batches (`update_targets`). The executor drives the three phases
//! concurrently; items and results are self-describing JSON values so they
//! can cross worker and process boundaries.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use docflow_store::Store;
use docflow_types::ChunkSpec;

use crate::errors::{BuildError, ItemFailure};

/// Default batch size for `update_targets`.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// A lazy, finite, consume-once sequence of work items.
///
/// Item-level `Err` values are fatal source errors and terminate the run.
pub type ItemStream = Box<dyn Iterator<Item = Result<Value, BuildError>> + Send>;

/// A three-phase transformation unit run over one or more source and
/// target stores.
///
/// Implementations must be `Send + Sync`: the executor shares one builder
/// between the producer, the worker pool, and the consumer.
pub trait Builder: Send + Sync {
    /// Name used in logs and build events.
    fn name(&self) -> String;

    /// Stores read by `get_items`.
    fn sources(&self) -> Vec<Arc<dyn Store>>;

    /// Stores written by `update_targets`.
    fn targets(&self) -> Vec<Arc<dyn Store>>;

    /// Stores consulted for incremental or chunking decisions but never
    /// written.
    fn auxiliaries(&self) -> Vec<Arc<dyn Store>> {
        Vec::new()
    }

    /// Batch size handed to `update_targets`.
    fn chunk_size(&self) -> usize {
        DEFAULT_CHUNK_SIZE
    }

    /// Expected item count, when known. Read by the executor after
    /// `get_items` for the `Started` event.
    fn total_hint(&self) -> Option<u64> {
        None
    }

    /// Per-item deadline for `process_item`; `None` disables the race.
    fn item_timeout(&self) -> Option<Duration> {
        None
    }

    /// Open every attached store. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if any store fails to connect.
    fn connect(&self) -> Result<(), BuildError> {
        for store in self
            .sources()
            .into_iter()
            .chain(self.targets())
            .chain(self.auxiliaries())
        {
            store.connect()?;
        }
        Ok(())
    }

    /// Split the total work into `num_chunks` attribute-override maps whose
    /// union covers the full work set; disjointness is this builder's
    /// responsibility.
    ///
    /// # Errors
    ///
    /// The default returns [`BuildError::NotDistributable`]; the
    /// distributed manager then falls back to a single whole-work chunk.
    fn prechunk(&self, num_chunks: usize) -> Result<Vec<ChunkSpec>, BuildError> {
        let _ = num_chunks;
        Err(BuildError::NotDistributable {
            builder: self.name(),
        })
    }

    /// Produce the work items. May perform I/O; safe to consume once.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Source`] variants; fatal to the run.
    fn get_items(&self) -> Result<ItemStream, BuildError>;

    /// Transform one item. Must not perform I/O and should be
    /// deterministic given its input.
    ///
    /// # Errors
    ///
    /// Returns [`ItemFailure`]; the executor counts and logs it, invokes
    /// [`Builder::on_item_error`], and continues with the next item.
    fn process_item(&self, item: Value) -> Result<Value, ItemFailure>;

    /// Convert a failed item into a result document to write anyway.
    ///
    /// Template builders use this to mark items failed in the target;
    /// the default drops the item.
    fn on_item_error(&self, item: &Value, failure: &ItemFailure) -> Option<Value> {
        let _ = (item, failure);
        None
    }

    /// Write a batch of processed items to the targets. Receives batches
    /// of up to [`Builder::chunk_size`] and must be idempotent with
    /// respect to the key of each output document.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Sink`] variants; fatal to the run.
    fn update_targets(&self, batch: &[Value]) -> Result<(), BuildError>;

    /// Invoked once after the last `update_targets` (on the manager in
    /// distributed mode). Typical uses: orphan deletion, index tune-down,
    /// summary writes.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`]; fatal to the run.
    fn finalize(&self) -> Result<(), BuildError> {
        Ok(())
    }

    /// Close every attached store. Called on all exit paths; close
    /// failures are logged, never propagated.
    fn close_stores(&self) {
        for store in self
            .sources()
            .into_iter()
            .chain(self.targets())
            .chain(self.auxiliaries())
        {
            if let Err(err) = store.close() {
                tracing::warn!(store = %store.name(), "failed to close store: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn Builder`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn Builder) {}
    }
}
