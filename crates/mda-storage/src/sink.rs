//! Image sink task.
//!
//! The sink owns the receiving end of the engine's bounded image queue.
//! Images are processed and stored strictly in the order they were queued.
//! When the engine drops its sender the sink drains what is left, freezes
//! the datastore and exits. If the datastore rejects an image the sink stops
//! receiving, which closes the queue and lets the engine notice on its next
//! send.

use crate::datastore::Datastore;
use crate::processor::ProcessorChain;
use mda_core::error::{MdaError, MdaResult};
use mda_core::image::TaggedImage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outcome of a sink task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkReport {
    /// Images handed to the datastore.
    pub images_stored: u64,
    /// Images dropped by processors.
    pub images_dropped: u64,
    /// First storage or processing error, if any.
    pub error: Option<String>,
}

/// Handle to a running sink task.
pub struct ImageSink {
    handle: JoinHandle<SinkReport>,
}

impl ImageSink {
    /// Start draining `rx` into `store`.
    pub fn spawn(
        mut rx: mpsc::Receiver<TaggedImage>,
        store: Arc<dyn Datastore>,
        mut processors: ProcessorChain,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut report = SinkReport::default();

            while let Some(image) = rx.recv().await {
                let seq = image.metadata.seq_num;
                let image = match processors.run(image).await {
                    Ok(Some(image)) => image,
                    Ok(None) => {
                        report.images_dropped += 1;
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(seq, error = %e, "image processing failed");
                        report.error = Some(format!("processing image {}: {:#}", seq, e));
                        break;
                    }
                };

                if let Err(e) = store.put_image(image).await {
                    tracing::error!(seq, store = store.id(), error = %e, "datastore rejected image");
                    report.error = Some(format!("storing image {}: {:#}", seq, e));
                    break;
                }
                report.images_stored += 1;
            }
            rx.close();

            if let Err(e) = store.freeze().await {
                tracing::error!(store = store.id(), error = %e, "failed to freeze datastore");
                report.error.get_or_insert(format!("freezing datastore: {:#}", e));
            }
            tracing::debug!(
                stored = report.images_stored,
                dropped = report.images_dropped,
                "image sink finished"
            );
            report
        });

        Self { handle }
    }

    /// Wait for the sink to finish.
    pub async fn join(self) -> MdaResult<SinkReport> {
        self.handle
            .await
            .map_err(|e| MdaError::Storage(format!("image sink task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::tests::image;
    use crate::datastore::MemoryDatastore;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_sink_preserves_order_and_freezes() {
        let store = Arc::new(MemoryDatastore::with_id("mem"));
        let (tx, rx) = mpsc::channel(2);
        let sink = ImageSink::spawn(rx, store.clone(), ProcessorChain::new());

        for seq in 0..10 {
            tx.send(image(seq)).await.unwrap();
        }
        drop(tx);

        let report = sink.join().await.unwrap();
        assert_eq!(report.images_stored, 10);
        assert!(report.error.is_none());
        assert!(store.is_frozen());
        let seqs: Vec<u64> = store.images().iter().map(|i| i.metadata.seq_num).collect();
        assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    }

    struct FailingStore;

    #[async_trait]
    impl Datastore for FailingStore {
        fn id(&self) -> &str {
            "failing"
        }

        async fn put_image(&self, image: TaggedImage) -> Result<()> {
            if image.metadata.seq_num >= 2 {
                return Err(anyhow!("disk full"));
            }
            Ok(())
        }

        async fn freeze(&self) -> Result<()> {
            Ok(())
        }

        fn is_frozen(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_store_failure_closes_queue() {
        let (tx, rx) = mpsc::channel(1);
        let sink = ImageSink::spawn(rx, Arc::new(FailingStore), ProcessorChain::new());

        let mut sent = 0;
        for seq in 0..100 {
            if tx.send(image(seq)).await.is_err() {
                break;
            }
            sent += 1;
        }
        assert!(sent < 100);

        let report = sink.join().await.unwrap();
        assert_eq!(report.images_stored, 2);
        assert!(report.error.unwrap().contains("disk full"));
    }
}
