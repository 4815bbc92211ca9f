//! Image processors applied between the queue and the datastore.

use anyhow::Result;
use async_trait::async_trait;
use mda_core::image::TaggedImage;

/// A processor that transforms or filters images.
///
/// Returning `Ok(None)` drops the image; it never reaches the datastore.
/// Examples: background subtraction, flat-field correction, live previews.
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Process one image.
    async fn process(&mut self, image: TaggedImage) -> Result<Option<TaggedImage>>;
}

/// Processors run in insertion order.
#[derive(Default)]
pub struct ProcessorChain {
    processors: Vec<Box<dyn ImageProcessor>>,
}

impl ProcessorChain {
    /// Empty chain; images pass through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a processor.
    pub fn with(mut self, processor: impl ImageProcessor + 'static) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Number of processors.
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// True when the chain has no processors.
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Run `image` through every processor, stopping when one drops it.
    pub async fn run(&mut self, image: TaggedImage) -> Result<Option<TaggedImage>> {
        let mut current = image;
        for processor in &mut self.processors {
            match processor.process(current).await? {
                Some(next) => current = next,
                None => {
                    tracing::trace!(processor = processor.name(), "image dropped");
                    return Ok(None);
                }
            }
        }
        Ok(Some(current))
    }
}

/// Subtracts a constant camera offset from every pixel, saturating at zero.
#[derive(Debug, Clone)]
pub struct BackgroundSubtract {
    offset: u16,
}

impl BackgroundSubtract {
    /// Subtract `offset` counts.
    pub fn new(offset: u16) -> Self {
        Self { offset }
    }
}

#[async_trait]
impl ImageProcessor for BackgroundSubtract {
    fn name(&self) -> &str {
        "background_subtract"
    }

    async fn process(&mut self, mut image: TaggedImage) -> Result<Option<TaggedImage>> {
        for px in &mut image.pixels {
            *px = px.saturating_sub(self.offset);
        }
        Ok(Some(image))
    }
}
