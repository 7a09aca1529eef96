//! Media processing elements
//!
//! Elements consume the forwarding path's output as [`Sample`]s. They are
//! looked up by type name through a closed dispatch table
//! ([`get_element`]) and fed by a [`Recorder`] subscribed like any other
//! sender.

mod elements;
mod recorder;
mod sample;
mod webm;

pub use elements::{get_element, TYPE_WEBM_SAVER};
pub use recorder::Recorder;
pub use sample::Sample;
pub use webm::WebmSaver;

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A consumer (and optional producer) of samples
#[async_trait]
pub trait Element: Send + Sync {
    /// Accept one sample
    async fn write(&self, sample: &Sample) -> Result<()>;

    /// Processed output. Ends when the element closes; may be empty.
    fn read(&self) -> BoxStream<'static, Sample>;

    /// Flush and release backing resources. Idempotent.
    async fn close(&self) -> Result<()>;
}
