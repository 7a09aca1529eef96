use super::{Element, WebmSaver};
use crate::config::ElementsConfig;
use crate::error::{Error, Result};
use crate::types::StreamId;
use std::sync::Arc;
use tracing::debug;

/// Muxes a stream's VP8 video and Opus audio into a WebM file
pub const TYPE_WEBM_SAVER: &str = "WebmSaver";

/// Create the element named `element_type` for stream `target`
pub fn get_element(
    element_type: &str,
    target: &StreamId,
    config: &ElementsConfig,
) -> Result<Arc<dyn Element>> {
    debug!(element_type, stream_id = %target, "Creating element");
    match element_type {
        TYPE_WEBM_SAVER => Ok(Arc::new(WebmSaver::new(target.clone(), &config.output_dir))),
        _ => Err(Error::ElementNotFound(element_type.to_string())),
    }
}
