//! Tags already embedded in the audio file

use super::{log_changes, ImproveContext, Improver};
use crate::dispatcher::BackendDispatcher;
use crate::error::TagResult;
use crate::record::MetadataRecord;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Fills empty fields from the tags the dispatcher reads from the input
pub struct EmbeddedTagImprover {
    dispatcher: Arc<BackendDispatcher>,
}

impl EmbeddedTagImprover {
    pub fn new(dispatcher: Arc<BackendDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Improver for EmbeddedTagImprover {
    fn name(&self) -> &'static str {
        "embedded"
    }

    async fn improve(&self, record: &mut MetadataRecord, ctx: &mut ImproveContext) -> TagResult<()> {
        let embedded = self.dispatcher.read_tag(&ctx.input).await?;
        if embedded.is_empty() {
            debug!(file = %ctx.input.display(), "No embedded tags");
            return Ok(());
        }

        log_changes(self.name(), &record.merge_missing(&embedded));
        if record.chapters.is_empty() && !embedded.chapters.is_empty() {
            info!(count = embedded.chapters.len(), "Adopting embedded chapters");
            record.chapters = embedded.chapters;
        }
        Ok(())
    }
}
