//! User-supplied values (command line)

use super::{log_changes, ImproveContext, Improver};
use crate::error::TagResult;
use crate::record::MetadataRecord;
use async_trait::async_trait;

/// Overwrites the record with every non-empty user value
///
/// Runs last in a typical pipeline so explicit input always wins.
#[derive(Debug, Clone, Default)]
pub struct OverrideImprover {
    overrides: MetadataRecord,
}

impl OverrideImprover {
    pub fn new(overrides: MetadataRecord) -> Self {
        Self { overrides }
    }
}

#[async_trait]
impl Improver for OverrideImprover {
    fn name(&self) -> &'static str {
        "overrides"
    }

    async fn improve(&self, record: &mut MetadataRecord, _ctx: &mut ImproveContext) -> TagResult<()> {
        log_changes(self.name(), &record.merge_overwrite(&self.overrides));
        Ok(())
    }
}
