//! Improvers that adjust chapter timing against the audio itself

use super::{ImproveContext, Improver};
use crate::backends::Silence;
use crate::dispatcher::BackendDispatcher;
use crate::error::TagResult;
use crate::record::{Chapter, MetadataRecord};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shortest silence considered a chapter break
pub const DEFAULT_MIN_SILENCE: Duration = Duration::from_millis(1750);

/// Farthest a chapter start may move to reach a silence
pub const DEFAULT_MAX_SHIFT: Duration = Duration::from_secs(10);

// ============================================================================
// Chapter length
// ============================================================================

/// Extends the last chapter to the total duration of the audio
pub struct ChapterLengthImprover {
    dispatcher: Arc<BackendDispatcher>,
}

impl ChapterLengthImprover {
    pub fn new(dispatcher: Arc<BackendDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Improver for ChapterLengthImprover {
    fn name(&self) -> &'static str {
        "chapter-length"
    }

    async fn improve(&self, record: &mut MetadataRecord, ctx: &mut ImproveContext) -> TagResult<()> {
        if record.chapters.is_empty() {
            debug!("No chapters to extend");
            return Ok(());
        }

        let Some(total) = self.dispatcher.estimate_duration(&ctx.input).await? else {
            warn!(file = %ctx.input.display(), "Could not determine duration");
            return Ok(());
        };

        extend_last_chapter(&mut record.chapters, total);
        Ok(())
    }
}

/// Stretch the last chapter to `total`; chapters are never shortened
pub fn extend_last_chapter(chapters: &mut [Chapter], total: Duration) {
    let Some(last) = chapters.last_mut() else {
        return;
    };
    if total > last.end() {
        info!(from = ?last.end(), to = ?total, "Extending last chapter");
        last.set_end(total);
    } else if total < last.end() {
        warn!(chapters_end = ?last.end(), ?total, "Chapters run past the end of the audio");
    }
}

// ============================================================================
// Silence snapping
// ============================================================================

/// Moves chapter starts into the middle of nearby silences
pub struct SilenceSnapImprover {
    dispatcher: Arc<BackendDispatcher>,
    min_silence: Duration,
    max_shift: Duration,
}

impl SilenceSnapImprover {
    pub fn new(dispatcher: Arc<BackendDispatcher>) -> Self {
        Self {
            dispatcher,
            min_silence: DEFAULT_MIN_SILENCE,
            max_shift: DEFAULT_MAX_SHIFT,
        }
    }

    pub fn with_min_silence(mut self, min_silence: Duration) -> Self {
        self.min_silence = min_silence;
        self
    }

    pub fn with_max_shift(mut self, max_shift: Duration) -> Self {
        self.max_shift = max_shift;
        self
    }
}

#[async_trait]
impl Improver for SilenceSnapImprover {
    fn name(&self) -> &'static str {
        "silence-snap"
    }

    async fn improve(&self, record: &mut MetadataRecord, ctx: &mut ImproveContext) -> TagResult<()> {
        if record.chapters.len() < 2 {
            debug!("Nothing to snap");
            return Ok(());
        }

        let silences = self
            .dispatcher
            .detect_silences(&ctx.input, self.min_silence)
            .await?;
        let moved = snap_to_silences(&mut record.chapters, &silences, self.max_shift);
        info!(moved, silences = silences.len(), "Snapped chapter starts to silences");

        ctx.silences = Some(silences);
        Ok(())
    }
}

/// Move every chapter start but the first to the middle of the nearest
/// silence within `max_shift`, keeping starts strictly increasing
///
/// Chapter ends follow the next start; the last chapter keeps its end.
/// Returns the number of moved chapters.
pub fn snap_to_silences(chapters: &mut [Chapter], silences: &[Silence], max_shift: Duration) -> usize {
    let Some(original_end) = chapters.last().map(Chapter::end) else {
        return 0;
    };
    let mut moved = 0;

    for i in 1..chapters.len() {
        let start = chapters[i].start();
        let lower = chapters[i - 1].start();
        let upper = chapters.get(i + 1).map(Chapter::start);

        let nearest = silences
            .iter()
            .map(Silence::middle)
            .filter(|m| *m > lower && upper.map_or(true, |u| *m < u))
            .filter(|m| distance(*m, start) <= max_shift)
            .min_by_key(|m| distance(*m, start));

        if let Some(target) = nearest {
            if target != start {
                debug!(chapter = %chapters[i].name, from = ?start, to = ?target, "Moving chapter start");
                chapters[i].set_start(target);
                moved += 1;
            }
        }
    }

    for i in 1..chapters.len() {
        let next_start = chapters[i].start();
        chapters[i - 1].set_end(next_start);
    }
    if let Some(last) = chapters.last_mut() {
        last.set_end(original_end);
    }
    moved
}

fn distance(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn chapters() -> Vec<Chapter> {
        vec![
            Chapter::new(secs(0), secs(100), "One"),
            Chapter::new(secs(100), secs(100), "Two"),
            Chapter::new(secs(200), secs(100), "Three"),
        ]
    }

    #[test]
    fn test_snap_moves_into_nearby_silence() {
        let mut list = chapters();
        let silences = [
            Silence::new(secs(96), secs(98)),
            Silence::new(secs(150), secs(152)),
            Silence::new(secs(230), secs(232)),
        ];

        let moved = snap_to_silences(&mut list, &silences, secs(10));

        assert_eq!(moved, 1);
        assert_eq!(list[1].start(), secs(97));
        assert_eq!(list[0].end(), secs(97));
        assert_eq!(list[2].start(), secs(200), "Silence too far away");
        assert_eq!(list[2].end(), secs(300), "Last chapter keeps its end");
        assert_eq!(list[1].end(), secs(200));
    }

    #[test]
    fn test_snap_picks_nearest() {
        let mut list = chapters();
        let silences = [Silence::new(secs(91), secs(93)), Silence::new(secs(103), secs(105))];
        snap_to_silences(&mut list, &silences, secs(10));
        assert_eq!(list[1].start(), secs(104));
    }

    #[test]
    fn test_snap_never_reorders() {
        let mut list = vec![
            Chapter::new(secs(0), secs(5), "A"),
            Chapter::new(secs(5), secs(5), "B"),
            Chapter::new(secs(10), secs(5), "C"),
        ];
        let silences = [Silence::new(secs(11), secs(13))];
        snap_to_silences(&mut list, &silences, secs(10));

        assert_eq!(list[1].start(), secs(5), "Target beyond the next start is rejected");
        assert_eq!(list[2].start(), secs(12));
        assert!(list.windows(2).all(|w| w[0].start() < w[1].start()));
    }

    #[test]
    fn test_extend_last_chapter_never_shortens() {
        let mut list = chapters();
        extend_last_chapter(&mut list, secs(350));
        assert_eq!(list[2].end(), secs(350));

        extend_last_chapter(&mut list, secs(320));
        assert_eq!(list[2].end(), secs(350));
    }
}
