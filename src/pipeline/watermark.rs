// ABOUTME: Watermark extraction - pages through the source by (event_time, entity_id) cursor
// ABOUTME: Advances the persisted offset per page, never past a failed record

use anyhow::{Context, Result};

use super::{EtlPipeline, Progress, RunMode};
use crate::offset::Offset;
use crate::record::{Record, RecordKey};
use crate::utils::with_timeout;

/// The offset to write after processing up to `candidate`, if it moves forward.
///
/// Offsets never move backwards: a bootstrap pass that re-reads old rows leaves a
/// higher stored offset alone.
pub fn advance_offset(current: Option<&RecordKey>, candidate: &RecordKey) -> Option<RecordKey> {
    match current {
        Some(current) if current >= candidate => None,
        _ => Some(candidate.clone()),
    }
}

impl EtlPipeline {
    pub(super) async fn run_watermark(&self, mode: RunMode, progress: &mut Progress) -> Result<()> {
        let job = self.settings.name.as_str();
        let stored = self
            .offsets
            .get(job)
            .await
            .with_context(|| format!("Failed to read offset of {}", job))?;
        let mut high = stored.as_ref().map(Offset::key);
        progress.offset = high.clone();

        let (mut cursor, page_limit) = match mode {
            RunMode::Incremental => (high.clone(), Some(self.settings.max_pages_per_run)),
            RunMode::Bootstrap => (None, None),
        };
        if cursor.is_none() {
            tracing::info!("Pipeline {} extracting from the beginning", job);
        }

        let page_size = self.settings.page_size;
        let mut pages = 0usize;

        loop {
            if page_limit.is_some_and(|limit| pages >= limit) {
                tracing::debug!("Pipeline {} reached its page cap for this run", job);
                break;
            }

            let page = match with_timeout(
                "fetch_incremental",
                self.settings.io_timeout,
                self.source.fetch_incremental(cursor.as_ref(), page_size),
            )
            .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(
                        "Pipeline {} failed to extract from {}: {:?}",
                        job,
                        self.source.name(),
                        e
                    );
                    self.set_connected(false);
                    progress.extraction_error = Some(format!("{:#}", e));
                    break;
                }
            };
            self.set_connected(true);
            pages += 1;

            let fetched = page.len();
            progress.extracted += fetched;
            if fetched == 0 {
                break;
            }

            let batch = self.load_batch(&page, true, progress).await;
            progress.accepted.extend(batch.loaded);

            if let Some(safe_key) = batch.safe_key {
                if let Some(next) = advance_offset(high.as_ref(), &safe_key) {
                    self.offsets
                        .set(job, Offset::new(job, next.clone(), batch.processed as u64))
                        .await
                        .with_context(|| format!("Failed to store offset of {}", job))?;
                    tracing::debug!("Pipeline {} offset -> {}", job, next);
                    high = Some(next);
                    progress.offset = high.clone();
                }
            }

            if let Some(failure) = batch.failure {
                return Err(failure);
            }

            cursor = page.last().map(Record::key);
            if fetched < page_size {
                break;
            }
        }

        Ok(())
    }
}
