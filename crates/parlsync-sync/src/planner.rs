use std::collections::HashMap;
use std::time::Duration;

use chrono::NaiveDate;
use parlsync_adapters::CountProbe;
use parlsync_core::{weeks_in_window, FetchParameter, FilterSet, RecordKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("window start {start} is after window end {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },
    #[error("{0} mode requires date_start and date_end")]
    MissingWindow(&'static str),
    #[error("incremental mode requires an updated-since timestamp")]
    MissingTimestamp,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Compares local and remote counts week by week and emits fetches only for weeks with missing records.
pub struct ReconciliationPlanner<'a> {
    store: &'a dyn RecordStore,
    probe: &'a dyn CountProbe,
    kind: RecordKind,
    probe_delay: Duration,
}

impl<'a> ReconciliationPlanner<'a> {
    pub fn new(store: &'a dyn RecordStore, probe: &'a dyn CountProbe, kind: RecordKind) -> Self {
        Self {
            store,
            probe,
            kind,
            probe_delay: Duration::ZERO,
        }
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub async fn plan_gap_fill(
        &self,
        window_start: NaiveDate,
        window_end: NaiveDate,
        filters: &FilterSet,
    ) -> Result<Vec<FetchParameter>, PlanError> {
        if window_start > window_end {
            return Err(PlanError::InvalidWindow {
                start: window_start,
                end: window_end,
            });
        }

        let local: HashMap<NaiveDate, u64> = self
            .store
            .count_per_period(self.kind, window_start, window_end, filters)
            .await?
            .into_iter()
            .map(|count| (count.period_start, count.count))
            .collect();

        let weeks = weeks_in_window(window_start, window_end);
        let mut plan = Vec::new();
        let mut probes = 0usize;
        for week in &weeks {
            let local_count = local.get(&week.start).copied().unwrap_or(0);
            let base = FetchParameter::window(week.start, week.end).with_process_types(&filters.process_types);

            let mut remote_count = 0u64;
            let mut nonzero = Vec::new();
            let mut unknown = Vec::new();
            for variant in base.expand_type_variants(&filters.document_types) {
                if probes > 0 && !self.probe_delay.is_zero() {
                    tokio::time::sleep(self.probe_delay).await;
                }
                probes += 1;
                match self.probe.fetch_count(&variant).await {
                    Ok(count) => {
                        remote_count += count;
                        if count > 0 {
                            nonzero.push(variant);
                        }
                    }
                    Err(err) => {
                        warn!(parameters = %variant, error = %err, "count probe failed, assuming gap");
                        unknown.push(variant);
                    }
                }
            }

            if remote_count > local_count {
                debug!(
                    period = %week.start,
                    missing = remote_count - local_count,
                    local_count,
                    remote_count,
                    "gap detected"
                );
                plan.extend(nonzero);
            }
            plan.extend(unknown);
        }

        info!(
            kind = %self.kind,
            weeks = weeks.len(),
            probes,
            parameters = plan.len(),
            "gap-fill plan ready"
        );
        Ok(plan)
    }
}
