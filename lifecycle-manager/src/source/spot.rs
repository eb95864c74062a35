use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lifecycle_common::client::NoticeSource;
use lifecycle_common::notice::Notice;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EventSource, PendingSlot};
use crate::error::SourceError;
use crate::health::HealthHandle;
use crate::metrics_consts::SOURCE_ERRORS;

/// Polls instance metadata for a spot reclamation notice on a fixed interval.
pub struct SpotSource {
    client: Arc<dyn NoticeSource>,
    notices: mpsc::Sender<Notice>,
    interval: Duration,
    liveness: HealthHandle,
    pending: PendingSlot,
}

impl SpotSource {
    pub fn new(
        client: Arc<dyn NoticeSource>,
        notices: mpsc::Sender<Notice>,
        interval: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            client,
            notices,
            interval,
            liveness,
            pending: PendingSlot::default(),
        }
    }

    async fn poll(&mut self) {
        match self.client.poll_spot_termination().await {
            Ok(Some(notice)) => {
                info!(%notice, "spot termination scheduled");
                self.pending.hold(notice);
            }
            Ok(None) => debug!("no spot termination scheduled"),
            Err(error) => {
                metrics::counter!(SOURCE_ERRORS, "source" => "spot").increment(1);
                warn!(%error, "failed to poll for spot termination");
            }
        }
        self.liveness.report_healthy();
    }
}

#[async_trait]
impl EventSource for SpotSource {
    fn name(&self) -> String {
        "spot".to_owned()
    }

    async fn listen(&mut self, shutdown: CancellationToken) -> Result<(), SourceError> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "listening for spot termination");

        loop {
            if self.pending.is_occupied() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    offered = self.pending.offer_while_live(&self.notices, "spot", &self.liveness) => offered?,
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.poll().await,
            }
        }

        info!("spot source stopped");
        Ok(())
    }
}
