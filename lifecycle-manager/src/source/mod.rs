//! Event sources detect notices and offer them to the dispatcher.
//!
//! Every source owns a single pending slot. A detected notice waits in the slot
//! until the dispatcher accepts it, and the source does not look for new
//! notices in the meantime.

use async_trait::async_trait;
use lifecycle_common::notice::Notice;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;
use crate::health::HealthHandle;

pub mod queue;
pub mod spot;

pub use queue::QueueSource;
pub use spot::SpotSource;

#[async_trait]
pub trait EventSource: Send {
    /// Used for logs, metrics and liveness.
    fn name(&self) -> String;

    /// Run until `shutdown` is cancelled. Transient failures are retried internally.
    async fn listen(&mut self, shutdown: CancellationToken) -> Result<(), SourceError>;
}

/// Single-notice buffer between detection and delivery.
#[derive(Debug, Default)]
pub(crate) struct PendingSlot {
    notice: Option<Notice>,
}

impl PendingSlot {
    pub(crate) fn is_occupied(&self) -> bool {
        self.notice.is_some()
    }

    pub(crate) fn hold(&mut self, notice: Notice) {
        debug_assert!(self.notice.is_none(), "pending slot already occupied");
        self.notice = Some(notice);
    }

    /// Waits for channel capacity, then hands the pending notice over.
    ///
    /// Cancel safe: the notice only leaves the slot once a permit is held, so
    /// dropping this future mid-wait keeps it pending.
    pub(crate) async fn offer(
        &mut self,
        notices: &mpsc::Sender<Notice>,
        source: &str,
    ) -> Result<(), SourceError> {
        let permit = notices
            .reserve()
            .await
            .map_err(|_| SourceError::DispatcherClosed(source.to_owned()))?;
        if let Some(notice) = self.notice.take() {
            tracing::debug!(source, kind = notice.kind(), "offered notice");
            permit.send(notice);
        }
        Ok(())
    }

    /// Like [`PendingSlot::offer`], but keeps reporting liveness while the
    /// dispatcher is busy with a long action.
    pub(crate) async fn offer_while_live(
        &mut self,
        notices: &mpsc::Sender<Notice>,
        source: &str,
        liveness: &HealthHandle,
    ) -> Result<(), SourceError> {
        let mut ticker = tokio::time::interval(liveness.report_interval());
        let offer = self.offer(notices, source);
        tokio::pin!(offer);

        loop {
            tokio::select! {
                offered = &mut offer => return offered,
                _ = ticker.tick() => liveness.report_healthy(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::health::HealthRegistry;

    #[tokio::test(start_paused = true)]
    async fn test_offer_keeps_notice_when_cancelled() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(Notice::spot(chrono::Utc::now())).await.unwrap();

        let mut slot = PendingSlot::default();
        slot.hold(Notice::spot(chrono::Utc::now()));

        // The channel is full, so the offer loses the race against the timeout.
        tokio::select! {
            _ = slot.offer(&tx, "spot") => panic!("channel should be full"),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        assert!(slot.is_occupied());

        rx.recv().await.unwrap();
        slot.offer(&tx, "spot").await.unwrap();
        assert!(!slot.is_occupied());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_offer_to_closed_dispatcher() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let mut slot = PendingSlot::default();
        slot.hold(Notice::spot(chrono::Utc::now()));
        assert_eq!(
            slot.offer(&tx, "spot").await,
            Err(SourceError::DispatcherClosed("spot".to_owned()))
        );
        assert!(slot.is_occupied());
    }

    #[tokio::test]
    async fn test_stays_live_while_dispatcher_is_busy() {
        let (tx, _rx) = mpsc::channel(1);
        tx.send(Notice::spot(chrono::Utc::now())).await.unwrap();

        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("spot", Duration::from_millis(200));
        let mut slot = PendingSlot::default();
        slot.hold(Notice::spot(chrono::Utc::now()));

        // Real time, since liveness deadlines follow the wall clock.
        let offered = tokio::time::timeout(
            Duration::from_millis(600),
            slot.offer_while_live(&tx, "spot", &liveness),
        )
        .await;
        assert!(offered.is_err());
        assert!(slot.is_occupied());
        assert!(registry.get_status().healthy);
    }
}
