use std::time::Instant;

use lifecycle_common::notice::Notice;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::handler::Handler;
use crate::metrics_consts::{ACTION_DURATION, NOTICES_HANDLED, NOTICES_RECEIVED};

/// Every source shares one sender. A capacity of one keeps at most a single
/// accepted notice waiting while the handler is busy.
pub const NOTICE_CHANNEL_CAPACITY: usize = 1;

pub fn notice_channel() -> (mpsc::Sender<Notice>, mpsc::Receiver<Notice>) {
    mpsc::channel(NOTICE_CHANNEL_CAPACITY)
}

/// Hands notices to the handler one at a time.
pub struct Dispatcher<H> {
    notices: mpsc::Receiver<Notice>,
    handler: H,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(notices: mpsc::Receiver<Notice>, handler: H) -> Self {
        Self { notices, handler }
    }

    /// Runs until `shutdown` is cancelled or every source has gone away. A notice
    /// already taken off the channel is always handled to the end.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("dispatching notices");
        loop {
            let notice = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                notice = self.notices.recv() => match notice {
                    Some(notice) => notice,
                    None => break,
                },
            };
            self.dispatch(notice).await;
        }
        info!("dispatcher stopped");
    }

    async fn dispatch(&self, notice: Notice) {
        let kind = notice.kind();
        let hook = notice
            .lifecycle_action()
            .map_or("", |action| action.hook_name.as_str());
        metrics::counter!(NOTICES_RECEIVED, "kind" => kind).increment(1);
        info!(kind, hook, %notice, "handling notice");

        let start = Instant::now();
        let result = self.handler.handle(&notice).await;
        metrics::histogram!(ACTION_DURATION, "kind" => kind).record(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::counter!(NOTICES_HANDLED, "kind" => kind, "outcome" => "success")
                    .increment(1);
                info!(kind, hook, "handled notice");
            }
            Err(error) => {
                metrics::counter!(NOTICES_HANDLED, "kind" => kind, "outcome" => "failure")
                    .increment(1);
                error!(kind, hook, %error, "failed to handle notice");
            }
        }
    }
}
