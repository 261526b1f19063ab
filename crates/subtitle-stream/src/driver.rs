// Subtitle Stream Driver: runs the controller on an event loop with a periodic tick.

use crate::controller::{ControllerAction, SubtitleStreamController};
use crate::decryption::PayloadDecrypter;
use crate::error::SubtitleStreamError;
use crate::events::{SubtitleEvent, SubtitleRequest};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

pub struct SubtitleStreamDriver {
    controller: SubtitleStreamController,
    decrypter: Arc<dyn PayloadDecrypter>,
    event_rx: mpsc::Receiver<SubtitleEvent>,
    request_tx: mpsc::Sender<SubtitleRequest>,
    token: CancellationToken,
    tick_interval: Duration,
}

impl SubtitleStreamDriver {
    pub fn new(
        controller: SubtitleStreamController,
        decrypter: Arc<dyn PayloadDecrypter>,
        event_rx: mpsc::Receiver<SubtitleEvent>,
        request_tx: mpsc::Sender<SubtitleRequest>,
        token: CancellationToken,
        tick_interval: Duration,
    ) -> Self {
        Self {
            controller,
            decrypter,
            event_rx,
            request_tx,
            token,
            tick_interval,
        }
    }

    /// Process events until cancelled or the event channel closes.
    ///
    /// Fails only if the request receiver was dropped while requests were pending.
    pub async fn run(&mut self) -> Result<(), SubtitleStreamError> {
        info!("SubtitleStreamDriver started.");
        let mut decrypts: FuturesUnordered<BoxFuture<'static, Option<SubtitleEvent>>> =
            FuturesUnordered::new();
        let mut ticker: Option<Interval> = None;

        let outcome = loop {
            let actions = tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    info!("Cancellation token received. SubtitleStreamDriver shutting down.");
                    break Ok(());
                }

                Some(completed) = decrypts.next(), if !decrypts.is_empty() => {
                    match completed {
                        Some(event) => self.controller.handle_event(event),
                        None => Vec::new(),
                    }
                }

                maybe_event = self.event_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            trace!(?event, "Subtitle event received");
                            self.controller.handle_event(event)
                        }
                        None => {
                            debug!("Subtitle event channel closed.");
                            break Ok(());
                        }
                    }
                }

                _ = next_tick(&mut ticker) => {
                    self.controller
                        .tick()
                        .map(ControllerAction::Request)
                        .into_iter()
                        .collect()
                }
            };

            self.sync_ticker(&mut ticker);

            if let Err(e) = self.dispatch(actions, &mut decrypts).await {
                error!(error = %e, "Subtitle request receiver dropped, stopping driver");
                break Err(e);
            }
        };

        self.controller.stop_load();
        info!("SubtitleStreamDriver finished.");
        outcome
    }

    /// Arm or disarm the periodic tick to follow the controller.
    fn sync_ticker(&self, ticker: &mut Option<Interval>) {
        match (self.controller.is_ticking(), ticker.is_some()) {
            (true, false) => {
                let start = Instant::now() + self.tick_interval;
                let mut interval = tokio::time::interval_at(start, self.tick_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *ticker = Some(interval);
                trace!(period_ms = self.tick_interval.as_millis() as u64, "Subtitle tick armed");
            }
            (false, true) => {
                *ticker = None;
                trace!("Subtitle tick disarmed");
            }
            _ => {}
        }
    }

    async fn dispatch(
        &self,
        actions: Vec<ControllerAction>,
        decrypts: &mut FuturesUnordered<BoxFuture<'static, Option<SubtitleEvent>>>,
    ) -> Result<(), SubtitleStreamError> {
        for action in actions {
            match action {
                ControllerAction::Request(request) => {
                    self.request_tx
                        .send(request)
                        .await
                        .map_err(|_| SubtitleStreamError::channel_closed("subtitle requests"))?;
                }
                ControllerAction::Decrypt(job) => {
                    decrypts.push(job.run(Arc::clone(&self.decrypter)).boxed());
                }
            }
        }
        Ok(())
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
