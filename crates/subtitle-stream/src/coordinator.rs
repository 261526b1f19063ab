// Subtitle Stream Coordinator: wires the controller, its driver and the host channels.

use crate::config::SubtitleStreamConfig;
use crate::controller::SubtitleStreamController;
use crate::decryption::{Aes128Decrypter, PayloadDecrypter};
use crate::driver::SubtitleStreamDriver;
use crate::error::SubtitleStreamError;
use crate::events::{SubtitleEvent, SubtitleRequest};
use crate::tracker::FragmentTracker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error};

/// Host side of a running subtitle stream.
pub struct SubtitleStreamHandles {
    /// Feed host events (media, tracks, loader results) into the stream
    pub event_tx: mpsc::Sender<SubtitleEvent>,
    /// Key and fragment requests to service, plus decrypted payloads
    pub request_rx: mpsc::Receiver<SubtitleRequest>,
    pub driver_handle: JoinHandle<Result<(), SubtitleStreamError>>,
}

pub struct SubtitleStreamCoordinator;

impl SubtitleStreamCoordinator {
    /// Validates the configuration, spawns the driver task and returns the host handles.
    ///
    /// The fragment tracker is shared with the host so that the other stream
    /// controllers can see subtitle fragment states. Without a decrypter, AES-128
    /// is used with offloading taken from the configuration.
    ///
    /// Optional parent_span is attached to the driver task.
    pub fn setup_and_spawn(
        config: Arc<SubtitleStreamConfig>,
        tracker: Arc<dyn FragmentTracker>,
        decrypter: Option<Arc<dyn PayloadDecrypter>>,
        token: CancellationToken,
        parent_span: Option<tracing::Span>,
    ) -> Result<SubtitleStreamHandles, SubtitleStreamError> {
        config.validate()?;

        let decrypter = decrypter.unwrap_or_else(|| {
            Arc::new(Aes128Decrypter::new(config.decryption_offload_enabled))
        });

        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let (request_tx, request_rx) = mpsc::channel(config.request_channel_capacity);

        let controller = SubtitleStreamController::new(Arc::clone(&config), tracker);
        let mut driver = SubtitleStreamDriver::new(
            controller,
            decrypter,
            event_rx,
            request_tx,
            token,
            config.tick_interval,
        );

        let task = async move {
            let res = driver.run().await;
            if let Err(e) = &res {
                error!("Subtitle stream driver ended with error: {:?}", e);
            }
            debug!("SubtitleStreamDriver task finished.");
            res
        };
        let driver_handle = match parent_span {
            Some(span) => tokio::spawn(task.instrument(span)),
            None => tokio::spawn(task),
        };

        Ok(SubtitleStreamHandles {
            event_tx,
            request_rx,
            driver_handle,
        })
    }
}
