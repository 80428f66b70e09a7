//! # Single-Flight Poll Guard
//!
//! Coalesces "check for more work" triggers. At most one pass runs at a time
//! and at most one follow-up pass is queued behind it: any number of
//! triggers arriving while a pass runs collapse into that single follow-up.
//! Callers never wait for a pass to finish.
//!
//! ```rust
//! use scene_tasks::orchestration::SingleFlight;
//!
//! # tokio_test::block_on(async {
//! let guard = SingleFlight::spawn("example", || async {
//!     // claim and run ready work
//! });
//! assert!(guard.trigger());
//! guard.shutdown().await;
//! # });
//! ```

use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Cheap handle used to request a pass
#[derive(Debug, Clone)]
pub struct SingleFlightTrigger {
    sender: mpsc::Sender<()>,
}

impl SingleFlightTrigger {
    /// Request a pass. Returns `false` when the request was folded into an
    /// already-queued pass or the guard has shut down.
    pub fn trigger(&self) -> bool {
        match self.sender.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => false,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

pub struct SingleFlight {
    name: &'static str,
    trigger: SingleFlightTrigger,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl SingleFlight {
    /// Spawn the pass loop. `pass` is invoked once per accepted trigger.
    pub fn spawn<F, Fut>(name: &'static str, pass: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // One slot: the pass queued behind the running one
        let (sender, mut receiver) = mpsc::channel::<()>(1);
        let shutdown = CancellationToken::new();
        let loop_shutdown = shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = loop_shutdown.cancelled() => break,
                    received = receiver.recv() => {
                        if received.is_none() {
                            break;
                        }
                        pass().await;
                    }
                }
            }
            debug!(single_flight = name, "Single-flight loop stopped");
        });

        Self {
            name,
            trigger: SingleFlightTrigger { sender },
            shutdown,
            handle,
        }
    }

    pub fn trigger(&self) -> bool {
        self.trigger.trigger()
    }

    pub fn trigger_handle(&self) -> SingleFlightTrigger {
        self.trigger.clone()
    }

    /// Stop accepting passes and wait for a running pass to return.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            error!(single_flight = self.name, error = %e, "Single-flight loop terminated abnormally");
        }
    }
}
