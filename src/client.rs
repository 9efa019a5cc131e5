//! Plugin lifecycle: start the sync worker, filter queue inserts, shut down.

use anyhow::Context;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::watch;

use crate::config::Config;
use crate::connection::{KeeperConnection, KeeperStream, Received};
use crate::error::{InsertError, SyncError};
use crate::filter::{FilterOutcome, InsertFilter, QueueContext};
use crate::reconcile::{Reconciler, Step};
use crate::store::QueueStore;
use crate::warmup::WarmupIndex;

pub struct PolicydClient {
    index: WarmupIndex,
    filter: InsertFilter,
    stop: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl PolicydClient {
    /// Starts the sync worker and blocks until the keeper's first SYNCED has
    /// been applied, or until the worker gives up.
    pub fn init(config: &Config, store: Arc<dyn QueueStore>) -> anyhow::Result<Self> {
        config.validate()?;

        let index = WarmupIndex::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let worker = SyncWorker {
            connection: KeeperConnection::new(
                config.address.clone(),
                config.reconnect_backoff(),
                stop_rx,
            ),
            reconciler: Reconciler::new(config.protocol, store, index.clone()),
            ready: Some(ready_tx),
        };
        let handle = thread::Builder::new()
            .name("policyd-sync".to_string())
            .spawn(move || worker.run_blocking())
            .context("Failed to start sync worker")?;

        let mut client = PolicydClient {
            filter: InsertFilter::new(index.clone()),
            index,
            stop: stop_tx,
            worker: Some(handle),
        };

        let outcome = match config.startup_timeout() {
            Some(timeout) => ready_rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => SyncError::Timeout(timeout),
                RecvTimeoutError::Disconnected => SyncError::WorkerStopped,
            }),
            None => ready_rx.recv().map_err(|_| SyncError::WorkerStopped),
        }
        .and_then(|ready| ready);

        if let Err(e) = outcome {
            log::error!("Failed to sync policies: {e}");
            client.cleanup();
            return Err(anyhow::Error::new(e).context("Failed to sync policies"));
        }

        log::info!("Policies synchronized from {}", config.address);
        Ok(client)
    }

    /// Per-message hook. On `Err`, the message is not queued on this attempt
    /// and `InsertError::payload` is what the host hands back to its caller.
    pub fn queue_insert(&self, ctx: &mut dyn QueueContext) -> Result<FilterOutcome, InsertError> {
        self.filter.apply(ctx)
    }

    pub fn warmup_index(&self) -> &WarmupIndex {
        &self.index
    }

    /// Stops the worker and waits for it to exit. Safe to call more than once.
    pub fn cleanup(&mut self) {
        self.stop.send_replace(true);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("Sync worker panicked");
            }
        }
    }
}

impl Drop for PolicydClient {
    fn drop(&mut self) {
        self.cleanup();
    }
}

enum CycleEnd {
    Disconnected,
    Stopped,
}

struct SyncWorker {
    connection: KeeperConnection,
    reconciler: Reconciler,
    ready: Option<SyncSender<Result<(), SyncError>>>,
}

impl SyncWorker {
    fn run_blocking(self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("Failed to build sync worker runtime: {e}");
                return;
            }
        };
        runtime.block_on(self.run());
    }

    async fn run(mut self) {
        loop {
            let Some(mut stream) = self.connection.connect().await else {
                log::debug!("Sync worker stopping");
                return;
            };

            self.reconciler.begin_cycle();
            let result = self.pump(&mut stream).await;
            self.reconciler.end_cycle();
            stream.close().await;

            match result {
                Ok(CycleEnd::Disconnected) => {
                    log::warn!(
                        "Lost connection to keeper at {}, reconnecting",
                        self.connection.address()
                    );
                }
                Ok(CycleEnd::Stopped) => return,
                Err(e) => {
                    log::error!("Policy synchronization halted: {e}");
                    self.signal(Err(e));
                    return;
                }
            }
        }
    }

    async fn pump(&mut self, stream: &mut KeeperStream) -> Result<CycleEnd, SyncError> {
        loop {
            match stream.next_frame().await {
                Received::Frame(frame) => {
                    if let Step::Synced { first: true } = self.reconciler.handle_frame(&frame)? {
                        self.signal(Ok(()));
                    }
                }
                Received::Disconnected => return Ok(CycleEnd::Disconnected),
                Received::Stopped => return Ok(CycleEnd::Stopped),
            }
        }
    }

    /// Reports the startup outcome. Only the first call has any effect.
    fn signal(&mut self, outcome: Result<(), SyncError>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(outcome);
        }
    }
}
