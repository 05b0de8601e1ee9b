//! Cooperative shutdown for the daemon's long-running workers.
//!
//! See <https://tokio.rs/tokio/topics/shutdown> for more information.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc::{Receiver as MpscReceiver, Sender as MpscSender};
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};

static ACTIVE: OnceLock<Mutex<Option<Activity>>> = OnceLock::new();
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static STOPPING: OnceLock<ShutdownState> = OnceLock::new();

/// Represents some activity which cannot be ruthlessly interrupted.
/// While any Activity instances are alive, LifeCycle::wait_for_shutdown
/// cannot complete.
#[derive(Clone)]
pub struct Activity {
    _tx: MpscSender<()>,
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Activity").finish()
    }
}

impl Activity {
    /// Obtain an Activity instance.
    /// Returns None if the process is shutting down and no new
    /// activity can be initiated.
    pub fn get_opt() -> Option<Self> {
        ACTIVE.get()?.lock().unwrap().as_ref().cloned()
    }

    /// Obtain an Activity instance, or Err if the process is
    /// already shutting down.
    pub fn get() -> anyhow::Result<Self> {
        Self::get_opt().ok_or_else(|| anyhow::anyhow!("shutting down"))
    }
}

pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::Relaxed)
}

struct ShutdownState {
    tx: WatchSender<()>,
    rx: WatchReceiver<()>,
    request_shutdown_tx: MpscSender<()>,
}

/// ShutdownSubscription can be used by code that is idling.
/// Select on your timeout and ShutdownSubscription::shutting_down
/// to wake up when either the timeout expires or the process is
/// about to shut down.
pub struct ShutdownSubscription {
    rx: WatchReceiver<()>,
}

impl ShutdownSubscription {
    pub fn get() -> Self {
        Self {
            rx: STOPPING.get().unwrap().rx.clone(),
        }
    }

    /// Await the shutdown of the process
    pub async fn shutting_down(&mut self) {
        self.rx.changed().await.ok();
    }
}

/// The LifeCycle struct represents the life cycle of this server process.
/// Creating an instance of it will prepare the global state of the
/// process and allow other code to work with Activity and
/// ShutdownSubscription.
pub struct LifeCycle {
    activity_rx: MpscReceiver<()>,
    request_shutdown_rx: MpscReceiver<()>,
}

impl LifeCycle {
    /// Initialize the process life cycle.
    /// May be called only once; will panic if called multiple times.
    pub fn new() -> Self {
        let (activity_tx, activity_rx) = tokio::sync::mpsc::channel(1);
        ACTIVE
            .set(Mutex::new(Some(Activity { _tx: activity_tx })))
            .map_err(|_| ())
            .unwrap();

        let (request_shutdown_tx, request_shutdown_rx) = tokio::sync::mpsc::channel(1);

        let (tx, rx) = tokio::sync::watch::channel(());
        STOPPING
            .set(ShutdownState {
                tx,
                rx,
                request_shutdown_tx,
            })
            .map_err(|_| ())
            .unwrap();

        Self {
            activity_rx,
            request_shutdown_rx,
        }
    }

    /// Request that we shut down the process.
    /// This will cause the wait_for_shutdown method on the process
    /// LifeCycle instance to wake up and initiate the shutdown
    /// procedure. The event forwarder escalates its loop-level
    /// failures through here.
    pub async fn request_shutdown() {
        tracing::debug!("shutdown has been requested");
        if let Some(state) = STOPPING.get() {
            state.request_shutdown_tx.send(()).await.ok();
        } else {
            tracing::error!("request_shutdown: process life cycle is not initialized");
        }
    }

    /// Set up the process life cycle once for the whole test binary
    #[cfg(test)]
    pub fn init_for_tests() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            std::mem::forget(LifeCycle::new());
        });
    }

    /// Wait for a shutdown request, then propagate that state
    /// to running tasks, and then wait for those tasks to complete
    /// before returning to the caller.
    pub async fn wait_for_shutdown(&mut self) {
        tracing::debug!("Waiting for interrupt");
        let mut sig_term =
            tokio::signal::unix::signal(SignalKind::terminate()).expect("listen for SIGTERM");
        tokio::select! {
            _ = sig_term.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
            _ = self.request_shutdown_rx.recv() => {}
        };
        tracing::info!(
            "Shutdown requested; waiting for in-flight deliveries to \
             run to completion before exiting"
        );
        SHUTTING_DOWN.store(true, Ordering::SeqCst);
        ACTIVE.get().map(|a| a.lock().unwrap().take());
        STOPPING.get().map(|s| s.tx.send(()).ok());
        tracing::debug!("Waiting for tasks to wrap up");
        self.activity_rx.recv().await;
    }
}
