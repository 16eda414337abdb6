//! Background task lifecycle
//!
//! Every long-running client task (relay loop, heartbeat, dispatcher, expiry
//! sweep) is spawned through [`ShutdownCoordinator::spawn`], which races it
//! against the shutdown broadcast. `shutdown()` signals, waits up to the grace
//! timeout for tasks to finish, then aborts whatever is left.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

pub struct ShutdownCoordinator {
    state: RwLock<ShutdownState>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: RwLock::new(ShutdownState::Running),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn `fut` as a named task that stops on the shutdown signal
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.subscribe();
        let handle = tokio::spawn(async move {
            debug!(task = name, "task started");
            tokio::select! {
                biased;
                _ = fut => debug!(task = name, "task completed"),
                signal = shutdown_rx.recv() => match signal {
                    Ok(ShutdownSignal::Graceful) => debug!(task = name, "task stopping"),
                    Ok(ShutdownSignal::Immediate) => warn!(task = name, "task stopped immediately"),
                    Err(e) => error!(task = name, error = %e, "shutdown channel error"),
                },
            }
        });

        match self.tasks.lock() {
            Ok(mut tasks) => {
                tasks.retain(|(_, h)| !h.is_finished());
                tasks.push((name, handle));
            }
            Err(_) => handle.abort(),
        }
    }

    /// Signal every task and wait for them within the grace timeout
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            if *state != ShutdownState::Running {
                debug!("shutdown already in progress");
                return;
            }
            *state = ShutdownState::ShuttingDown;
        }
        info!("shutting down");

        let _ = self.shutdown_tx.send(ShutdownSignal::Graceful);

        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let deadline = tokio::time::Instant::now() + self.timeout;
        for (name, mut handle) in tasks {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(task = name, "task did not stop in time, aborting");
                handle.abort();
            }
        }

        *self.state.write().await = ShutdownState::Shutdown;
        info!("shutdown complete");
    }

    pub async fn shutdown_immediately(&self) {
        warn!("immediate shutdown");
        *self.state.write().await = ShutdownState::Shutdown;
        let _ = self.shutdown_tx.send(ShutdownSignal::Immediate);
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain(..) {
                handle.abort();
            }
        }
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.state.read().await != ShutdownState::Running
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    pub fn task_count(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.iter().filter(|(_, h)| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

/// Shut the coordinator down on SIGTERM/SIGINT
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        coordinator.shutdown().await;
    });
}

#[cfg(windows)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            return;
        }
        info!("received Ctrl+C");
        coordinator.shutdown().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_shutdown_stops_spawned_tasks() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(500));
        coordinator.spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert_eq!(coordinator.task_count(), 1);

        coordinator.shutdown().await;
        assert_eq!(coordinator.state().await, ShutdownState::Shutdown);
        assert_eq!(coordinator.task_count(), 0);
    }

    #[tokio::test]
    async fn test_completed_task_is_not_interrupted() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        coordinator.spawn("quick", async move {
            flag.store(true, Ordering::SeqCst);
        });

        coordinator.shutdown().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_second_shutdown_is_noop() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(10));
        coordinator.shutdown().await;
        coordinator.shutdown().await;
        assert!(coordinator.is_shutting_down().await);
    }
}
