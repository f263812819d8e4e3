//! Queued delivery of accounting messages to the primary daemon.
//!
//! The controller enqueues packed messages with [`AccountingAgent::agent_send`] and never
//! waits for the network. A worker task drains the queue in batches, reconnecting with a
//! back-off when the daemon is unreachable. The queue is saved to the replay file when the
//! agent stops and loaded again when it starts.
mod queue;
pub mod replay;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use jobres::protocol::PROTOCOL_VERSION;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

use crate::agent::queue::PendingQueue;
use crate::common::error::{DbdError, connection_error};
use crate::config::{AgentConfig, ExtHost, OverflowAction};
use crate::dbd_conn::DbdConn;
use crate::ext::ExtDbdManager;
use crate::messages::{DbdMsg, IdRc, RegisterCtld};
use crate::transfer::connection::PersistFlags;

/// How long a stopping agent waits for the worker before aborting it.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Minimal period of the "queue filling" warning.
const QUEUE_WARNING_PERIOD: Duration = Duration::from_secs(120);

pub(crate) struct QueueState {
    pending: PendingQueue,
    last_warning: Option<Instant>,
}

pub(crate) struct AgentShared {
    config: AgentConfig,
    max_queue: usize,
    queue: Mutex<QueueState>,
    wakeup: Notify,
    /// Holding this lock is required for any I/O on the primary connection
    conn: tokio::sync::Mutex<DbdConn>,
    /// Number of direct requests waiting for the connection
    halt: AtomicUsize,
    shutdown: Arc<AtomicBool>,
    primary_up: watch::Sender<bool>,
    id_sink: Option<mpsc::UnboundedSender<IdRc>>,
}

impl AgentShared {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    #[inline]
    fn is_halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst) > 0
    }

    /// Sleeps until woken up or until `timeout` elapses.
    async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.wakeup.notified()).await;
    }

    fn save_state(&self) -> crate::Result<usize> {
        let state = self.lock_queue();
        let path = self.config.replay_path();
        let saved = replay::save(&path, PROTOCOL_VERSION, state.pending.iter())?;
        if state.pending.is_empty() {
            log::debug!("No pending accounting messages, cleared {}", path.display());
        } else {
            log::info!(
                "Saved {saved} pending accounting messages to {}",
                path.display()
            );
        }
        Ok(saved)
    }
}

/// Blocks the worker from taking the connection while a direct request is in progress.
struct HaltGuard<'a> {
    shared: &'a AgentShared,
}

impl<'a> HaltGuard<'a> {
    fn new(shared: &'a AgentShared) -> Self {
        shared.halt.fetch_add(1, Ordering::SeqCst);
        HaltGuard { shared }
    }
}

impl Drop for HaltGuard<'_> {
    fn drop(&mut self) {
        self.shared.halt.fetch_sub(1, Ordering::SeqCst);
        self.shared.wakeup.notify_one();
    }
}

pub struct AccountingAgent {
    shared: Arc<AgentShared>,
    ext: ExtDbdManager,
    worker: Option<JoinHandle<crate::Result<usize>>>,
}

impl AccountingAgent {
    /// Loads the replay file and starts the worker, which connects to the primary daemon.
    /// Connections to the configured external daemons are opened by their own health task.
    ///
    /// `ID_RC` replies of delivered job records are forwarded to `id_sink`.
    /// Must be called from within a tokio runtime.
    pub fn start(config: AgentConfig, id_sink: Option<mpsc::UnboundedSender<IdRc>>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let conn = DbdConn::new(&config, PersistFlags::empty(), shutdown.clone());
        let mut pending = PendingQueue::default();
        match replay::load(&config.replay_path(), PROTOCOL_VERSION) {
            Ok(frames) => pending.prepend(frames),
            Err(e) => log::error!(
                "Cannot load saved accounting messages from {}: {e}",
                config.replay_path().display()
            ),
        }
        let ext = ExtDbdManager::new(&config, shutdown.clone());
        let (primary_up, _) = watch::channel(false);
        let shared = Arc::new(AgentShared {
            max_queue: config.max_queue(),
            config,
            queue: Mutex::new(QueueState {
                pending,
                last_warning: None,
            }),
            wakeup: Notify::new(),
            conn: tokio::sync::Mutex::new(conn),
            halt: AtomicUsize::new(0),
            shutdown,
            primary_up,
            id_sink,
        });
        let worker = tokio::spawn(worker::run_worker(shared.clone()));
        AccountingAgent {
            shared,
            ext,
            worker: Some(worker),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    /// Flag shared by every connection of this agent; set when the agent is stopping.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shared.shutdown.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock_queue().pending.len()
    }

    /// Queues a message for the primary daemon. Performs no network I/O.
    ///
    /// When the queue is full, the configured [`OverflowAction`] applies: `Discard` drops step
    /// records and then job start records, `Exit` saves the queue to the replay file, stops
    /// the agent and returns [`DbdError::ReplayOverflow`].
    pub fn agent_send(&self, version: u16, msg: &DbdMsg) -> crate::Result<()> {
        if self.shared.is_shutting_down() {
            return connection_error("the accounting agent is stopping");
        }
        let frame = msg.pack(version)?;
        let max_queue = self.shared.max_queue;
        let mut state = self.shared.lock_queue();
        let len = state.pending.len();

        if len >= max_queue / 2 {
            let warn = state
                .last_warning
                .is_none_or(|t| t.elapsed() >= QUEUE_WARNING_PERIOD);
            if warn {
                log::error!(
                    "Agent queue filling ({len}), MaxDBDMsgs={max_queue}, restart the accounting daemon now"
                );
                state.last_warning = Some(Instant::now());
            }
        }

        if len >= max_queue.saturating_sub(1) {
            match self.shared.config.max_dbd_msg_action {
                OverflowAction::Exit => {
                    let path = self.shared.config.replay_path();
                    let saved = replay::save(&path, PROTOCOL_VERSION, state.pending.iter())?;
                    drop(state);
                    log::error!(
                        "Agent queue is full ({len}), saved {saved} messages to {}, stopping",
                        path.display()
                    );
                    self.shared.shutdown.store(true, Ordering::SeqCst);
                    self.shared.wakeup.notify_one();
                    return Err(DbdError::ReplayOverflow(saved));
                }
                OverflowAction::Discard => {
                    state.pending.make_room(max_queue);
                    if state.pending.len() >= max_queue.saturating_sub(1) {
                        log::error!(
                            "Agent queue is full ({}), discarding {:?} request",
                            state.pending.len(),
                            msg.msg_type()
                        );
                        return Ok(());
                    }
                }
            }
        }
        state.pending.push_back(frame);
        drop(state);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Sends a request directly over the primary connection and waits for the reply.
    ///
    /// The worker does not send while the request is in progress, so the reply cannot be
    /// mixed with batch replies.
    pub async fn send_recv(&self, version: u16, msg: &DbdMsg) -> crate::Result<DbdMsg> {
        let _halt = HaltGuard::new(&self.shared);
        let mut conn = self.shared.conn.lock().await;
        conn.send_recv_direct(version, msg).await
    }

    pub async fn send_recv_rc(
        &self,
        version: u16,
        msg: &DbdMsg,
    ) -> crate::Result<(i32, Option<String>)> {
        let _halt = HaltGuard::new(&self.shared);
        let mut conn = self.shared.conn.lock().await;
        conn.send_recv_rc(version, msg).await
    }

    /// Registers the controller listening on `port`; returns the daemon's return code.
    ///
    /// With accounting enforcement a refused registration is [`DbdError::Fatal`].
    pub async fn register_ctld(&self, port: u16) -> crate::Result<i32> {
        let msg = DbdMsg::RegisterCtld(RegisterCtld { port, flags: 0 });
        let (rc, _) = self.send_recv_rc(PROTOCOL_VERSION, &msg).await?;
        Ok(rc)
    }

    /// Waits until the primary connection is up; returns `false` on timeout.
    pub async fn wait_for_assoc_cache(&self, timeout: Duration) -> bool {
        let mut receiver = self.shared.primary_up.subscribe();
        matches!(
            tokio::time::timeout(timeout, receiver.wait_for(|up| *up)).await,
            Ok(Ok(_))
        )
    }

    /// External daemons that receive messages sent with [`ExtDbdManager::send_all`].
    pub fn ext(&self) -> &ExtDbdManager {
        &self.ext
    }

    pub async fn reconfig(&self, ext_hosts: &[ExtHost]) {
        self.ext.reconfig(ext_hosts).await;
    }

    /// Replaces the primary connection, closing the previous one.
    pub async fn set_conn(&self, conn: DbdConn) {
        let _halt = HaltGuard::new(&self.shared);
        let mut current = self.shared.conn.lock().await;
        current.close().await;
        *current = conn;
    }

    /// Stops the worker, saves the queue to the replay file and closes the connection.
    ///
    /// Returns the number of saved messages.
    pub async fn shutdown(mut self) -> crate::Result<usize> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_one();
        let result = match self.worker.take() {
            Some(mut handle) => {
                match tokio::time::timeout(WORKER_JOIN_TIMEOUT, &mut handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        log::error!("Accounting agent worker failed: {e}");
                        self.shared.save_state()
                    }
                    Err(_) => {
                        log::warn!("Accounting agent worker did not stop in time, aborting it");
                        handle.abort();
                        let _ = handle.await;
                        self.shared.save_state()
                    }
                }
            }
            None => self.shared.save_state(),
        };
        self.shared.conn.lock().await.close().await;
        self.ext.stop().await;
        result
    }
}

impl Drop for AccountingAgent {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.shutdown.store(true, Ordering::SeqCst);
            handle.abort();
            if let Err(e) = self.shared.save_state() {
                log::error!("Cannot save pending accounting messages: {e}");
            }
        }
    }
}
