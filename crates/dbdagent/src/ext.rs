//! Connections to external accounting daemons.
//!
//! External daemons get every message directly, there is no queue. A health task checks the
//! connections periodically, reconnects dead ones and registers the controller again. A daemon
//! that refuses the registration is removed for good.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::common::error::{DbdError, protocol_error};
use crate::config::{AgentConfig, ExtHost};
use crate::messages::{DbdMsg, ESLURM_ACCESS_DENIED, RegisterCtld, SLURM_SUCCESS};
use crate::transfer::connection::{PersistConn, PersistFlags};

struct ExtConn {
    host: ExtHost,
    conn: PersistConn,
    registered: bool,
}

impl ExtConn {
    /// Opens the connection and registers the controller.
    async fn connect(&mut self, ctld_port: u16) -> crate::Result<()> {
        self.registered = false;
        self.conn.open().await?;
        let msg = DbdMsg::RegisterCtld(RegisterCtld {
            port: ctld_port,
            flags: 0,
        });
        let version = self.conn.version();
        let rc = match self.conn.send_recv(version, &msg).await? {
            DbdMsg::PersistRc(rc) => rc,
            reply => {
                self.conn.destroy();
                return protocol_error(format!(
                    "unexpected {:?} in reply to registration",
                    reply.msg_type()
                ));
            }
        };
        match rc.rc {
            SLURM_SUCCESS => {}
            ESLURM_ACCESS_DENIED => {
                self.conn.destroy();
                return Err(DbdError::AccessDenied(format!(
                    "{} refused the registration: {}",
                    self.host,
                    rc.comment.as_deref().unwrap_or("")
                )));
            }
            code => log::warn!(
                "Registration at external accounting daemon {} returned rc {code}",
                self.host
            ),
        }
        self.registered = true;
        log::info!("Registered at external accounting daemon {}", self.host);
        Ok(())
    }
}

struct ExtShared {
    cluster: String,
    uid: u32,
    ctld_port: u16,
    msg_timeout: Duration,
    check_interval: Duration,
    conns: tokio::sync::Mutex<Vec<ExtConn>>,
    shutdown: Arc<AtomicBool>,
    wakeup: Notify,
}

impl ExtShared {
    fn new_conn(&self, host: ExtHost) -> ExtConn {
        let mut conn = PersistConn::new(
            self.cluster.clone(),
            host.host.clone(),
            host.port,
            PersistFlags::DBD | PersistFlags::EXT_DBD,
            self.msg_timeout,
            self.shutdown.clone(),
        );
        conn.uid = self.uid;
        conn.ctld_port = self.ctld_port;
        ExtConn {
            host,
            conn,
            registered: false,
        }
    }

    /// One health pass; returns the number of remaining connections.
    async fn check_all(&self) -> usize {
        let mut conns = self.conns.lock().await;
        let mut denied = Vec::new();
        for (index, ext) in conns.iter_mut().enumerate() {
            if ext.registered && ext.conn.writeable() {
                continue;
            }
            match ext.connect(self.ctld_port).await {
                Ok(()) => {}
                Err(DbdError::AccessDenied(e)) => {
                    log::error!("Removing external accounting daemon {}: {e}", ext.host);
                    denied.push(index);
                }
                Err(e) => {
                    log::debug!("External accounting daemon {} is not available: {e}", ext.host)
                }
            }
        }
        for index in denied.into_iter().rev() {
            conns.remove(index);
        }
        conns.len()
    }
}

async fn health_loop(shared: Arc<ExtShared>) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if shared.check_all().await == 0 {
            log::debug!("No external accounting daemons left, stopping health checks");
            break;
        }
        let _ = tokio::time::timeout(shared.check_interval, shared.wakeup.notified()).await;
    }
}

pub struct ExtDbdManager {
    shared: Arc<ExtShared>,
    health: Mutex<Option<JoinHandle<()>>>,
}

impl ExtDbdManager {
    /// Creates the manager for `config.ext_hosts` and starts the health task if there are any.
    pub fn new(config: &AgentConfig, shutdown: Arc<AtomicBool>) -> Self {
        let mut shared = ExtShared {
            cluster: config.cluster_name.clone(),
            uid: config.uid,
            ctld_port: config.ctld_port,
            msg_timeout: config.msg_timeout,
            check_interval: config.ext_check_interval,
            conns: Default::default(),
            shutdown,
            wakeup: Notify::new(),
        };
        let conns: Vec<ExtConn> = config
            .ext_hosts
            .iter()
            .map(|host| shared.new_conn(host.clone()))
            .collect();
        *shared.conns.get_mut() = conns;
        let manager = ExtDbdManager {
            shared: Arc::new(shared),
            health: Mutex::new(None),
        };
        if !config.ext_hosts.is_empty() {
            manager.start_health();
        }
        manager
    }

    /// Replaces the set of external daemons.
    ///
    /// Connections to hosts present in both sets are kept, removed hosts are closed and new
    /// hosts are connected by the health task, which runs while the set is not empty.
    pub async fn reconfig(&self, hosts: &[ExtHost]) {
        let mut conns = self.shared.conns.lock().await;
        let mut kept = Vec::with_capacity(hosts.len());
        for mut ext in std::mem::take(&mut *conns) {
            if hosts.contains(&ext.host) {
                kept.push(ext);
            } else {
                log::info!("Removing external accounting daemon {}", ext.host);
                ext.conn.close().await;
            }
        }
        for host in hosts {
            if !kept.iter().any(|ext| &ext.host == host) {
                log::info!("Adding external accounting daemon {host}");
                kept.push(self.shared.new_conn(host.clone()));
            }
        }
        *conns = kept;
        let empty = conns.is_empty();
        drop(conns);

        if empty {
            self.stop_health();
        } else {
            self.start_health();
        }
    }

    fn start_health(&self) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if health.as_ref().is_some_and(|handle| !handle.is_finished()) {
            self.shared.wakeup.notify_one();
            return;
        }
        *health = Some(tokio::spawn(health_loop(self.shared.clone())));
    }

    fn stop_health(&self) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = health.take() {
            handle.abort();
        }
    }

    /// Whether the health task is running.
    pub fn is_checking(&self) -> bool {
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Runs one health pass immediately.
    pub async fn check_now(&self) {
        self.shared.check_all().await;
    }

    pub async fn hosts(&self) -> Vec<ExtHost> {
        let conns = self.shared.conns.lock().await;
        conns.iter().map(|ext| ext.host.clone()).collect()
    }

    pub async fn registered_hosts(&self) -> Vec<ExtHost> {
        let conns = self.shared.conns.lock().await;
        conns
            .iter()
            .filter(|ext| ext.registered && ext.conn.is_open())
            .map(|ext| ext.host.clone())
            .collect()
    }

    /// Sends `msg` directly to every registered external daemon and collects the replies.
    pub async fn send_all(
        &self,
        version: u16,
        msg: &DbdMsg,
    ) -> Vec<(ExtHost, crate::Result<DbdMsg>)> {
        let mut conns = self.shared.conns.lock().await;
        let mut results = Vec::new();
        for ext in conns.iter_mut().filter(|ext| ext.registered) {
            let result = ext.conn.send_recv(version, msg).await;
            if let Err(e) = &result {
                log::error!(
                    "Sending {:?} to external accounting daemon {} failed: {e}",
                    msg.msg_type(),
                    ext.host
                );
                ext.registered = false;
                self.shared.wakeup.notify_one();
            }
            results.push((ext.host.clone(), result));
        }
        results
    }

    /// Stops the health task and closes every connection.
    pub async fn stop(&self) {
        self.stop_health();
        let mut conns = self.shared.conns.lock().await;
        for ext in conns.iter_mut() {
            ext.conn.close().await;
        }
        conns.clear();
    }
}

impl Drop for ExtDbdManager {
    fn drop(&mut self) {
        self.stop_health();
    }
}
