//! Connection to the primary accounting daemon.
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::common::error::{DbdError, error, protocol_error};
use crate::config::AgentConfig;
use crate::messages::{
    ACCOUNTING_FIRST_REG, ACCOUNTING_NODES_CHANGE_DB, ACCOUNTING_TRES_CHANGE_DB, DbdMsg,
    DbdMsgType, SLURM_SUCCESS,
};
use crate::transfer::connection::{PersistConn, PersistFlags};

pub struct DbdConn {
    conn: PersistConn,
    primary_host: String,
    backup_host: Option<String>,
    accounting_enforce: bool,
}

impl DbdConn {
    /// Creates a closed connection; use [`DbdConn::open`] or [`DbdConn::check_and_reopen`].
    pub fn new(config: &AgentConfig, flags: PersistFlags, shutdown: Arc<AtomicBool>) -> Self {
        let mut conn = PersistConn::new(
            config.cluster_name.clone(),
            config.storage_host.clone(),
            config.storage_port,
            flags | PersistFlags::DBD,
            config.msg_timeout,
            shutdown,
        );
        conn.uid = config.uid;
        conn.ctld_port = config.ctld_port;
        DbdConn {
            conn,
            primary_host: config.storage_host.clone(),
            backup_host: config.storage_backup_host.clone(),
            accounting_enforce: config.accounting_enforce,
        }
    }

    /// Opens the connection, falling back once to the backup host.
    ///
    /// Failure leaves the connection closed; the agent keeps retrying later. Only the first
    /// failure of an outage is logged as an error.
    pub async fn open(&mut self) -> crate::Result<()> {
        let result = self.open_any_host().await;
        if result.is_ok() {
            self.conn.flags.remove(PersistFlags::SUPPRESS_ERR);
        } else {
            self.conn.flags.insert(PersistFlags::SUPPRESS_ERR);
        }
        result
    }

    async fn open_any_host(&mut self) -> crate::Result<()> {
        let quiet = self
            .conn
            .flags
            .intersects(PersistFlags::EXT_DBD | PersistFlags::SUPPRESS_ERR);
        let first = match self.conn.open().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if quiet {
            log::debug!("Cannot open connection to {}: {first}", self.conn.address());
        } else {
            log::error!("Cannot open connection to {}: {first}", self.conn.address());
        }
        let backup = match self.backup_host.as_ref() {
            Some(host) if !self.conn.flags.contains(PersistFlags::EXT_DBD) => host.clone(),
            _ => return Err(first),
        };
        self.conn.host = backup;
        match self.conn.open().await {
            Ok(()) => {
                log::info!("Connected to backup accounting daemon {}", self.conn.address());
                Ok(())
            }
            Err(e) => {
                if quiet {
                    log::debug!("Cannot open connection to backup {}: {e}", self.conn.address());
                } else {
                    log::error!(
                        "Cannot open connection to backup {}: {e}",
                        self.conn.address()
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn close(&mut self) {
        self.conn.close().await;
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    #[inline]
    pub fn version(&self) -> u16 {
        self.conn.version()
    }

    pub fn persist_conn(&mut self) -> &mut PersistConn {
        &mut self.conn
    }

    /// Reopens a closed connection, starting again from the primary host.
    pub async fn check_and_reopen(&mut self) -> crate::Result<()> {
        if self.conn.is_open() {
            return Ok(());
        }
        self.conn.host = self.primary_host.clone();
        self.open().await
    }

    /// Sends one request and waits for its reply, bypassing the agent queue.
    ///
    /// A non-zero return code of an `ID_RC` reply is returned as an error.
    pub async fn send_recv_direct(&mut self, version: u16, msg: &DbdMsg) -> crate::Result<DbdMsg> {
        if !self.conn.is_open() {
            self.check_and_reopen().await?;
        }
        let reply = self.conn.send_recv(version, msg).await?;
        if let DbdMsg::IdRc(id_rc) = &reply {
            if id_rc.return_code != SLURM_SUCCESS as u32 {
                return error(format!(
                    "{:?} of job {} failed with rc {}",
                    msg.msg_type(),
                    id_rc.job_id,
                    id_rc.return_code
                ));
            }
        }
        Ok(reply)
    }

    /// Sends a request answered by `PERSIST_RC` and returns its return code and comment.
    pub async fn send_recv_rc(
        &mut self,
        version: u16,
        msg: &DbdMsg,
    ) -> crate::Result<(i32, Option<String>)> {
        let reply = match self.send_recv_direct(version, msg).await? {
            DbdMsg::PersistRc(rc) => rc,
            reply => {
                return protocol_error(format!(
                    "unexpected {:?} in reply to {:?}",
                    reply.msg_type(),
                    msg.msg_type()
                ));
            }
        };
        check_rc(
            msg.msg_type(),
            reply.rc,
            reply.comment.as_deref(),
            self.accounting_enforce,
        )?;
        Ok((reply.rc, reply.comment))
    }
}

/// Logs unexpected return codes; fails when the controller registration is refused under
/// enforcement.
pub(crate) fn check_rc(
    msg_type: DbdMsgType,
    rc: i32,
    comment: Option<&str>,
    accounting_enforce: bool,
) -> crate::Result<()> {
    if matches!(
        rc,
        SLURM_SUCCESS
            | ACCOUNTING_FIRST_REG
            | ACCOUNTING_TRES_CHANGE_DB
            | ACCOUNTING_NODES_CHANGE_DB
    ) {
        return Ok(());
    }
    let comment = comment.unwrap_or("no error message");
    if msg_type == DbdMsgType::RegisterCtld && accounting_enforce {
        log::error!("Registration of the controller failed (rc {rc}): {comment}");
        return Err(DbdError::Fatal(format!(
            "controller registration refused with rc {rc} while accounting is enforced: {comment}"
        )));
    }
    log::warn!("{msg_type:?} returned rc {rc}: {comment}");
    Ok(())
}
