//! Framed, version negotiated connection to an accounting daemon.
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use jobres::protocol::{PROTOCOL_VERSION, format_version, is_supported_version};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::common::error::{DbdError, connection_error, protocol_error};
use crate::messages::{
    DbdMsg, ESLURM_ACCESS_DENIED, Fini, PERSIST_TYPE_DBD, PersistInit, SLURM_SUCCESS,
};
use crate::transfer::protocol::make_protocol_builder;

type Codec = Framed<TcpStream, LengthDelimitedCodec>;

/// Lower bound of the per RPC timeout, accounting queries may be slow.
pub const MIN_DBD_TIMEOUT: Duration = Duration::from_secs(900);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PersistFlags: u16 {
        const DBD = 0x0001;
        /// Connection to an external daemon; never falls back to a backup host
        const EXT_DBD = 0x0002;
        /// Do not log connection failures as errors
        const SUPPRESS_ERR = 0x0004;
    }
}

pub struct PersistConn {
    framed: Option<Codec>,
    pub cluster: String,
    pub host: String,
    pub port: u16,
    pub flags: PersistFlags,
    pub uid: u32,
    /// Listening port of the controller, announced during the handshake
    pub ctld_port: u16,
    version: u16,
    connect_timeout: Duration,
    timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl PersistConn {
    pub fn new(
        cluster: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        flags: PersistFlags,
        msg_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        PersistConn {
            framed: None,
            cluster: cluster.into(),
            host: host.into(),
            port,
            flags,
            uid: 0,
            ctld_port: 0,
            version: PROTOCOL_VERSION,
            connect_timeout: msg_timeout,
            timeout: msg_timeout.max(MIN_DBD_TIMEOUT),
            shutdown,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.framed.is_some()
    }

    /// Protocol version negotiated by the last successful handshake.
    #[inline]
    pub fn version(&self) -> u16 {
        self.version
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connects and performs the init handshake. A previous connection is dropped.
    pub async fn open(&mut self) -> crate::Result<()> {
        self.framed = None;
        let address = self.address();
        let stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return connection_error(format!("connect to {address}: {e}")),
                Err(_) => return connection_error(format!("connect to {address} timed out")),
            };
        stream.set_nodelay(true)?;
        let mut framed = make_protocol_builder().new_framed(stream);

        let init = DbdMsg::PersistInit(PersistInit {
            version: PROTOCOL_VERSION,
            cluster: Some(self.cluster.clone()),
            uid: self.uid,
            persist_type: PERSIST_TYPE_DBD,
            flags: self.flags.bits(),
            port: self.ctld_port,
        });
        write_frame(&mut framed, init.pack(PROTOCOL_VERSION)?, self.connect_timeout).await?;
        let reply = read_frame(&mut framed, self.connect_timeout).await?;
        let rc = match DbdMsg::unpack(&reply, PROTOCOL_VERSION)? {
            DbdMsg::PersistRc(rc) => rc,
            msg => {
                return protocol_error(format!(
                    "unexpected {:?} in reply to the init handshake",
                    msg.msg_type()
                ));
            }
        };
        match rc.rc {
            SLURM_SUCCESS => {}
            ESLURM_ACCESS_DENIED => {
                return Err(DbdError::AccessDenied(format!(
                    "{address} refused the connection: {}",
                    rc.comment.as_deref().unwrap_or("")
                )));
            }
            code => {
                return connection_error(format!(
                    "{address} refused the connection (rc {code}): {}",
                    rc.comment.as_deref().unwrap_or("")
                ));
            }
        }
        if !is_supported_version(rc.ret_info) {
            return protocol_error(format!(
                "{address} negotiated unsupported version {}",
                format_version(rc.ret_info)
            ));
        }
        self.version = rc.ret_info;
        self.framed = Some(framed);
        log::debug!(
            "Persistent connection to {address} opened, protocol version {}",
            format_version(self.version)
        );
        Ok(())
    }

    pub async fn send(&mut self, frame: Bytes) -> crate::Result<()> {
        let Some(framed) = self.framed.as_mut() else {
            return connection_error(format!("not connected to {}", self.address()));
        };
        let result = write_frame(framed, frame, self.timeout).await;
        if result.is_err() {
            self.framed = None;
        }
        result
    }

    pub async fn recv(&mut self) -> crate::Result<Bytes> {
        let Some(framed) = self.framed.as_mut() else {
            return connection_error(format!("not connected to {}", self.address()));
        };
        let result = read_frame(framed, self.timeout).await;
        if result.is_err() {
            self.framed = None;
        }
        result
    }

    /// Sends one message packed in `version` (capped by the negotiated version) and decodes
    /// the reply.
    pub async fn send_recv(&mut self, version: u16, msg: &DbdMsg) -> crate::Result<DbdMsg> {
        let version = version.min(self.version);
        self.send(msg.pack(version)?).await?;
        let reply = self.recv().await?;
        DbdMsg::unpack(&reply, version)
    }

    /// Whether the socket can be written and the peer has not closed it.
    ///
    /// The connection is idle when this is called, so pending input means EOF or garbage.
    pub fn writeable(&self) -> bool {
        let Some(framed) = self.framed.as_ref() else {
            return false;
        };
        let stream = framed.get_ref();
        let mut fds = [PollFd::new(
            stream.as_fd(),
            PollFlags::POLLIN | PollFlags::POLLOUT,
        )];
        if let Err(e) = poll(&mut fds, PollTimeout::ZERO) {
            log::debug!("poll of {} failed: {e}", self.address());
            return false;
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(
            PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL | PollFlags::POLLIN,
        ) {
            log::debug!(
                "Connection to {} is not writeable ({revents:?})",
                self.address()
            );
            return false;
        }
        revents.contains(PollFlags::POLLOUT)
    }

    /// Sends `FINI` unless the controller is shutting down or the socket is dead, then drops
    /// the connection.
    pub async fn close(&mut self) {
        if self.framed.is_none() {
            return;
        }
        if !self.shutdown.load(Ordering::SeqCst) && self.writeable() {
            let fini = DbdMsg::Fini(Fini {
                commit: false,
                close_conn: true,
            });
            match fini.pack(self.version) {
                Ok(frame) => {
                    if let Err(e) = self.send(frame).await {
                        log::debug!("Sending FINI to {} failed: {e}", self.address());
                    }
                }
                Err(e) => log::error!("Cannot pack FINI: {e}"),
            }
        }
        self.destroy();
    }

    /// Drops the connection without notifying the peer.
    pub fn destroy(&mut self) {
        self.framed = None;
    }
}

async fn write_frame(framed: &mut Codec, frame: Bytes, timeout: Duration) -> crate::Result<()> {
    match tokio::time::timeout(timeout, framed.send(frame)).await {
        Ok(result) => Ok(result?),
        Err(_) => connection_error("timed out while sending a message"),
    }
}

async fn read_frame(framed: &mut Codec, timeout: Duration) -> crate::Result<Bytes> {
    match tokio::time::timeout(timeout, framed.next()).await {
        Ok(Some(Ok(data))) => Ok(data.freeze()),
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(None) => connection_error("connection closed by peer"),
        Err(_) => connection_error("timed out while waiting for a reply"),
    }
}
