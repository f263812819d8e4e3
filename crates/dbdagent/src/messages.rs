//! Messages exchanged with the accounting daemon.
//!
//! Every frame starts with a `u16` message type followed by a payload packed in the
//! protocol version negotiated on the connection.
use bytes::Bytes;
use jobres::pack::{Packer, UnpackError, UnpackResult, Unpacker};
use jobres::protocol::{PROTOCOL_VERSION, format_version, is_supported_version};
use serde::{Serialize, Serializer};

use crate::common::error::protocol_error;

pub const SLURM_SUCCESS: i32 = 0;
pub const SLURM_ERROR: i32 = -1;
pub const ESLURM_ACCESS_DENIED: i32 = 2010;
pub const ESLURM_DB_CONNECTION: i32 = 7000;
pub const ACCOUNTING_FIRST_REG: i32 = 10000;
pub const ACCOUNTING_TRES_CHANGE_DB: i32 = 10001;
pub const ACCOUNTING_NODES_CHANGE_DB: i32 = 10002;

/// Connection type announced in [`PersistInit`].
pub const PERSIST_TYPE_DBD: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DbdMsgType {
    PersistInit,
    PersistRc,
    Fini,
    ClusterTres,
    JobComplete,
    JobStart,
    JobSuspend,
    NodeState,
    RegisterCtld,
    StepComplete,
    StepStart,
    IdRc,
    SendMultMsg,
    GotMultMsg,
}

impl DbdMsgType {
    pub fn code(self) -> u16 {
        match self {
            DbdMsgType::Fini => 1401,
            DbdMsgType::ClusterTres => 1407,
            DbdMsgType::IdRc => 1421,
            DbdMsgType::JobComplete => 1424,
            DbdMsgType::JobStart => 1425,
            DbdMsgType::JobSuspend => 1427,
            DbdMsgType::NodeState => 1432,
            DbdMsgType::PersistRc => 1433,
            DbdMsgType::RegisterCtld => 1434,
            DbdMsgType::StepComplete => 1441,
            DbdMsgType::StepStart => 1442,
            DbdMsgType::SendMultMsg => 1474,
            DbdMsgType::GotMultMsg => 1475,
            DbdMsgType::PersistInit => 6500,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1401 => DbdMsgType::Fini,
            1407 => DbdMsgType::ClusterTres,
            1421 => DbdMsgType::IdRc,
            1424 => DbdMsgType::JobComplete,
            1425 => DbdMsgType::JobStart,
            1427 => DbdMsgType::JobSuspend,
            1432 => DbdMsgType::NodeState,
            1433 => DbdMsgType::PersistRc,
            1434 => DbdMsgType::RegisterCtld,
            1441 => DbdMsgType::StepComplete,
            1442 => DbdMsgType::StepStart,
            1474 => DbdMsgType::SendMultMsg,
            1475 => DbdMsgType::GotMultMsg,
            6500 => DbdMsgType::PersistInit,
            _ => return None,
        })
    }

    /// Type of an already packed frame.
    pub fn of_frame(frame: &[u8]) -> Option<Self> {
        match frame {
            [hi, lo, ..] => Self::from_code(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}

trait Record: Sized {
    fn pack(&self, packer: &mut Packer, version: u16);
    fn unpack(unpacker: &mut Unpacker, version: u16) -> UnpackResult<Self>;
}

fn pack_time(packer: &mut Packer, time: i64) {
    packer.pack64(time as u64);
}

fn unpack_time(unpacker: &mut Unpacker) -> UnpackResult<i64> {
    Ok(unpacker.unpack64()? as i64)
}

/// Opening message of a persistent connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistInit {
    pub version: u16,
    pub cluster: Option<String>,
    pub uid: u32,
    pub persist_type: u16,
    pub flags: u16,
    pub port: u16,
}

impl Record for PersistInit {
    fn pack(&self, packer: &mut Packer, _version: u16) {
        packer.pack16(self.version);
        packer.pack_str(self.cluster.as_deref());
        packer.pack32(self.uid);
        packer.pack16(self.persist_type);
        packer.pack16(self.flags);
        packer.pack16(self.port);
    }

    fn unpack(unpacker: &mut Unpacker, _version: u16) -> UnpackResult<Self> {
        Ok(Self {
            version: unpacker.unpack16()?,
            cluster: unpacker.unpack_str()?,
            uid: unpacker.unpack32()?,
            persist_type: unpacker.unpack16()?,
            flags: unpacker.unpack16()?,
            port: unpacker.unpack16()?,
        })
    }
}

/// Generic return code. As a reply to [`PersistInit`], `ret_info` holds the negotiated version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistRc {
    pub rc: i32,
    pub ret_info: u16,
    pub flags: u16,
    pub comment: Option<String>,
}

impl PersistRc {
    pub fn new(rc: i32) -> Self {
        Self {
            rc,
            ..Default::default()
        }
    }
}

impl Record for PersistRc {
    fn pack(&self, packer: &mut Packer, _version: u16) {
        packer.pack_str(self.comment.as_deref());
        packer.pack16(self.flags);
        packer.pack_i32(self.rc);
        packer.pack16(self.ret_info);
    }

    fn unpack(unpacker: &mut Unpacker, _version: u16) -> UnpackResult<Self> {
        let comment = unpacker.unpack_str()?;
        let flags = unpacker.unpack16()?;
        let rc = unpacker.unpack_i32()?;
        let ret_info = unpacker.unpack16()?;
        Ok(Self {
            rc,
            ret_info,
            flags,
            comment,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Fini {
    pub commit: bool,
    pub close_conn: bool,
}

impl Record for Fini {
    fn pack(&self, packer: &mut Packer, _version: u16) {
        packer.pack16(self.close_conn as u16);
        packer.pack16(self.commit as u16);
    }

    fn unpack(unpacker: &mut Unpacker, _version: u16) -> UnpackResult<Self> {
        let close_conn = unpacker.unpack16()? != 0;
        let commit = unpacker.unpack16()? != 0;
        Ok(Self { commit, close_conn })
    }
}

/// Registration of the controller, answered with [`PersistRc`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegisterCtld {
    pub port: u16,
    pub flags: u16,
}

impl Record for RegisterCtld {
    fn pack(&self, packer: &mut Packer, _version: u16) {
        packer.pack16(self.port);
        packer.pack16(self.flags);
    }

    fn unpack(unpacker: &mut Unpacker, _version: u16) -> UnpackResult<Self> {
        Ok(Self {
            port: unpacker.unpack16()?,
            flags: unpacker.unpack16()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStart {
    pub job_id: u32,
    pub db_index: u64,
    pub array_job_id: u32,
    pub array_task_id: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub name: Option<String>,
    pub partition: Option<String>,
    pub nodes: Option<String>,
    pub node_inx: Option<String>,
    pub alloc_nodes: u32,
    pub req_cpus: u32,
    pub job_state: u32,
    pub submit_time: i64,
    pub eligible_time: i64,
    pub start_time: i64,
    /// Only transmitted by the current protocol version
    pub container: Option<String>,
}

impl Record for JobStart {
    fn pack(&self, packer: &mut Packer, version: u16) {
        packer.pack32(self.job_id);
        packer.pack64(self.db_index);
        packer.pack32(self.array_job_id);
        packer.pack32(self.array_task_id);
        packer.pack32(self.user_id);
        packer.pack32(self.group_id);
        packer.pack_str(self.name.as_deref());
        packer.pack_str(self.partition.as_deref());
        packer.pack_str(self.nodes.as_deref());
        packer.pack_str(self.node_inx.as_deref());
        packer.pack32(self.alloc_nodes);
        packer.pack32(self.req_cpus);
        packer.pack32(self.job_state);
        pack_time(packer, self.submit_time);
        pack_time(packer, self.eligible_time);
        pack_time(packer, self.start_time);
        if version >= PROTOCOL_VERSION {
            packer.pack_str(self.container.as_deref());
        }
    }

    fn unpack(unpacker: &mut Unpacker, version: u16) -> UnpackResult<Self> {
        Ok(Self {
            job_id: unpacker.unpack32()?,
            db_index: unpacker.unpack64()?,
            array_job_id: unpacker.unpack32()?,
            array_task_id: unpacker.unpack32()?,
            user_id: unpacker.unpack32()?,
            group_id: unpacker.unpack32()?,
            name: unpacker.unpack_str()?,
            partition: unpacker.unpack_str()?,
            nodes: unpacker.unpack_str()?,
            node_inx: unpacker.unpack_str()?,
            alloc_nodes: unpacker.unpack32()?,
            req_cpus: unpacker.unpack32()?,
            job_state: unpacker.unpack32()?,
            submit_time: unpack_time(unpacker)?,
            eligible_time: unpack_time(unpacker)?,
            start_time: unpack_time(unpacker)?,
            container: if version >= PROTOCOL_VERSION {
                unpacker.unpack_str()?
            } else {
                None
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobComplete {
    pub job_id: u32,
    pub db_index: u64,
    pub job_state: u32,
    pub exit_code: u32,
    pub derived_ec: u32,
    pub nodes: Option<String>,
    pub comment: Option<String>,
    pub submit_time: i64,
    pub start_time: i64,
    pub end_time: i64,
}

impl Record for JobComplete {
    fn pack(&self, packer: &mut Packer, _version: u16) {
        packer.pack32(self.job_id);
        packer.pack64(self.db_index);
        packer.pack32(self.job_state);
        packer.pack32(self.exit_code);
        packer.pack32(self.derived_ec);
        packer.pack_str(self.nodes.as_deref());
        packer.pack_str(self.comment.as_deref());
        pack_time(packer, self.submit_time);
        pack_time(packer, self.start_time);
        pack_time(packer, self.end_time);
    }

    fn unpack(unpacker: &mut Unpacker, _version: u16) -> UnpackResult<Self> {
        Ok(Self {
            job_id: unpacker.unpack32()?,
            db_index: unpacker.unpack64()?,
            job_state: unpacker.unpack32()?,
            exit_code: unpacker.unpack32()?,
            derived_ec: unpacker.unpack32()?,
            nodes: unpacker.unpack_str()?,
            comment: unpacker.unpack_str()?,
            submit_time: unpack_time(unpacker)?,
            start_time: unpack_time(unpacker)?,
            end_time: unpack_time(unpacker)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSuspend {
    pub job_id: u32,
    pub db_index: u64,
    pub job_state: u32,
    pub submit_time: i64,
    pub suspend_time: i64,
}

impl Record for JobSuspend {
    fn pack(&self, packer: &mut Packer, _version: u16) {
        packer.pack32(self.job_id);
        packer.pack64(self.db_index);
        packer.pack32(self.job_state);
        pack_time(packer, self.submit_time);
        pack_time(packer, self.suspend_time);
    }

    fn unpack(unpacker: &mut Unpacker, _version: u16) -> UnpackResult<Self> {
        Ok(Self {
            job_id: unpacker.unpack32()?,
            db_index: unpacker.unpack64()?,
            job_state: unpacker.unpack32()?,
            submit_time: unpack_time(unpacker)?,
            suspend_time: unpack_time(unpacker)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepStart {
    pub job_id: u32,
    pub db_index: u64,
    pub step_id: u32,
    pub name: Option<String>,
    pub nodes: Option<String>,
    pub node_inx: Option<String>,
    pub node_cnt: u32,
    pub total_tasks: u32,
    pub start_time: i64,
    /// Only transmitted by the current protocol version
    pub submit_line: Option<String>,
}

impl Record for StepStart {
    fn pack(&self, packer: &mut Packer, version: u16) {
        packer.pack32(self.job_id);
        packer.pack64(self.db_index);
        packer.pack32(self.step_id);
        packer.pack_str(self.name.as_deref());
        packer.pack_str(self.nodes.as_deref());
        packer.pack_str(self.node_inx.as_deref());
        packer.pack32(self.node_cnt);
        packer.pack32(self.total_tasks);
        pack_time(packer, self.start_time);
        if version >= PROTOCOL_VERSION {
            packer.pack_str(self.submit_line.as_deref());
        }
    }

    fn unpack(unpacker: &mut Unpacker, version: u16) -> UnpackResult<Self> {
        Ok(Self {
            job_id: unpacker.unpack32()?,
            db_index: unpacker.unpack64()?,
            step_id: unpacker.unpack32()?,
            name: unpacker.unpack_str()?,
            nodes: unpacker.unpack_str()?,
            node_inx: unpacker.unpack_str()?,
            node_cnt: unpacker.unpack32()?,
            total_tasks: unpacker.unpack32()?,
            start_time: unpack_time(unpacker)?,
            submit_line: if version >= PROTOCOL_VERSION {
                unpacker.unpack_str()?
            } else {
                None
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepComplete {
    pub job_id: u32,
    pub db_index: u64,
    pub step_id: u32,
    pub exit_code: u32,
    pub total_tasks: u32,
    pub end_time: i64,
}

impl Record for StepComplete {
    fn pack(&self, packer: &mut Packer, _version: u16) {
        packer.pack32(self.job_id);
        packer.pack64(self.db_index);
        packer.pack32(self.step_id);
        packer.pack32(self.exit_code);
        packer.pack32(self.total_tasks);
        pack_time(packer, self.end_time);
    }

    fn unpack(unpacker: &mut Unpacker, _version: u16) -> UnpackResult<Self> {
        Ok(Self {
            job_id: unpacker.unpack32()?,
            db_index: unpacker.unpack64()?,
            step_id: unpacker.unpack32()?,
            exit_code: unpacker.unpack32()?,
            total_tasks: unpacker.unpack32()?,
            end_time: unpack_time(unpacker)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeState {
    pub hostlist: Option<String>,
    pub reason: Option<String>,
    pub reason_uid: u32,
    pub state: u32,
    /// Node is going up (`true`) or down
    pub up: bool,
    pub event_time: i64,
    pub tres: Option<String>,
}

impl Record for NodeState {
    fn pack(&self, packer: &mut Packer, _version: u16) {
        packer.pack_str(self.hostlist.as_deref());
        packer.pack_str(self.reason.as_deref());
        packer.pack32(self.reason_uid);
        packer.pack32(self.state);
        packer.pack16(self.up as u16);
        pack_time(packer, self.event_time);
        packer.pack_str(self.tres.as_deref());
    }

    fn unpack(unpacker: &mut Unpacker, _version: u16) -> UnpackResult<Self> {
        Ok(Self {
            hostlist: unpacker.unpack_str()?,
            reason: unpacker.unpack_str()?,
            reason_uid: unpacker.unpack32()?,
            state: unpacker.unpack32()?,
            up: unpacker.unpack16()? != 0,
            event_time: unpack_time(unpacker)?,
            tres: unpacker.unpack_str()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterTres {
    pub cluster_nodes: Option<String>,
    pub tres: Option<String>,
    pub event_time: i64,
}

impl Record for ClusterTres {
    fn pack(&self, packer: &mut Packer, _version: u16) {
        packer.pack_str(self.cluster_nodes.as_deref());
        packer.pack_str(self.tres.as_deref());
        pack_time(packer, self.event_time);
    }

    fn unpack(unpacker: &mut Unpacker, _version: u16) -> UnpackResult<Self> {
        Ok(Self {
            cluster_nodes: unpacker.unpack_str()?,
            tres: unpacker.unpack_str()?,
            event_time: unpack_time(unpacker)?,
        })
    }
}

/// Reply to [`JobStart`] carrying the database index of the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdRc {
    pub job_id: u32,
    pub db_index: u64,
    pub return_code: u32,
}

impl Record for IdRc {
    fn pack(&self, packer: &mut Packer, _version: u16) {
        packer.pack32(self.job_id);
        packer.pack64(self.db_index);
        packer.pack32(self.return_code);
    }

    fn unpack(unpacker: &mut Unpacker, _version: u16) -> UnpackResult<Self> {
        Ok(Self {
            job_id: unpacker.unpack32()?,
            db_index: unpacker.unpack64()?,
            return_code: unpacker.unpack32()?,
        })
    }
}

fn serialize_frame_sizes<S: Serializer>(
    frames: &[Bytes],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(frames.iter().map(|frame| frame.len()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum DbdMsg {
    PersistInit(PersistInit),
    PersistRc(PersistRc),
    Fini(Fini),
    RegisterCtld(RegisterCtld),
    JobStart(JobStart),
    JobComplete(JobComplete),
    JobSuspend(JobSuspend),
    StepStart(StepStart),
    StepComplete(StepComplete),
    NodeState(NodeState),
    ClusterTres(ClusterTres),
    IdRc(IdRc),
    /// Batch of already packed frames
    SendMultMsg(#[serde(serialize_with = "serialize_frame_sizes")] Vec<Bytes>),
    /// One reply per frame of the acknowledged batch prefix
    GotMultMsg(Vec<DbdMsg>),
}

fn check_version(version: u16) -> crate::Result<()> {
    if !is_supported_version(version) {
        return protocol_error(format!(
            "unsupported protocol version {}",
            format_version(version)
        ));
    }
    Ok(())
}

impl DbdMsg {
    pub fn msg_type(&self) -> DbdMsgType {
        match self {
            DbdMsg::PersistInit(_) => DbdMsgType::PersistInit,
            DbdMsg::PersistRc(_) => DbdMsgType::PersistRc,
            DbdMsg::Fini(_) => DbdMsgType::Fini,
            DbdMsg::RegisterCtld(_) => DbdMsgType::RegisterCtld,
            DbdMsg::JobStart(_) => DbdMsgType::JobStart,
            DbdMsg::JobComplete(_) => DbdMsgType::JobComplete,
            DbdMsg::JobSuspend(_) => DbdMsgType::JobSuspend,
            DbdMsg::StepStart(_) => DbdMsgType::StepStart,
            DbdMsg::StepComplete(_) => DbdMsgType::StepComplete,
            DbdMsg::NodeState(_) => DbdMsgType::NodeState,
            DbdMsg::ClusterTres(_) => DbdMsgType::ClusterTres,
            DbdMsg::IdRc(_) => DbdMsgType::IdRc,
            DbdMsg::SendMultMsg(_) => DbdMsgType::SendMultMsg,
            DbdMsg::GotMultMsg(_) => DbdMsgType::GotMultMsg,
        }
    }

    /// Job the message refers to, if any.
    pub fn job_id(&self) -> Option<u32> {
        match self {
            DbdMsg::JobStart(msg) => Some(msg.job_id),
            DbdMsg::JobComplete(msg) => Some(msg.job_id),
            DbdMsg::JobSuspend(msg) => Some(msg.job_id),
            DbdMsg::StepStart(msg) => Some(msg.job_id),
            DbdMsg::StepComplete(msg) => Some(msg.job_id),
            DbdMsg::IdRc(msg) => Some(msg.job_id),
            _ => None,
        }
    }

    pub fn pack(&self, version: u16) -> crate::Result<Bytes> {
        check_version(version)?;
        let mut packer = Packer::new();
        packer.pack16(self.msg_type().code());
        match self {
            DbdMsg::PersistInit(msg) => msg.pack(&mut packer, version),
            DbdMsg::PersistRc(msg) => msg.pack(&mut packer, version),
            DbdMsg::Fini(msg) => msg.pack(&mut packer, version),
            DbdMsg::RegisterCtld(msg) => msg.pack(&mut packer, version),
            DbdMsg::JobStart(msg) => msg.pack(&mut packer, version),
            DbdMsg::JobComplete(msg) => msg.pack(&mut packer, version),
            DbdMsg::JobSuspend(msg) => msg.pack(&mut packer, version),
            DbdMsg::StepStart(msg) => msg.pack(&mut packer, version),
            DbdMsg::StepComplete(msg) => msg.pack(&mut packer, version),
            DbdMsg::NodeState(msg) => msg.pack(&mut packer, version),
            DbdMsg::ClusterTres(msg) => msg.pack(&mut packer, version),
            DbdMsg::IdRc(msg) => msg.pack(&mut packer, version),
            DbdMsg::SendMultMsg(frames) => {
                packer.pack32(frames.len() as u32);
                for frame in frames {
                    packer.pack_bytes(frame);
                }
            }
            DbdMsg::GotMultMsg(replies) => {
                packer.pack32(replies.len() as u32);
                for reply in replies {
                    packer.pack_bytes(&reply.pack(version)?);
                }
            }
        }
        Ok(packer.freeze())
    }

    pub fn unpack(frame: &[u8], version: u16) -> crate::Result<DbdMsg> {
        check_version(version)?;
        let mut unpacker = Unpacker::new(frame);
        let code = unpacker.unpack16()?;
        let Some(msg_type) = DbdMsgType::from_code(code) else {
            return protocol_error(format!("unknown message type {code}"));
        };
        let u = &mut unpacker;
        let msg = match msg_type {
            DbdMsgType::PersistInit => DbdMsg::PersistInit(PersistInit::unpack(u, version)?),
            DbdMsgType::PersistRc => DbdMsg::PersistRc(PersistRc::unpack(u, version)?),
            DbdMsgType::Fini => DbdMsg::Fini(Fini::unpack(u, version)?),
            DbdMsgType::RegisterCtld => DbdMsg::RegisterCtld(RegisterCtld::unpack(u, version)?),
            DbdMsgType::JobStart => DbdMsg::JobStart(JobStart::unpack(u, version)?),
            DbdMsgType::JobComplete => DbdMsg::JobComplete(JobComplete::unpack(u, version)?),
            DbdMsgType::JobSuspend => DbdMsg::JobSuspend(JobSuspend::unpack(u, version)?),
            DbdMsgType::StepStart => DbdMsg::StepStart(StepStart::unpack(u, version)?),
            DbdMsgType::StepComplete => DbdMsg::StepComplete(StepComplete::unpack(u, version)?),
            DbdMsgType::NodeState => DbdMsg::NodeState(NodeState::unpack(u, version)?),
            DbdMsgType::ClusterTres => DbdMsg::ClusterTres(ClusterTres::unpack(u, version)?),
            DbdMsgType::IdRc => DbdMsg::IdRc(IdRc::unpack(u, version)?),
            DbdMsgType::SendMultMsg => {
                let count = unpack_list_count(u)?;
                let mut frames = Vec::with_capacity(count);
                for _ in 0..count {
                    frames.push(u.unpack_bytes()?);
                }
                DbdMsg::SendMultMsg(frames)
            }
            DbdMsgType::GotMultMsg => {
                let count = unpack_list_count(u)?;
                let mut replies = Vec::with_capacity(count);
                for _ in 0..count {
                    let inner = u.unpack_bytes()?;
                    replies.push(DbdMsg::unpack(&inner, version)?);
                }
                DbdMsg::GotMultMsg(replies)
            }
        };
        if !unpacker.is_empty() {
            return protocol_error(format!(
                "{} trailing bytes after {msg_type:?}",
                unpacker.remaining()
            ));
        }
        Ok(msg)
    }

    /// Converts a packed frame between protocol versions.
    pub fn repack(frame: &[u8], from: u16, to: u16) -> crate::Result<Bytes> {
        if from == to {
            return Ok(Bytes::copy_from_slice(frame));
        }
        DbdMsg::unpack(frame, from)?.pack(to)
    }
}

/// Element count of a frame list; every element takes at least its 4 byte length.
fn unpack_list_count(unpacker: &mut Unpacker) -> UnpackResult<usize> {
    let count = unpacker.unpack32()? as usize;
    if count.saturating_mul(4) > unpacker.remaining() {
        return Err(UnpackError::Truncated("frame list"));
    }
    Ok(count)
}
