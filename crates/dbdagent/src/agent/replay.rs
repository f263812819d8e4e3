//! On-disk copy of the pending queue, written on shutdown and loaded on startup.
//!
//! Every record is `u32 size | payload | u32 magic` (big-endian). The first record is the
//! ASCII header `VER<N>`, where `N` is the protocol version the frames were packed with.
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use jobres::protocol::format_version;

use crate::common::error::error;
use crate::messages::{DbdMsg, DbdMsgType};

pub const REPLAY_MAGIC: u32 = 0xDEAD_3219;

const HEADER_PREFIX: &str = "VER";

/// Writes a replay file, replacing any previous content.
pub struct ReplayWriter {
    file: BufWriter<File>,
    records: usize,
}

impl ReplayWriter {
    pub fn create(path: &Path, version: u16) -> crate::Result<Self> {
        let raw_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = ReplayWriter {
            file: BufWriter::new(raw_file),
            records: 0,
        };
        writer.write_record(format!("{HEADER_PREFIX}{version}").as_bytes())?;
        Ok(writer)
    }

    fn write_record(&mut self, payload: &[u8]) -> crate::Result<()> {
        self.file.write_all(&(payload.len() as u32).to_be_bytes())?;
        self.file.write_all(payload)?;
        self.file.write_all(&REPLAY_MAGIC.to_be_bytes())?;
        Ok(())
    }

    /// Appends a frame; controller registrations are skipped. Returns whether it was written.
    pub fn store(&mut self, frame: &[u8]) -> crate::Result<bool> {
        if DbdMsgType::of_frame(frame) == Some(DbdMsgType::RegisterCtld) {
            return Ok(false);
        }
        self.write_record(frame)?;
        self.records += 1;
        Ok(true)
    }

    /// Flushes and syncs the file; returns the number of stored frames.
    pub fn finish(mut self) -> crate::Result<usize> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(self.records)
    }
}

/// Saves `frames` packed in `version` to `path`.
pub fn save<'a>(
    path: &Path,
    version: u16,
    frames: impl IntoIterator<Item = &'a Bytes>,
) -> crate::Result<usize> {
    let mut writer = ReplayWriter::create(path, version)?;
    for frame in frames {
        writer.store(frame)?;
    }
    writer.finish()
}

/// Iterates over the frames of a replay file.
pub struct ReplayReader {
    file: BufReader<File>,
    version: u16,
    finished: bool,
}

impl ReplayReader {
    pub fn open(path: &Path) -> crate::Result<Self> {
        let mut reader = ReplayReader {
            file: BufReader::new(File::open(path)?),
            version: 0,
            finished: false,
        };
        let Some(header) = reader.read_record()? else {
            return error(format!("Replay file {} is empty", path.display()));
        };
        let version = std::str::from_utf8(&header)
            .ok()
            .and_then(|header| header.strip_prefix(HEADER_PREFIX))
            .and_then(|version| version.parse::<u16>().ok());
        match version {
            Some(version) => reader.version = version,
            None => {
                return error(format!(
                    "Replay file {} has an invalid header",
                    path.display()
                ));
            }
        }
        Ok(reader)
    }

    /// Protocol version the frames were packed with.
    pub fn version(&self) -> u16 {
        self.version
    }

    fn read_record(&mut self) -> crate::Result<Option<Bytes>> {
        let mut size = [0u8; 4];
        match self.file.read_exact(&mut size) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let size = u32::from_be_bytes(size) as usize;
        if size > crate::MAX_FRAME_SIZE {
            return error(format!("Replay record of {size} bytes is too large"));
        }
        let mut payload = vec![0u8; size];
        self.file.read_exact(&mut payload)?;
        let mut magic = [0u8; 4];
        self.file.read_exact(&mut magic)?;
        let magic = u32::from_be_bytes(magic);
        if magic != REPLAY_MAGIC {
            return error(format!("Bad replay record magic {magic:#x}"));
        }
        Ok(Some(payload.into()))
    }
}

impl Iterator for ReplayReader {
    type Item = crate::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Loads the frames saved in `path`, converted to `version`.
///
/// A missing file yields no frames. Reading stops at the first damaged record and frames that
/// cannot be converted are dropped; both are logged.
pub fn load(path: &Path, version: u16) -> crate::Result<Vec<Bytes>> {
    let reader = match ReplayReader::open(path) {
        Ok(reader) => reader,
        Err(crate::DbdError::Io(e)) if e.kind() == ErrorKind::NotFound => {
            log::debug!("No replay file at {}", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };
    let file_version = reader.version();
    if file_version != version {
        log::info!(
            "Converting saved accounting messages from protocol version {} to {}",
            format_version(file_version),
            format_version(version)
        );
    }
    let mut frames = Vec::new();
    for frame in read_intact(reader, path) {
        match DbdMsg::repack(&frame, file_version, version) {
            Ok(frame) => frames.push(frame),
            Err(e) => log::error!("Dropping saved accounting message: {e}"),
        }
    }
    log::info!(
        "Recovered {} pending accounting messages from {}",
        frames.len(),
        path.display()
    );
    Ok(frames)
}

/// Reads frames until the end of the file or the first damaged record, which is logged.
fn read_intact(reader: ReplayReader, path: &Path) -> Vec<Bytes> {
    let mut frames = Vec::new();
    for record in reader {
        match record {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                log::error!(
                    "Replay file {} is damaged after {} records: {e}",
                    path.display(),
                    frames.len()
                );
                break;
            }
        }
    }
    frames
}

/// Outcome of [`upgrade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeSummary {
    pub from_version: u16,
    pub stored: usize,
    /// Registrations and frames that could not be converted
    pub dropped: usize,
}

/// Rewrites the replay file `input` into `output` packed in `version`.
///
/// `input` is read completely before `output` is created, so both may be the same file.
pub fn upgrade(input: &Path, output: &Path, version: u16) -> crate::Result<UpgradeSummary> {
    let reader = ReplayReader::open(input)?;
    let from_version = reader.version();
    let frames = read_intact(reader, input);

    let mut writer = ReplayWriter::create(output, version)?;
    let mut dropped = 0;
    for frame in &frames {
        match DbdMsg::repack(frame, from_version, version) {
            Ok(frame) => {
                if !writer.store(&frame)? {
                    dropped += 1;
                }
            }
            Err(e) => {
                log::warn!("Dropping message that cannot be converted: {e}");
                dropped += 1;
            }
        }
    }
    let stored = writer.finish()?;
    log::debug!(
        "Upgraded {} from {} to {}",
        input.display(),
        format_version(from_version),
        format_version(version)
    );
    Ok(UpgradeSummary {
        from_version,
        stored,
        dropped,
    })
}

/// A decoded record of a replay file.
pub struct ReplayEntry {
    pub index: usize,
    pub size: usize,
    pub msg: crate::Result<DbdMsg>,
}

impl ReplayEntry {
    /// Time of the event recorded by the message.
    pub fn event_time(&self) -> Option<i64> {
        let time = match self.msg.as_ref().ok()? {
            DbdMsg::JobStart(msg) => msg.start_time.max(msg.submit_time),
            DbdMsg::JobComplete(msg) => msg.end_time,
            DbdMsg::JobSuspend(msg) => msg.suspend_time,
            DbdMsg::StepStart(msg) => msg.start_time,
            DbdMsg::StepComplete(msg) => msg.end_time,
            DbdMsg::NodeState(msg) => msg.event_time,
            DbdMsg::ClusterTres(msg) => msg.event_time,
            _ => return None,
        };
        (time > 0).then_some(time)
    }

    /// One line summary, e.g. `     3 JobStart (120 bytes) job 7 at 2023-11-14T22:13:20Z`.
    pub fn describe(&self) -> String {
        let index = self.index;
        let size = self.size;
        match &self.msg {
            Ok(msg) => {
                let job = msg
                    .job_id()
                    .map(|id| format!(" job {id}"))
                    .unwrap_or_default();
                let time = self
                    .event_time()
                    .map(|t| format!(" at {}", format_time(t)))
                    .unwrap_or_default();
                format!("{index:>6} {:?} ({size} bytes){job}{time}", msg.msg_type())
            }
            Err(e) => format!("{index:>6} <invalid> ({size} bytes): {e}"),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match &self.msg {
            Ok(msg) => serde_json::json!({
                "index": self.index,
                "size": self.size,
                "message": msg,
            }),
            Err(e) => serde_json::json!({
                "index": self.index,
                "size": self.size,
                "error": e.to_string(),
            }),
        }
    }
}

fn format_time(time: i64) -> String {
    match DateTime::<Utc>::from_timestamp(time, 0) {
        Some(time) => time.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => time.to_string(),
    }
}

/// Decodes every intact record of a replay file; returns the file version and the records.
pub fn entries(path: &Path) -> crate::Result<(u16, Vec<ReplayEntry>)> {
    let reader = ReplayReader::open(path)?;
    let version = reader.version();
    let entries = read_intact(reader, path)
        .into_iter()
        .enumerate()
        .map(|(index, frame)| ReplayEntry {
            index,
            size: frame.len(),
            msg: DbdMsg::unpack(&frame, version),
        })
        .collect();
    Ok((version, entries))
}
