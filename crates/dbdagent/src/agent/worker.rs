use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::agent::AgentShared;
use crate::agent::queue::Batch;
use crate::common::error::{DbdError, protocol_error};
use crate::dbd_conn::DbdConn;
use crate::messages::{DbdMsg, ESLURM_DB_CONNECTION, IdRc, SLURM_SUCCESS};
use crate::{MAX_BATCH_MSGS, MAX_MSG_SIZE};

/// Drains the pending queue into the primary connection until the agent stops.
///
/// Returns the number of messages saved to the replay file on exit.
pub(crate) async fn run_worker(shared: Arc<AgentShared>) -> crate::Result<usize> {
    let retry_interval = shared.config.retry_interval;
    let in_backoff =
        |fail_time: Option<Instant>| fail_time.is_some_and(|t| t.elapsed() < retry_interval);
    let mut fail_time: Option<Instant> = None;

    loop {
        if shared.is_shutting_down() {
            break;
        }
        if shared.is_halted() {
            shared.wait(retry_interval).await;
            continue;
        }

        let mut conn = shared.conn.lock().await;
        if !conn.is_open() && !in_backoff(fail_time) {
            match conn.check_and_reopen().await {
                Ok(()) => {
                    log::info!("Connection to the accounting daemon established");
                    fail_time = None;
                }
                Err(e) => {
                    log::debug!("Accounting daemon is not reachable: {e}");
                    fail_time = Some(Instant::now());
                }
            }
        }
        shared.primary_up.send_replace(conn.is_open());

        let batch = if conn.is_open() && !in_backoff(fail_time) {
            shared
                .lock_queue()
                .pending
                .peek_batch(MAX_BATCH_MSGS, MAX_MSG_SIZE)
        } else {
            Batch::default()
        };
        if batch.is_empty() {
            drop(conn);
            shared.wait(retry_interval).await;
            continue;
        }

        let result = send_batch(&mut conn, &batch.frames, shared.id_sink.as_ref()).await;
        if let Err(DbdError::Protocol(_)) = &result {
            conn.persist_conn().destroy();
        }
        let connected = conn.is_open();
        drop(conn);
        match result {
            Ok(acked) => {
                if acked > 0 {
                    shared.lock_queue().pending.pop_through(batch.seqs[acked - 1]);
                }
                log::debug!("Delivered {acked} of {} accounting messages", batch.len());
                fail_time = if acked < batch.len() {
                    Some(Instant::now())
                } else {
                    None
                };
            }
            Err(e) => {
                if shared.is_shutting_down() {
                    break;
                }
                log::error!(
                    "Sending {} accounting messages failed: {e}",
                    batch.len()
                );
                fail_time = Some(Instant::now());
            }
        }
        if !connected {
            shared.primary_up.send_replace(false);
        }
    }
    shared.save_state()
}

/// Sends a batch and returns how many of its messages were acknowledged.
///
/// A single message is sent as is, more messages are wrapped in `SEND_MULT_MSG`.
async fn send_batch(
    conn: &mut DbdConn,
    batch: &[Bytes],
    id_sink: Option<&mpsc::UnboundedSender<IdRc>>,
) -> crate::Result<usize> {
    let version = conn.version();
    let persist = conn.persist_conn();
    if let [frame] = batch {
        persist.send(frame.clone()).await?;
        let reply = DbdMsg::unpack(&persist.recv().await?, version)?;
        return Ok(handle_reply(reply, id_sink) as usize);
    }

    let envelope = DbdMsg::SendMultMsg(batch.to_vec()).pack(version)?;
    persist.send(envelope).await?;
    let replies = match DbdMsg::unpack(&persist.recv().await?, version)? {
        DbdMsg::GotMultMsg(replies) => replies,
        DbdMsg::PersistRc(rc) => {
            return Err(DbdError::DbConnection(format!(
                "batch of {} messages refused with rc {}: {}",
                batch.len(),
                rc.rc,
                rc.comment.as_deref().unwrap_or("")
            )));
        }
        reply => {
            return protocol_error(format!(
                "unexpected {:?} in reply to a batch",
                reply.msg_type()
            ));
        }
    };
    if replies.len() > batch.len() {
        return protocol_error(format!(
            "{} replies for a batch of {} messages",
            replies.len(),
            batch.len()
        ));
    }
    let mut acked = 0;
    for reply in replies {
        if !handle_reply(reply, id_sink) {
            break;
        }
        acked += 1;
    }
    Ok(acked)
}

/// Processes the reply to one queued message; returns whether the message can be dequeued.
fn handle_reply(reply: DbdMsg, id_sink: Option<&mpsc::UnboundedSender<IdRc>>) -> bool {
    match reply {
        DbdMsg::PersistRc(rc) if rc.rc == ESLURM_DB_CONNECTION => {
            log::error!(
                "Accounting daemon has no database connection: {}",
                rc.comment.as_deref().unwrap_or("")
            );
            false
        }
        DbdMsg::PersistRc(rc) => {
            if rc.rc != SLURM_SUCCESS {
                log::error!(
                    "Accounting message rejected with rc {}: {}",
                    rc.rc,
                    rc.comment.as_deref().unwrap_or("")
                );
            }
            true
        }
        DbdMsg::IdRc(id_rc) => {
            if let Some(sink) = id_sink {
                if sink.send(id_rc).is_err() {
                    log::debug!("ID_RC receiver is closed");
                }
            }
            true
        }
        reply => {
            log::error!("Unexpected {:?} reply to an accounting message", reply.msg_type());
            true
        }
    }
}
