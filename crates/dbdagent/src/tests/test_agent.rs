use std::time::Duration;

use jobres::protocol::{PREVIOUS_PROTOCOL_VERSION, PROTOCOL_VERSION};
use tokio::sync::mpsc;

use crate::agent::AccountingAgent;
use crate::agent::replay::{ReplayReader, ReplayWriter};
use crate::common::error::DbdError;
use crate::config::OverflowAction;
use crate::messages::{
    ACCOUNTING_FIRST_REG, DbdMsg, DbdMsgType, JobStart, SLURM_ERROR, SLURM_SUCCESS,
};
use crate::tests::mock_dbd::db_index_of;
use crate::tests::{MockDbd, agent_config, job_start, step_start, wait_until};

fn replay_types(agent_config: &crate::AgentConfig) -> Vec<DbdMsgType> {
    ReplayReader::open(&agent_config.replay_path())
        .unwrap()
        .map(|frame| DbdMsgType::of_frame(&frame.unwrap()).unwrap())
        .collect()
}

#[tokio::test]
async fn drain_queue_after_reconnect() {
    let mock = MockDbd::start().await;
    mock.set_online(false);
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path())
        .max_dbd_msgs(1024)
        .build()
        .unwrap();
    let agent = AccountingAgent::start(config, None);

    for job_id in 0..300 {
        agent.agent_send(PROTOCOL_VERSION, &job_start(job_id)).unwrap();
        assert_eq!(agent.queue_len(), job_id as usize + 1);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.queue_len(), 300);
    assert_eq!(mock.connections(), 0);

    mock.set_online(true);
    wait_until(|| agent.queue_len() == 0).await;

    let deliveries = mock.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].len(), 300);
    assert_eq!(mock.received_job_ids(), (0..300).collect::<Vec<_>>());
    assert_eq!(agent.shutdown().await.unwrap(), 0);
}

#[tokio::test]
async fn single_message_is_sent_without_envelope() {
    let mock = MockDbd::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();
    let agent = AccountingAgent::start(config, None);

    agent.agent_send(PROTOCOL_VERSION, &job_start(3)).unwrap();
    wait_until(|| agent.queue_len() == 0).await;

    let deliveries = mock.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(
        DbdMsgType::of_frame(&deliveries[0][0]),
        Some(DbdMsgType::JobStart)
    );
    assert_eq!(mock.received(), vec![job_start(3)]);
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn discard_step_records_when_full() {
    let mock = MockDbd::start().await;
    mock.set_online(false);
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path())
        .max_dbd_msgs(100)
        .build()
        .unwrap();
    let agent = AccountingAgent::start(config.clone(), None);

    for job_id in 0..60 {
        agent
            .agent_send(PROTOCOL_VERSION, &step_start(job_id, 0))
            .unwrap();
    }
    for job_id in 0..60 {
        agent.agent_send(PROTOCOL_VERSION, &job_start(job_id)).unwrap();
        assert!(agent.queue_len() <= 99);
    }
    agent
        .agent_send(PROTOCOL_VERSION, &step_start(60, 0))
        .unwrap();
    assert_eq!(agent.queue_len(), 61);

    assert_eq!(agent.shutdown().await.unwrap(), 61);
    let types = replay_types(&config);
    assert!(types[..60].iter().all(|t| *t == DbdMsgType::JobStart));
    assert_eq!(types[60], DbdMsgType::StepStart);
}

#[tokio::test]
async fn exit_policy_saves_queue() {
    let mock = MockDbd::start().await;
    mock.set_online(false);
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path())
        .max_dbd_msgs(10)
        .max_dbd_msg_action(OverflowAction::Exit)
        .build()
        .unwrap();
    let agent = AccountingAgent::start(config.clone(), None);

    for job_id in 0..9 {
        agent.agent_send(PROTOCOL_VERSION, &job_start(job_id)).unwrap();
    }
    let result = agent.agent_send(PROTOCOL_VERSION, &job_start(9));
    assert!(matches!(result, Err(DbdError::ReplayOverflow(9))));
    assert!(matches!(
        agent.agent_send(PROTOCOL_VERSION, &job_start(10)),
        Err(DbdError::DbConnection(_))
    ));

    let saved: Vec<_> = ReplayReader::open(&config.replay_path())
        .unwrap()
        .map(|frame| frame.unwrap())
        .collect();
    let expected: Vec<_> = (0..9)
        .map(|job_id| job_start(job_id).pack(PROTOCOL_VERSION).unwrap())
        .collect();
    assert_eq!(saved, expected);
    assert_eq!(agent.shutdown().await.unwrap(), 9);
}

#[tokio::test]
async fn replay_across_restart() {
    let mock = MockDbd::start().await;
    mock.set_online(false);
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();

    let agent = AccountingAgent::start(config.clone(), None);
    for job_id in 0..50 {
        agent.agent_send(PROTOCOL_VERSION, &job_start(job_id)).unwrap();
    }
    agent
        .register_ctld(6817)
        .await
        .expect_err("daemon is offline");
    assert_eq!(agent.shutdown().await.unwrap(), 50);

    let reader = ReplayReader::open(&config.replay_path()).unwrap();
    assert_eq!(reader.version(), PROTOCOL_VERSION);
    assert_eq!(reader.count(), 50);

    let agent = AccountingAgent::start(config, None);
    assert_eq!(agent.queue_len(), 50);
    mock.set_online(true);
    wait_until(|| agent.queue_len() == 0).await;
    assert_eq!(mock.received_job_ids(), (0..50).collect::<Vec<_>>());
    assert_eq!(agent.shutdown().await.unwrap(), 0);
}

#[tokio::test]
async fn replay_from_previous_version() {
    let mock = MockDbd::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();

    let mut writer =
        ReplayWriter::create(&config.replay_path(), PREVIOUS_PROTOCOL_VERSION).unwrap();
    for job_id in 0..20 {
        let frame = job_start(job_id).pack(PREVIOUS_PROTOCOL_VERSION).unwrap();
        assert!(writer.store(&frame).unwrap());
    }
    writer.finish().unwrap();

    let agent = AccountingAgent::start(config, None);
    assert_eq!(agent.queue_len(), 20);
    wait_until(|| agent.queue_len() == 0).await;

    let expected: Vec<_> = (0..20)
        .map(|job_id| match job_start(job_id) {
            DbdMsg::JobStart(job) => DbdMsg::JobStart(JobStart {
                container: None,
                ..job
            }),
            msg => msg,
        })
        .collect();
    assert_eq!(mock.received(), expected);
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn registration_is_never_saved() {
    let mock = MockDbd::start().await;
    mock.set_online(false);
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();

    let agent = AccountingAgent::start(config.clone(), None);
    agent.agent_send(PROTOCOL_VERSION, &job_start(1)).unwrap();
    agent
        .agent_send(
            PROTOCOL_VERSION,
            &DbdMsg::RegisterCtld(crate::messages::RegisterCtld {
                port: 6817,
                flags: 0,
            }),
        )
        .unwrap();
    agent.agent_send(PROTOCOL_VERSION, &job_start(2)).unwrap();
    assert_eq!(agent.queue_len(), 3);
    assert_eq!(agent.shutdown().await.unwrap(), 2);
    assert_eq!(
        replay_types(&config),
        vec![DbdMsgType::JobStart, DbdMsgType::JobStart]
    );
}

#[tokio::test]
async fn resend_same_batch_after_reconnect() {
    let mock = MockDbd::start().await;
    mock.drop_next_delivery();
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();
    let agent = AccountingAgent::start(config, None);

    for job_id in 0..20 {
        agent.agent_send(PROTOCOL_VERSION, &job_start(job_id)).unwrap();
    }
    wait_until(|| agent.queue_len() == 0).await;

    let deliveries = mock.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0], deliveries[1]);
    assert_eq!(deliveries[0].len(), 20);
    assert_eq!(mock.connections(), 2);
    assert_eq!(mock.received_job_ids(), (0..20).collect::<Vec<_>>());
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn id_rc_is_forwarded() {
    let mock = MockDbd::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let agent = AccountingAgent::start(config, Some(sender));

    for job_id in 1..=5 {
        agent.agent_send(PROTOCOL_VERSION, &job_start(job_id)).unwrap();
    }
    agent
        .agent_send(PROTOCOL_VERSION, &step_start(1, 0))
        .unwrap();
    for job_id in 1..=5 {
        let id_rc = receiver.recv().await.unwrap();
        assert_eq!(id_rc.job_id, job_id);
        assert_eq!(id_rc.db_index, db_index_of(job_id));
    }
    wait_until(|| agent.queue_len() == 0).await;
    assert!(receiver.try_recv().is_err());
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn lost_database_keeps_messages_queued() {
    let mock = MockDbd::start().await;
    mock.set_db_down(true);
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();
    let agent = AccountingAgent::start(config, None);

    for job_id in 0..3 {
        agent.agent_send(PROTOCOL_VERSION, &job_start(job_id)).unwrap();
    }
    wait_until(|| !mock.deliveries().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(agent.queue_len(), 3);
    assert!(mock.received().is_empty());

    mock.set_db_down(false);
    wait_until(|| agent.queue_len() == 0).await;
    assert_eq!(mock.received_job_ids(), vec![0, 1, 2]);
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn direct_request_gets_its_reply() {
    let mock = MockDbd::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();
    let agent = AccountingAgent::start(config, None);

    let reply = agent
        .send_recv(PROTOCOL_VERSION, &job_start(42))
        .await
        .unwrap();
    match reply {
        DbdMsg::IdRc(id_rc) => {
            assert_eq!(id_rc.job_id, 42);
            assert_eq!(id_rc.db_index, db_index_of(42));
        }
        msg => panic!("unexpected reply {msg:?}"),
    }
    assert_eq!(mock.received(), vec![job_start(42)]);
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn register_controller() {
    let mock = MockDbd::start().await;
    let dir = tempfile::tempdir().unwrap();
    let agent = AccountingAgent::start(
        agent_config(mock.port(), dir.path()).build().unwrap(),
        None,
    );
    assert_eq!(agent.register_ctld(6817).await.unwrap(), SLURM_SUCCESS);
    mock.set_register_rc(ACCOUNTING_FIRST_REG);
    assert_eq!(
        agent.register_ctld(6817).await.unwrap(),
        ACCOUNTING_FIRST_REG
    );
    mock.set_register_rc(SLURM_ERROR);
    assert_eq!(agent.register_ctld(6817).await.unwrap(), SLURM_ERROR);
    assert_eq!(mock.registrations(), 3);
    assert!(mock.deliveries().is_empty());
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn refused_registration_is_fatal_when_enforced() {
    let mock = MockDbd::start().await;
    mock.set_register_rc(SLURM_ERROR);
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path())
        .accounting_enforce(true)
        .build()
        .unwrap();
    let agent = AccountingAgent::start(config, None);
    assert!(matches!(
        agent.register_ctld(6817).await,
        Err(DbdError::Fatal(_))
    ));
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn refused_handshake_keeps_queue() {
    let mock = MockDbd::start().await;
    mock.set_init_rc(SLURM_ERROR);
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();
    let agent = AccountingAgent::start(config, None);

    agent.agent_send(PROTOCOL_VERSION, &job_start(1)).unwrap();
    assert!(!agent.wait_for_assoc_cache(Duration::from_millis(200)).await);
    assert_eq!(agent.queue_len(), 1);

    mock.set_init_rc(SLURM_SUCCESS);
    assert!(agent.wait_for_assoc_cache(Duration::from_secs(5)).await);
    wait_until(|| agent.queue_len() == 0).await;
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn wait_for_primary() {
    let mock = MockDbd::start().await;
    mock.set_online(false);
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();
    let agent = AccountingAgent::start(config, None);

    assert!(!agent.wait_for_assoc_cache(Duration::from_millis(200)).await);
    mock.set_online(true);
    assert!(agent.wait_for_assoc_cache(Duration::from_secs(5)).await);
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn discard_while_batch_in_flight_keeps_new_jobs() {
    let mock = MockDbd::start().await;
    mock.hold_replies();
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path())
        .max_dbd_msgs(10)
        .build()
        .unwrap();
    let agent = AccountingAgent::start(config, None);

    agent
        .agent_send(PROTOCOL_VERSION, &step_start(100, 0))
        .unwrap();
    wait_until(|| mock.deliveries().len() == 1).await;

    // The ninth job start discards the step record that is waiting for its reply
    for job_id in 0..9 {
        agent.agent_send(PROTOCOL_VERSION, &job_start(job_id)).unwrap();
    }
    assert_eq!(agent.queue_len(), 9);

    mock.release_replies();
    wait_until(|| agent.queue_len() == 0).await;

    let deliveries = mock.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[1].len(), 9);
    let mut expected = vec![100];
    expected.extend(0..9);
    assert_eq!(mock.received_job_ids(), expected);
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn direct_request_waits_for_batch_in_flight() {
    let mock = MockDbd::start().await;
    mock.hold_replies();
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();
    let agent = AccountingAgent::start(config, None);

    for job_id in 0..5 {
        agent.agent_send(PROTOCOL_VERSION, &job_start(job_id)).unwrap();
    }
    wait_until(|| mock.deliveries().len() == 1).await;

    let start = job_start(42);
    let direct = agent.send_recv(PROTOCOL_VERSION, &start);
    let release = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mock.deliveries().len(), 1);
        for job_id in 5..8 {
            agent.agent_send(PROTOCOL_VERSION, &job_start(job_id)).unwrap();
        }
        mock.release_replies();
    };
    let (reply, ()) = tokio::join!(direct, release);
    match reply.unwrap() {
        DbdMsg::IdRc(id_rc) => {
            assert_eq!(id_rc.job_id, 42);
            assert_eq!(id_rc.db_index, db_index_of(42));
        }
        msg => panic!("unexpected reply {msg:?}"),
    }
    wait_until(|| agent.queue_len() == 0).await;

    let sizes: Vec<_> = mock.deliveries().iter().map(|d| d.len()).collect();
    assert_eq!(sizes, vec![5, 1, 3]);
    assert_eq!(
        mock.received_job_ids(),
        vec![0, 1, 2, 3, 4, 42, 5, 6, 7]
    );
    assert_eq!(mock.connections(), 1);
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn undecodable_reply_reopens_connection() {
    let mock = MockDbd::start().await;
    mock.garble_next_reply();
    let dir = tempfile::tempdir().unwrap();
    let config = agent_config(mock.port(), dir.path()).build().unwrap();
    let agent = AccountingAgent::start(config, None);

    for job_id in 0..3 {
        agent.agent_send(PROTOCOL_VERSION, &job_start(job_id)).unwrap();
    }
    wait_until(|| agent.queue_len() == 0).await;

    let deliveries = mock.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0], deliveries[1]);
    assert_eq!(mock.connections(), 2);
    agent.shutdown().await.unwrap();
}
