use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::config::AgentConfigBuilder;
use crate::messages::{DbdMsg, JobStart, StepStart};

mod test_agent;

pub(crate) use mock_dbd::MockDbd;

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration pointing at `port` with a short retry interval.
pub(crate) fn agent_config(port: u16, state_dir: &Path) -> AgentConfigBuilder {
    AgentConfigBuilder::default()
        .cluster_name("test")
        .storage_host("127.0.0.1")
        .storage_port(port)
        .state_save_location(state_dir)
        .retry_interval(Duration::from_millis(50))
        .ext_check_interval(Duration::from_millis(50))
        .msg_timeout(Duration::from_secs(5))
}

pub(crate) fn job_start(job_id: u32) -> DbdMsg {
    DbdMsg::JobStart(JobStart {
        job_id,
        name: Some(format!("job{job_id}")),
        nodes: Some("tux[1-2]".to_string()),
        alloc_nodes: 2,
        submit_time: 1_700_000_000,
        start_time: 1_700_000_100,
        container: Some("/srv/containers/c1".to_string()),
        ..Default::default()
    })
}

pub(crate) fn step_start(job_id: u32, step_id: u32) -> DbdMsg {
    DbdMsg::StepStart(StepStart {
        job_id,
        step_id,
        nodes: Some("tux1".to_string()),
        node_cnt: 1,
        total_tasks: 4,
        start_time: 1_700_000_200,
        submit_line: Some("srun hostname".to_string()),
        ..Default::default()
    })
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub(crate) async fn wait_until_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
