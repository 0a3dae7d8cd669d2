use anyhow::Result;
use keeper_executor::{
    fees::{compute_fee, FeeInputs},
    sandbox::{
        mock::{MockRun, MockRuntime, StaticFetcher},
        SandboxRunner,
    },
    SandboxConfig, SandboxError,
};
use std::{sync::Arc, time::Duration};

const SOURCE: &[u8] = b"package main\n\nimport \"fmt\"\n\nfunc main() { fmt.Println(\"ok\") }\n";

fn runner(runtime: Arc<MockRuntime>) -> SandboxRunner {
    SandboxRunner::new(runtime, Arc::new(StaticFetcher::new(SOURCE)), SandboxConfig::default())
}

#[tokio::test]
async fn clean_run_captures_output_and_meters_it() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new(vec![MockRun::printing("hello\nworld")]));
    let stats = runner(runtime.clone()).run("ipfs://script").await?;

    assert_eq!(stats.output, "hello\nworld");
    assert_eq!(stats.memory_usage, 32 * 1024 * 1024);
    assert_eq!(stats.rx_bytes, 1024);
    assert_eq!(stats.tx_bytes, 512);
    assert_eq!(stats.source_size, SOURCE.len());
    assert_eq!(
        stats.fee,
        compute_fee(&FeeInputs {
            source_size_bytes: SOURCE.len(),
            execution_time: stats.execution_time,
            memory_used_bytes: stats.memory_usage,
            number_of_attesters: 0,
        })
    );

    let created = runtime.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].image, "golang:latest");
    assert_eq!(created[0].working_dir, "/code");
    assert_eq!(created[0].cmd, vec!["sh".to_string(), "/code/setup.sh".to_string()]);
    assert!(created[0].binds[0].ends_with(":/code"));
    assert!(runtime.live_containers().is_empty());
    Ok(())
}

#[tokio::test]
async fn image_pull_failure_leaves_no_container() {
    let runtime = Arc::new(MockRuntime::failing_pull("registry unreachable"));
    let result = runner(runtime.clone()).run("ipfs://script").await;

    assert!(matches!(result, Err(SandboxError::ImagePull { .. })));
    assert!(runtime.live_containers().is_empty());
}

#[tokio::test]
async fn non_zero_exit_removes_the_container() {
    let runtime = Arc::new(MockRuntime::new(vec![MockRun::exiting(1)]));
    let result = runner(runtime.clone()).run("ipfs://script").await;

    assert!(matches!(result, Err(SandboxError::NonZeroExit(1))));
    assert_eq!(runtime.created().len(), 1);
    assert!(runtime.live_containers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hung_container_times_out_and_is_removed() {
    let runtime = Arc::new(MockRuntime::new(vec![MockRun::hanging()]));
    let result = runner(runtime.clone()).run("ipfs://script").await;

    match result {
        Err(SandboxError::Timeout(limit)) => assert_eq!(limit, Duration::from_secs(600)),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(runtime.live_containers().is_empty());
}

#[tokio::test]
async fn condition_verdict_is_read_from_output() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new(vec![
        MockRun::printing("Condition satisfied: true"),
        MockRun::printing("{\"satisfied\": false}"),
    ]));
    let runner = runner(runtime);
    assert!(runner.run("ipfs://a").await?.condition_satisfied);
    assert!(!runner.run("ipfs://b").await?.condition_satisfied);
    Ok(())
}

#[tokio::test]
async fn stats_failure_stops_the_run_and_removes_the_container() {
    let runtime = Arc::new(MockRuntime::new(vec![MockRun::failing_stats("bad stats frame")]));
    let result = runner(runtime.clone()).run("ipfs://script").await;

    match result {
        Err(SandboxError::Stats(reason)) => assert_eq!(reason, "bad stats frame"),
        other => panic!("expected stats error, got {:?}", other),
    }
    assert_eq!(runtime.created().len(), 1);
    assert!(runtime.live_containers().is_empty());
}

#[tokio::test]
async fn create_failure_leaves_no_container() {
    let runtime = Arc::new(MockRuntime::failing_create("name conflict"));
    let result = runner(runtime.clone()).run("ipfs://script").await;

    assert!(matches!(result, Err(SandboxError::ContainerCreate(reason)) if reason == "name conflict"));
    assert!(runtime.created().is_empty());
    assert!(runtime.live_containers().is_empty());
}

#[tokio::test]
async fn start_failure_removes_the_created_container() {
    let runtime = Arc::new(MockRuntime::new(vec![MockRun::failing_start("port in use")]));
    let result = runner(runtime.clone()).run("ipfs://script").await;

    assert!(matches!(result, Err(SandboxError::ContainerStart { reason, .. }) if reason == "port in use"));
    assert_eq!(runtime.created().len(), 1);
    assert!(runtime.live_containers().is_empty());
}
