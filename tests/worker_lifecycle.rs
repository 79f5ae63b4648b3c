//! Scenarios that need a genuinely live child process: the happy path,
//! a rolling restart under load, and crash recovery. Driven directly
//! against a worker's dispatcher rather than through the HTTP proxy, so
//! failures point at the dispatcher logic rather than the routing layer.

mod support;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use tqserver::config::ScalingConfig;
use tqserver::worker::DispatcherCommand;

use support::{EchoFixture, TestEnv};

async fn fetch(port: u16) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to worker");
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("write request");
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.expect("read response");
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn happy_path_dispatches_to_a_healthy_instance() {
    let fixture = EchoFixture::new();
    let env = TestEnv::new(22000, 22020);
    let spec = fixture.spec(
        "echo",
        "/echo",
        ScalingConfig {
            min_instances: 1,
            max_instances: 2,
            ..ScalingConfig::default()
        },
    );
    let (handle, _join) = env.spawn_worker(spec, Duration::from_millis(200));

    let instance = handle
        .dispatch(Duration::from_secs(10))
        .await
        .expect("dispatch succeeds once the minimum pool is up");
    let response = fetch(instance.port).await;
    assert!(response.contains(&format!("echo:{}", instance.port)));

    handle.send_command(DispatcherCommand::Shutdown).await;
}

#[tokio::test]
async fn rolling_restart_keeps_dispatch_available_throughout() {
    let fixture = EchoFixture::new();
    let env = TestEnv::new(22100, 22130);
    let scaling = ScalingConfig {
        min_instances: 2,
        max_instances: 2,
        ..ScalingConfig::default()
    };
    let spec = fixture.spec("echo", "/echo", scaling.clone());
    let (handle, _join) = env.spawn_worker(spec, Duration::from_millis(200));

    // Wait for the minimum pool to come up before driving load.
    let first = handle
        .dispatch(Duration::from_secs(10))
        .await
        .expect("initial pool is up");
    assert!(fetch(first.port).await.contains("echo:"));

    let new_spec = fixture.spec("echo", "/echo", scaling);
    handle
        .send_command(DispatcherCommand::Reload(new_spec))
        .await;

    // Dispatch must keep succeeding while the reload rolls: the
    // pre-build-then-swap strategy never drops to zero instances.
    for _ in 0..20 {
        let instance = handle
            .dispatch(Duration::from_secs(5))
            .await
            .expect("dispatch never refuses during a rolling restart");
        assert!(fetch(instance.port).await.contains("echo:"));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let snapshot = handle.snapshot().await;
    assert_eq!(snapshot.restart_epoch, 1);

    handle.send_command(DispatcherCommand::Shutdown).await;
}

#[tokio::test]
async fn crashed_instance_is_reaped_and_replaced() {
    let fixture = EchoFixture::new();
    let env = TestEnv::new(22200, 22220);
    let spec = fixture.spec(
        "echo",
        "/echo",
        ScalingConfig {
            min_instances: 1,
            max_instances: 1,
            ..ScalingConfig::default()
        },
    );
    let (handle, _join) = env.spawn_worker(spec, Duration::from_millis(150));

    let instance = handle
        .dispatch(Duration::from_secs(10))
        .await
        .expect("initial instance is up");

    // SIGKILL the worker process out from under the dispatcher.
    unsafe {
        libc::kill(instance.pid as libc::pid_t, libc::SIGKILL);
    }

    // Give the scaling tick a few cycles to notice the dead child,
    // release its port, and bring the pool back to its minimum.
    let mut recovered = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        if let Ok(fresh) = handle.dispatch(Duration::from_millis(200)).await {
            if fresh.id != instance.id {
                recovered = true;
                assert!(fetch(fresh.port).await.contains("echo:"));
                break;
            }
        }
    }
    assert!(recovered, "dispatcher should replace the crashed instance");

    handle.send_command(DispatcherCommand::Shutdown).await;
}
