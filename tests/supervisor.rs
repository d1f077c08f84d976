//! Supervisor lifecycle tests: serve, reload, stop.

use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use roost::{handler, sync_handler, Flow, Request, ServerInstance};

mod common;

fn config(version: &str) -> String {
    format!(
        "global:\n  stop_timeout: 5\n  kill_timeout: 1\n  config:\n    version: {version}\n\
         servers:\n  - name: app\n    listen: 127.0.0.1:{{port}}\n"
    )
}

fn version(req: &mut Request) -> Flow {
    let version = req.config().get::<String>("version").unwrap_or_default();
    req.send_string(version)
}

fn slow(req: &mut Request) -> BoxFuture<'_, Flow> {
    Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        req.send_string("slow done")
    })
}

fn app() -> ServerInstance {
    let mut server = ServerInstance::new("app");
    server
        .route("/version", vec![sync_handler(version)])
        .route("/slow", vec![handler(slow)]);
    server
}

async fn fetch(url: &str) -> Option<String> {
    let resp = reqwest::get(url).await.ok()?;
    resp.text().await.ok()
}

async fn wait_for_body(url: &str, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if fetch(url).await.as_deref() == Some(expected) {
            return;
        }
        assert!(Instant::now() < deadline, "{url} never answered {expected:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_swaps_config_without_dropping_in_flight() {
    let running = common::Running::start(vec![app()], &config("v1")).await;
    assert_eq!(fetch(&running.url("/version")).await.as_deref(), Some("v1"));

    let slow_url = running.url("/slow");
    let in_flight = tokio::spawn(async move { reqwest::get(slow_url).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    running.rewrite_config(&config("v2"));
    running.reload().await;
    wait_for_body(&running.url("/version"), "v2").await;

    let slow = in_flight.await.unwrap().unwrap();
    assert_eq!(slow.status(), 200);
    assert_eq!(slow.text().await.unwrap(), "slow done");

    running.stop().await.2.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_reload_keeps_current_generation() {
    let running = common::Running::start(vec![app()], &config("v1")).await;

    running.rewrite_config("servers:\n  - name: app\n    listen: nowhere\n");
    running.reload().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fetch(&running.url("/version")).await.as_deref(), Some("v1"));

    running.rewrite_config("servers: [unclosed\n");
    running.reload().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fetch(&running.url("/version")).await.as_deref(), Some("v1"));

    running.stop().await.2.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_can_move_a_server() {
    let running = common::Running::start(vec![app()], &config("v1")).await;
    let old_addr = running.addr;

    let new_port = common::free_port();
    running.rewrite_config(&config("v2").replace("{port}", &new_port.to_string()));
    running.reload().await;

    let new_url = format!("http://127.0.0.1:{new_port}/version");
    wait_for_body(&new_url, "v2").await;

    let deadline = Instant::now() + Duration::from_secs(10);
    while tokio::net::TcpStream::connect(old_addr).await.is_ok() {
        assert!(Instant::now() < deadline, "old address still bound");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    running.stop().await.2.unwrap();
}

#[tokio::test]
async fn stop_frees_ports_and_pid_file() {
    let running = common::Running::start(vec![app()], &config("v1")).await;
    let addr = running.addr;
    let pid_path = running.path("logs/roost.pid");
    assert!(pid_path.exists());

    let (_dir, supervisor, result) = running.stop().await;
    result.unwrap();
    assert!(!pid_path.exists());
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    assert!(supervisor.servers().iter().all(|s| !s.enable()));
}

#[tokio::test]
async fn disabled_and_unconfigured_servers_are_skipped() {
    let disabled_port = common::free_port();
    let yaml = format!(
        "servers:\n  - name: app\n    listen: 127.0.0.1:{{port}}\n\
         \x20 - name: off\n    listen: 127.0.0.1:{disabled_port}\n    enable: false\n"
    );
    let running = common::Running::start(
        vec![app(), ServerInstance::new("off"), ServerInstance::new("ghost")],
        &yaml,
    )
    .await;

    assert!(tokio::net::TcpStream::connect(("127.0.0.1", disabled_port))
        .await
        .is_err());
    assert_eq!(fetch(&running.url("/version")).await.as_deref(), Some(""));

    running.stop().await.2.unwrap();
}
