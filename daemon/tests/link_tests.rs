use minerguard_daemon::collector::{ProcessCollector, ProcessInfo};
use minerguard_daemon::link::{LaunchError, MinerLink, TcpMinerLink, MAX_CONSECUTIVE_LAUNCHES};
use minerguard_daemon::wire::Command;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const SUMMARY_OK: &str = r#"{"STATUS":[{"STATUS":"S","Msg":"Summary"}],"SUMMARY":[{"MHS 5s":0.35}],"id":1}"#;

/// Fixed process table.
#[derive(Default)]
struct FakeProcesses(Vec<ProcessInfo>);

impl FakeProcesses {
    fn with(names: &[&str]) -> Self {
        Self(
            names
                .iter()
                .enumerate()
                .map(|(i, name)| ProcessInfo {
                    pid: 1000 + i as u32,
                    name: name.to_string(),
                    cmdline: format!("/usr/bin/{}", name),
                    state: 'S',
                })
                .collect(),
        )
    }
}

impl ProcessCollector for FakeProcesses {
    fn list_processes(&self) -> Vec<ProcessInfo> {
        self.0.clone()
    }
}

/// Accept one connection per reply, record what was sent, answer and close.
async fn serve(replies: Vec<&'static str>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        let mut requests = Vec::new();
        for reply in replies {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            requests.push(String::from_utf8_lossy(&buf[..n]).to_string());
            stream.write_all(reply.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
        requests
    });
    (address, task)
}

/// An address nothing is listening on.
async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

fn link(address: String) -> TcpMinerLink<FakeProcesses> {
    TcpMinerLink::new(address, "cgminer", "/nonexistent/cgminer", vec![])
        .with_collector(FakeProcesses::default())
}

#[tokio::test]
async fn test_connected_reported_only_on_first_success() {
    let (address, server) = serve(vec![SUMMARY_OK, SUMMARY_OK]).await;
    let mut link = link(address);

    let first = link.execute(&Command::summary()).await;
    assert_eq!(first.payload, SUMMARY_OK.as_bytes());
    assert!(first.connected);
    assert!(first.fault.is_none());

    let second = link.execute(&Command::summary()).await;
    assert_eq!(second.payload, SUMMARY_OK.as_bytes());
    assert!(!second.connected);

    let requests = server.await.unwrap();
    assert_eq!(requests, vec![r#"{"command":"summary"}"#; 2]);
}

#[tokio::test]
async fn test_quit_never_reports_connected() {
    let (address, server) = serve(vec![r#"{"STATUS":[{"STATUS":"S","Msg":"BYE"}]}"#]).await;
    let mut link = link(address);

    let exchange = link.execute(&Command::quit()).await;
    assert!(!exchange.payload.is_empty());
    assert!(!exchange.connected);
    assert_eq!(server.await.unwrap(), vec![r#"{"command":"quit"}"#]);
}

#[tokio::test]
async fn test_parameter_is_sent_when_present() {
    let (address, server) = serve(vec![r#"{"STATUS":[{"STATUS":"I"}]}"#]).await;
    let mut link = link(address);

    link.execute(&Command::gpu_intensity(0, 13)).await;
    assert_eq!(
        server.await.unwrap(),
        vec![r#"{"command":"gpuintensity","parameter":"0,13"}"#]
    );
}

#[tokio::test]
async fn test_refused_connection_is_quiet_and_empty() {
    let mut link = link(closed_address().await);

    let exchange = link.execute(&Command::summary()).await;
    assert!(exchange.payload.is_empty());
    assert!(!exchange.connected);
    assert!(exchange.fault.is_none());
}

#[tokio::test]
async fn test_failure_rearms_connected_edge() {
    let (address, server) = serve(vec![SUMMARY_OK]).await;
    let mut link = link(address.clone());
    assert!(link.execute(&Command::summary()).await.connected);
    server.await.unwrap();

    // server is gone: this exchange fails and clears the known-connected flag
    assert!(link.execute(&Command::summary()).await.payload.is_empty());

    let listener = TcpListener::bind(&address).await;
    // the port may have been taken in the meantime; nothing more to check then
    let Ok(listener) = listener else { return };
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 512];
        let _ = stream.read(&mut buf).await.unwrap();
        stream.write_all(SUMMARY_OK.as_bytes()).await.unwrap();
    });
    assert!(link.execute(&Command::summary()).await.connected);
    server.await.unwrap();
}

#[test]
fn test_process_queries_use_collector() {
    let link = TcpMinerLink::new("127.0.0.1:4028", "cgminer", "/nonexistent", vec!["Blender".to_string()])
        .with_collector(FakeProcesses::with(&["cgminer", "blender"]));
    assert!(link.is_miner_running());
    assert!(link.is_important_process_running());

    let idle = TcpMinerLink::new("127.0.0.1:4028", "cgminer", "/nonexistent", vec!["blender".to_string()])
        .with_collector(FakeProcesses::with(&["bash"]));
    assert!(!idle.is_miner_running());
    assert!(!idle.is_important_process_running());
}

#[test]
fn test_launch_skipped_when_already_running() {
    let mut link = TcpMinerLink::new("127.0.0.1:4028", "cgminer", "/nonexistent", vec![])
        .with_collector(FakeProcesses::with(&["cgminer"]));
    assert!(!link.launch(false).unwrap());
    assert_eq!(link.consecutive_launches(), 0);
}

#[test]
fn test_launch_with_missing_program() {
    let mut link = link("127.0.0.1:4028".to_string());
    match link.launch(false) {
        Err(LaunchError::MissingProgram(path)) => assert_eq!(path, Path::new("/nonexistent/cgminer")),
        other => panic!("expected MissingProgram, got {:?}", other),
    }
}

#[tokio::test]
async fn test_launch_throttle_resets_after_success() {
    let program = Path::new("/bin/true");
    if !program.is_file() {
        return;
    }
    let (address, server) = serve(vec![SUMMARY_OK]).await;
    let mut link = TcpMinerLink::new(address, "minerguard-absent", program, vec![])
        .with_collector(FakeProcesses::default());

    for _ in 0..MAX_CONSECUTIVE_LAUNCHES {
        assert!(link.launch(false).unwrap());
    }
    assert_eq!(link.consecutive_launches(), MAX_CONSECUTIVE_LAUNCHES);
    assert!(matches!(link.launch(false), Err(LaunchError::TooManyLaunches(20))));

    link.execute(&Command::summary()).await;
    server.await.unwrap();
    assert_eq!(link.consecutive_launches(), 0);
    assert!(link.launch(false).unwrap());
}

#[test]
fn test_kill_resets_launch_throttle() {
    let program = Path::new("/bin/true");
    if !program.is_file() {
        return;
    }
    let mut link = TcpMinerLink::new("127.0.0.1:4028", "minerguard-absent", program, vec![])
        .with_collector(FakeProcesses::default());

    for _ in 0..MAX_CONSECUTIVE_LAUNCHES {
        link.launch(false).unwrap();
    }
    assert!(matches!(link.launch(false), Err(LaunchError::TooManyLaunches(_))));

    link.kill();
    assert_eq!(link.consecutive_launches(), 0);
    assert!(link.launch(false).unwrap());
}
