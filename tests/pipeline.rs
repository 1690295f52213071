//! End-to-end tests for the download pipeline.
//!
//! These drive the registry, worker pool and fetcher together against mock
//! HTTP servers and real temp directories.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use libram::config::Config;
use libram::download::{BookInfo, FetchError, Fetcher, QueueStatus, Registry, WorkerPool};

struct TestDirs {
    tmp: TempDir,
    ingest: TempDir,
}

impl TestDirs {
    fn new() -> Self {
        Self {
            tmp: TempDir::new().expect("failed to create tmp dir"),
            ingest: TempDir::new().expect("failed to create ingest dir"),
        }
    }
}

fn test_config(dirs: &TestDirs, workers: usize) -> Config {
    Config {
        host: "127.0.0.1:0".to_string(),
        max_concurrent_downloads: workers,
        status_timeout: 3600,
        main_loop_sleep_time: 1,
        tmp_dir: dirs.tmp.path().to_path_buf(),
        ingest_dir: dirs.ingest.path().to_path_buf(),
        use_book_title: false,
        supported_formats: vec!["epub".to_string(), "txt".to_string()],
        custom_script: None,
        max_retry: 3,
        default_sleep: 5,
        aa_base_url: "https://example.org".to_string(),
        aa_donator_key: None,
        cwa_db_path: None,
    }
}

fn book(id: &str, urls: Vec<String>) -> BookInfo {
    BookInfo {
        id: id.to_string(),
        title: format!("Book {id}"),
        format: Some("txt".to_string()),
        download_urls: urls,
        ..Default::default()
    }
}

async fn wait_for_status(
    registry: &Registry,
    id: &str,
    expected: QueueStatus,
    timeout: Duration,
) -> QueueStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = registry.book_with_status(id).map(|(_, status)| status);
        if status == Some(expected) {
            return expected;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {id} to reach {expected}, currently {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn mount_file(server: &MockServer, path_str: &str, content: &[u8]) {
    Mock::given(method("GET"))
        .and(path(path_str))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.to_vec()))
        .mount(server)
        .await;
}

/// Serves `total` bytes of `x` in `chunk`-sized pieces with a pause between
/// each, so cancellation can land mid-transfer.
async fn start_drip_server(total: usize, chunk: usize, delay: Duration) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind drip server");
    let addr = listener.local_addr().expect("drip server address");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n"
                );
                if socket.write_all(header.as_bytes()).await.is_err() {
                    return;
                }

                let body = vec![b'x'; chunk];
                let mut sent = 0;
                while sent < total {
                    if socket.write_all(&body).await.is_err() {
                        return;
                    }
                    let _ = socket.flush().await;
                    sent += chunk;
                    tokio::time::sleep(delay).await;
                }
            });
        }
    });

    format!("http://{addr}/file")
}

#[tokio::test]
async fn single_worker_dispatches_in_priority_order() {
    let server = MockServer::start().await;
    for p in ["/a", "/b", "/c"] {
        mount_file(&server, p, b"x").await;
    }

    let dirs = TestDirs::new();
    let config = Arc::new(test_config(&dirs, 1));
    let registry = Arc::new(Registry::new(config.status_timeout()));

    registry.add(book("a", vec![format!("{}/a", server.uri())]), 10);
    registry.add(book("b", vec![format!("{}/b", server.uri())]), 1);
    registry.add(book("c", vec![format!("{}/c", server.uri())]), 5);

    let pool = WorkerPool::start(config, registry.clone());
    for id in ["a", "b", "c"] {
        wait_for_status(&registry, id, QueueStatus::Available, Duration::from_secs(10)).await;
    }
    pool.shutdown().await;

    let requests = server.received_requests().await.expect("recording enabled");
    let order: Vec<String> = requests.iter().map(|r| r.url.path().to_string()).collect();
    assert_eq!(order, vec!["/b", "/c", "/a"]);
}

#[tokio::test]
async fn concurrent_downloads_both_complete() {
    let server = MockServer::start().await;
    let content1 = b"test book content 1";
    let content2 = b"test book content 2";
    mount_file(&server, "/one", content1).await;
    mount_file(&server, "/two", content2).await;

    let dirs = TestDirs::new();
    let config = Arc::new(test_config(&dirs, 2));
    let registry = Arc::new(Registry::new(config.status_timeout()));
    let pool = WorkerPool::start(config, registry.clone());

    registry.add(book("one", vec![format!("{}/one", server.uri())]), 0);
    registry.add(book("two", vec![format!("{}/two", server.uri())]), 0);

    wait_for_status(&registry, "one", QueueStatus::Available, Duration::from_secs(10)).await;
    wait_for_status(&registry, "two", QueueStatus::Available, Duration::from_secs(10)).await;
    pool.shutdown().await;

    for (id, content) in [("one", content1.as_slice()), ("two", content2.as_slice())] {
        let (info, _) = registry.book_with_status(id).unwrap();
        let path = info.download_path.expect("final path recorded");
        assert_eq!(std::fs::read(&path).unwrap(), content, "content for {id}");
        assert!(path.starts_with(&dirs.ingest.path().to_string_lossy().to_string()));
    }
}

#[tokio::test]
async fn failed_source_falls_back_to_next_url() {
    let failing = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&failing)
        .await;

    let working = MockServer::start().await;
    mount_file(&working, "/file", b"ok").await;

    let dirs = TestDirs::new();
    let config = Arc::new(test_config(&dirs, 1));
    let registry = Arc::new(Registry::new(config.status_timeout()));
    let pool = WorkerPool::start(config, registry.clone());

    registry.add(
        book(
            "fallback",
            vec![
                format!("{}/file", failing.uri()),
                format!("{}/file", working.uri()),
            ],
        ),
        0,
    );

    wait_for_status(
        &registry,
        "fallback",
        QueueStatus::Available,
        Duration::from_secs(10),
    )
    .await;
    pool.shutdown().await;

    let (info, _) = registry.book_with_status("fallback").unwrap();
    let path = info.download_path.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"ok");
}

#[tokio::test]
async fn cancelling_an_active_download_stops_it_and_leaves_no_file() {
    // 100 KB dripped a kilobyte at a time
    let url = start_drip_server(100 * 1024, 1024, Duration::from_millis(50)).await;

    let dirs = TestDirs::new();
    let config = Arc::new(test_config(&dirs, 1));
    let registry = Arc::new(Registry::new(config.status_timeout()));
    let pool = WorkerPool::start(config, registry.clone());

    registry.add(book("slow", vec![url]), 0);
    wait_for_status(
        &registry,
        "slow",
        QueueStatus::Downloading,
        Duration::from_secs(5),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(registry.cancel("slow"));
    wait_for_status(
        &registry,
        "slow",
        QueueStatus::Cancelled,
        Duration::from_secs(1),
    )
    .await;
    pool.shutdown().await;

    let final_path = dirs.ingest.path().join("slow.txt");
    assert!(!final_path.exists(), "no file may land after cancellation");
    assert!(
        std::fs::read_dir(dirs.tmp.path()).unwrap().next().is_none(),
        "temp file must be cleaned up"
    );
}

#[tokio::test]
async fn truncated_download_is_rejected() {
    // declares 100 KB but serves only 1000 bytes
    let server = MockServer::start().await;
    mount_file(&server, "/file", &vec![b'x'; 1000]).await;

    let dirs = TestDirs::new();
    let config = Arc::new(test_config(&dirs, 1));
    let fetcher = Fetcher::new(config.clone());

    let mut truncated = book("short", vec![format!("{}/file", server.uri())]);
    truncated.size = Some("100 KB".to_string());

    let err = fetcher
        .download_book(&truncated, &CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    match err {
        FetchError::Exhausted { tried, last } => {
            assert_eq!(tried, 1);
            assert!(last.contains("truncated"), "unexpected failure: {last}");
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }

    // via the pool, exhaustion becomes a terminal error status
    let registry = Arc::new(Registry::new(config.status_timeout()));
    let pool = WorkerPool::start(config, registry.clone());
    let mut again = book("short", vec![format!("{}/file", server.uri())]);
    again.size = Some("100 KB".to_string());
    registry.add(again, 0);
    wait_for_status(&registry, "short", QueueStatus::Error, Duration::from_secs(10)).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn html_login_wall_is_classified_distinctly() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html; charset=utf-8")
                .set_body_bytes(b"<html>please log in</html>".to_vec()),
        )
        .mount(&server)
        .await;

    let dirs = TestDirs::new();
    let fetcher = Fetcher::new(Arc::new(test_config(&dirs, 1)));

    let mut walled = book("walled", vec![format!("{}/file", server.uri())]);
    walled.size = Some("5 MB".to_string());

    let err = fetcher
        .download_book(&walled, &CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    match err {
        FetchError::Exhausted { last, .. } => {
            assert!(last.contains("HTML"), "unexpected failure: {last}");
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn reordered_queue_dispatches_new_front_first() {
    let registry = Registry::new(Duration::from_secs(3600));
    registry.add(book("a", vec![]), 10);
    registry.add(book("b", vec![]), 20);

    let priorities = HashMap::from([("a".to_string(), 5), ("b".to_string(), 1)]);
    assert!(registry.reorder(&priorities));

    let (first, _) = registry.get_next().expect("queue not empty");
    assert_eq!(first, "b");
}

#[tokio::test]
async fn progress_reaches_the_registry_and_is_monotonic() {
    let url = start_drip_server(20 * 1024, 1024, Duration::from_millis(20)).await;

    let dirs = TestDirs::new();
    let config = Arc::new(test_config(&dirs, 1));
    let registry = Arc::new(Registry::new(config.status_timeout()));
    let pool = WorkerPool::start(config, registry.clone());

    let mut sized = book("sized", vec![url]);
    sized.size = Some("20 KB".to_string());
    registry.add(sized, 0);

    wait_for_status(
        &registry,
        "sized",
        QueueStatus::Downloading,
        Duration::from_secs(5),
    )
    .await;

    let mut last_seen = 0.0f64;
    while registry
        .book_with_status("sized")
        .is_some_and(|(_, status)| status == QueueStatus::Downloading)
    {
        if let Some(progress) = registry.book("sized").and_then(|b| b.progress) {
            assert!(progress >= last_seen, "progress regressed: {last_seen} -> {progress}");
            assert!((0.0..=100.0).contains(&progress));
            last_seen = progress;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    wait_for_status(&registry, "sized", QueueStatus::Available, Duration::from_secs(10)).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn duplicate_title_does_not_overwrite_existing_book() {
    let server = MockServer::start().await;
    mount_file(&server, "/file", b"first edition").await;

    let dirs = TestDirs::new();
    let mut config = test_config(&dirs, 1);
    config.use_book_title = true;
    let fetcher = Fetcher::new(Arc::new(config));

    let mut first = book("id-one", vec![format!("{}/file", server.uri())]);
    first.title = "Same Title".to_string();
    let mut second = book("id-two", vec![format!("{}/file", server.uri())]);
    second.title = "Same Title".to_string();

    let token = CancellationToken::new();
    let path = fetcher.download_book(&first, &token, |_| {}).await.unwrap();
    assert_eq!(path, dirs.ingest.path().join("Same Title.txt"));

    let err = fetcher.download_book(&second, &token, |_| {}).await.unwrap_err();
    assert!(matches!(err, FetchError::Io { .. }), "got {err:?}");
    assert_eq!(std::fs::read(&path).unwrap(), b"first edition");
}

#[cfg(unix)]
#[tokio::test]
async fn custom_script_runs_against_the_temp_file() {
    use std::os::unix::fs::PermissionsExt;

    let server = MockServer::start().await;
    mount_file(&server, "/file", b"book bytes").await;

    let dirs = TestDirs::new();
    let script_path = dirs.tmp.path().join("hook.sh");
    std::fs::write(&script_path, "#!/bin/sh\ntouch \"$1.seen\"\n").unwrap();
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = test_config(&dirs, 1);
    config.custom_script = Some(script_path);
    let fetcher = Fetcher::new(Arc::new(config));

    let hooked = book("hooked", vec![format!("{}/file", server.uri())]);
    fetcher
        .download_book(&hooked, &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    let marker = dirs.tmp.path().join("hooked.txt.crdownload.seen");
    assert!(marker.exists(), "hook saw the temp path before publication");
}

#[tokio::test]
async fn idle_pool_shuts_down_promptly() {
    let dirs = TestDirs::new();
    let config = Arc::new(test_config(&dirs, 3));
    let registry = Arc::new(Registry::new(config.status_timeout()));
    let pool = WorkerPool::start(config, registry);

    tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
        .await
        .expect("shutdown must not hang");
}
