//! Coordinator startup against a mock ingestion endpoint

use std::path::Path;
use std::sync::Arc;

use crashrelay_core::config::{Config, ConfigBuilder, CrashLayout};
use crashrelay_core::domain::{Attachment, Dsn, ItemKind, Session, SessionStatus};
use crashrelay_delivery::{Coordinator, HttpTransport};
use wiremock::MockServer;

use crate::common;

fn config(server: &MockServer, dir: &Path) -> Config {
    ConfigBuilder::new()
        .dsn(common::dsn_for(server))
        .release("app@2.0.0")
        .cache_dir(dir.join("cache"))
        .crashes_dir(dir.join("crashes"))
        .crash_layout(CrashLayout::Breakpad)
        .minidump_settle_ms(0)
        .build()
}

async fn coordinator(server: &MockServer, dir: &Path) -> Arc<Coordinator> {
    let config = config(server, dir);
    let dsn = Dsn::parse(config.dsn.as_deref().unwrap()).unwrap();
    let transport = Arc::new(HttpTransport::new(&dsn).unwrap());
    Coordinator::from_config(&config, Arc::new(common::EmptyHost), Some(transport)).await
}

#[tokio::test]
async fn test_startup_reports_dump_and_crashed_session() {
    let server = MockServer::start().await;
    common::mount_envelope_status(&server, 200).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("crashes")).unwrap();

    // first run leaves an `ok` session behind
    coordinator(&server, dir.path()).await.startup().await.unwrap();

    let mut dump = b"MDMP".to_vec();
    dump.resize(10_000, 0);
    std::fs::write(dir.path().join("crashes/previous.dmp"), dump).unwrap();

    let second = coordinator(&server, dir.path()).await;
    second.startup().await.unwrap();

    let received = common::received_envelopes(&server).await;
    assert_eq!(received.len(), 2);

    let crash = &received[0];
    let event = crash.items[0].payload_json().unwrap();
    assert_eq!(event["level"], "fatal");
    assert_eq!(event["platform"], "native");
    assert_eq!(event["release"], "app@2.0.0");
    let attachment = crash
        .items
        .iter()
        .find(|i| i.kind() == ItemKind::Attachment)
        .expect("minidump attachment");
    assert_eq!(
        attachment.header.extra["attachment_type"],
        Attachment::MINIDUMP
    );

    let session: Session =
        serde_json::from_value(received[1].items[0].payload_json().unwrap()).unwrap();
    assert_eq!(session.status, SessionStatus::Crashed);
    assert_eq!(session.errors, 1);

    assert!(!dir.path().join("crashes/previous.dmp").exists());
    assert_eq!(
        second.sessions().current().await.unwrap().status,
        SessionStatus::Ok
    );
}

#[tokio::test]
async fn test_startup_while_offline_queues_session() {
    let server = MockServer::start().await;
    common::mount_envelope_status(&server, 503).await;
    let dir = tempfile::tempdir().unwrap();

    coordinator(&server, dir.path()).await.startup().await.unwrap();
    let second = coordinator(&server, dir.path()).await;
    second.startup().await.unwrap();

    assert_eq!(second.delivery().queue().len().await, 1);
    let queued = second.delivery().queue().pop().await.unwrap();
    assert_eq!(queued.items[0].kind(), ItemKind::Session);
}
