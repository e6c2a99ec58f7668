mod common;

use common::{updater, upgrade_payload, CountingRebooter, MockFetcher};
use device_agent::firmware::{UpdateError, UpdateOutcome};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const OLD_IMAGE: &[u8] = b"print('v1')\n";
const NEW_IMAGE: &[u8] = b"print('v2')\n";

fn device_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("app.py"), OLD_IMAGE).unwrap();
    dir
}

#[tokio::test]
async fn successful_update_archives_installs_and_reboots() {
    let dir = device_dir();
    let archive = dir.path().join("archive");
    fs::create_dir(&archive).unwrap();
    for slot in [0, 3, 7] {
        fs::write(archive.join(format!("app.py.{}", slot)), b"older").unwrap();
    }

    let fetcher = MockFetcher::new(200, NEW_IMAGE);
    let rebooter = Arc::new(CountingRebooter::default());
    let updater = updater(dir.path(), fetcher.clone(), rebooter.clone());

    let outcome = updater
        .handle(&upgrade_payload("https://example.com/fw.bin"))
        .await;

    match outcome {
        UpdateOutcome::Installed { archived } => {
            assert_eq!(archived, archive.join("app.py.8"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(fs::read(archive.join("app.py.8")).unwrap(), OLD_IMAGE);
    assert_eq!(fs::read(archive.join("app.py.7")).unwrap(), b"older");
    assert_eq!(fs::read(dir.path().join("app.py")).unwrap(), NEW_IMAGE);
    assert!(!dir.path().join("app.py.download").exists());
    assert_eq!(fetcher.requested(), vec!["https://example.com/fw.bin"]);
    assert_eq!(rebooter.count(), 1);
}

#[tokio::test]
async fn first_update_creates_archive_dir_at_slot_zero() {
    let dir = device_dir();
    let rebooter = Arc::new(CountingRebooter::default());
    let updater = updater(dir.path(), MockFetcher::new(200, NEW_IMAGE), rebooter.clone());

    let outcome = updater
        .handle(&upgrade_payload("http://localhost/fw.bin"))
        .await;

    assert!(outcome.is_installed());
    assert_eq!(
        fs::read(dir.path().join("archive").join("app.py.0")).unwrap(),
        OLD_IMAGE
    );
}

#[tokio::test]
async fn http_error_leaves_running_image_alone() {
    let dir = device_dir();
    let archive = dir.path().join("archive");
    fs::create_dir(&archive).unwrap();
    fs::write(archive.join("app.py.0"), b"older").unwrap();

    let rebooter = Arc::new(CountingRebooter::default());
    let updater = updater(dir.path(), MockFetcher::new(404, b"not found"), rebooter.clone());

    let outcome = updater
        .handle(&upgrade_payload("https://example.com/fw.bin"))
        .await;

    assert!(matches!(
        outcome,
        UpdateOutcome::Aborted(UpdateError::HttpStatus(404))
    ));
    assert_eq!(fs::read(dir.path().join("app.py")).unwrap(), OLD_IMAGE);
    assert_eq!(fs::read(archive.join("app.py.0")).unwrap(), b"older");
    assert_eq!(fs::read(archive.join("app.py.1")).unwrap(), OLD_IMAGE);
    assert_eq!(rebooter.count(), 0);
}

#[tokio::test]
async fn invalid_url_aborts_before_any_io() {
    let dir = device_dir();
    let fetcher = MockFetcher::new(200, NEW_IMAGE);
    let rebooter = Arc::new(CountingRebooter::default());
    let updater = updater(dir.path(), fetcher.clone(), rebooter.clone());

    let outcome = updater.handle(&upgrade_payload("ftp://x.com/fw.bin")).await;

    assert!(matches!(
        outcome,
        UpdateOutcome::Aborted(UpdateError::InvalidUrl(_))
    ));
    assert!(!dir.path().join("archive").exists());
    assert!(fetcher.requested().is_empty());
    assert_eq!(rebooter.count(), 0);
}

#[tokio::test]
async fn malformed_request_is_a_parse_error() {
    let dir = device_dir();
    let fetcher = MockFetcher::new(200, NEW_IMAGE);
    let rebooter = Arc::new(CountingRebooter::default());
    let updater = updater(dir.path(), fetcher.clone(), rebooter.clone());

    let payloads: [&[u8]; 3] = [b"{not json", br#"{"d":{"upgrade":{}}}"#, br#"{"d":{}}"#];
    for payload in payloads {
        let outcome = updater.handle(payload).await;
        assert!(matches!(outcome, UpdateOutcome::Aborted(UpdateError::Parse(_))));
    }
    assert!(!dir.path().join("archive").exists());
    assert!(fetcher.requested().is_empty());
}

#[tokio::test]
async fn missing_application_image_fails_archiving() {
    let dir = TempDir::new().unwrap();
    let fetcher = MockFetcher::new(200, NEW_IMAGE);
    let rebooter = Arc::new(CountingRebooter::default());
    let updater = updater(dir.path(), fetcher.clone(), rebooter.clone());

    let outcome = updater
        .handle(&upgrade_payload("https://example.com/fw.bin"))
        .await;

    assert!(matches!(outcome, UpdateOutcome::Aborted(UpdateError::Archive(_))));
    assert!(!dir.path().join("archive").join("app.py.0").exists());
    assert!(fetcher.requested().is_empty());
    assert!(!dir.path().join("app.py").exists());
}
