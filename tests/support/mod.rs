//! Shared fixtures for integration tests: a listing connector served by a
//! mock server and a service rooted in a temporary directory.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use datalink::{DataEntry, DataLinkService, EntryKey, EntryStatus, ServiceConfig, SourceSettings};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Admin key configured for every test service.
pub const ADMIN_KEY: &str = "test-admin-key";

/// Size declared by the listing for `abc123`.
pub const DECLARED_SIZE: u64 = 500_000;

/// Body served for `abc123.dat`.
pub fn dataset_body() -> Vec<u8> {
    (0..4096u32).map(|i| (i % 251) as u8).collect()
}

/// One listing page with a single dataset `abc123`.
pub fn listing_page() -> String {
    format!(
        r#"<table>
<tr class="dataset" data-id="abc123" data-size="{DECLARED_SIZE}">
  <td><a href="/p/1abc/">1ABC</a></td>
  <td class="description">Lysozyme native</td>
  <td><a href="/files/abc123.dat">Download</a></td>
</tr>
</table>
<span class="pages">Page 1 of 1</span>"#
    )
}

/// Test environment; keep it alive for the duration of the test.
pub struct TestEnv {
    pub dir: TempDir,
    pub server: MockServer,
    pub service: DataLinkService,
}

impl TestEnv {
    /// Data root of the service.
    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }
}

/// Mounts the listing page on `server`.
pub async fn mount_listing(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/datasets/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page()))
        .mount(server)
        .await;
}

/// Mounts the dataset file, answering after `delay`.
pub async fn mount_dataset(server: &MockServer, delay: Duration) {
    Mock::given(method("GET"))
        .and(path("/files/abc123.dat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(dataset_body())
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

/// Config with only the listing connector enabled, pointed at `server`.
pub fn config_for(server: &MockServer, root: &std::path::Path) -> ServiceConfig {
    let mut sources = BTreeMap::new();
    sources.insert(
        "irrmc".to_string(),
        SourceSettings {
            base_url: Some(format!("{}/datasets/", server.uri())),
            politeness_delay_ms: Some(0),
            ..SourceSettings::default()
        },
    );
    for disabled in ["sbgrid", "zenodo"] {
        sources.insert(
            disabled.to_string(),
            SourceSettings {
                enabled: false,
                ..SourceSettings::default()
            },
        );
    }
    ServiceConfig {
        data_dir: root.join("data"),
        state_dir: root.join("state"),
        admin_key: Some(ADMIN_KEY.to_string()),
        min_free_gb: 0,
        max_age_days: 0,
        upload_enabled: true,
        catalog_wait_secs: 5,
        connect_timeout_secs: 5,
        read_timeout_secs: 10,
        pdb_metadata_url: format!("{}/rcsb/entry", server.uri()),
        sources,
        ..ServiceConfig::default()
    }
}

/// Opens a service whose listing connector already has its catalog.
pub async fn ready_env(dataset_delay: Duration) -> TestEnv {
    let server = MockServer::start().await;
    mount_listing(&server).await;
    mount_dataset(&server, dataset_delay).await;
    let dir = TempDir::new().expect("failed to create temp dir");
    let service = DataLinkService::open(config_for(&server, dir.path()))
        .await
        .expect("service should open");
    service
        .sources()
        .get("irrmc")
        .expect("irrmc should be registered")
        .refresh()
        .await
        .expect("catalog refresh should succeed");
    TestEnv {
        dir,
        server,
        service,
    }
}

/// The `alice/irrmc/abc123` key.
pub fn alice_key() -> EntryKey {
    EntryKey::new("alice", "irrmc", "abc123").expect("valid key")
}

/// Polls until the entry reaches `status` and no job remains, or panics.
pub async fn wait_for_status(service: &DataLinkService, key: &EntryKey, status: EntryStatus) -> DataEntry {
    for _ in 0..200 {
        if let Some(entry) = service.catalog().get_entry(key)
            && entry.status == status
            && !service.has_job(key)
        {
            return entry;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "entry {key} never reached {status}: {:?}",
        service.catalog().get_entry(key)
    );
}
