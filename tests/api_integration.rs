//! Integration tests for the HTTP API: envelope, authentication and the
//! entry lifecycle through HTTP.

mod support;

use std::time::Duration;

use datalink::api::{self, ADMIN_KEY_HEADER, TOKEN_HEADER};
use datalink::DataLinkService;
use reqwest::StatusCode;
use serde_json::{Value, json};
use support::{ADMIN_KEY, TestEnv, ready_env};

const ALICE_TOKEN: &str = "alice-token";

/// Serves the API on an ephemeral port and returns its base URL.
async fn serve(service: DataLinkService) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("listener has an address");
    tokio::spawn(async move {
        axum::serve(listener, api::router(service))
            .await
            .expect("server failed");
    });
    format!("http://{addr}")
}

async fn api_env(delay: Duration) -> (TestEnv, String) {
    let env = ready_env(delay).await;
    let tokens = env.dir.path().join("state/tokens");
    std::fs::create_dir_all(&tokens).unwrap();
    std::fs::write(tokens.join("alice.json"), json!({"token": ALICE_TOKEN}).to_string()).unwrap();
    let base = serve(env.service.clone()).await;
    (env, base)
}

async fn body(response: reqwest::Response) -> (StatusCode, Value) {
    let status = response.status();
    let value: Value = response.json().await.expect("body should be JSON");
    assert_eq!(value["code"], status.as_u16(), "code mirrors HTTP status: {value}");
    (status, value)
}

async fn wait_for_api_status(client: &reqwest::Client, url: &str, wanted: &str) -> Value {
    for _ in 0..200 {
        let (_, value) = body(
            client
                .get(url)
                .header(TOKEN_HEADER, ALICE_TOKEN)
                .send()
                .await
                .unwrap(),
        )
        .await;
        if value["data"]["status"] == wanted {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{url} never reached {wanted}");
}

#[tokio::test]
async fn test_sources_listing_and_unknown_source() {
    let (_env, base) = api_env(Duration::ZERO).await;
    let client = reqwest::Client::new();

    let (status, value) = body(client.get(format!("{base}/sources")).send().await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"][0]["name"], "irrmc");
    assert_eq!(value["data"][0]["status"], "completed");
    assert_eq!(value["data"][0]["entries"], 1);

    let (status, value) = body(client.get(format!("{base}/sources/nope")).send().await.unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(value["data"].is_null());

    let (status, value) =
        body(client.get(format!("{base}/sources/irrmc/catalog")).send().await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["entries"]["abc123"]["size"], 500_000);
}

#[tokio::test]
async fn test_search_by_pdb_and_legacy_path() {
    let (_env, base) = api_env(Duration::ZERO).await;
    let client = reqwest::Client::new();

    let (status, value) =
        body(client.get(format!("{base}/search?f=pdb&q=1ABC")).send().await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["results"][0]["id"], "abc123");
    assert_eq!(value["data"]["results"][0]["source"], "irrmc");

    let (status, value) = body(client.get(format!("{base}/search/1abc")).send().await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["results"].as_array().unwrap().len(), 1);

    let (status, _) = body(client.get(format!("{base}/search?f=title&q=x")).send().await.unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_entry_lifecycle_over_http() {
    let (_env, base) = api_env(Duration::ZERO).await;
    let client = reqwest::Client::new();
    let entry_url = format!("{base}/data/alice/irrmc/abc123");

    let (status, _) = body(client.put(&entry_url).send().await.unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = body(
        client
            .put(&entry_url)
            .header(TOKEN_HEADER, "wrong")
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, value) = body(
        client
            .put(&entry_url)
            .header(TOKEN_HEADER, ALICE_TOKEN)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["message"], "transfer started");

    let value = wait_for_api_status(&client, &entry_url, "completed").await;
    assert_eq!(value["data"]["size_s"], 500_000);
    assert_eq!(value["data"]["inUse"], false);

    let (status, _) = body(
        client
            .patch(&entry_url)
            .header(TOKEN_HEADER, ALICE_TOKEN)
            .body(r#"{"status": "failed"}"#)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, value) = body(
        client
            .patch(&entry_url)
            .header(TOKEN_HEADER, ALICE_TOKEN)
            .body(r#"{"inUse": true}"#)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["inUse"], true);

    let (status, value) = body(
        client
            .delete(&entry_url)
            .header(TOKEN_HEADER, ALICE_TOKEN)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{value}");

    let (status, _) = body(
        client
            .get(&entry_url)
            .header(TOKEN_HEADER, ALICE_TOKEN)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_key_scopes() {
    let (env, base) = api_env(Duration::ZERO).await;
    let client = reqwest::Client::new();
    env.service.fetch(&support::alice_key(), false).await.unwrap();

    let (status, _) = body(
        client
            .get(format!("{base}/data"))
            .header(TOKEN_HEADER, ALICE_TOKEN)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, value) = body(
        client
            .get(format!("{base}/data"))
            .header(ADMIN_KEY_HEADER, ADMIN_KEY)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(value["data"]["alice"]["irrmc"]["abc123"].is_object());

    let (status, _) = body(client.put(format!("{base}/sources/*/update")).send().await.unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, value) = body(
        client
            .put(format!("{base}/sources/*/update"))
            .header(ADMIN_KEY_HEADER, ADMIN_KEY)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"][0], "irrmc");
}

#[tokio::test]
async fn test_invalid_names_are_rejected() {
    let (_env, base) = api_env(Duration::ZERO).await;
    let client = reqwest::Client::new();

    let (status, _) = body(
        client
            .put(format!("{base}/data/alice/irrmc/..hidden"))
            .header(ADMIN_KEY_HEADER, ADMIN_KEY)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_multipart_upload_creates_completed_entry() {
    let (env, base) = api_env(Duration::ZERO).await;
    let client = reqwest::Client::new();
    let multipart = "--XBOUNDARY\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"model.pdb\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        ATOM 1\r\n\
        --XBOUNDARY--\r\n";

    let (status, value) = body(
        client
            .post(format!("{base}/data/alice/mydata/run1/upload"))
            .header(TOKEN_HEADER, ALICE_TOKEN)
            .header("content-type", "multipart/form-data; boundary=XBOUNDARY")
            .body(multipart)
            .send()
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{value}");
    assert_eq!(value["data"]["status"], "completed");
    let stored = env.data_dir().join("alice/mydata/run1/model.pdb");
    assert_eq!(std::fs::read_to_string(stored).unwrap(), "ATOM 1");
}

#[tokio::test]
async fn test_upload_without_multipart_body_gets_envelope() {
    let (env, base) = api_env(Duration::ZERO).await;
    let client = reqwest::Client::new();
    let url = format!("{base}/data/alice/mydata/run2/upload");

    let (status, _) = body(client.post(&url).body("ATOM 1").send().await.unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, value) = body(
        client
            .post(&url)
            .header(TOKEN_HEADER, ALICE_TOKEN)
            .header("content-type", "text/plain")
            .body("ATOM 1")
            .send()
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["data"].is_null());
    assert!(!env.data_dir().join("alice/mydata/run2").exists());
}

#[tokio::test]
async fn test_stats_counts_entries() {
    let (env, base) = api_env(Duration::from_secs(2)).await;
    let client = reqwest::Client::new();
    env.service.fetch(&support::alice_key(), false).await.unwrap();

    let (status, value) = body(client.get(format!("{base}/stats")).send().await.unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["entries"], 1);
    assert_eq!(value["data"]["users"], 1);
    assert_eq!(value["data"]["in_progress"], 1);
    assert_eq!(value["data"]["jobs"], 1);
}
