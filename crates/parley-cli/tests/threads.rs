//! Integration tests for `parley threads`.


use assert_cmd::cargo::cargo_bin_cmd;
use fixtures::can_bind_localhost;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn parley(home: &TempDir, server: &MockServer) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("parley");
    cmd.env("PARLEY_HOME", home.path())
        .env("PARLEY_BASE_URL", server.uri())
        .env("PARLEY_SESSION_TOKEN", "test-token");
    cmd
}

#[tokio::test]
async fn test_threads_list_prints_each_thread() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/threads"))
        .and(header("cookie", "session=test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "id": "t-1",
                "projectId": 4,
                "createdAt": "2024-05-01T09:00:00Z",
                "updatedAt": "2024-05-02T10:30:00Z"
            },
            {
                "id": "t-2",
                "createdAt": "2024-05-03T09:00:00Z",
                "updatedAt": "2024-05-03T09:00:00Z"
            }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    parley(&home, &server)
        .args(["threads", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("t-1  4  2024-05-02 10:30"))
        .stdout(predicate::str::contains("t-2  -  2024-05-03 09:00"));
}

#[tokio::test]
async fn test_threads_list_empty() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/threads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    parley(&home, &server)
        .args(["threads", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No threads found."));
}

#[tokio::test]
async fn test_threads_list_unauthorized_exits_2() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/threads"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    parley(&home, &server)
        .args(["threads", "list"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unauthorized"))
        .stderr(predicate::str::contains("Sign in again"));
}

#[tokio::test]
async fn test_threads_delete() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api/threads/t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(1)
        .mount(&server)
        .await;

    parley(&home, &server)
        .args(["threads", "delete", "t-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted thread t-1"));
}

#[tokio::test]
async fn test_threads_delete_missing_thread_fails() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api/threads/t-gone"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": false })))
        .mount(&server)
        .await;

    parley(&home, &server)
        .args(["threads", "delete", "t-gone"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("delete thread 't-gone'"))
        .stderr(predicate::str::contains("refused to delete"));
}
