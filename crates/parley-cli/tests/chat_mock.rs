use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mock_response(text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "model": "gpt-4o-mini",
        "choices": [
            {
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": "stop"
            }
        ],
        "usage": { "prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30 }
    })
}

#[tokio::test]
async fn test_chat_responds_and_exits_on_quit() {
    let mock_server = MockServer::start().await;
    let home = tempdir().unwrap();

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-api-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_response("Hello there!")))
        .expect(1)
        .mount(&mock_server)
        .await;

    cargo_bin_cmd!("parley")
        .env("PARLEY_HOME", home.path())
        .env("OPENAI_API_KEY", "test-api-key")
        .env("PARLEY_BASE_URL", format!("{}/v1", mock_server.uri()))
        .args(["chat", "--no-playback"])
        .write_stdin("hi\n:q\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Hello there!"))
        .stdout(predicate::str::contains("Goodbye!"));
}

#[tokio::test]
async fn test_chat_sends_history_on_follow_up() {
    let mock_server = MockServer::start().await;
    let home = tempdir().unwrap();

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({
            "messages": [
                { "role": "system", "content": "Answer tersely." },
                { "role": "user", "content": "first" },
                { "role": "assistant", "content": "One." },
                { "role": "user", "content": "second" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_response("Two.")))
        .expect(1)
        .named("follow_up")
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_response("One.")))
        .expect(1)
        .named("first_message")
        .mount(&mock_server)
        .await;

    cargo_bin_cmd!("parley")
        .env("PARLEY_HOME", home.path())
        .env("OPENAI_API_KEY", "test-api-key")
        .env("PARLEY_BASE_URL", format!("{}/v1", mock_server.uri()))
        .args(["chat", "--no-playback", "--system", "Answer tersely."])
        .write_stdin("first\nsecond\n:q\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("One."))
        .stdout(predicate::str::contains("Two."));
}

#[tokio::test]
async fn test_chat_playback_prints_full_reply() {
    let mock_server = MockServer::start().await;
    let home = tempdir().unwrap();
    std::fs::write(
        home.path().join("config.toml"),
        "[playback]\nchunk_size = 3\ninterval_ms = 1\n",
    )
    .unwrap();

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(mock_response("Typed out a few characters at a time.")),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    cargo_bin_cmd!("parley")
        .env("PARLEY_HOME", home.path())
        .env("OPENAI_API_KEY", "test-api-key")
        .env("PARLEY_BASE_URL", format!("{}/v1", mock_server.uri()))
        .args(["chat"])
        .write_stdin("go\n:q\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Typed out a few characters at a time."));
}

#[tokio::test]
async fn test_chat_org_mode_converts_reply() {
    let mock_server = MockServer::start().await;
    let home = tempdir().unwrap();

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(mock_response("Run `make` **now**.")),
        )
        .mount(&mock_server)
        .await;

    cargo_bin_cmd!("parley")
        .env("PARLEY_HOME", home.path())
        .env("OPENAI_API_KEY", "test-api-key")
        .env("PARLEY_BASE_URL", format!("{}/v1", mock_server.uri()))
        .args(["chat", "--no-playback", "--mode", "org"])
        .write_stdin("build?\n:q\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Run =make= *now*."));
}

#[tokio::test]
async fn test_chat_reports_http_failure() {
    let mock_server = MockServer::start().await;
    let home = tempdir().unwrap();

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    cargo_bin_cmd!("parley")
        .env("PARLEY_HOME", home.path())
        .env("OPENAI_API_KEY", "bad-key")
        .env("PARLEY_BASE_URL", format!("{}/v1", mock_server.uri()))
        .args(["chat", "--no-playback"])
        .write_stdin("hi\n:show\n:q\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("401 Unauthorized"))
        .stdout(predicate::str::contains("hi"));
}

#[tokio::test]
async fn test_chat_without_key_fails_before_request() {
    let mock_server = MockServer::start().await;
    let home = tempdir().unwrap();

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_response("never")))
        .expect(0)
        .mount(&mock_server)
        .await;

    cargo_bin_cmd!("parley")
        .env("PARLEY_HOME", home.path())
        .env_remove("OPENAI_API_KEY")
        .env("PARLEY_BASE_URL", format!("{}/v1", mock_server.uri()))
        .args(["chat", "--no-playback"])
        .write_stdin("hi\n:status\n:q\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("No API key available"))
        .stdout(predicate::str::contains("failed"));
}

#[tokio::test]
async fn test_chat_undo_removes_reply() {
    let mock_server = MockServer::start().await;
    let home = tempdir().unwrap();

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_response("Removable.")))
        .mount(&mock_server)
        .await;

    cargo_bin_cmd!("parley")
        .env("PARLEY_HOME", home.path())
        .env("OPENAI_API_KEY", "test-api-key")
        .env("PARLEY_BASE_URL", format!("{}/v1", mock_server.uri()))
        .args(["chat", "--no-playback"])
        .write_stdin("ask\n:undo\n:undo\n:undo\n:q\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Undone."))
        .stdout(predicate::str::contains("Nothing to undo."));
}
