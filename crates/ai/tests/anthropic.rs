use ai::provider::{
    AnthropicProvider, CompletionProvider, CompletionRequest, ContentBlock, Message,
};
use postmate_core::error::PostmateError;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> AnthropicProvider {
    AnthropicProvider::new("test-key".into(), server.uri(), Duration::from_secs(5)).unwrap()
}

fn request() -> CompletionRequest {
    CompletionRequest {
        model: "claude-opus-4-1".into(),
        system: "You answer mail.".into(),
        messages: vec![Message::user_text("Where is my order?")],
        tools: vec![],
        capabilities: vec![],
        max_tokens: 8000,
        container_id: None,
    }
}

#[tokio::test]
async fn parses_text_and_tool_use_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "claude-opus-4-1",
            "stop_reason": "tool_use",
            "container": {"id": "cont_1"},
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "tu_1", "name": "order_status", "input": {"orderId": "42"}},
                {"type": "server_tool_use", "id": "srv_1", "name": "web_search", "input": {}}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5}
        })))
        .mount(&server)
        .await;

    let response = provider(&server).complete(request()).await.unwrap();
    assert_eq!(response.content.len(), 3);
    assert!(matches!(response.content[2], ContentBlock::Other(_)));
    assert_eq!(response.tool_uses()[0].input["orderId"], "42");
    assert_eq!(response.container_id.as_deref(), Some("cont_1"));
    assert_eq!(response.usage.output_tokens, 5);
}

#[tokio::test]
async fn status_529_is_overloaded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        })))
        .mount(&server)
        .await;

    let err = provider(&server).complete(request()).await.unwrap_err();
    assert!(matches!(err, PostmateError::Overloaded(_)));
}

#[tokio::test]
async fn other_errors_are_not_overload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let err = provider(&server).complete(request()).await.unwrap_err();
    assert!(matches!(err, PostmateError::AI(_)));
}

#[tokio::test]
async fn downloads_file_under_its_reported_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/files/file_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "file_1",
            "filename": "../../offer.pdf"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/files/file_1/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let path = provider(&server)
        .download_file("file_1", dir.path())
        .await
        .unwrap();

    assert_eq!(path, dir.path().join("offer.pdf"));
    assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-1.7");
}
