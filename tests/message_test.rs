use thrifty::{CompletionRequest, ContentBlock, Message, MessageContent, Role};

#[test]
fn test_message_constructors() {
    let sys = Message::system("You are helpful");
    assert!(matches!(sys.role, Role::System));
    assert!(sys.is_system());

    let user = Message::user("Hello");
    assert!(matches!(user.role, Role::User));

    let asst = Message::assistant("Hi there!");
    assert!(matches!(asst.role, Role::Assistant));
    assert!(!asst.is_system());
}

#[test]
fn test_message_content_text() {
    let msg = Message::user("test content");
    match &msg.content {
        MessageContent::Text(s) => assert_eq!(s, "test content"),
        MessageContent::Blocks(_) => panic!("expected plain text"),
    }
    assert_eq!(msg.content.char_len(), 12);
}

#[test]
fn test_block_text_skips_tool_use() {
    let msg = Message::blocks(
        Role::Assistant,
        vec![
            ContentBlock::Text {
                text: "looking it up".into(),
            },
            ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "search".into(),
                input: serde_json::json!({"q": "rust"}),
            },
            ContentBlock::ToolResult {
                tool_use_id: "call_1".into(),
                content: "3 results".into(),
            },
        ],
    );
    assert_eq!(msg.text(), "looking it up\n3 results");
    assert_eq!(msg.content.char_len(), msg.text().chars().count());
}

#[test]
fn test_char_len_counts_chars_not_bytes() {
    let msg = Message::user("错误怎么修复");
    assert_eq!(msg.content.char_len(), 6);
}

#[test]
fn test_plain_and_block_content_deserialise() {
    let plain: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
    assert_eq!(plain, Message::user("hi"));

    let blocks: Message = serde_json::from_str(
        r#"{"role":"user","content":[{"type":"text","text":"hi"},{"type":"tool_result","tool_use_id":"t","content":"ok"}]}"#,
    )
    .unwrap();
    assert!(matches!(blocks.content, MessageContent::Blocks(ref b) if b.len() == 2));
    assert_eq!(blocks.text(), "hi\nok");
}

#[test]
fn tool_input_key_order_does_not_change_the_request_key() {
    fn tool_call(input: serde_json::Value) -> CompletionRequest {
        CompletionRequest::new(
            "m1",
            vec![Message::blocks(
                Role::Assistant,
                vec![ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "search".into(),
                    input,
                }],
            )],
        )
    }

    let mut inner_a = serde_json::Map::new();
    inner_a.insert("lang".into(), "rust".into());
    inner_a.insert("limit".into(), 5.into());
    let mut a = serde_json::Map::new();
    a.insert("q".into(), "cache".into());
    a.insert("filters".into(), inner_a.into());

    let mut inner_b = serde_json::Map::new();
    inner_b.insert("limit".into(), 5.into());
    inner_b.insert("lang".into(), "rust".into());
    let mut b = serde_json::Map::new();
    b.insert("filters".into(), inner_b.into());
    b.insert("q".into(), "cache".into());

    let first = tool_call(a.into());
    let second = tool_call(b.into());
    assert_eq!(first, second);
    assert_eq!(first.cache_key(), second.cache_key());
    assert!(first.cache_key().is_some());

    let other = tool_call(serde_json::json!({
        "q": "cache",
        "filters": {"lang": "go", "limit": 5},
    }));
    assert_ne!(first.cache_key(), other.cache_key());
}
