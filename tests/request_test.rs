use crate::common::{
    FakeConfig, SAMPLE_PROJECT, TestWorkspace, rust_definition, setup_context, setup_session,
};
use kadabra_lsp::config::TimeoutKind;
use kadabra_lsp::error::LspError;
use kadabra_lsp::lsp::{FileChangeType, LocalEdit, Position, RequestStats, ServerWrapper, Url};
use kadabra_lsp::settings::ServerConfiguration;
use serde_json::{Value, json};
use std::sync::Arc;

/// Waits for the client's answer to the server request `id`.
async fn reply_to(server: &crate::common::FakeServer, id: &str) -> Value {
    server
        .wait_for(|m| m["id"] == id && m.get("method").is_none())
        .await
}

#[tokio::test]
async fn test_hover_returns_result_and_counts_success() {
    let (workspace, _server, _recorder, wrapper) = setup_session(FakeConfig::default());
    let uri = workspace.uri("src/main.rs");
    wrapper
        .connect(uri.clone(), workspace.text("src/main.rs"))
        .await
        .unwrap();

    let (_, line, character) = workspace.fixture.cursor.clone().unwrap();
    let hover = wrapper
        .hover(&uri, Position::new(line, character))
        .await
        .unwrap()
        .expect("fake server always hovers");
    assert_eq!(
        serde_json::to_value(&hover.contents).unwrap(),
        json!("fake hover")
    );

    let stats = wrapper.stats();
    assert_eq!(
        stats.get(&TimeoutKind::Hover),
        Some(&RequestStats {
            succeeded: 1,
            timed_out: 0
        })
    );
    assert!(!stats.contains_key(&TimeoutKind::Definition));

    wrapper.shutdown().await;
}

#[tokio::test]
async fn test_timeout_discards_late_response() {
    let mut config = FakeConfig::default();
    config.unanswered.insert("textDocument/hover".to_string());
    let (workspace, server, _recorder, wrapper) = setup_session(config);
    let uri = workspace.uri("src/main.rs");
    wrapper
        .connect(uri.clone(), workspace.text("src/main.rs"))
        .await
        .unwrap();

    let err = wrapper.hover(&uri, Position::new(0, 0)).await.unwrap_err();
    assert!(matches!(err, LspError::Timeout { ref method, .. } if method == "textDocument/hover"));

    let request = server.wait_for_method("textDocument/hover").await;
    assert!(request["id"].is_number());

    // The answer arrives after the deadline and is dropped.
    server.send(json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "result": { "contents": "too late" }
    }));

    server.configure(|config| config.unanswered.clear());
    assert!(wrapper.hover(&uri, Position::new(0, 0)).await.unwrap().is_some());

    assert_eq!(
        wrapper.stats().get(&TimeoutKind::Hover),
        Some(&RequestStats {
            succeeded: 1,
            timed_out: 1
        })
    );
    assert_eq!(wrapper.status(), kadabra_lsp::lsp::ServerStatus::Started);

    wrapper.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_capability_not_sent_until_registered() {
    let (workspace, server, _recorder, wrapper) = setup_session(FakeConfig::default());
    let uri = workspace.uri("src/lib.rs");
    wrapper
        .connect(uri.clone(), workspace.text("src/lib.rs"))
        .await
        .unwrap();

    let err = wrapper
        .references(&uri, Position::new(0, 7), true)
        .await
        .unwrap_err();
    assert!(matches!(err, LspError::CapabilityNotSupported(_)));
    assert!(server.messages("textDocument/references").is_empty());

    server.request(
        "reg-1",
        "client/registerCapability",
        json!({
            "registrations": [{ "id": "refs", "method": "textDocument/references" }]
        }),
    );
    assert_eq!(reply_to(&server, "reg-1").await["result"], Value::Null);

    let references = wrapper
        .references(&uri, Position::new(0, 7), true)
        .await
        .unwrap();
    assert!(references.is_none());
    assert_eq!(server.messages("textDocument/references").len(), 1);

    server.request(
        "unreg-1",
        "client/unregisterCapability",
        json!({ "unregisterations": [{ "id": "refs", "method": "textDocument/references" }] }),
    );
    reply_to(&server, "unreg-1").await;
    assert!(matches!(
        wrapper.references(&uri, Position::new(0, 7), true).await,
        Err(LspError::CapabilityNotSupported(_))
    ));

    wrapper.shutdown().await;
}

#[tokio::test]
async fn test_watched_files_follow_registrations() {
    let (workspace, server, _recorder, wrapper) = setup_session(FakeConfig::default());
    wrapper.start().await.unwrap();

    let manifest = workspace.file("Cargo.toml");
    assert!(!wrapper
        .notify_file_changed(&manifest, FileChangeType::CHANGED)
        .unwrap());

    server.request(
        "watch-1",
        "client/registerCapability",
        json!({
            "registrations": [{
                "id": "manifests",
                "method": "workspace/didChangeWatchedFiles",
                "registerOptions": {
                    "watchers": [{ "globPattern": "**/*.toml", "kind": 2 }]
                }
            }]
        }),
    );
    reply_to(&server, "watch-1").await;

    assert!(wrapper
        .notify_file_changed(&manifest, FileChangeType::CHANGED)
        .unwrap());
    assert!(!wrapper
        .notify_file_changed(&manifest, FileChangeType::CREATED)
        .unwrap());
    assert!(!wrapper
        .notify_file_changed(&workspace.file("src/lib.rs"), FileChangeType::CHANGED)
        .unwrap());

    let event = server
        .wait_for_method("workspace/didChangeWatchedFiles")
        .await;
    assert_eq!(
        event["params"]["changes"],
        json!([{ "uri": Url::from_file_path(&manifest).unwrap(), "type": 2 }])
    );
    assert_eq!(server.messages("workspace/didChangeWatchedFiles").len(), 1);

    // Registrations do not survive a restart.
    wrapper.restart().await.unwrap();
    assert!(!wrapper
        .notify_file_changed(&manifest, FileChangeType::CHANGED)
        .unwrap());

    wrapper.shutdown().await;
}

#[tokio::test]
async fn test_configuration_served_from_settings() {
    let workspace = TestWorkspace::new(SAMPLE_PROJECT);
    let settings = ServerConfiguration::parse(
        r#"{
            "rust-analyzer": { "checkOnSave": true, "cargo": { "features": ["a"] } },
            "initializationOptions": { "lens": false }
        }"#,
    )
    .unwrap();
    let (server, _recorder, context) = setup_context(FakeConfig::default());
    let wrapper = ServerWrapper::new(
        rust_definition(),
        workspace.path(),
        context.with_config(Arc::new(settings)),
    )
    .unwrap();
    wrapper.start().await.unwrap();

    let initialize = server.wait_for_method("initialize").await;
    assert_eq!(
        initialize["params"]["initializationOptions"],
        json!({ "lens": false })
    );
    let pushed = server
        .wait_for_method("workspace/didChangeConfiguration")
        .await;
    assert_eq!(
        pushed["params"]["settings"]["rust-analyzer"]["checkOnSave"],
        json!(true)
    );

    server.request(
        "cfg-1",
        "workspace/configuration",
        json!({
            "items": [
                { "section": "rust-analyzer" },
                { "section": "rust-analyzer.cargo", "scopeUri": workspace.uri("src/lib.rs") },
                { "section": "missing" }
            ]
        }),
    );
    let reply = reply_to(&server, "cfg-1").await;
    assert_eq!(
        reply["result"],
        json!([
            { "checkOnSave": true, "cargo": { "features": ["a"] } },
            { "features": ["a"] },
            null
        ])
    );

    wrapper.shutdown().await;
}

#[tokio::test]
async fn test_workspace_folders_and_unknown_requests() {
    let (workspace, server, _recorder, wrapper) = setup_session(FakeConfig::default());
    wrapper.start().await.unwrap();

    server.request("folders-1", "workspace/workspaceFolders", Value::Null);
    let folders = reply_to(&server, "folders-1").await;
    assert_eq!(
        folders["result"][0]["uri"],
        Url::from_directory_path(workspace.path()).unwrap().as_str()
    );

    server.request("progress-1", "window/workDoneProgress/create", json!({ "token": 1 }));
    assert_eq!(reply_to(&server, "progress-1").await["result"], Value::Null);

    server.request("odd-1", "custom/unknown", json!({}));
    let unknown = reply_to(&server, "odd-1").await;
    assert_eq!(unknown["error"]["code"], -32601);

    server.request("bad-1", "workspace/configuration", json!({ "items": 3 }));
    let invalid = reply_to(&server, "bad-1").await;
    assert_eq!(invalid["error"]["code"], -32602);

    wrapper.shutdown().await;
}

#[tokio::test]
async fn test_apply_edit_updates_open_documents() {
    let (workspace, server, recorder, wrapper) = setup_session(FakeConfig::default());
    let uri = workspace.uri("src/lib.rs");
    let doc = wrapper.connect(uri.clone(), "fn a() {}\n").await.unwrap();

    server.request(
        "edit-1",
        "workspace/applyEdit",
        json!({
            "edit": {
                "changes": {
                    uri.as_str(): [{
                        "range": {
                            "start": { "line": 0, "character": 3 },
                            "end": { "line": 0, "character": 4 }
                        },
                        "newText": "renamed"
                    }]
                }
            }
        }),
    );
    let reply = reply_to(&server, "edit-1").await;
    assert_eq!(reply["result"]["applied"], true);
    assert_eq!(doc.text(), "fn renamed() {}\n");
    assert_eq!(
        *recorder.edits.lock(),
        vec![(uri.clone(), vec![LocalEdit::replace(3, 4, "renamed")])]
    );

    // Unknown documents reject the whole edit.
    server.request(
        "edit-2",
        "workspace/applyEdit",
        json!({
            "edit": {
                "changes": {
                    uri.as_str(): [{
                        "range": {
                            "start": { "line": 0, "character": 0 },
                            "end": { "line": 0, "character": 2 }
                        },
                        "newText": "pub fn"
                    }],
                    workspace.uri("src/main.rs").as_str(): []
                }
            }
        }),
    );
    let rejected = reply_to(&server, "edit-2").await;
    assert_eq!(rejected["result"]["applied"], false);
    assert_eq!(doc.text(), "fn renamed() {}\n");

    // Edits computed for an old version are refused.
    assert!(doc.flush().unwrap());
    server.request(
        "edit-3",
        "workspace/applyEdit",
        json!({
            "edit": {
                "documentChanges": [{
                    "textDocument": { "uri": uri, "version": 0 },
                    "edits": [{
                        "range": {
                            "start": { "line": 0, "character": 0 },
                            "end": { "line": 0, "character": 0 }
                        },
                        "newText": "// stale\n"
                    }]
                }]
            }
        }),
    );
    let stale = reply_to(&server, "edit-3").await;
    assert_eq!(stale["result"]["applied"], false);
    assert_eq!(doc.text(), "fn renamed() {}\n");

    wrapper.shutdown().await;
}

#[tokio::test]
async fn test_apply_edit_merges_document_changes() {
    let (workspace, server, recorder, wrapper) = setup_session(FakeConfig::default());
    let uri = workspace.uri("src/lib.rs");
    let doc = wrapper.connect(uri.clone(), "abc\n").await.unwrap();
    let insert = |character: u32, text: &str| {
        json!({
            "range": {
                "start": { "line": 0, "character": character },
                "end": { "line": 0, "character": character }
            },
            "newText": text
        })
    };

    // Two groups for the same document at the same version apply as one.
    server.request(
        "merge-1",
        "workspace/applyEdit",
        json!({
            "edit": {
                "documentChanges": [
                    { "textDocument": { "uri": uri, "version": 0 }, "edits": [insert(0, "X")] },
                    { "textDocument": { "uri": uri, "version": 0 }, "edits": [insert(3, "Y")] }
                ],
                "changes": { uri.as_str(): [insert(1, "ignored")] }
            }
        }),
    );
    let reply = reply_to(&server, "merge-1").await;
    assert_eq!(reply["result"]["applied"], true);
    assert_eq!(doc.text(), "XabcY\n");
    assert_eq!(
        *recorder.edits.lock(),
        vec![(
            uri.clone(),
            vec![LocalEdit::insert(3, "Y"), LocalEdit::insert(0, "X")]
        )]
    );

    // Overlapping groups are refused without touching the text.
    let replace = |start: u32, end: u32, text: &str| {
        json!({
            "range": {
                "start": { "line": 0, "character": start },
                "end": { "line": 0, "character": end }
            },
            "newText": text
        })
    };
    server.request(
        "merge-2",
        "workspace/applyEdit",
        json!({
            "edit": {
                "documentChanges": [
                    { "textDocument": { "uri": uri, "version": null }, "edits": [replace(0, 3, "Q")] },
                    { "textDocument": { "uri": uri, "version": null }, "edits": [replace(2, 4, "R")] }
                ]
            }
        }),
    );
    let reply = reply_to(&server, "merge-2").await;
    assert_eq!(reply["result"]["applied"], false);
    assert_eq!(doc.text(), "XabcY\n");
    assert_eq!(recorder.edits.lock().len(), 1);

    wrapper.shutdown().await;
}

#[tokio::test]
async fn test_capability_kept_while_another_registration_covers_it() {
    let (workspace, server, _recorder, wrapper) = setup_session(FakeConfig::default());
    let uri = workspace.uri("src/lib.rs");
    wrapper
        .connect(uri.clone(), workspace.text("src/lib.rs"))
        .await
        .unwrap();

    server.request(
        "reg-1",
        "client/registerCapability",
        json!({
            "registrations": [
                { "id": "refs-a", "method": "textDocument/references" },
                { "id": "refs-b", "method": "textDocument/references" }
            ]
        }),
    );
    reply_to(&server, "reg-1").await;

    server.request(
        "unreg-1",
        "client/unregisterCapability",
        json!({ "unregisterations": [{ "id": "refs-a", "method": "textDocument/references" }] }),
    );
    reply_to(&server, "unreg-1").await;
    assert!(wrapper.references(&uri, Position::new(0, 7), true).await.is_ok());

    server.request(
        "unreg-2",
        "client/unregisterCapability",
        json!({ "unregisterations": [{ "id": "refs-b", "method": "textDocument/references" }] }),
    );
    reply_to(&server, "unreg-2").await;
    assert!(matches!(
        wrapper.references(&uri, Position::new(0, 7), true).await,
        Err(LspError::CapabilityNotSupported(_))
    ));

    wrapper.shutdown().await;
}
