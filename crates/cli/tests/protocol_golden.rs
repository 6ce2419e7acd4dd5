//! Golden vector compatibility test for v1 protocol.
//!
//! Ensures the dealgrid-protocol types can deserialize the frozen v1 wire
//! format. If this test fails, the protocol types have drifted from the
//! canonical format.
//!
//! **Rule**: The golden vectors MUST NOT change. If the test fails, fix the
//! types, not the vectors.

use dealgrid_protocol::{ClientMessage, CommitAction, ServerMessage};

const HELLO_OK: &[&str] = &[
    r#"{"id":"1","type":"hello","client":"test-agent","version":"0.3.0","token":"secret","protocol_version":1}"#,
    r#"{"id":"1","type":"welcome","session_id":"a3a5a1c2-7a0f-4a8e-9a51-000000000001","actor":"7b8c9d0e-0000-4000-8000-000000000002","protocol_version":1,"capabilities":["mutate_row","fetch_rows","stats"]}"#,
];

const JOIN_OK: &[&str] = &[
    r#"{"id":"2","type":"join","spreadsheet_id":"11111111-1111-4111-8111-111111111111"}"#,
    r#"{"id":"2","type":"joined","spreadsheet_id":"11111111-1111-4111-8111-111111111111","columns":[{"id":"c1","name":"Company","kind":"text","position":0,"required":true},{"id":"c2","name":"DealValue","kind":"currency","min":0.0,"position":1,"required":false},{"id":"c3","name":"Stage","kind":"select","options":["Lead","Won"],"position":2,"required":false}]}"#,
];

const MUTATE_COMMIT: &[&str] = &[
    r#"{"id":"3","type":"mutate_row","spreadsheet_id":"11111111-1111-4111-8111-111111111111","row_id":"22222222-2222-4222-8222-222222222222","expected_version":1,"row_data":{"DealValue":5000.0}}"#,
    r#"{"type":"row_committed","spreadsheet_id":"11111111-1111-4111-8111-111111111111","row_id":"22222222-2222-4222-8222-222222222222","version":2,"row_data":{"Company":"Acme","DealValue":5000.0},"action":"update","actor":"7b8c9d0e-0000-4000-8000-000000000002","timestamp":"2026-01-01T00:00:00+00:00"}"#,
];

const MUTATE_REJECTS: &[&str] = &[
    r#"{"id":"4","type":"row_rejected","spreadsheet_id":"s","row_id":"r","reason":"conflict_error","current_version":2,"current_row_data":{"DealValue":5000.0}}"#,
    r#"{"id":"5","type":"row_rejected","spreadsheet_id":"s","row_id":"r","reason":"validation_error","errors":[{"field":"DealValue","message":"is not a valid number"}]}"#,
    r#"{"id":"6","type":"row_rejected","spreadsheet_id":"s","row_id":"r","reason":"permission_error"}"#,
    r#"{"id":"7","type":"row_rejected","spreadsheet_id":"s","row_id":"r","reason":"persistence_error"}"#,
];

const DELETE_ROW: &str = r#"{"id":"8","type":"mutate_row","spreadsheet_id":"s","row_id":"r","expected_version":3,"row_data":null}"#;

const ERROR_MESSAGE: &str =
    r#"{"type":"error","id":"9","code":"rate_limited","message":"Rate limit exceeded","retry_after_ms":250}"#;

#[test]
fn test_hello_ok() {
    let client_msg: ClientMessage = serde_json::from_str(HELLO_OK[0]).unwrap();
    match client_msg {
        ClientMessage::Hello(hello) => {
            assert_eq!(hello.client, "test-agent");
            assert_eq!(hello.protocol_version, 1);
        }
        _ => panic!("Expected Hello message"),
    }

    let server_msg: ServerMessage = serde_json::from_str(HELLO_OK[1]).unwrap();
    match server_msg {
        ServerMessage::Welcome(welcome) => {
            assert_eq!(welcome.protocol_version, 1);
            assert!(welcome.capabilities.contains(&"mutate_row".to_string()));
            assert!(!welcome.actor.is_empty());
        }
        _ => panic!("Expected Welcome message"),
    }
}

#[test]
fn test_join_ok() {
    let client_msg: ClientMessage = serde_json::from_str(JOIN_OK[0]).unwrap();
    assert!(matches!(client_msg, ClientMessage::Join(_)));

    let server_msg: ServerMessage = serde_json::from_str(JOIN_OK[1]).unwrap();
    match server_msg {
        ServerMessage::Joined(joined) => {
            assert_eq!(joined.columns.len(), 3);
            assert_eq!(joined.columns[0].name, "Company");
            assert!(joined.columns[0].required);
        }
        _ => panic!("Expected Joined message"),
    }
}

#[test]
fn test_mutate_and_commit() {
    let client_msg: ClientMessage = serde_json::from_str(MUTATE_COMMIT[0]).unwrap();
    match client_msg {
        ClientMessage::MutateRow(mutate) => {
            assert_eq!(mutate.expected_version, 1);
            assert!(mutate.row_data.is_some());
        }
        _ => panic!("Expected MutateRow message"),
    }

    let server_msg: ServerMessage = serde_json::from_str(MUTATE_COMMIT[1]).unwrap();
    match server_msg {
        ServerMessage::RowCommitted(commit) => {
            assert_eq!(commit.version, 2);
            assert_eq!(commit.action, CommitAction::Update);
            assert_eq!(commit.row_data["Company"], serde_json::json!("Acme"));
        }
        _ => panic!("Expected RowCommitted message"),
    }
}

#[test]
fn test_reject_vectors() {
    use dealgrid_protocol::RejectReason;

    let expected = ["conflict", "validation", "permission", "persistence"];
    for (line, kind) in MUTATE_REJECTS.iter().zip(expected) {
        let msg: ServerMessage = serde_json::from_str(line).unwrap();
        let ServerMessage::RowRejected(rejected) = msg else {
            panic!("Expected RowRejected for {} vector", kind);
        };
        match (kind, &rejected.reason) {
            ("conflict", RejectReason::ConflictError) => {
                assert_eq!(rejected.current_version, Some(2));
                assert!(rejected.current_row_data.is_some());
            }
            ("validation", RejectReason::ValidationError { errors }) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "DealValue");
            }
            ("permission", RejectReason::PermissionError) => {}
            ("persistence", RejectReason::PersistenceError) => {}
            (kind, reason) => panic!("Vector {} decoded as {:?}", kind, reason),
        }
    }
}

#[test]
fn test_delete_row_shape() {
    let msg: ClientMessage = serde_json::from_str(DELETE_ROW).unwrap();
    match msg {
        ClientMessage::MutateRow(mutate) => {
            assert_eq!(mutate.expected_version, 3);
            assert!(mutate.row_data.is_none());
        }
        _ => panic!("Expected MutateRow message"),
    }
}

#[test]
fn test_error_message_shape() {
    let msg: ServerMessage = serde_json::from_str(ERROR_MESSAGE).unwrap();
    match msg {
        ServerMessage::Error(error) => {
            assert_eq!(error.code, "rate_limited");
            assert_eq!(error.retry_after_ms, Some(250));
        }
        _ => panic!("Expected Error message"),
    }
}

#[test]
fn test_roundtrip_stability() {
    // Serialize-then-deserialize must preserve every golden client message
    for line in HELLO_OK
        .iter()
        .take(1)
        .chain(JOIN_OK.iter().take(1))
        .chain(MUTATE_COMMIT.iter().take(1))
        .chain(std::iter::once(&DELETE_ROW))
    {
        let msg: ClientMessage = serde_json::from_str(line).unwrap();
        let rewritten = serde_json::to_string(&msg).unwrap();
        let reparsed: ClientMessage = serde_json::from_str(&rewritten).unwrap();
        // Compare through canonical JSON values
        let a: serde_json::Value = serde_json::from_str(&rewritten).unwrap();
        let b = serde_json::to_value(&reparsed).unwrap();
        assert_eq!(a, b);
    }
}
