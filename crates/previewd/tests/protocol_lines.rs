use previewd::protocol::{encode_event, parse_command, Command, Event};

/// Commands a front-end actually sends, as literal wire lines.
const WIRE_COMMANDS: &[&str] = &[
    r#"{"type":"AddStream","request_id":"r1","stream_id":"s1","file":"/p/V.swift","device_type_id":"com.apple.CoreSimulator.SimDeviceType.iPhone-16-Pro","runtime_id":"com.apple.CoreSimulator.SimRuntime.iOS-18-2"}"#,
    r#"{"type":"AddStream","request_id":"r2","stream_id":"s2","file":"/p/W.swift","udid":"ABCD-1234","selector":1}"#,
    r#"{"type":"AddStream","request_id":"r2","stream_id":"s2","file":"/p/W.swift","udid":"ABCD-1234","selector":"Dark Mode"}"#,
    r#"{"type":"ReplaceAllStreams","request_id":"r3","stream_id":"s3","file":"/p/V.swift","udid":"ABCD-1234"}"#,
    r#"{"type":"RemoveStream","request_id":"r4","stream_id":"s1"}"#,
    r#"{"type":"SendInput","stream_id":"s1","event":{"type":"Touch","phase":"down","x":120.5,"y":300.0}}"#,
    r#"{"type":"SendInput","stream_id":"s1","event":{"type":"Text","string":"hello"}}"#,
    r#"{"type":"NextPreview","stream_id":"s1"}"#,
    r#"{"type":"ChangeDevice","request_id":"r5","stream_id":"s1","udid":"FFFF-0000"}"#,
];

#[test]
fn accepted_commands_reserialize_to_the_same_normal_form() {
    for line in WIRE_COMMANDS {
        let first: Command = parse_command(line).unwrap_or_else(|e| {
            panic!("command rejected: {}\n{:?}", line, e);
        });
        let normalized = serde_json::to_string(&first).unwrap();
        let second = parse_command(&normalized).unwrap();
        assert_eq!(first, second, "round-trip changed {}", line);
        assert_eq!(
            normalized,
            serde_json::to_string(&second).unwrap(),
            "normal form not stable for {}",
            line
        );
    }
}

#[test]
fn normalization_is_key_order_independent() {
    let shuffled =
        r#"{"stream_id":"s1","request_id":"r4","type":"RemoveStream"}"#;
    let canonical = r#"{"type":"RemoveStream","request_id":"r4","stream_id":"s1"}"#;
    let a = parse_command(shuffled).unwrap();
    let b = parse_command(canonical).unwrap();
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}

#[test]
fn rejections_reference_the_offending_request() {
    let err = parse_command(r#"{"type":"LaunchMissiles","request_id":"r9"}"#).unwrap_err();
    match err {
        Event::ProtocolError { request_id, .. } => {
            assert_eq!(request_id.as_deref(), Some("r9"))
        }
        other => panic!("expected ProtocolError, got {:?}", other),
    }
}

#[test]
fn every_event_is_one_line_of_json() {
    let events = vec![
        Event::StreamStarted {
            stream_id: "s1".into(),
            device: "ABCD-1234".into(),
            preview_title: "Dark".into(),
        },
        Event::Frame {
            stream_id: "s1".into(),
            frame: previewd::protocol::FramePayload {
                data: "AAAA".into(),
            },
        },
        Event::StreamStopped {
            stream_id: "s1".into(),
            reason: "SelectorOutOfRange".into(),
            message: "preview index 99 out of range (file has 2)".into(),
            diagnostic: None,
        },
        Event::ProtocolError {
            request_id: None,
            message: "invalid JSON".into(),
        },
    ];
    for event in &events {
        let line = encode_event(event);
        assert!(!line.contains('\n'), "embedded newline in {}", line);
        let parsed: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(&parsed, event);
    }
}
