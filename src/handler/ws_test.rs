use super::{ClientMessage, jpeg_data_url, parse_client_message};

#[test]
fn test_both_switch_shapes_are_accepted() {
    assert_eq!(
        parse_client_message(r#"{"action":"switchSource","source":"CAM A"}"#),
        Some(ClientMessage::SwitchSource("CAM A".into()))
    );
    assert_eq!(
        parse_client_message(r#"{"type":"select_source","source":"CAM B (Studio)"}"#),
        Some(ClientMessage::SwitchSource("CAM B (Studio)".into()))
    );
}

#[test]
fn test_unrelated_or_broken_messages_are_ignored() {
    assert_eq!(parse_client_message(r#"{"action":"switchSource"}"#), None);
    assert_eq!(parse_client_message(r#"{"type":"status"}"#), None);
    assert_eq!(parse_client_message(r#"{"action":"reboot","source":"x"}"#), None);
    assert_eq!(parse_client_message("not json"), None);
    assert_eq!(parse_client_message("[]"), None);
}

#[test]
fn test_jpeg_data_url() {
    assert_eq!(
        jpeg_data_url(&[0xFF, 0xD8, 0xFF, 0xD9]),
        "data:image/jpeg;base64,/9j/2Q=="
    );
}
