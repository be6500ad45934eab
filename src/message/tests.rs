use super::*;
use chrono::DateTime;
use serde_json::json;

fn sample_notice() -> Notice {
    Notice {
        title: "maintenance".to_string(),
        content: "broker restarts at 02:00".to_string(),
        level: NoticeLevel::Warning,
    }
}

fn full_header() -> MessageHeader {
    let mut header = MessageHeader {
        message_id: Some(42),
        timestamp: DateTime::from_timestamp(1_700_000_000, 0),
        priority: Some(5),
        expiration_ms: Some(30_000),
        delivery_mode: Some(DeliveryMode::Persistent),
        content_type: Some("text/plain".to_string()),
        content_encoding: Some("utf-8".to_string()),
        correlation_id: Some("corr-1".to_string()),
        reply_to: Some("reply.queue".to_string()),
        app_id: Some("orders".to_string()),
        user_id: Some("guest".to_string()),
        cluster_id: Some("east".to_string()),
        headers: Default::default(),
    };
    header.insert("retry", 3i64);
    header.insert("source", "test");
    header.insert("urgent", true);
    header
}

#[test]
fn test_lookup_known_tags() {
    for message_type in MessageType::ALL {
        assert_eq!(MessageType::lookup(message_type.tag()).unwrap(), message_type);
    }
}

#[test]
fn test_lookup_unknown_tag_fails() {
    let err = MessageType::lookup("ghostMessage").unwrap_err();
    assert!(matches!(err, MessageError::UnknownType(ref tag) if tag == "ghostMessage"));
}

#[test]
fn test_lookup_is_case_sensitive() {
    assert!(MessageType::lookup("AppMessage").is_err());
}

#[test]
fn test_from_str_uses_lookup() {
    let parsed: MessageType = "noticeMessage".parse().unwrap();
    assert_eq!(parsed, MessageType::NoticeMessage);
}

#[test]
fn test_new_message_is_empty_shell() {
    let msg = Message::new(MessageType::TextMessage);
    assert_eq!(msg.message_type(), MessageType::TextMessage);
    assert!(msg.body().is_none());
    assert_eq!(msg.header(), &MessageHeader::default());
}

#[test]
fn test_header_round_trip_preserves_all_fields() {
    let header = full_header();
    for message_type in MessageType::ALL {
        let wire = encode_header(&header, message_type).unwrap();
        assert_eq!(wire.kind.as_deref(), Some(message_type.tag()));
        let decoded = decode_header(&wire, message_type).unwrap();
        assert_eq!(decoded, header);
    }
}

#[test]
fn test_header_round_trip_default() {
    let wire = encode_header(&MessageHeader::default(), MessageType::AppMessage).unwrap();
    let decoded = decode_header(&wire, MessageType::AppMessage).unwrap();
    assert_eq!(decoded, MessageHeader::default());
}

#[test]
fn test_decode_header_rejects_mismatched_tag() {
    let wire = encode_header(&MessageHeader::default(), MessageType::TextMessage).unwrap();
    let err = decode_header(&wire, MessageType::AppMessage).unwrap_err();
    assert!(matches!(err, MessageError::Header(_)));
}

#[test]
fn test_decode_header_rejects_bad_message_id() {
    let wire = WireProperties {
        kind: Some("appMessage".to_string()),
        message_id: Some("not-a-number".to_string()),
        ..Default::default()
    };
    assert!(decode_header(&wire, MessageType::AppMessage).is_err());
}

#[test]
fn test_decode_header_rejects_bad_delivery_mode() {
    let wire = WireProperties {
        delivery_mode: Some(7),
        ..Default::default()
    };
    assert!(decode_header(&wire, MessageType::AppMessage).is_err());
}

#[test]
fn test_type_tag_ignores_empty() {
    let mut wire = WireProperties::default();
    assert_eq!(wire.type_tag(), None);
    wire.kind = Some(String::new());
    assert_eq!(wire.type_tag(), None);
    wire.kind = Some("textMessage".to_string());
    assert_eq!(wire.type_tag(), Some("textMessage"));
}

#[test]
fn test_body_round_trip_per_type() {
    let samples = [
        Message::app(vec![0u8, 1, 2, 255]),
        Message::text("hello, bus"),
        Message::object(json!({"order": 7, "items": ["a", "b"]})),
        Message::notice(sample_notice()),
        Message::heartbeat(),
    ];

    for msg in samples {
        let codec = msg.message_type().body_codec();
        let body = msg.body().unwrap();
        let bytes = codec.encode(msg.message_type(), body).unwrap();
        let decoded = codec.decode(msg.message_type(), &bytes).unwrap();
        assert_eq!(&decoded, body, "{} body did not survive", msg.message_type());
    }
}

#[test]
fn test_codec_rejects_mismatched_body() {
    let codec = MessageType::TextMessage.body_codec();
    let err = codec
        .encode(MessageType::TextMessage, &MessageBody::Bytes(vec![1]))
        .unwrap_err();
    assert!(matches!(err, MessageError::BodyMismatch { found: "bytes", .. }));
}

#[test]
fn test_text_codec_rejects_invalid_utf8() {
    let codec = MessageType::TextMessage.body_codec();
    assert!(codec.decode(MessageType::TextMessage, &[0xff, 0xfe]).is_err());
}

#[test]
fn test_heartbeat_codec_rejects_payload() {
    let codec = MessageType::HeartbeatMessage.body_codec();
    assert!(codec.decode(MessageType::HeartbeatMessage, b"x").is_err());
}

#[test]
fn test_notice_codec_rejects_garbage() {
    let codec = MessageType::NoticeMessage.body_codec();
    assert!(codec.decode(MessageType::NoticeMessage, b"{}").is_err());
}

#[test]
fn test_message_encode_decode() {
    let mut msg = Message::text("ping");
    *msg.header_mut() = full_header();

    let (wire, bytes) = msg.encode().unwrap();
    let decoded = Message::decode(MessageType::TextMessage, &wire, &bytes).unwrap();

    assert_eq!(decoded, msg);
}

#[test]
fn test_encode_without_body_fails() {
    let msg = Message::new(MessageType::AppMessage);
    assert!(matches!(msg.encode(), Err(MessageError::MissingBody(MessageType::AppMessage))));
}

#[test]
fn test_validate() {
    assert!(Message::text("ok").validate().is_ok());
    assert!(Message::new(MessageType::TextMessage).validate().is_err());

    let mut wrong = Message::new(MessageType::HeartbeatMessage);
    wrong.set_body(MessageBody::Text("boom".to_string()));
    assert!(matches!(
        wrong.validate(),
        Err(MessageError::BodyMismatch { found: "text", .. })
    ));
}

#[test]
fn test_stamp_now_truncates_to_seconds() {
    let mut header = MessageHeader::default();
    header.stamp_now();
    let ts = header.timestamp.unwrap();
    assert_eq!(ts.timestamp_subsec_nanos(), 0);

    let wire = encode_header(&header, MessageType::AppMessage).unwrap();
    assert_eq!(decode_header(&wire, MessageType::AppMessage).unwrap(), header);
}

#[test]
fn test_pre_epoch_timestamp_is_rejected() {
    let header = MessageHeader {
        timestamp: DateTime::from_timestamp(-86_400, 0),
        ..Default::default()
    };

    let err = encode_header(&header, MessageType::AppMessage).unwrap_err();
    assert!(matches!(err, MessageError::Header(ref m) if m.contains("before the Unix epoch")));

    let mut msg = Message::app(vec![1]);
    msg.set_header(header);
    assert!(msg.validate().is_err());
    assert!(msg.encode().is_err());
}

#[test]
fn test_sub_second_timestamp_is_rejected() {
    let header = MessageHeader {
        timestamp: DateTime::from_timestamp(1_700_000_000, 123_000_000),
        ..Default::default()
    };

    let err = encode_header(&header, MessageType::TextMessage).unwrap_err();
    assert!(matches!(err, MessageError::Header(ref m) if m.contains("sub-second")));

    let mut msg = Message::text("late");
    msg.set_header(header);
    assert!(matches!(msg.validate(), Err(MessageError::Header(_))));
}

#[test]
fn test_epoch_timestamp_round_trips() {
    let header = MessageHeader {
        timestamp: DateTime::from_timestamp(0, 0),
        ..Default::default()
    };

    let wire = encode_header(&header, MessageType::AppMessage).unwrap();
    assert_eq!(wire.timestamp, Some(0));
    assert_eq!(decode_header(&wire, MessageType::AppMessage).unwrap(), header);
}
