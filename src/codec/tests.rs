//! MQTT Codec Tests

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use super::{read_variable_int, write_variable_int};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, ProtocolVersion, PubRel, Publish, QoS, ReasonCode,
    SubAck, Subscribe, Subscription,
};

fn encode_packet(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, _)) => Ok(packet),
        None => Err(DecodeError::InsufficientData),
    }
}

#[test]
fn test_connect_with_credentials_survives_encoding() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V311,
        client_id: "bridge-01".to_string(),
        clean_session: true,
        keep_alive: 30,
        username: Some("bridge".to_string()),
        password: Some(Bytes::from("secret")),
        will: None,
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x10);
    // username + password + clean session
    assert_eq!(encoded[9], 0xC2);

    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_v31_uses_mqisdp_name() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V31,
        client_id: "legacy".to_string(),
        ..Default::default()
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(&encoded[4..10], b"MQIsdp");
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_rejects_mismatched_protocol_name() {
    // "MQTT" with level 3 is not a valid combination
    let raw = [
        0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x03, 0x02, 0x00, 0x3C, 0x00, 0x00,
    ];
    assert_eq!(decode_packet(&raw), Err(DecodeError::InvalidProtocolName));
}

#[test]
fn test_connect_password_without_username_is_rejected() {
    let raw = [
        0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x42, 0x00, 0x3C, 0x00, 0x00,
    ];
    assert_eq!(decode_packet(&raw), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_connect_debug_redacts_password() {
    let connect = Connect {
        username: Some("user".to_string()),
        password: Some(Bytes::from("hunter2")),
        ..Default::default()
    };
    let rendered = format!("{:?}", connect);
    assert!(!rendered.contains("hunter2"));
    assert!(rendered.contains("<redacted>"));
}

#[test]
fn test_publish_qos1_wire_format() {
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "t/1".to_string(),
        packet_id: Some(7),
        payload: Bytes::from_static(&[0x01, 0x02]),
    });

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[0x32, 0x09, 0x00, 0x03, b't', b'/', b'1', 0x00, 0x07, 0x01, 0x02]
    );
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_retain_flag_and_empty_payload() {
    let packet = Packet::Publish(Publish {
        retain: true,
        topic: "status".to_string(),
        ..Default::default()
    });

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x31);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_qos1_without_packet_id_fails_to_encode() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: "a".to_string(),
        ..Default::default()
    });
    let mut buf = BytesMut::new();
    assert!(Encoder::new().encode(&packet, &mut buf).is_err());
}

#[test]
fn test_publish_with_wildcard_topic_is_malformed() {
    let raw = [0x30, 0x05, 0x00, 0x03, b'a', b'/', b'#'];
    assert!(matches!(
        decode_packet(&raw),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_publish_qos0_with_dup_is_malformed() {
    let raw = [0x38, 0x03, 0x00, 0x01, b'a'];
    assert!(matches!(
        decode_packet(&raw),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_partial_packet_needs_more_data() {
    let packet = Packet::Publish(Publish {
        topic: "sensors/temperature".to_string(),
        payload: Bytes::from("21.5"),
        ..Default::default()
    });
    let encoded = encode_packet(&packet);

    let decoder = Decoder::new();
    for split in 0..encoded.len() {
        assert_eq!(decoder.decode(&encoded[..split]).unwrap(), None);
    }
    let (decoded, consumed) = decoder.decode(&encoded).unwrap().unwrap();
    assert_eq!(decoded, packet);
    assert_eq!(consumed, encoded.len());
}

#[test]
fn test_two_packets_in_one_buffer() {
    let mut buf = encode_packet(&Packet::PingReq);
    buf.extend_from_slice(&encode_packet(&Packet::Disconnect));

    let decoder = Decoder::new();
    let (first, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingReq);
    let (second, _) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(second, Packet::Disconnect);
}

#[test]
fn test_packet_too_large() {
    let decoder = Decoder::new().with_max_packet_size(4);
    let raw = [0x30, 0x06, 0x00, 0x01, b'a', b'x', b'y', b'z'];
    assert_eq!(decoder.decode(&raw), Err(DecodeError::PacketTooLarge));
}

#[test]
fn test_subscribe_with_wildcards() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 10,
        subscriptions: vec![
            Subscription {
                filter: "sensors/+/temp".to_string(),
                qos: QoS::AtLeastOnce,
            },
            Subscription {
                filter: "#".to_string(),
                qos: QoS::ExactlyOnce,
            },
        ],
    });

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x82);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_subscribe_reserved_bits_rejected() {
    let raw = [0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x04];
    assert!(matches!(
        decode_packet(&raw),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_subscribe_wrong_fixed_header_flags() {
    let raw = [0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00];
    assert_eq!(decode_packet(&raw), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_suback_failure_code() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 3,
        reason_codes: vec![ReasonCode::GrantedQoS1, ReasonCode::Failure],
    });
    let encoded = encode_packet(&packet);
    assert_eq!(&encoded[..], &[0x90, 0x04, 0x00, 0x03, 0x01, 0x80]);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connack_bad_credentials_code() {
    let packet = Packet::ConnAck(ConnAck {
        session_present: false,
        reason_code: ReasonCode::BadUserNameOrPassword,
    });
    let encoded = encode_packet(&packet);
    assert_eq!(&encoded[..], &[0x20, 0x02, 0x00, 0x04]);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_pubrel_requires_flags() {
    let encoded = encode_packet(&Packet::PubRel(PubRel { packet_id: 5 }));
    assert_eq!(&encoded[..], &[0x62, 0x02, 0x00, 0x05]);

    let raw = [0x60, 0x02, 0x00, 0x05];
    assert_eq!(decode_packet(&raw), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_unknown_packet_type() {
    let raw = [0xF0, 0x00];
    assert_eq!(decode_packet(&raw), Err(DecodeError::InvalidPacketType(15)));
}

#[test]
fn test_variable_int_boundaries() {
    for (value, len) in [(0u32, 1usize), (127, 1), (128, 2), (16_383, 2), (16_384, 3), (268_435_455, 4)] {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, value).unwrap();
        assert_eq!(buf.len(), len, "length for {}", value);
        assert_eq!(read_variable_int(&buf).unwrap(), (value, len));
    }

    let mut buf = BytesMut::new();
    assert!(write_variable_int(&mut buf, 268_435_456).is_err());
    assert_eq!(
        read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
}
