//! MQTT Packet Decoder

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, ProtocolVersion, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, ReasonCode, SubAck, Subscribe, Subscription, UnsubAck, Unsubscribe, Will,
};

/// MQTT Packet Decoder
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the buffer
    /// Returns `Ok(None)` until a complete packet is buffered, then
    /// (packet, bytes_consumed)
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Parse fixed header
        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(flags, payload)?,
            2 => self.decode_connack(flags, payload)?,
            3 => self.decode_publish(flags, payload)?,
            4 => Packet::PubAck(PubAck {
                packet_id: Self::decode_packet_id(flags, 0x00, payload)?,
            }),
            5 => Packet::PubRec(PubRec {
                packet_id: Self::decode_packet_id(flags, 0x00, payload)?,
            }),
            6 => Packet::PubRel(PubRel {
                packet_id: Self::decode_packet_id(flags, 0x02, payload)?,
            }),
            7 => Packet::PubComp(PubComp {
                packet_id: Self::decode_packet_id(flags, 0x00, payload)?,
            }),
            8 => self.decode_subscribe(flags, payload)?,
            9 => self.decode_suback(flags, payload)?,
            10 => self.decode_unsubscribe(flags, payload)?,
            11 => Packet::UnsubAck(UnsubAck {
                packet_id: Self::decode_packet_id(flags, 0x00, payload)?,
            }),
            12 => {
                Self::expect_empty(flags, payload)?;
                Packet::PingReq
            }
            13 => {
                Self::expect_empty(flags, payload)?;
                Packet::PingResp
            }
            14 => {
                Self::expect_empty(flags, payload)?;
                Packet::Disconnect
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn expect_empty(flags: u8, payload: &[u8]) -> Result<(), DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if !payload.is_empty() {
            return Err(DecodeError::MalformedPacket("unexpected payload"));
        }
        Ok(())
    }

    /// Decode the two-byte body shared by PUBACK, PUBREC, PUBREL, PUBCOMP, UNSUBACK
    fn decode_packet_id(flags: u8, expected_flags: u8, payload: &[u8]) -> Result<u16, DecodeError> {
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() != 2 {
            return Err(DecodeError::MalformedPacket("expected packet identifier"));
        }
        read_u16(payload)
    }

    fn decode_connect(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut pos = 0;

        let (protocol_name, len) = read_string(payload)?;
        pos += len;

        let version_byte = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        let protocol_version = ProtocolVersion::from_u8(version_byte)
            .ok_or(DecodeError::InvalidProtocolVersion(version_byte))?;
        if protocol_name != protocol_version.protocol_name() {
            return Err(DecodeError::InvalidProtocolName);
        }

        let connect_flags = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        // Reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_session = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        // [MQTT-3.1.2-22] If username flag is 0, password flag must be 0
        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }
        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }
        let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;

        let keep_alive = read_u16(&payload[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&payload[pos..])?;
        pos += len;

        let will = if will_flag {
            let (topic, len) = read_string(&payload[pos..])?;
            pos += len;
            let (will_payload, len) = read_binary(&payload[pos..])?;
            pos += len;

            Some(Will {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(will_payload),
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, len) = read_string(&payload[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, _) = read_binary(&payload[pos..])?;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username,
            password,
            will,
        })))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() != 2 {
            return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
        }

        let acknowledge_flags = payload[0];
        // Only bit 0 is valid (session present), rest must be 0
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let reason_code = ReasonCode::from_connack_code(payload[1])
            .ok_or(DecodeError::InvalidReasonCode(payload[1]))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: (acknowledge_flags & 0x01) != 0,
            reason_code,
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let (topic, mut pos) = read_string(payload)?;

        // No wildcards allowed in PUBLISH topic names
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&payload[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&payload[pos..]),
        }))
    }

    fn decode_subscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        // [MQTT-3.8.1-1] Fixed header flags must be 0010
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        let mut pos = 2;

        let mut subscriptions = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            let options = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;

            // Upper 6 bits are reserved in v3.1.1
            if (options & 0xFC) != 0 {
                return Err(DecodeError::MalformedPacket(
                    "reserved subscription option bits set",
                ));
            }
            let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;

            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }

        // [MQTT-3.8.3-3] At least one subscription
        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must contain at least one topic filter",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        let reason_codes = payload[2..]
            .iter()
            .map(|&code| ReasonCode::from_suback_code(code).ok_or(DecodeError::InvalidReasonCode(code)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        let mut pos = 2;

        let mut filters = Vec::new();
        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;
            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must contain at least one topic filter",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
