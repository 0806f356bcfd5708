//! MQTT v3.1.1 return codes
//!
//! CONNACK return codes and SUBACK return codes share this type.

use std::fmt;

/// Return code carried by CONNACK and SUBACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReasonCode {
    /// Connection accepted / Granted QoS 0
    #[default]
    Success,
    /// Granted QoS 1
    GrantedQoS1,
    /// Granted QoS 2
    GrantedQoS2,
    /// Connection refused, unacceptable protocol version
    UnsupportedProtocolVersion,
    /// Connection refused, identifier rejected
    ClientIdNotValid,
    /// Connection refused, server unavailable
    ServerUnavailable,
    /// Connection refused, bad user name or password
    BadUserNameOrPassword,
    /// Connection refused, not authorized
    NotAuthorized,
    /// Subscription failure
    Failure,
}

impl ReasonCode {
    /// Check if this code indicates success
    #[inline]
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ReasonCode::Success | ReasonCode::GrantedQoS1 | ReasonCode::GrantedQoS2
        )
    }

    /// Granted-QoS code for a SUBACK entry
    pub fn granted(qos: crate::protocol::QoS) -> Self {
        match qos {
            crate::protocol::QoS::AtMostOnce => ReasonCode::Success,
            crate::protocol::QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
            crate::protocol::QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
        }
    }

    /// Convert to CONNACK return code
    pub fn to_connack_code(self) -> u8 {
        match self {
            ReasonCode::Success => 0x00,
            ReasonCode::UnsupportedProtocolVersion => 0x01,
            ReasonCode::ClientIdNotValid => 0x02,
            ReasonCode::ServerUnavailable => 0x03,
            ReasonCode::BadUserNameOrPassword => 0x04,
            _ => 0x05,
        }
    }

    /// Create from CONNACK return code
    pub fn from_connack_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ReasonCode::Success),
            0x01 => Some(ReasonCode::UnsupportedProtocolVersion),
            0x02 => Some(ReasonCode::ClientIdNotValid),
            0x03 => Some(ReasonCode::ServerUnavailable),
            0x04 => Some(ReasonCode::BadUserNameOrPassword),
            0x05 => Some(ReasonCode::NotAuthorized),
            _ => None,
        }
    }

    /// Convert to SUBACK return code
    pub fn to_suback_code(self) -> u8 {
        match self {
            ReasonCode::Success => 0x00,
            ReasonCode::GrantedQoS1 => 0x01,
            ReasonCode::GrantedQoS2 => 0x02,
            _ => 0x80,
        }
    }

    /// Create from SUBACK return code
    pub fn from_suback_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ReasonCode::Success),
            0x01 => Some(ReasonCode::GrantedQoS1),
            0x02 => Some(ReasonCode::GrantedQoS2),
            0x80 => Some(ReasonCode::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonCode::Success => write!(f, "Success"),
            ReasonCode::GrantedQoS1 => write!(f, "Granted QoS 1"),
            ReasonCode::GrantedQoS2 => write!(f, "Granted QoS 2"),
            ReasonCode::UnsupportedProtocolVersion => write!(f, "Unsupported Protocol Version"),
            ReasonCode::ClientIdNotValid => write!(f, "Client Identifier not valid"),
            ReasonCode::ServerUnavailable => write!(f, "Server unavailable"),
            ReasonCode::BadUserNameOrPassword => write!(f, "Bad User Name or Password"),
            ReasonCode::NotAuthorized => write!(f, "Not authorized"),
            ReasonCode::Failure => write!(f, "Failure"),
        }
    }
}
