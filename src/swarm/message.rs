//! Protocol message shape for the session-addressed transport.
//!
//! Messages travel over an injected transport that delivers ordered,
//! reliable, peer-addressed payloads. Fields other than `kind` and the
//! sender are optional and omitted when absent.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{PeerId, PieceIndex};

/// Discriminant of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Handshake,
}

/// One protocol message as carried by the transport.
///
/// `piece_index` is present for HAVE/REQUEST/PIECE, `data` for PIECE,
/// and `bitfield` (a '0'/'1' string, one character per piece) for
/// BITFIELD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub kind: MessageKind,
    pub sender_peer_id: PeerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub piece_index: Option<PieceIndex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitfield: Option<String>,
}

impl Message {
    fn bare(kind: MessageKind, sender: PeerId) -> Self {
        Self {
            kind,
            sender_peer_id: sender,
            piece_index: None,
            data: None,
            bitfield: None,
        }
    }

    pub fn choke(sender: PeerId) -> Self {
        Self::bare(MessageKind::Choke, sender)
    }

    pub fn unchoke(sender: PeerId) -> Self {
        Self::bare(MessageKind::Unchoke, sender)
    }

    pub fn interested(sender: PeerId) -> Self {
        Self::bare(MessageKind::Interested, sender)
    }

    pub fn not_interested(sender: PeerId) -> Self {
        Self::bare(MessageKind::NotInterested, sender)
    }

    pub fn handshake(sender: PeerId) -> Self {
        Self::bare(MessageKind::Handshake, sender)
    }

    pub fn have(sender: PeerId, index: PieceIndex) -> Self {
        Self {
            piece_index: Some(index),
            ..Self::bare(MessageKind::Have, sender)
        }
    }

    pub fn request(sender: PeerId, index: PieceIndex) -> Self {
        Self {
            piece_index: Some(index),
            ..Self::bare(MessageKind::Request, sender)
        }
    }

    pub fn piece(sender: PeerId, index: PieceIndex, data: Bytes) -> Self {
        Self {
            piece_index: Some(index),
            data: Some(data),
            ..Self::bare(MessageKind::Piece, sender)
        }
    }

    pub fn bitfield(sender: PeerId, encoded: String) -> Self {
        Self {
            bitfield: Some(encoded),
            ..Self::bare(MessageKind::Bitfield, sender)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_fields_are_omitted_from_wire_json() {
        let msg = Message::interested(PeerId::new("1001"));
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"kind\":\"INTERESTED\""));
        assert!(json.contains("\"senderPeerId\":\"1001\""));
        assert!(!json.contains("pieceIndex"));
        assert!(!json.contains("data"));
        assert!(!json.contains("bitfield"));
    }

    #[test]
    fn test_piece_message_round_trip() {
        let msg = Message::piece(
            PeerId::new("1002"),
            PieceIndex::new(7),
            Bytes::from_static(b"abc"),
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();

        assert_eq!(back, msg);
        assert_eq!(back.piece_index, Some(PieceIndex::new(7)));
    }

    #[test]
    fn test_kind_names_match_wire_contract() {
        let json = serde_json::to_string(&MessageKind::NotInterested).unwrap();
        assert_eq!(json, "\"NOT_INTERESTED\"");
    }
}
