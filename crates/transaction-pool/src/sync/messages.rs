//! Wire messages of the transaction sync protocol.

use alloy_rlp::{RlpDecodable, RlpEncodable};
use grove_primitives::{Bytes, TxHash};

/// Kinds of transaction sync messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TxsSyncMsgType {
    /// Announcement of held transactions, hashes only.
    Status = 1,
    /// Request for the full transactions behind the given hashes.
    Request = 2,
    /// A batch of full transactions, packed into a block container.
    Response = 3,
}

impl TryFrom<u8> for TxsSyncMsgType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(Self::Status),
            2 => Ok(Self::Request),
            3 => Ok(Self::Response),
            other => Err(other),
        }
    }
}

/// A transaction sync message.
///
/// `hashes` carries the payload of status and request messages; `payload`
/// carries the encoded block container of a response. Unknown discriminants
/// are preserved so receivers can log and drop them.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TxsSyncMsg {
    /// Message discriminant, one of [`TxsSyncMsgType`].
    pub msg_type: u8,
    /// Announced or requested transaction hashes.
    pub hashes: Vec<TxHash>,
    /// Encoded block container of a response.
    pub payload: Bytes,
}

impl TxsSyncMsg {
    /// A status announcement for the given hashes.
    pub fn status(hashes: Vec<TxHash>) -> Self {
        Self { msg_type: TxsSyncMsgType::Status as u8, hashes, payload: Bytes::new() }
    }

    /// A request for the given hashes.
    pub fn request(hashes: Vec<TxHash>) -> Self {
        Self { msg_type: TxsSyncMsgType::Request as u8, hashes, payload: Bytes::new() }
    }

    /// A response carrying an encoded block container.
    pub fn response(payload: Bytes) -> Self {
        Self { msg_type: TxsSyncMsgType::Response as u8, hashes: Vec::new(), payload }
    }

    /// The message kind, if the discriminant is known.
    pub fn msg_type(&self) -> Option<TxsSyncMsgType> {
        TxsSyncMsgType::try_from(self.msg_type).ok()
    }

    /// The RLP wire form of this message.
    pub fn encoded(&self) -> Bytes {
        alloy_rlp::encode(self).into()
    }

    /// Decodes a message from its wire form, rejecting trailing bytes.
    pub fn decode(mut data: &[u8]) -> alloy_rlp::Result<Self> {
        let msg = <Self as alloy_rlp::Decodable>::decode(&mut data)?;
        if !data.is_empty() {
            return Err(alloy_rlp::Error::UnexpectedLength)
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_type_discrimination() {
        let hashes = vec![TxHash::repeat_byte(1), TxHash::repeat_byte(2)];
        let msg = TxsSyncMsg::request(hashes.clone());
        let decoded = TxsSyncMsg::decode(&msg.encoded()).unwrap();
        assert_eq!(decoded.msg_type(), Some(TxsSyncMsgType::Request));
        assert_eq!(decoded.hashes, hashes);

        let unknown = TxsSyncMsg { msg_type: 42, hashes: Vec::new(), payload: Bytes::new() };
        assert_eq!(TxsSyncMsg::decode(&unknown.encoded()).unwrap().msg_type(), None);
    }
}
