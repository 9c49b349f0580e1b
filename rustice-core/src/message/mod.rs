/*
   0                   1                   2                   3
   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |0 0|     message type (class+method)   |      message length   |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                     magic cookie (absent in legacy mode)      |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                                                               |
  |             transaction id (12, or 16 in legacy mode)         |
  |                                                               |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |         attribute type        |       attribute length        |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                  attribute value (padded to 4)             ...
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::attribute::{
    self, Attribute, FINGERPRINT, MAPPED_ADDRESS, MESSAGE_INTEGRITY, XOR_MAPPED_ADDRESS,
};
use crate::error::{Error, Result};
use crate::transaction::TransactionId;

pub const HEADER_LEN: usize = 20;
pub const MAGIC_COOKIE: u32 = 0x2112_a442;
/// The one method this engine speaks.
pub const BINDING: u16 = 0x0001;

const MESSAGE_INTEGRITY_SIZE: usize = 4 + 20;
const FINGERPRINT_SIZE: usize = 4 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn from_type(ty: u16) -> Self {
        match ((ty >> 7) & 0b10) | ((ty >> 4) & 0b01) {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0x0000,
            MessageClass::Indication => 0x0010,
            MessageClass::SuccessResponse => 0x0100,
            MessageClass::ErrorResponse => 0x0110,
        }
    }
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageClass::SuccessResponse | MessageClass::ErrorResponse
        )
    }
}

fn method_from_type(ty: u16) -> u16 {
    (ty & 0x000f) | ((ty >> 1) & 0x0070) | ((ty >> 2) & 0x0f80)
}

fn type_of(class: MessageClass, method: u16) -> u16 {
    let m = (method & 0x000f) | ((method & 0x0070) << 1) | ((method & 0x0f80) << 2);
    m | class.bits()
}

/// A decoded message: class, method, transaction id and the attribute
/// list in wire order.
#[derive(Clone, Debug)]
pub struct Message {
    class: MessageClass,
    method: u16,
    transaction_id: TransactionId,
    attributes: Vec<Attribute>,
}

impl Message {
    /// Parses and validates one datagram.
    ///
    /// Rejects anything that is not plausibly this protocol (length,
    /// leading type bits, length field consistency), then walks the
    /// attributes. A fingerprint attribute, when present, must come
    /// last and must match a recomputation over the bytes it covers.
    pub fn decode(buf: &[u8]) -> Result<Message> {
        if buf.len() < HEADER_LEN {
            return Err(Error::MessageTooShort(buf.len()));
        }
        if buf[0] & 0xc0 != 0 {
            return Err(Error::NotStun);
        }
        let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if declared % 4 != 0 {
            return Err(Error::NotStun);
        }
        if declared != buf.len() - HEADER_LEN {
            return Err(Error::LengthMismatch {
                declared,
                actual: buf.len() - HEADER_LEN,
            });
        }
        let ty = u16::from_be_bytes([buf[0], buf[1]]);
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let transaction_id = if cookie == MAGIC_COOKIE {
            TransactionId::from_bytes(&buf[8..HEADER_LEN])
        } else {
            TransactionId::from_bytes(&buf[4..HEADER_LEN])
        };

        let mut attributes = Vec::new();
        let mut pos = HEADER_LEN;
        let end = buf.len();
        let mut fingerprint_at = None;
        while pos < end {
            // pos and end stay 4-byte aligned, so a full TLV header is
            // always available here.
            let aty = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let alen = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            let value_end = pos + 4 + alen;
            if value_end > end {
                return Err(Error::AttributeOverrun { ty: aty, len: alen });
            }
            if fingerprint_at.is_some() {
                return Err(Error::FingerprintNotLast);
            }
            if aty == FINGERPRINT {
                fingerprint_at = Some(pos);
            }
            attributes.push(Attribute {
                ty: aty,
                value: Bytes::copy_from_slice(&buf[pos + 4..value_end]),
            });
            pos = pos + 4 + (alen + 3) / 4 * 4;
        }

        if let Some(offset) = fingerprint_at {
            let stored = attribute::decode_fingerprint(&buf[offset + 4..offset + 8])?;
            // The header length on the wire already counts the
            // fingerprint, so the covered bytes are simply everything
            // before the attribute.
            if attribute::fingerprint_value(&buf[..offset]) != stored {
                return Err(Error::FingerprintMismatch);
            }
        }

        Ok(Message {
            class: MessageClass::from_type(ty),
            method: method_from_type(ty),
            transaction_id,
            attributes,
        })
    }

    #[inline]
    pub fn class(&self) -> MessageClass {
        self.class
    }
    #[inline]
    pub fn method(&self) -> u16 {
        self.method
    }
    #[inline]
    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }
    #[inline]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
    pub fn attribute(&self, ty: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.ty == ty)
    }
    pub fn mapped_address(&self) -> Result<Option<SocketAddr>> {
        match self.attribute(MAPPED_ADDRESS) {
            Some(a) => attribute::decode_address(&a.value).map(Some),
            None => Ok(None),
        }
    }
    pub fn xor_mapped_address(&self) -> Result<Option<SocketAddr>> {
        match self.attribute(XOR_MAPPED_ADDRESS) {
            Some(a) => {
                attribute::decode_xor_address(&a.value, &self.transaction_id).map(Some)
            }
            None => Ok(None),
        }
    }
    pub fn fingerprint(&self) -> Result<Option<[u8; 4]>> {
        match self.attribute(FINGERPRINT) {
            Some(a) => attribute::decode_fingerprint(&a.value).map(Some),
            None => Ok(None),
        }
    }
}

/// Writes a message front to back, patching the header length as
/// attributes land.
///
/// The two content-dependent attributes are only reachable through
/// their finalizers, which bump the header length *before* computing
/// their value, since both cover a length field that already counts
/// them. A fingerprint seals the message.
pub struct MessageBuilder {
    buf: BytesMut,
    sealed: bool,
}

impl MessageBuilder {
    pub fn new(class: MessageClass, method: u16, id: &TransactionId) -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u16(type_of(class, method));
        buf.put_u16(0);
        if id.is_legacy() {
            buf.put_slice(id.as_bytes());
        } else {
            buf.put_u32(MAGIC_COOKIE);
            buf.put_slice(id.as_bytes());
        }
        Self { buf, sealed: false }
    }

    pub fn binding_request(id: &TransactionId) -> Self {
        Self::new(MessageClass::Request, BINDING, id)
    }

    pub fn binding_success(id: &TransactionId) -> Self {
        Self::new(MessageClass::SuccessResponse, BINDING, id)
    }

    /// Appends a plain attribute. The integrity attributes are refused
    /// here: their values depend on the message bytes and only exist
    /// through [`Self::message_integrity`] and [`Self::fingerprint`].
    pub fn attribute(mut self, ty: u16, value: &[u8]) -> Result<Self> {
        if ty == FINGERPRINT || ty == MESSAGE_INTEGRITY {
            return Err(Error::ContentDependent(ty));
        }
        if self.sealed {
            return Err(Error::FingerprintNotLast);
        }
        let padded = (value.len() + 3) / 4 * 4;
        self.bump_length(4 + padded);
        self.buf.put_u16(ty);
        self.buf.put_u16(value.len() as u16);
        self.buf.put_slice(value);
        self.buf.put_bytes(0, padded - value.len());
        Ok(self)
    }

    /// Finalizes a keyed integrity attribute over everything written so
    /// far. Must precede [`Self::fingerprint`], whose checksum covers it.
    pub fn message_integrity(mut self, key: &[u8]) -> Result<Self> {
        if self.sealed {
            return Err(Error::FingerprintNotLast);
        }
        self.bump_length(MESSAGE_INTEGRITY_SIZE);
        let value = attribute::message_integrity_value(&self.buf, key);
        self.buf.put_u16(MESSAGE_INTEGRITY);
        self.buf.put_u16(20);
        self.buf.put_slice(&value);
        Ok(self)
    }

    /// Appends the trailing checksum attribute and seals the message.
    pub fn fingerprint(mut self) -> Self {
        self.bump_length(FINGERPRINT_SIZE);
        let value = attribute::fingerprint_value(&self.buf);
        self.buf.put_u16(FINGERPRINT);
        self.buf.put_u16(4);
        self.buf.put_slice(&value);
        self.sealed = true;
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    fn bump_length(&mut self, add: usize) {
        let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize + add;
        self.buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    }
}
