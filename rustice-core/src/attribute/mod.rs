//! STUN attribute codecs.
//!
//! Only the attributes this engine consumes are typed: the address
//! attributes the harvester reads back from a binding response, and the
//! two integrity attributes whose values depend on the exact bytes of
//! the enclosing message. Everything else travels as an opaque TLV.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use crc::Crc;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{Error, Result};
use crate::message::MAGIC_COOKIE;
use crate::transaction::TransactionId;

pub const MAPPED_ADDRESS: u16 = 0x0001;
pub const MESSAGE_INTEGRITY: u16 = 0x0008;
pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const FINGERPRINT: u16 = 0x8028;

/// Mask applied to the big-endian CRC-32 bytes of a fingerprint, so the
/// attribute cannot be mistaken for a checksum of some colocated
/// protocol sharing the port.
pub const FINGERPRINT_XOR_MASK: [u8; 4] = [0x53, 0x54, 0x55, 0x4e];

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

type HmacSha1 = Hmac<Sha1>;

/// One attribute as it sits on the wire, value unpadded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub ty: u16,
    pub value: Bytes,
}

impl Attribute {
    /// Wire footprint including the 4-byte header and value padding.
    pub fn padded_size(&self) -> usize {
        4 + (self.value.len() + 3) / 4 * 4
    }
}

/// Computes the fingerprint value for a finalized message.
///
/// `message` must be the complete byte sequence the fingerprint will
/// trail, with the header length field already counting the fingerprint
/// attribute itself. The value is the CRC-32 of those bytes with each
/// big-endian byte xored against [`FINGERPRINT_XOR_MASK`]. There is no
/// standalone form; the value is meaningless without the message.
pub fn fingerprint_value(message: &[u8]) -> [u8; 4] {
    let crc = CRC32.checksum(message);
    let mut value = crc.to_be_bytes();
    for (b, m) in value.iter_mut().zip(FINGERPRINT_XOR_MASK) {
        *b ^= m;
    }
    value
}

/// Reads a received fingerprint body. The stored bytes are kept
/// verbatim; validation is a recompute-and-compare by the caller.
pub fn decode_fingerprint(body: &[u8]) -> Result<[u8; 4]> {
    if body.len() != 4 {
        return Err(Error::AttributeLength {
            ty: FINGERPRINT,
            expected: 4,
            actual: body.len(),
        });
    }
    let mut value = [0u8; 4];
    value.copy_from_slice(body);
    Ok(value)
}

/// HMAC-SHA1 over the message bytes preceding the integrity attribute,
/// with the header length already counting the attribute itself.
pub fn message_integrity_value(message: &[u8], key: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC key length is valid");
    mac.update(message);
    let mut value = [0u8; 20];
    value.copy_from_slice(&mac.finalize().into_bytes());
    value
}

pub fn encode_address(addr: SocketAddr) -> Bytes {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(FAMILY_IPV4);
            buf.put_u16(addr.port());
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(FAMILY_IPV6);
            buf.put_u16(addr.port());
            buf.put_slice(&ip.octets());
        }
    }
    buf.freeze()
}

pub fn decode_address(body: &[u8]) -> Result<SocketAddr> {
    decode_address_inner(body, MAPPED_ADDRESS)
}

/// The xor mapping is an involution, so encoding is decoding applied to
/// the already-xored transport address.
pub fn encode_xor_address(addr: SocketAddr, id: &TransactionId) -> Bytes {
    encode_address(xor_transport(addr, id))
}

pub fn decode_xor_address(body: &[u8], id: &TransactionId) -> Result<SocketAddr> {
    let xored = decode_address_inner(body, XOR_MAPPED_ADDRESS)?;
    Ok(xor_transport(xored, id))
}

fn xor_transport(addr: SocketAddr, id: &TransactionId) -> SocketAddr {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = match addr.ip() {
        IpAddr::V4(ip) => {
            let bits = u32::from(ip) ^ MAGIC_COOKIE;
            IpAddr::V4(Ipv4Addr::from(bits))
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            let mask = MAGIC_COOKIE.to_be_bytes();
            for (o, m) in octets
                .iter_mut()
                .zip(mask.iter().chain(id.as_bytes().iter()))
            {
                *o ^= m;
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    SocketAddr::new(ip, port)
}

fn decode_address_inner(body: &[u8], ty: u16) -> Result<SocketAddr> {
    if body.len() < 4 {
        return Err(Error::AttributeLength {
            ty,
            expected: 8,
            actual: body.len(),
        });
    }
    let family = body[1];
    let port = u16::from_be_bytes([body[2], body[3]]);
    match family {
        FAMILY_IPV4 => {
            if body.len() != 8 {
                return Err(Error::AttributeLength {
                    ty,
                    expected: 8,
                    actual: body.len(),
                });
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&body[4..8]);
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        FAMILY_IPV6 => {
            if body.len() != 20 {
                return Err(Error::AttributeLength {
                    ty,
                    expected: 20,
                    actual: body.len(),
                });
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[4..20]);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(Error::UnknownAddressFamily(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn fingerprint_is_masked_crc() {
        let message = b"exact bytes matter here, all of them";
        let expected = (CRC32.checksum(message) ^ u32::from_be_bytes(FINGERPRINT_XOR_MASK))
            .to_be_bytes();
        assert_eq!(fingerprint_value(message), expected);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let message = [0x21u8; 48];
        assert_eq!(fingerprint_value(&message), fingerprint_value(&message));
    }

    #[rstest]
    #[case(0)]
    #[case(7)]
    #[case(23)]
    #[case(47)]
    fn fingerprint_reacts_to_any_byte(#[case] index: usize) {
        let mut message = [0xabu8; 48];
        let original = fingerprint_value(&message);
        message[index] ^= 0x01;
        assert_ne!(fingerprint_value(&message), original);
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    #[case(5)]
    fn fingerprint_body_must_be_four_bytes(#[case] len: usize) {
        let body = vec![0u8; len];
        match decode_fingerprint(&body) {
            Err(Error::AttributeLength {
                ty,
                expected,
                actual,
            }) => {
                assert_eq!(ty, FINGERPRINT);
                assert_eq!(expected, 4);
                assert_eq!(actual, len);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fingerprint_body_kept_verbatim() {
        assert_eq!(
            decode_fingerprint(&[0xde, 0xad, 0xbe, 0xef]).unwrap(),
            [0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn message_integrity_depends_on_key() {
        let message = [0x42u8; 32];
        let a = message_integrity_value(&message, b"first key");
        let b = message_integrity_value(&message, b"second key");
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
        assert_eq!(a, message_integrity_value(&message, b"first key"));
    }

    #[test]
    fn xor_mapped_rfc5769_response_vector() {
        // XOR-MAPPED-ADDRESS value from the sample IPv4 response of
        // RFC 5769, carrying 192.0.2.1:32853.
        let id = TransactionId::from_bytes(&[
            0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae,
        ]);
        let body = [0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43];
        let addr = decode_xor_address(&body, &id).unwrap();
        assert_eq!(addr, "192.0.2.1:32853".parse().unwrap());
    }

    #[test]
    fn xor_mapped_v6_round_trips() {
        let id = TransactionId::new();
        let addr: SocketAddr = "[2001:db8::42]:3478".parse().unwrap();
        let body = encode_xor_address(addr, &id);
        assert_eq!(decode_xor_address(&body, &id).unwrap(), addr);
    }

    #[test]
    fn mapped_address_round_trips() {
        let addr: SocketAddr = "203.0.113.9:9988".parse().unwrap();
        let body = encode_address(addr);
        assert_eq!(decode_address(&body).unwrap(), addr);
    }

    #[test]
    fn unknown_family_is_rejected() {
        let body = [0x00, 0x03, 0x00, 0x50, 1, 2, 3, 4];
        assert!(matches!(
            decode_address(&body),
            Err(Error::UnknownAddressFamily(0x03))
        ));
    }

    #[test]
    fn truncated_address_is_rejected() {
        let body = [0x00, 0x01, 0x00, 0x50, 1, 2];
        assert!(matches!(
            decode_address(&body),
            Err(Error::AttributeLength { .. })
        ));
    }

    #[test]
    fn padded_size_rounds_up() {
        let attr = Attribute {
            ty: 0x8022,
            value: Bytes::from_static(b"tester"),
        };
        assert_eq!(attr.padded_size(), 4 + 8);
    }
}
