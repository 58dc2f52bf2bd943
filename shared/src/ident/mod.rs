// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! 128-bit attribution identifiers.
//!
//! Every cross-language call, topology transition and security event is
//! stamped with an [`Identifier`] so it can be attributed independently of
//! any other record. An identifier is a plain 16-byte value with four
//! stable ASCII renderings; parsers detect the rendering from the string
//! shape alone.

use std::fmt::{self, Formatter};
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of an identifier in bytes.
pub const IDENTIFIER_LEN: usize = 16;

/// The version nibble stamped into byte 6, as for a random UUID.
pub const VERSION_NIBBLE: u8 = 4;

/// The variant bits stamped into byte 8, as for a random UUID.
pub const VARIANT_BITS: u8 = 0b10;

const HYPHENATED_LEN: usize = 36;
const COMPACT_LEN: usize = 32;
const CRYPTONOMIC_LEN: usize = 38;
const CRYPTONOMIC_PREFIX: &str = "C-";

/// Positions of the hyphens in the 8-4-4-4-12 renderings.
const HYPHENS: [usize; 4] = [8, 13, 18, 23];

/// One of the four string renderings of an [`Identifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierFormat {
    /// Uppercase hyphenated 8-4-4-4-12.
    Guid,
    /// Lowercase hyphenated 8-4-4-4-12.
    Uuid,
    /// Compact lowercase, 32 hex characters.
    Compact,
    /// `C-` prefix followed by the lowercase hyphenated form.
    Cryptonomic,
}

impl IdentifierFormat {
    pub fn name(self) -> &'static str {
        match self {
            IdentifierFormat::Guid => "guid",
            IdentifierFormat::Uuid => "uuid",
            IdentifierFormat::Compact => "compact",
            IdentifierFormat::Cryptonomic => "cryptonomic",
        }
    }
}

impl Default for IdentifierFormat {
    fn default() -> Self {
        IdentifierFormat::Uuid
    }
}

/// Error produced when parsing an identifier string.
///
/// All variants surface as the stable `InvalidFormat` code; the variants
/// exist so log lines can say what actually went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("identifier has unrecognized length {0}")]
    UnexpectedLength(usize),
    #[error("identifier delimiters match no accepted rendering")]
    BadDelimiters,
    #[error("identifier contains a non-hexadecimal character")]
    BadCharacter,
    #[error("identifier mixes upper and lower case hex digits")]
    MixedCase,
}

impl IdentifierError {
    pub fn code(&self) -> crate::error::ErrorCode {
        crate::error::ErrorCode::InvalidFormat
    }
}

/// A 128-bit attribution token.
///
/// Identifiers are value types with no lifecycle. Random identifiers carry
/// the canonical version/variant bits of a random UUID; cryptonomic
/// identifiers are derived deterministically from a namespace, a state id
/// and an event id, and carry the same version/variant bits (stamped last,
/// over the encoded fields).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier([u8; IDENTIFIER_LEN]);

impl Identifier {
    /// The all-zero identifier. Never produced by generation; useful as a
    /// sentinel in tests.
    pub const NIL: Identifier = Identifier([0; IDENTIFIER_LEN]);

    pub const fn from_bytes(bytes: [u8; IDENTIFIER_LEN]) -> Self {
        Identifier(bytes)
    }

    pub const fn to_bytes(self) -> [u8; IDENTIFIER_LEN] {
        self.0
    }

    /// Generate a random identifier.
    ///
    /// Uses the calling thread's RNG state; generation never takes a
    /// process-wide lock.
    pub fn random() -> Self {
        let mut bytes = [0u8; IDENTIFIER_LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        stamp_version_variant(&mut bytes);
        Identifier(bytes)
    }

    /// Deterministically derive a cryptonomic identifier from a namespace
    /// string, a 32-bit state id and a 32-bit event id.
    ///
    /// The derivation is a BLAKE2b keyed hash (key: the namespace bytes,
    /// pre-hashed when longer than the BLAKE2b key limit) over the
    /// big-endian state and event ids, truncated to 16 bytes. Bytes 4..8
    /// are then overwritten with the big-endian state id, bytes 8..12 with
    /// the big-endian event id, and the version/variant bits are stamped
    /// last. The stamping order makes the state id an effective 28-bit
    /// space: its rendered top nibble at byte 6 always reads 4.
    pub fn derive(namespace: &str, state_id: u32, event_id: u32) -> Self {
        let ns = namespace.as_bytes();
        let mut key_buf;
        let key: &[u8] = if ns.len() <= blake2b_simd::KEYBYTES {
            ns
        } else {
            key_buf = [0u8; 32];
            key_buf.copy_from_slice(
                &blake2b_simd::Params::new()
                    .hash_length(32)
                    .hash(ns)
                    .as_bytes()[..32],
            );
            &key_buf
        };

        let digest = blake2b_simd::Params::new()
            .hash_length(IDENTIFIER_LEN)
            .key(key)
            .to_state()
            .update(&state_id.to_be_bytes())
            .update(&event_id.to_be_bytes())
            .finalize();

        let mut bytes = [0u8; IDENTIFIER_LEN];
        bytes.copy_from_slice(digest.as_bytes());
        BigEndian::write_u32(&mut bytes[4..8], state_id);
        BigEndian::write_u32(&mut bytes[8..12], event_id);
        stamp_version_variant(&mut bytes);
        Identifier(bytes)
    }

    /// The version nibble (upper nibble of byte 6).
    pub fn version(self) -> u8 {
        self.0[6] >> 4
    }

    /// The variant bits (upper two bits of byte 8).
    pub fn variant(self) -> u8 {
        self.0[8] >> 6
    }

    /// The namespace-derived prefix of a cryptonomic identifier
    /// (bytes 0..4).
    pub fn namespace_prefix(self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out.copy_from_slice(&self.0[0..4]);
        out
    }

    /// The encoded state id, read big-endian from bytes 4..8. For derived
    /// identifiers the top nibble of the third byte reads as the version
    /// stamp, so only 28 bits round-trip.
    pub fn state_id(self) -> u32 {
        BigEndian::read_u32(&self.0[4..8])
    }

    /// The encoded event id, read big-endian from bytes 8..12. The top two
    /// bits read as the variant stamp.
    pub fn event_id(self) -> u32 {
        BigEndian::read_u32(&self.0[8..12])
    }

    /// Render in the requested format.
    pub fn render(self, format: IdentifierFormat) -> String {
        match format {
            IdentifierFormat::Guid => self.hyphenated(true),
            IdentifierFormat::Uuid => self.hyphenated(false),
            IdentifierFormat::Compact => {
                let mut out = String::with_capacity(COMPACT_LEN);
                for b in self.0 {
                    push_hex(&mut out, b, false);
                }
                out
            }
            IdentifierFormat::Cryptonomic => {
                let mut out = String::with_capacity(CRYPTONOMIC_LEN);
                out.push_str(CRYPTONOMIC_PREFIX);
                out.push_str(&self.hyphenated(false));
                out
            }
        }
    }

    /// Parse any of the four renderings, detecting the format from the
    /// string shape: 36 characters with hyphens at positions 8/13/18/23
    /// (case selects GUID or UUID), 32 bare hex characters, or 38
    /// characters with a literal `C-` prefix. Anything else is rejected.
    pub fn parse(s: &str) -> Result<(Self, IdentifierFormat), IdentifierError> {
        match s.len() {
            HYPHENATED_LEN => {
                let (id, upper) = parse_hyphenated(s)?;
                let format = if upper {
                    IdentifierFormat::Guid
                } else {
                    IdentifierFormat::Uuid
                };
                Ok((id, format))
            }
            COMPACT_LEN => {
                let mut bytes = [0u8; IDENTIFIER_LEN];
                let raw = s.as_bytes();
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = decode_byte_lower(raw[2 * i], raw[2 * i + 1])?;
                }
                Ok((Identifier(bytes), IdentifierFormat::Compact))
            }
            CRYPTONOMIC_LEN => {
                let tail = s
                    .strip_prefix(CRYPTONOMIC_PREFIX)
                    .ok_or(IdentifierError::BadDelimiters)?;
                let (id, upper) = parse_hyphenated(tail)?;
                if upper {
                    // The cryptonomic rendering is defined over the
                    // lowercase hyphenated form only.
                    return Err(IdentifierError::MixedCase);
                }
                Ok((id, IdentifierFormat::Cryptonomic))
            }
            other => Err(IdentifierError::UnexpectedLength(other)),
        }
    }

    fn hyphenated(self, upper: bool) -> String {
        let mut out = String::with_capacity(HYPHENATED_LEN);
        for (i, b) in self.0.iter().enumerate() {
            push_hex(&mut out, *b, upper);
            if i == 3 || i == 5 || i == 7 || i == 9 {
                out.push('-');
            }
        }
        out
    }
}

fn stamp_version_variant(bytes: &mut [u8; IDENTIFIER_LEN]) {
    bytes[6] = (bytes[6] & 0x0f) | (VERSION_NIBBLE << 4);
    bytes[8] = (bytes[8] & 0x3f) | (VARIANT_BITS << 6);
}

fn push_hex(out: &mut String, byte: u8, upper: bool) {
    let table: &[u8; 16] = if upper {
        b"0123456789ABCDEF"
    } else {
        b"0123456789abcdef"
    };
    out.push(table[(byte >> 4) as usize] as char);
    out.push(table[(byte & 0x0f) as usize] as char);
}

/// Decode a hyphenated 8-4-4-4-12 string, returning the identifier and
/// whether the alphabetic digits were uppercase. Mixed case matches no
/// rendering.
fn parse_hyphenated(s: &str) -> Result<(Identifier, bool), IdentifierError> {
    debug_assert_eq!(s.len(), HYPHENATED_LEN);
    let raw = s.as_bytes();
    let mut seen_upper = false;
    let mut seen_lower = false;
    let mut bytes = [0u8; IDENTIFIER_LEN];
    let mut nibbles = [0u8; 32];
    let mut n = 0;

    for (pos, &c) in raw.iter().enumerate() {
        if HYPHENS.contains(&pos) {
            if c != b'-' {
                return Err(IdentifierError::BadDelimiters);
            }
            continue;
        }
        let nibble = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => {
                seen_lower = true;
                c - b'a' + 10
            }
            b'A'..=b'F' => {
                seen_upper = true;
                c - b'A' + 10
            }
            b'-' => return Err(IdentifierError::BadDelimiters),
            _ => return Err(IdentifierError::BadCharacter),
        };
        nibbles[n] = nibble;
        n += 1;
    }

    if seen_upper && seen_lower {
        return Err(IdentifierError::MixedCase);
    }
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (nibbles[2 * i] << 4) | nibbles[2 * i + 1];
    }
    Ok((Identifier(bytes), seen_upper))
}

fn decode_byte_lower(hi: u8, lo: u8) -> Result<u8, IdentifierError> {
    let nib = |c: u8| match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        // The compact rendering is lowercase by definition; uppercase here
        // is not one of the four shapes.
        b'A'..=b'F' => Err(IdentifierError::MixedCase),
        _ => Err(IdentifierError::BadCharacter),
    };
    Ok((nib(hi)? << 4) | nib(lo)?)
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(IdentifierFormat::Uuid))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({self})")
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Identifier::parse(s).map(|(id, _)| id)
    }
}

impl Serialize for Identifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.render(IdentifierFormat::Uuid))
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(feature = "arb")]
impl quickcheck::Arbitrary for Identifier {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let mut bytes = [0u8; IDENTIFIER_LEN];
        for b in bytes.iter_mut() {
            *b = u8::arbitrary(g);
        }
        Identifier(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_have_the_documented_shapes() {
        let id = Identifier::from_bytes([
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0x4c, 0xde, 0x8f, 0x01, 0x23, 0x45, 0x67, 0x89,
            0x0a, 0xbc,
        ]);
        assert_eq!(
            id.render(IdentifierFormat::Uuid),
            "01234567-89ab-4cde-8f01-234567890abc"
        );
        assert_eq!(
            id.render(IdentifierFormat::Guid),
            "01234567-89AB-4CDE-8F01-234567890ABC"
        );
        assert_eq!(
            id.render(IdentifierFormat::Compact),
            "0123456789ab4cde8f01234567890abc"
        );
        assert_eq!(
            id.render(IdentifierFormat::Cryptonomic),
            "C-01234567-89ab-4cde-8f01-234567890abc"
        );
    }

    #[test]
    fn parse_detects_cryptonomic() {
        let (id, format) = Identifier::parse("C-01234567-89ab-4cde-8f01-234567890abc").unwrap();
        assert_eq!(format, IdentifierFormat::Cryptonomic);
        assert_eq!(id.version(), 4);
        assert_eq!(id.variant(), 0b10);
    }

    #[test]
    fn parse_rejects_other_shapes() {
        for bad in [
            "",
            "0123",
            "01234567_89ab_4cde_8f01_234567890abc",
            "01234567-89ab-4cde-8f01-234567890abg",
            "0123456789AB4cde8f01234567890abc",
            "c-01234567-89ab-4cde-8f01-234567890abc",
            "C-01234567-89AB-4CDE-8F01-234567890ABC",
            "01234567-89Ab-4cde-8f01-234567890abc",
        ] {
            assert!(Identifier::parse(bad).is_err(), "{bad:?} must not parse");
        }
    }

    #[test]
    fn random_is_stamped_and_unique_enough() {
        let a = Identifier::random();
        let b = Identifier::random();
        assert_eq!(a.version(), 4);
        assert_eq!(a.variant(), 0b10);
        assert_ne!(a, b);
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = Identifier::derive("topology", 7, 42);
        let b = Identifier::derive("topology", 7, 42);
        let c = Identifier::derive("policy", 7, 42);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a.namespace_prefix(), c.namespace_prefix());
    }

    #[test]
    fn derivation_encodes_fields_under_the_stamp() {
        let id = Identifier::derive("resource", 0x0102_0304, 0x0a0b_0c0d);
        // Byte 6's top nibble is the version stamp; the rest of the state
        // id survives.
        assert_eq!(id.state_id(), (0x0102_0304 & !0x0000_f000) | 0x0000_4000);
        // Byte 8's top two bits are the variant stamp.
        assert_eq!(id.event_id(), (0x0a0b_0c0d & 0x3fff_ffff) | 0x8000_0000);
        assert_eq!(id.version(), 4);
        assert_eq!(id.variant(), 0b10);
    }

    #[test]
    fn long_namespaces_are_accepted() {
        let ns = "n".repeat(200);
        let a = Identifier::derive(&ns, 1, 2);
        let b = Identifier::derive(&ns, 1, 2);
        assert_eq!(a, b);
    }
}
