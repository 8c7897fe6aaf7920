//! Signature descriptor structure and the canonical signed payload
//!
//! The descriptor binds a digest map to a leaf certificate and a signature:
//!
//! ```json
//! {
//!     "hashes": { "<relative path>": "<hex sha512>" },
//!     "signature": "<base64>",
//!     "certificate": "-----BEGIN CERTIFICATE-----..."
//! }
//! ```
//!
//! The signed bytes are the compact JSON encoding of the sorted digest map,
//! written with the escaping rules of the signing tool that produced existing
//! descriptors (`/` as `\/`, non-ASCII as `\uXXXX`, empty map as `[]`). Any
//! deviation here breaks verification of signatures made elsewhere.

use crate::error::IntegrityError;
use crate::hasher::DigestMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::ser::{CompactFormatter, Formatter, PrettyFormatter};
use std::io;
use std::path::Path;

/// The persisted signature of one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureDescriptor {
    /// Expected digest of every file in the artifact
    #[serde(
        deserialize_with = "deserialize_digest_map",
        serialize_with = "serialize_digest_map"
    )]
    pub hashes: DigestMap,

    /// Base64 RSA-PSS signature over the canonical payload of `hashes`
    pub signature: String,

    /// PEM encoded leaf certificate of the signer
    pub certificate: String,
}

impl SignatureDescriptor {
    pub fn new(hashes: DigestMap, signature: &[u8], certificate_pem: &str) -> Self {
        SignatureDescriptor {
            hashes,
            signature: STANDARD.encode(signature),
            certificate: certificate_pem.to_string(),
        }
    }

    /// Parse a descriptor read from `path`
    pub fn parse(content: &[u8], path: &Path) -> Result<Self, IntegrityError> {
        serde_json::from_slice(content).map_err(|e| IntegrityError::MalformedDescriptor {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Raw signature bytes
    pub fn signature_bytes(&self, path: &Path) -> Result<Vec<u8>, IntegrityError> {
        STANDARD
            .decode(self.signature.trim())
            .map_err(|e| IntegrityError::MalformedDescriptor {
                path: path.to_path_buf(),
                reason: format!("signature is not valid base64: {e}"),
            })
    }

    /// The bytes that were signed
    pub fn payload(&self) -> Result<Vec<u8>, IntegrityError> {
        canonical_payload(&self.hashes)
    }

    /// Pretty printed descriptor, four space indentation
    pub fn to_pretty_json(&self) -> Result<Vec<u8>, IntegrityError> {
        Ok(write_escaped(self, PrettyFormatter::with_indent(b"    "))?)
    }
}

/// Pretty JSON with the descriptor escaping; an empty object renders as `[]`
pub fn to_pretty_escaped<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, IntegrityError> {
    let out = write_escaped(value, PrettyFormatter::with_indent(b"    "))?;
    if out == b"{}" {
        return Ok(b"[]".to_vec());
    }
    Ok(out)
}

/// Canonical byte sequence signed for a digest map
pub fn canonical_payload(hashes: &DigestMap) -> Result<Vec<u8>, IntegrityError> {
    if hashes.is_empty() {
        return Ok(b"[]".to_vec());
    }
    Ok(write_escaped(hashes, CompactFormatter)?)
}

fn write_escaped<T: Serialize + ?Sized, F: Formatter>(value: &T, formatter: F) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, EscapingFormatter(formatter));
    value.serialize(&mut ser)?;
    Ok(out)
}

fn serialize_digest_map<S: Serializer>(hashes: &DigestMap, serializer: S) -> Result<S::Ok, S::Error> {
    if hashes.is_empty() {
        let empty: [(); 0] = [];
        return empty.serialize(serializer);
    }
    hashes.serialize(serializer)
}

fn deserialize_digest_map<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DigestMap, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MapOrEmptyList {
        Map(DigestMap),
        List(Vec<serde_json::Value>),
    }

    match MapOrEmptyList::deserialize(deserializer)? {
        MapOrEmptyList::Map(map) => Ok(map),
        MapOrEmptyList::List(list) if list.is_empty() => Ok(DigestMap::new()),
        MapOrEmptyList::List(_) => Err(serde::de::Error::custom("hashes must be an object")),
    }
}

/// Wraps a serde_json formatter and escapes `/` and non-ASCII characters
struct EscapingFormatter<F>(F);

impl<F: Formatter> Formatter for EscapingFormatter<F> {
    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        let mut start = 0;
        for (idx, ch) in fragment.char_indices() {
            if ch != '/' && ch.is_ascii() {
                continue;
            }
            writer.write_all(fragment[start..idx].as_bytes())?;
            if ch == '/' {
                writer.write_all(b"\\/")?;
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
            start = idx + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }

    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_array(writer)
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.0.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object(writer)
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.0.begin_object_key(writer, first)
    }

    fn end_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object_key(writer)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object_value(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn hashes(entries: &[(&str, &str)]) -> DigestMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_canonical_payload_is_sorted_compact_and_escaped() {
        let map = hashes(&[("lib/b.php", "bb"), ("a.txt", "aa"), ("l10n/é.js", "cc")]);
        let payload = String::from_utf8(canonical_payload(&map).unwrap()).unwrap();
        assert_eq!(
            payload,
            r#"{"a.txt":"aa","l10n\/\u00e9.js":"cc","lib\/b.php":"bb"}"#
        );
    }

    #[test]
    fn test_canonical_payload_escapes_astral_characters_as_surrogates() {
        let map = hashes(&[("😀", "x")]);
        let payload = String::from_utf8(canonical_payload(&map).unwrap()).unwrap();
        assert_eq!(payload, r#"{"\ud83d\ude00":"x"}"#);
    }

    #[test]
    fn test_canonical_payload_of_empty_map() {
        assert_eq!(canonical_payload(&DigestMap::new()).unwrap(), b"[]".to_vec());
    }

    #[test]
    fn test_pretty_escaped_uses_descriptor_escaping() {
        let map = hashes(&[("application/pdf", "x-office/document")]);
        let json = String::from_utf8(to_pretty_escaped(&map).unwrap()).unwrap();
        assert_eq!(json, "{\n    \"application\\/pdf\": \"x-office\\/document\"\n}");
        assert_eq!(to_pretty_escaped(&DigestMap::new()).unwrap(), b"[]".to_vec());
        assert_eq!(to_pretty_escaped(&Vec::<String>::new()).unwrap(), b"[]".to_vec());
    }

    #[test]
    fn test_pretty_escaped_reports_unencodable_values() {
        let map = std::collections::BTreeMap::from([(vec![1u8, 2], "x".to_string())]);
        let err = to_pretty_escaped(&map).unwrap_err();
        assert!(matches!(err, IntegrityError::Encoding(_)));
        assert_eq!(err.kind(), "Encoding");
    }

    #[test]
    fn test_descriptor_pretty_json_round_trip() {
        let descriptor = SignatureDescriptor::new(
            hashes(&[("appinfo/info.xml", "abc")]),
            b"sig",
            "-----BEGIN CERTIFICATE-----\nMIIB/w==\n-----END CERTIFICATE-----\n",
        );
        let json = String::from_utf8(descriptor.to_pretty_json().unwrap()).unwrap();
        assert!(json.starts_with("{\n    \"hashes\": {\n        \"appinfo\\/info.xml\": \"abc\"\n    },"));
        assert!(json.contains("MIIB\\/w=="));

        let parsed = SignatureDescriptor::parse(json.as_bytes(), Path::new("signature.json")).unwrap();
        assert_eq!(parsed, descriptor);
        assert_eq!(parsed.signature_bytes(Path::new("signature.json")).unwrap(), b"sig");
    }

    #[test]
    fn test_descriptor_accepts_empty_list_for_hashes() {
        let json = br#"{"hashes": [], "signature": "", "certificate": ""}"#;
        let parsed = SignatureDescriptor::parse(json, Path::new("signature.json")).unwrap();
        assert!(parsed.hashes.is_empty());
    }

    #[test]
    fn test_descriptor_rejects_garbage() {
        let path = PathBuf::from("/srv/app/appinfo/signature.json");
        let err = SignatureDescriptor::parse(b"not json", &path).unwrap_err();
        assert!(matches!(err, IntegrityError::MalformedDescriptor { .. }));
        assert_eq!(err.to_string(), "Signature data not found.");
    }

    #[test]
    fn test_signature_bytes_rejects_invalid_base64() {
        let descriptor = SignatureDescriptor {
            hashes: DigestMap::new(),
            signature: "***".to_string(),
            certificate: String::new(),
        };
        assert!(descriptor.signature_bytes(Path::new("x")).is_err());
    }
}
