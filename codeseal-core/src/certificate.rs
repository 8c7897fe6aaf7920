//! Certificate trust validation
//!
//! The trust model is flat: a set of root certificates, and one leaf certificate
//! per descriptor that must be issued directly by one of those roots. There is
//! no intermediate CA support, no revocation and no validity period check.
//!
//! The leaf's Common Name scopes the signature to one artifact. The CN `core`
//! is the platform's own signing identity and is accepted for every artifact.

use crate::error::IntegrityError;
use openssl::nid::Nid;
use openssl::x509::{X509Ref, X509VerifyResult, X509};
use std::path::Path;
use tracing::debug;

/// Common Name accepted for every artifact identity
pub const UNIVERSAL_SCOPE: &str = "core";

/// Trusted root certificates
#[derive(Clone)]
pub struct TrustStore {
    anchors: Vec<X509>,
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("anchors", &self.anchors.len())
            .finish()
    }
}

impl TrustStore {
    /// Parse one or more concatenated PEM root certificates
    pub fn from_pem(bundle: &[u8], source: &Path) -> Result<Self, IntegrityError> {
        let anchors =
            X509::stack_from_pem(bundle).map_err(|e| IntegrityError::TrustAnchorUnavailable {
                path: source.to_path_buf(),
                reason: e.to_string(),
            })?;

        if anchors.is_empty() {
            return Err(IntegrityError::TrustAnchorUnavailable {
                path: source.to_path_buf(),
                reason: "no certificates found".to_string(),
            });
        }

        debug!("Loaded {} trusted root certificates from {:?}", anchors.len(), source);
        Ok(TrustStore { anchors })
    }

    pub fn from_certificates(anchors: Vec<X509>) -> Self {
        TrustStore { anchors }
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Check that `leaf` was issued by a trusted root and is scoped to `required_cn`
    pub fn validate(&self, leaf: &X509Ref, required_cn: &str) -> Result<(), IntegrityError> {
        if !self.chains_to_anchor(leaf) {
            return Err(IntegrityError::TrustChainInvalid);
        }

        let actual = common_name(leaf).unwrap_or_default();
        if actual != required_cn && actual != UNIVERSAL_SCOPE {
            return Err(IntegrityError::ScopeMismatch {
                requested: required_cn.to_string(),
                actual,
            });
        }

        debug!("Certificate CN={} accepted for {}", actual, required_cn);
        Ok(())
    }

    fn chains_to_anchor(&self, leaf: &X509Ref) -> bool {
        self.anchors.iter().any(|anchor| {
            if anchor.issued(leaf) != X509VerifyResult::OK {
                return false;
            }
            match anchor.public_key() {
                Ok(key) => leaf.verify(&key).unwrap_or(false),
                Err(_) => false,
            }
        })
    }
}

/// Parse a PEM leaf certificate; an unparsable certificate cannot be trusted
pub fn parse_leaf(pem: &str) -> Result<X509, IntegrityError> {
    X509::from_pem(pem.as_bytes()).map_err(|_| IntegrityError::TrustChainInvalid)
}

/// Subject Common Name of a certificate
pub fn common_name(cert: &X509Ref) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder, X509};

    pub fn key() -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
    }

    /// Certificate for `cn` issued by `issuer` (self-signed when `None`)
    pub fn certificate(
        cn: &str,
        key: &PKey<Private>,
        issuer: Option<(&X509, &PKey<Private>)>,
    ) -> X509 {
        let mut name_builder = X509NameBuilder::new().unwrap();
        name_builder.append_entry_by_text("CN", cn).unwrap();
        let name = name_builder.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(rand_serial()).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_pubkey(key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(365).unwrap()).unwrap();

        match issuer {
            Some((issuer_cert, issuer_key)) => {
                builder.set_issuer_name(issuer_cert.subject_name()).unwrap();
                builder.sign(issuer_key, MessageDigest::sha256()).unwrap();
            }
            None => {
                builder.set_issuer_name(&name).unwrap();
                builder.sign(key, MessageDigest::sha256()).unwrap();
            }
        }
        builder.build()
    }

    fn rand_serial() -> u32 {
        let mut buf = [0u8; 4];
        openssl::rand::rand_bytes(&mut buf).unwrap();
        u32::from_be_bytes(buf) >> 1
    }
}
