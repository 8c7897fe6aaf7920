//! RSA-PSS signing and verification of canonical payloads
//!
//! Parameters are fixed: SHA-512 message digest, MGF1 with SHA-512 and a salt
//! length of zero. Descriptors signed with any other parameters do not verify.

use crate::error::IntegrityError;
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::rsa::Padding;
use openssl::sign::{RsaPssSaltlen, Signer, Verifier};
use openssl::x509::{X509Ref, X509};
use tracing::debug;

/// Leaf certificate and private key used to sign an artifact
pub struct SigningCredentials {
    pub certificate: X509,
    pub private_key: PKey<Private>,
}

impl std::fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("certificate", &crate::certificate::common_name(&self.certificate))
            .finish_non_exhaustive()
    }
}

impl SigningCredentials {
    pub fn new(certificate: X509, private_key: PKey<Private>) -> Self {
        SigningCredentials {
            certificate,
            private_key,
        }
    }

    /// Load a PEM certificate and a PEM private key
    pub fn from_pem(certificate_pem: &[u8], private_key_pem: &[u8]) -> Result<Self, IntegrityError> {
        Ok(SigningCredentials {
            certificate: X509::from_pem(certificate_pem)?,
            private_key: PKey::private_key_from_pem(private_key_pem)?,
        })
    }

    /// The certificate as embedded in a descriptor
    pub fn certificate_pem(&self) -> Result<String, IntegrityError> {
        let pem = self.certificate.to_pem()?;
        Ok(String::from_utf8_lossy(&pem).into_owned())
    }

    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, IntegrityError> {
        sign_payload(payload, &self.private_key)
    }
}

/// Sign `payload` with RSA-PSS / SHA-512 / salt 0
pub fn sign_payload(payload: &[u8], key: &PKeyRef<Private>) -> Result<Vec<u8>, IntegrityError> {
    let mut signer = Signer::new(MessageDigest::sha512(), key)?;
    signer.set_rsa_padding(Padding::PKCS1_PSS)?;
    signer.set_rsa_pss_saltlen(RsaPssSaltlen::custom(0))?;
    signer.set_rsa_mgf1_md(MessageDigest::sha512())?;
    signer.update(payload)?;
    Ok(signer.sign_to_vec()?)
}

/// Verify `signature` over `payload` with the public key of `leaf`
pub fn verify_payload(payload: &[u8], signature: &[u8], leaf: &X509Ref) -> Result<(), IntegrityError> {
    let key = leaf.public_key().map_err(|_| IntegrityError::SignatureInvalid)?;
    match verify_with_key(payload, signature, &key) {
        Ok(true) => {
            debug!("Signature verified ({} payload bytes)", payload.len());
            Ok(())
        }
        Ok(false) => Err(IntegrityError::SignatureInvalid),
        Err(e) => {
            debug!("Signature verification errored: {}", e);
            Err(IntegrityError::SignatureInvalid)
        }
    }
}

fn verify_with_key<T: HasPublic>(
    payload: &[u8],
    signature: &[u8],
    key: &PKeyRef<T>,
) -> Result<bool, openssl::error::ErrorStack> {
    let mut verifier = Verifier::new(MessageDigest::sha512(), key)?;
    verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
    verifier.set_rsa_pss_saltlen(RsaPssSaltlen::custom(0))?;
    verifier.set_rsa_mgf1_md(MessageDigest::sha512())?;
    verifier.update(payload)?;
    verifier.verify(signature)
}
