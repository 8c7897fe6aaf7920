//! Integrity error types with clear, actionable messages

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while signing or verifying an artifact
#[derive(Error, Debug)]
pub enum IntegrityError {
    /// The signature descriptor could not be read
    #[error("Signature data not found.")]
    MissingOrUnreadableDescriptor {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The signature descriptor is not a valid descriptor document
    #[error("Signature data not found.")]
    MalformedDescriptor { path: PathBuf, reason: String },

    /// The trusted root bundle could not be read or contained no certificates
    #[error("Trusted root certificates could not be loaded from {path}")]
    TrustAnchorUnavailable { path: PathBuf, reason: String },

    /// The leaf certificate does not chain to any trusted root
    #[error("Certificate is not valid.")]
    TrustChainInvalid,

    /// The leaf certificate is valid but issued for another artifact
    #[error("Certificate is not valid for required scope. (Requested: {requested}, current: CN={actual})")]
    ScopeMismatch { requested: String, actual: String },

    /// The signature over the digest map does not verify
    #[error("Signature could not get verified.")]
    SignatureInvalid,

    /// The artifact locator does not know the identity
    #[error("App not found: {identity}")]
    UnknownArtifact { identity: String },

    /// The descriptor directory cannot be written
    #[error("{} is not writable", path.display())]
    NotWritable { path: PathBuf },

    /// A file could not be read or written
    #[error("I/O failure on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Signature data could not be encoded as JSON
    #[error("Failed to encode signature data: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The crypto backend rejected an operation
    #[error("Cryptographic operation failed: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// The difference engine produced a key that exists in neither map
    #[error("Invalid behaviour in file hash comparison experienced for {path}. Please report this error to the developers.")]
    InternalConsistencyFault { path: String },
}

impl IntegrityError {
    /// Short name of the failure, stored as the `class` of an `EXCEPTION` report
    pub fn kind(&self) -> &'static str {
        match self {
            IntegrityError::MissingOrUnreadableDescriptor { .. } => "MissingOrUnreadableDescriptor",
            IntegrityError::MalformedDescriptor { .. } => "MalformedDescriptor",
            IntegrityError::TrustAnchorUnavailable { .. } => "TrustAnchorUnavailable",
            IntegrityError::TrustChainInvalid => "TrustChainInvalid",
            IntegrityError::ScopeMismatch { .. } => "ScopeMismatch",
            IntegrityError::SignatureInvalid => "SignatureInvalid",
            IntegrityError::UnknownArtifact { .. } => "UnknownArtifact",
            IntegrityError::NotWritable { .. } => "NotWritable",
            IntegrityError::Io { .. } => "Io",
            IntegrityError::Encoding(_) => "Encoding",
            IntegrityError::Crypto(_) => "Crypto",
            IntegrityError::InternalConsistencyFault { .. } => "InternalConsistencyFault",
        }
    }

    /// Fatal errors are programming defects and are never folded into a report
    pub fn is_fatal(&self) -> bool {
        matches!(self, IntegrityError::InternalConsistencyFault { .. })
    }

    pub fn log_if_security_critical(&self) {
        match self {
            IntegrityError::TrustChainInvalid
            | IntegrityError::ScopeMismatch { .. }
            | IntegrityError::SignatureInvalid => {
                tracing::error!(target: "security", "INTEGRITY VIOLATION: {}", self);
            }
            IntegrityError::InternalConsistencyFault { .. } => {
                tracing::error!("{}", self);
            }
            _ => {}
        }
    }
}
