//! Codeseal library exports
//!
//! Signs deployed code trees and verifies installed trees against their
//! signed digest maps.

pub mod certificate;
pub mod checker;
pub mod config;
pub mod descriptor;
pub mod diff;
pub mod environment;
pub mod error;
pub mod hasher;
pub mod mimetype;
pub mod results;
pub mod signer;
pub mod walker;

pub use checker::{Checker, CheckerSettings, Collaborators, CORE_IDENTITY};
pub use config::{EnforcementPolicy, IntegrityConfig};
pub use descriptor::SignatureDescriptor;
pub use diff::DifferenceReport;
pub use error::IntegrityError;
pub use results::VerificationResults;
pub use signer::SigningCredentials;
