//! Verification coordinator
//!
//! The [`Checker`] ties the pieces together:
//! 1. read the artifact's signature descriptor
//! 2. validate its certificate against the trust anchors and the artifact identity
//! 3. verify the signature over the expected digest map
//! 4. hash the installed tree and diff it against the expected map
//! 5. store the outcome in the result cache
//!
//! Recoverable failures in steps 1-4 are recorded as an `EXCEPTION` report.
//! An internal consistency fault is returned to the caller and not stored.

use crate::certificate::{parse_leaf, TrustStore};
use crate::config::{EnforcementPolicy, IntegrityConfig, DEFAULT_TRUST_ANCHOR};
use crate::descriptor::{canonical_payload, SignatureDescriptor};
use crate::diff::{diff, DifferenceReport};
use crate::environment::{
    AppsDirectoryLocator, ArtifactLocator, ComponentRegistry, FileAccess, JsonFileConfigStore,
    LocalFileAccess, MemoryCache, ShippedListRegistry,
};
use crate::error::IntegrityError;
use crate::hasher::{ContentTransform, DigestBuilder, DigestMap, SentinelTruncation};
use crate::mimetype::{GeneratedAssetNormalizer, JsonMimetypeRegistry, MimetypeRegistry};
use crate::results::{ConfigStore, DistributedCache, ResultCache, VerificationResults};
use crate::signer::{verify_payload, SigningCredentials};
use crate::walker::{absolute_path, TreeWalker};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Identity of the platform itself
pub const CORE_IDENTITY: &str = "core";

/// Expected core paths exempt from comparison; the updater replaces itself
/// after the check has run
pub const UPDATER_PREFIX: &str = "updater/";

const APP_DESCRIPTOR: &str = "appinfo/signature.json";
const CORE_DESCRIPTOR: &str = "core/signature.json";

/// Installation facts the checker works with
#[derive(Debug, Clone)]
pub struct CheckerSettings {
    pub server_root: PathBuf,
    pub policy: EnforcementPolicy,
    /// PEM bundle of trusted roots
    pub trust_anchor: PathBuf,
    /// Absolute paths never hashed (app roots, custom data directory)
    pub excluded_paths: Vec<PathBuf>,
}

impl CheckerSettings {
    pub fn new(server_root: impl Into<PathBuf>) -> Self {
        let server_root = server_root.into();
        CheckerSettings {
            trust_anchor: server_root.join(DEFAULT_TRUST_ANCHOR),
            server_root,
            policy: EnforcementPolicy::new("stable", false),
            excluded_paths: Vec::new(),
        }
    }

    pub fn from_config(config: &IntegrityConfig) -> Self {
        let mut config = config.clone();
        config.resolve_server_root();
        let mut excluded_paths = config.app_roots();
        excluded_paths.extend(config.data_directory());
        CheckerSettings {
            server_root: config.server_root.clone(),
            policy: config.policy(),
            trust_anchor: config.trust_anchor_path(),
            excluded_paths,
        }
    }
}

/// Injected platform services
#[derive(Clone)]
pub struct Collaborators {
    pub files: Arc<dyn FileAccess>,
    pub locator: Arc<dyn ArtifactLocator>,
    pub registry: Arc<dyn ComponentRegistry>,
    pub mimetypes: Arc<dyn MimetypeRegistry>,
    pub cache: Arc<dyn DistributedCache>,
    pub store: Arc<dyn ConfigStore>,
}

impl Collaborators {
    /// Local filesystem implementations for an installation
    pub fn local(config: &IntegrityConfig) -> anyhow::Result<Self> {
        let locator = AppsDirectoryLocator::new(config.app_roots());
        let registry =
            ShippedListRegistry::load(&config.server_root, locator.clone(), &config.shipped_components)?;
        let mimetypes = JsonMimetypeRegistry::load(&config.server_root)?;

        Ok(Collaborators {
            files: Arc::new(LocalFileAccess),
            locator: Arc::new(locator),
            registry: Arc::new(registry),
            mimetypes: Arc::new(mimetypes),
            cache: Arc::new(MemoryCache::default()),
            store: Arc::new(JsonFileConfigStore::new(config.result_store_path())),
        })
    }
}

pub struct Checker {
    settings: CheckerSettings,
    files: Arc<dyn FileAccess>,
    locator: Arc<dyn ArtifactLocator>,
    registry: Arc<dyn ComponentRegistry>,
    mimetypes: Arc<dyn MimetypeRegistry>,
    results: ResultCache,
}

impl Checker {
    pub fn new(settings: CheckerSettings, collaborators: Collaborators) -> Self {
        Checker {
            settings,
            files: collaborators.files,
            locator: collaborators.locator,
            registry: collaborators.registry,
            mimetypes: collaborators.mimetypes,
            results: ResultCache::new(collaborators.cache, collaborators.store),
        }
    }

    /// Checker with local collaborators for the configured installation
    pub fn from_config(config: &IntegrityConfig) -> anyhow::Result<Self> {
        let mut config = config.clone();
        config.resolve_server_root();
        Ok(Self::new(CheckerSettings::from_config(&config), Collaborators::local(&config)?))
    }

    pub fn settings(&self) -> &CheckerSettings {
        &self.settings
    }

    pub fn is_code_check_enforced(&self) -> bool {
        self.settings.policy.is_enforced()
    }

    /// Verify one app and store the outcome
    ///
    /// `path` defaults to the locator's answer for `identity`. `force` runs the
    /// check even when it is not enforced for this installation.
    pub fn verify_app_signature(
        &self,
        identity: &str,
        path: Option<&Path>,
        force: bool,
    ) -> Result<DifferenceReport, IntegrityError> {
        let outcome = self.resolve_app_path(identity, path).and_then(|app_path| {
            self.verify(&app_path.join(APP_DESCRIPTOR), &app_path, identity, force)
        });
        self.settle(identity, outcome)
    }

    /// Verify the platform core and store the outcome
    pub fn verify_core_signature(&self) -> Result<DifferenceReport, IntegrityError> {
        let root = &self.settings.server_root;
        let outcome = self.verify(&root.join(CORE_DESCRIPTOR), root, CORE_IDENTITY, false);
        self.settle(CORE_IDENTITY, outcome)
    }

    /// Re-verify the core and every app that needs a signature
    ///
    /// Previous results are dropped first. Shipped apps always need a valid
    /// signature, other apps only if they carry a descriptor.
    pub fn run_instance_verification(&self) -> Result<BTreeMap<String, DifferenceReport>, IntegrityError> {
        info!("Running integrity check for {:?}", self.settings.server_root);
        if let Err(e) = self.results.clean_results() {
            warn!("Failed to clear previous integrity results: {:#}", e);
        }

        let mut reports = BTreeMap::new();
        reports.insert(CORE_IDENTITY.to_string(), self.verify_core_signature()?);

        for identity in self.registry.all_components() {
            if !self.needs_check(&identity) {
                debug!("Skipping unsigned, non-shipped app {}", identity);
                continue;
            }
            let report = self.verify_app_signature(&identity, None, false)?;
            reports.insert(identity, report);
        }

        let failed = reports.values().filter(|r| !r.is_empty()).count();
        info!("Integrity check finished: {} artifacts checked, {} with findings", reports.len(), failed);
        Ok(reports)
    }

    /// Hash, sign and write `<path>/appinfo/signature.json`
    pub fn write_app_signature(
        &self,
        path: &Path,
        credentials: &SigningCredentials,
    ) -> Result<SignatureDescriptor, IntegrityError> {
        self.write_signature(path, &self.settings.server_root, &path.join("appinfo"), credentials)
    }

    /// Hash, sign and write `<path>/core/signature.json`
    pub fn write_core_signature(
        &self,
        credentials: &SigningCredentials,
        path: &Path,
    ) -> Result<SignatureDescriptor, IntegrityError> {
        self.write_signature(path, path, &path.join("core"), credentials)
    }

    pub fn results(&self) -> Option<VerificationResults> {
        self.results.get_results()
    }

    pub fn results_for(&self, identity: &str) -> Option<DifferenceReport> {
        self.results.results_for(identity)
    }

    pub fn has_passed_check(&self) -> Option<bool> {
        self.results.has_passed()
    }

    fn resolve_app_path(&self, identity: &str, path: Option<&Path>) -> Result<PathBuf, IntegrityError> {
        match path {
            Some(path) => Ok(path.to_path_buf()),
            None => self
                .locator
                .app_path(identity)
                .ok_or_else(|| IntegrityError::UnknownArtifact {
                    identity: identity.to_string(),
                }),
        }
    }

    fn needs_check(&self, identity: &str) -> bool {
        if self.registry.is_shipped(identity) {
            return true;
        }
        self.locator
            .app_path(identity)
            .is_some_and(|path| self.files.exists(&path.join(APP_DESCRIPTOR)))
    }

    fn verify(
        &self,
        descriptor_path: &Path,
        base_path: &Path,
        identity: &str,
        force: bool,
    ) -> Result<DifferenceReport, IntegrityError> {
        if !force && !self.is_code_check_enforced() {
            debug!("Integrity check not enforced, skipping {}", identity);
            return Ok(DifferenceReport::default());
        }

        let content = self
            .files
            .read(descriptor_path)
            .map_err(|source| IntegrityError::MissingOrUnreadableDescriptor {
                path: descriptor_path.to_path_buf(),
                source,
            })?;
        let descriptor = SignatureDescriptor::parse(&content, descriptor_path)?;
        let signature = descriptor.signature_bytes(descriptor_path)?;

        let trust_store = self.trust_store()?;
        let leaf = parse_leaf(&descriptor.certificate)?;
        trust_store.validate(&leaf, identity)?;
        verify_payload(&descriptor.payload()?, &signature, &leaf)?;
        debug!("Signature of {} verified, comparing {} files", identity, descriptor.hashes.len());

        let exclude_prefixes: &[&str] = if self.is_server_root(base_path) {
            &[UPDATER_PREFIX]
        } else {
            &[]
        };
        let current = self.hash_tree(base_path, &self.settings.server_root)?;
        diff(&descriptor.hashes, &current, exclude_prefixes)
    }

    /// Store a verification outcome; fatal faults propagate unstored
    fn settle(
        &self,
        identity: &str,
        outcome: Result<DifferenceReport, IntegrityError>,
    ) -> Result<DifferenceReport, IntegrityError> {
        let report = match outcome {
            Ok(report) => report,
            Err(e) if e.is_fatal() => {
                error!("Integrity check of {} aborted: {}", identity, e);
                return Err(e);
            }
            Err(e) => {
                e.log_if_security_critical();
                debug!("Integrity check of {} failed: {}", identity, e);
                DifferenceReport::from_error(&e)
            }
        };

        if report.is_empty() {
            debug!("{} passed the integrity check", identity);
        } else {
            warn!("{} failed the integrity check ({} file findings)", identity, report.len());
        }
        if let Err(e) = self.results.store_results(identity, &report) {
            warn!("Failed to store integrity results for {}: {:#}", identity, e);
        }
        Ok(report)
    }

    fn trust_store(&self) -> Result<TrustStore, IntegrityError> {
        let path = &self.settings.trust_anchor;
        let bundle = self
            .files
            .read(path)
            .map_err(|e| IntegrityError::TrustAnchorUnavailable {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        TrustStore::from_pem(&bundle, path)
    }

    fn hash_tree(&self, base_path: &Path, reference_root: &Path) -> Result<DigestMap, IntegrityError> {
        let walker = TreeWalker::new(base_path)
            .reference_root(reference_root)
            .exclude_paths(self.settings.excluded_paths.iter().cloned());

        let mut builder = DigestBuilder::new(base_path);
        if self.is_server_root(base_path) {
            builder = builder.with_transforms(self.server_root_transforms());
        }
        builder.build(walker.walk())
    }

    fn server_root_transforms(&self) -> Vec<Arc<dyn ContentTransform>> {
        vec![
            Arc::new(SentinelTruncation::htaccess()),
            Arc::new(GeneratedAssetNormalizer::new(
                self.mimetypes.clone(),
                &self.settings.server_root,
            )),
        ]
    }

    fn is_server_root(&self, path: &Path) -> bool {
        absolute_path(path) == absolute_path(&self.settings.server_root)
    }

    fn write_signature(
        &self,
        base_path: &Path,
        reference_root: &Path,
        target_dir: &Path,
        credentials: &SigningCredentials,
    ) -> Result<SignatureDescriptor, IntegrityError> {
        let descriptor_path = target_dir.join("signature.json");
        let outcome = self
            .files
            .assert_directory_exists(target_dir)
            .map_err(|source| IntegrityError::Io {
                path: target_dir.to_path_buf(),
                source,
            })
            .and_then(|()| self.sign_tree(base_path, reference_root, credentials))
            .and_then(|descriptor| {
                self.files
                    .write(&descriptor_path, &descriptor.to_pretty_json()?)
                    .map_err(|source| IntegrityError::Io {
                        path: descriptor_path.clone(),
                        source,
                    })?;
                Ok(descriptor)
            });

        match outcome {
            Ok(descriptor) => {
                info!("Wrote signature for {} files to {:?}", descriptor.hashes.len(), descriptor_path);
                Ok(descriptor)
            }
            Err(_) if !self.files.is_writable(target_dir) => Err(IntegrityError::NotWritable {
                path: target_dir.to_path_buf(),
            }),
            Err(e) => Err(e),
        }
    }

    fn sign_tree(
        &self,
        base_path: &Path,
        reference_root: &Path,
        credentials: &SigningCredentials,
    ) -> Result<SignatureDescriptor, IntegrityError> {
        let hashes = self.hash_tree(base_path, reference_root)?;
        let signature = credentials.sign(&canonical_payload(&hashes)?)?;
        Ok(SignatureDescriptor::new(hashes, &signature, &credentials.certificate_pem()?))
    }
}
