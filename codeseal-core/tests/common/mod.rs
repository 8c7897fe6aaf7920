//! Test helper functions for integration tests
//!
//! Shared across the integration test files using the tests/common/ pattern:
//! test logging, a throwaway certificate authority and a fake installation.

#![allow(dead_code)]

use codeseal_core::environment::{
    AppsDirectoryLocator, FileAccess, LocalFileAccess, MemoryCache, MemoryConfigStore,
    ShippedListRegistry,
};
use codeseal_core::mimetype::JsonMimetypeRegistry;
use codeseal_core::{
    Checker, CheckerSettings, Collaborators, EnforcementPolicy, IntegrityConfig, SigningCredentials,
};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use tempfile::TempDir;

/// Initialize logging for tests (only once per test run)
static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

static SERIAL: AtomicU32 = AtomicU32::new(1);

fn generate_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

fn build_certificate(cn: &str, key: &PKey<Private>, issuer: Option<(&X509, &PKey<Private>)>) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(SERIAL.fetch_add(1, Ordering::SeqCst))
        .unwrap()
        .to_asn1_integer()
        .unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    match issuer {
        Some((cert, issuer_key)) => {
            builder.set_issuer_name(cert.subject_name()).unwrap();
            builder.sign(issuer_key, MessageDigest::sha256()).unwrap();
        }
        None => {
            builder.set_issuer_name(&name).unwrap();
            builder.sign(key, MessageDigest::sha256()).unwrap();
        }
    }
    builder.build()
}

/// A root CA issuing signing certificates
pub struct TestAuthority {
    pub root: X509,
    root_key: PKey<Private>,
}

impl TestAuthority {
    pub fn new(name: &str) -> Self {
        let root_key = generate_key();
        let root = build_certificate(name, &root_key, None);
        TestAuthority { root, root_key }
    }

    /// Signing credentials for `cn` issued by this root
    pub fn issue(&self, cn: &str) -> SigningCredentials {
        let key = generate_key();
        let certificate = build_certificate(cn, &key, Some((&self.root, &self.root_key)));
        SigningCredentials::new(certificate, key)
    }

    pub fn root_pem(&self) -> Vec<u8> {
        self.root.to_pem().unwrap()
    }
}

/// A platform installation in a temporary directory
///
/// Layout: `index.php`, `core/`, `apps/`, and the trust anchor at
/// `resources/codesigning/root.crt`.
pub struct Installation {
    _temp_dir: TempDir,
    pub root: PathBuf,
    pub authority: TestAuthority,
}

impl Installation {
    pub fn new() -> Self {
        init_test_logging();
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let authority = TestAuthority::new("Codeseal Test Root");

        let installation = Installation {
            _temp_dir: temp_dir,
            root,
            authority,
        };
        installation.write("index.php", "<?php require 'lib/base.php';\n");
        installation.write("lib/base.php", "<?php // platform bootstrap\n");
        installation.write("core/js/app.js", "console.log('core');\n");
        fs::create_dir_all(installation.root.join("apps")).unwrap();
        installation.write_bytes(
            "resources/codesigning/root.crt",
            &installation.authority.root_pem(),
        );
        installation
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn write(&self, relative: &str, content: &str) {
        self.write_bytes(relative, content.as_bytes());
    }

    pub fn write_bytes(&self, relative: &str, content: &[u8]) {
        let path = self.path(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn remove(&self, relative: &str) {
        fs::remove_file(self.path(relative)).unwrap();
    }

    /// Create `apps/<id>` with an `appinfo/info.xml` and one source file
    pub fn add_app(&self, id: &str) -> PathBuf {
        self.write(&format!("apps/{id}/appinfo/info.xml"), &format!("<info><id>{id}</id></info>\n"));
        self.write(&format!("apps/{id}/lib/Controller.php"), "<?php class Controller {}\n");
        self.path(&format!("apps/{id}"))
    }

    /// Checker built from an installation config, with in-memory result tiers
    pub fn checker_for_config(&self, config: &IntegrityConfig) -> Checker {
        let locator = AppsDirectoryLocator::new(config.app_roots());
        let registry = ShippedListRegistry::new(locator.clone(), Vec::new());
        Checker::new(
            CheckerSettings::from_config(config),
            Collaborators {
                files: Arc::new(LocalFileAccess),
                locator: Arc::new(locator),
                registry: Arc::new(registry),
                mimetypes: Arc::new(JsonMimetypeRegistry::default()),
                cache: Arc::new(MemoryCache::default()),
                store: Arc::new(MemoryConfigStore::default()),
            },
        )
    }

    pub fn checker(&self, release_channel: &str) -> Checker {
        self.checker_with(release_channel, &[], Arc::new(LocalFileAccess))
    }

    pub fn checker_with(
        &self,
        release_channel: &str,
        shipped: &[&str],
        files: Arc<dyn FileAccess>,
    ) -> Checker {
        let app_root = self.path("apps");
        let locator = AppsDirectoryLocator::new(vec![app_root.clone()]);
        let registry =
            ShippedListRegistry::new(locator.clone(), shipped.iter().map(|s| s.to_string()));

        let mut settings = CheckerSettings::new(&self.root);
        settings.policy = EnforcementPolicy::new(release_channel, false);
        settings.excluded_paths = vec![app_root];

        Checker::new(
            settings,
            Collaborators {
                files,
                locator: Arc::new(locator),
                registry: Arc::new(registry),
                mimetypes: Arc::new(JsonMimetypeRegistry::default()),
                cache: Arc::new(MemoryCache::default()),
                store: Arc::new(MemoryConfigStore::default()),
            },
        )
    }
}

/// Descriptor path of an app
pub fn app_descriptor(app: &Path) -> PathBuf {
    app.join("appinfo/signature.json")
}

/// `path` expressed relative to the working directory
#[cfg(unix)]
pub fn relative_to_cwd(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap();
    let mut relative = PathBuf::new();
    for _ in cwd.components().skip(1) {
        relative.push("..");
    }
    relative.join(path.strip_prefix("/").unwrap())
}
