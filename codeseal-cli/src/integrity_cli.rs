//! Integrity CLI commands
//!
//! Sign apps and the core, verify them, and show stored results. Reports are
//! printed to stdout as pretty JSON.

use crate::expand_home;
use anyhow::{Context, Result};
use clap::Parser;
use codeseal_core::{Checker, IntegrityConfig, SigningCredentials};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Parser, Debug)]
pub enum IntegrityCommand {
    /// Write appinfo/signature.json for an app
    SignApp {
        /// App directory
        #[clap(long)]
        path: PathBuf,

        /// PEM certificate issued for the app
        #[clap(long)]
        certificate: PathBuf,

        /// PEM private key of the certificate
        #[clap(long)]
        private_key: PathBuf,
    },

    /// Write core/signature.json for a platform tree
    SignCore {
        /// Platform root (default: the server root)
        #[clap(long)]
        path: Option<PathBuf>,

        /// PEM certificate with CN=core
        #[clap(long)]
        certificate: PathBuf,

        /// PEM private key of the certificate
        #[clap(long)]
        private_key: PathBuf,
    },

    /// Verify one app
    CheckApp {
        /// App identity
        id: String,

        /// App directory (default: looked up in the app roots)
        #[clap(long)]
        path: Option<PathBuf>,

        /// Verify even on unsigned release channels
        #[clap(long)]
        force: bool,
    },

    /// Verify the platform core
    CheckCore,

    /// Verify the core and all apps that require a signature
    CheckInstance,

    /// Show stored verification results
    Results {
        /// Only the result of this identity
        id: Option<String>,
    },
}

impl IntegrityCommand {
    /// Execute the command; `false` when findings were reported
    pub async fn execute(self, config: IntegrityConfig) -> Result<bool> {
        match self {
            IntegrityCommand::SignApp {
                path,
                certificate,
                private_key,
            } => {
                let credentials = load_credentials(&certificate, &private_key).await?;
                let path = expand_home(&path);
                blocking(config, move |checker| {
                    let descriptor = checker.write_app_signature(&path, &credentials)?;
                    println!(
                        "Signed {} files, wrote {}",
                        descriptor.hashes.len(),
                        path.join("appinfo/signature.json").display()
                    );
                    Ok(true)
                })
                .await
            }
            IntegrityCommand::SignCore {
                path,
                certificate,
                private_key,
            } => {
                let credentials = load_credentials(&certificate, &private_key).await?;
                let path = path
                    .map(|p| expand_home(&p))
                    .unwrap_or_else(|| config.server_root.clone());
                blocking(config, move |checker| {
                    let descriptor = checker.write_core_signature(&credentials, &path)?;
                    println!(
                        "Signed {} files, wrote {}",
                        descriptor.hashes.len(),
                        path.join("core/signature.json").display()
                    );
                    Ok(true)
                })
                .await
            }
            IntegrityCommand::CheckApp { id, path, force } => {
                let path = path.map(|p| expand_home(&p));
                blocking(config, move |checker| {
                    let report = checker.verify_app_signature(&id, path.as_deref(), force)?;
                    print_json(&report)?;
                    Ok(report.is_empty())
                })
                .await
            }
            IntegrityCommand::CheckCore => {
                blocking(config, |checker| {
                    let report = checker.verify_core_signature()?;
                    print_json(&report)?;
                    Ok(report.is_empty())
                })
                .await
            }
            IntegrityCommand::CheckInstance => {
                blocking(config, |checker| {
                    if !checker.is_code_check_enforced() {
                        info!("Integrity check is not enforced for this installation");
                    }
                    let reports = checker.run_instance_verification()?;
                    print_json(&reports)?;
                    Ok(reports.values().all(|report| report.is_empty()))
                })
                .await
            }
            IntegrityCommand::Results { id } => {
                blocking(config, move |checker| match id {
                    Some(id) => {
                        let report = checker.results_for(&id);
                        print_json(&report)?;
                        Ok(report.map_or(true, |r| r.is_empty()))
                    }
                    None => {
                        print_json(&checker.results())?;
                        Ok(checker.has_passed_check() != Some(false))
                    }
                })
                .await
            }
        }
    }
}

/// Run `task` with a checker on the blocking pool
async fn blocking<F>(config: IntegrityConfig, task: F) -> Result<bool>
where
    F: FnOnce(&Checker) -> Result<bool> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let checker = Checker::from_config(&config).context("Failed to set up integrity checker")?;
        debug!("Checker ready for {:?}", checker.settings().server_root);
        task(&checker)
    })
    .await
    .context("Integrity task panicked")?
}

async fn load_credentials(certificate: &Path, private_key: &Path) -> Result<SigningCredentials> {
    let certificate = expand_home(certificate);
    let private_key = expand_home(private_key);
    let cert_pem = tokio::fs::read(&certificate)
        .await
        .with_context(|| format!("Failed to read certificate: {}", certificate.display()))?;
    let key_pem = tokio::fs::read(&private_key)
        .await
        .with_context(|| format!("Failed to read private key: {}", private_key.display()))?;
    SigningCredentials::from_pem(&cert_pem, &key_pem).context("Failed to load signing credentials")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
