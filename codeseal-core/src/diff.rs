//! Classification of expected vs observed digest maps

use crate::error::IntegrityError;
use crate::hasher::DigestMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Expected and observed digest of one path; empty where not applicable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashPair {
    pub expected: String,
    pub current: String,
}

/// A recoverable failure recorded in place of a file level diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub class: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifferenceKind {
    ExtraFile,
    FileMissing,
    InvalidHash,
}

impl fmt::Display for DifferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DifferenceKind::ExtraFile => "EXTRA_FILE",
            DifferenceKind::FileMissing => "FILE_MISSING",
            DifferenceKind::InvalidHash => "INVALID_HASH",
        };
        f.write_str(name)
    }
}

/// Outcome of verifying one artifact; empty means the artifact passed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifferenceReport {
    #[serde(rename = "EXTRA_FILE", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_files: BTreeMap<String, HashPair>,

    #[serde(rename = "FILE_MISSING", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub missing_files: BTreeMap<String, HashPair>,

    #[serde(rename = "INVALID_HASH", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub invalid_hashes: BTreeMap<String, HashPair>,

    #[serde(rename = "EXCEPTION", default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
}

impl DifferenceReport {
    /// Report carrying only the failure that stopped verification
    pub fn from_error(err: &IntegrityError) -> Self {
        DifferenceReport {
            exception: Some(ExceptionInfo {
                class: err.kind().to_string(),
                message: err.to_string(),
            }),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.extra_files.is_empty()
            && self.missing_files.is_empty()
            && self.invalid_hashes.is_empty()
            && self.exception.is_none()
    }

    /// Number of file level findings
    pub fn len(&self) -> usize {
        self.extra_files.len() + self.missing_files.len() + self.invalid_hashes.len()
    }

    pub fn insert(&mut self, kind: DifferenceKind, path: String, pair: HashPair) {
        let category = match kind {
            DifferenceKind::ExtraFile => &mut self.extra_files,
            DifferenceKind::FileMissing => &mut self.missing_files,
            DifferenceKind::InvalidHash => &mut self.invalid_hashes,
        };
        category.insert(path, pair);
    }
}

/// Compare an expected digest map to the observed one
///
/// Expected paths starting with one of `exclude_prefixes` are dropped before
/// comparison.
pub fn diff(
    expected: &DigestMap,
    current: &DigestMap,
    exclude_prefixes: &[&str],
) -> Result<DifferenceReport, IntegrityError> {
    let expected: DigestMap = expected
        .iter()
        .filter(|(path, _)| !exclude_prefixes.iter().any(|prefix| path.starts_with(prefix)))
        .map(|(path, hash)| (path.clone(), hash.clone()))
        .collect();

    let differing: BTreeSet<&String> = expected
        .iter()
        .filter(|(path, hash)| current.get(*path) != Some(*hash))
        .map(|(path, _)| path)
        .chain(
            current
                .iter()
                .filter(|(path, hash)| expected.get(*path) != Some(*hash))
                .map(|(path, _)| path),
        )
        .collect();

    let mut report = DifferenceReport::default();
    for path in differing {
        let (kind, pair) = match (expected.get(path), current.get(path)) {
            (Some(want), None) => (
                DifferenceKind::FileMissing,
                HashPair {
                    expected: want.clone(),
                    current: String::new(),
                },
            ),
            (None, Some(got)) => (
                DifferenceKind::ExtraFile,
                HashPair {
                    expected: String::new(),
                    current: got.clone(),
                },
            ),
            (Some(want), Some(got)) => (
                DifferenceKind::InvalidHash,
                HashPair {
                    expected: want.clone(),
                    current: got.clone(),
                },
            ),
            (None, None) => {
                return Err(IntegrityError::InternalConsistencyFault { path: path.clone() });
            }
        };
        debug!("{}: {}", kind, path);
        report.insert(kind, path.clone(), pair);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn map(entries: &[(&str, &str)]) -> DigestMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_identical_maps_produce_empty_report() {
        let hashes = map(&[("a.php", "1"), ("b.php", "2")]);
        let report = diff(&hashes, &hashes, &[]).unwrap();
        assert!(report.is_empty());
        assert_eq!(serde_json::to_string(&report).unwrap(), "{}");
    }

    #[test]
    fn test_each_category_is_classified() {
        let expected = map(&[("changed.php", "old"), ("gone.php", "g"), ("same.php", "s")]);
        let current = map(&[("changed.php", "new"), ("new.php", "n"), ("same.php", "s")]);

        let report = diff(&expected, &current, &[]).unwrap();
        assert_eq!(report.len(), 3);
        assert_eq!(
            report.invalid_hashes["changed.php"],
            HashPair {
                expected: "old".to_string(),
                current: "new".to_string()
            }
        );
        assert_eq!(report.missing_files["gone.php"].current, "");
        assert_eq!(report.extra_files["new.php"].expected, "");
        assert!(!report.invalid_hashes.contains_key("same.php"));
    }

    #[test]
    fn test_excluded_prefix_is_dropped_from_expected() {
        let expected = map(&[("updater/foo.php", "u"), ("index.php", "i")]);
        let current = map(&[("index.php", "i")]);

        assert!(diff(&expected, &current, &["updater/"]).unwrap().is_empty());
        let report = diff(&expected, &current, &[]).unwrap();
        assert!(report.missing_files.contains_key("updater/foo.php"));
    }

    #[test]
    fn test_report_json_uses_category_names() {
        let report = diff(&map(&[("a", "1")]), &map(&[("b", "2")]), &[]).unwrap();
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "EXTRA_FILE": {"b": {"expected": "", "current": "2"}},
                "FILE_MISSING": {"a": {"expected": "1", "current": ""}}
            })
        );
    }

    #[test]
    fn test_exception_report() {
        let report = DifferenceReport::from_error(&IntegrityError::SignatureInvalid);
        assert!(!report.is_empty());
        assert_eq!(report.len(), 0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "EXCEPTION": {"class": "SignatureInvalid", "message": "Signature could not get verified."}
            })
        );
    }
}
