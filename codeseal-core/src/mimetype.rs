//! Mimetype registry and the generated `core/js/mimetypelist.js` asset
//!
//! The asset is regenerated on each installation from the mimetype aliases and
//! the file type icons. When an operator adds custom aliases the file differs
//! from the shipped one, so the digest is taken over the default-only rendering
//! whenever the file on disk is exactly the full rendering.

use crate::descriptor::to_pretty_escaped;
use crate::error::IntegrityError;
use crate::hasher::ContentTransform;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Relative path of the generated asset below the platform root
pub const MIMETYPE_LIST_PATH: &str = "core/js/mimetypelist.js";

/// Icon folder below the platform root and below each theme
const FILETYPE_ICONS: &str = "core/img/filetypes";

const HEADER: &str = concat!(
    "/**\n",
    "* This file is automatically generated\n",
    "* DO NOT EDIT MANUALLY!\n",
    "*\n",
    "* You can update the list of MimeType Aliases in config/mimetypealiases.json\n",
    "* The list of files is fetched from core/img/filetypes\n",
    "* To regenerate this file run ./occ maintenance:mimetype:update-js\n",
    "*/\n",
);

/// Source of mimetype aliases and display names
pub trait MimetypeRegistry: Send + Sync {
    /// Default aliases merged with operator customisations
    fn all_aliases(&self) -> BTreeMap<String, String>;

    /// Aliases as shipped, without customisations
    fn default_aliases(&self) -> BTreeMap<String, String>;

    /// Display names per mimetype
    fn all_namings(&self) -> BTreeMap<String, String>;
}

/// File type icon names, without extension, of the platform and its themes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FiletypeIcons {
    pub files: Vec<String>,
    /// Only themes that ship their own icon folder
    pub themes: BTreeMap<String, Vec<String>>,
}

impl FiletypeIcons {
    /// Scan `core/img/filetypes` and `themes/*/core/img/filetypes`
    pub fn scan(server_root: &Path) -> Self {
        let files = icon_names(&server_root.join(FILETYPE_ICONS));

        let mut themes = BTreeMap::new();
        if let Ok(entries) = fs::read_dir(server_root.join("themes")) {
            for entry in entries.flatten() {
                let icons = entry.path().join(FILETYPE_ICONS);
                if entry.path().is_dir() && icons.is_dir() {
                    let theme = entry.file_name().to_string_lossy().into_owned();
                    themes.insert(theme, icon_names(&icons));
                }
            }
        }

        FiletypeIcons { files, themes }
    }
}

/// Sorted, de-duplicated file names of a folder with the last extension cut
fn icon_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let names: BTreeSet<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .map(|entry| strip_extension(&entry.file_name().to_string_lossy()).to_string())
        .collect();
    names.into_iter().collect()
}

// a name without any dot is cut entirely, as the platform's generator does
fn strip_extension(name: &str) -> &str {
    name.rfind('.').map_or("", |dot| &name[..dot])
}

/// Render the mimetype list asset
pub fn generate_mimetype_list(
    aliases: &BTreeMap<String, String>,
    icons: &FiletypeIcons,
    namings: &BTreeMap<String, String>,
) -> Result<String, IntegrityError> {
    Ok(format!(
        "{HEADER}OC.MimeTypeList={{\n\taliases: {},\n\tfiles: {},\n\tthemes: {},\n\tnames: {}\n}};\n",
        pretty(aliases)?,
        pretty(&icons.files)?,
        pretty(&icons.themes)?,
        pretty(namings)?,
    ))
}

fn pretty<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, IntegrityError> {
    Ok(String::from_utf8_lossy(&to_pretty_escaped(value)?).into_owned())
}

/// Hashes the default-only rendering when the asset equals the full rendering
#[derive(Clone)]
pub struct GeneratedAssetNormalizer {
    relative_path: String,
    registry: Arc<dyn MimetypeRegistry>,
    server_root: PathBuf,
}

impl GeneratedAssetNormalizer {
    pub fn new(registry: Arc<dyn MimetypeRegistry>, server_root: &Path) -> Self {
        GeneratedAssetNormalizer {
            relative_path: MIMETYPE_LIST_PATH.to_string(),
            registry,
            server_root: server_root.to_path_buf(),
        }
    }

    fn render(&self, aliases: &BTreeMap<String, String>, icons: &FiletypeIcons) -> Option<String> {
        match generate_mimetype_list(aliases, icons, &self.registry.all_namings()) {
            Ok(rendered) => Some(rendered),
            Err(e) => {
                debug!("Cannot render mimetype list: {}", e);
                None
            }
        }
    }
}

impl ContentTransform for GeneratedAssetNormalizer {
    fn applies_to(&self, relative_path: &str) -> bool {
        relative_path == self.relative_path
    }

    fn transform(&self, content: &[u8]) -> Option<Vec<u8>> {
        let icons = FiletypeIcons::scan(&self.server_root);
        let full = self.render(&self.registry.all_aliases(), &icons)?;
        if full.as_bytes() != content {
            return None;
        }
        debug!("Mimetype list matches generated file, hashing default aliases only");
        self.render(&self.registry.default_aliases(), &icons)
            .map(String::into_bytes)
    }
}

/// Mimetype registry backed by the JSON alias files of an installation
///
/// - `resources/config/mimetypealiases.dist.json`: shipped aliases
/// - `config/mimetypealiases.json`: operator aliases (optional)
/// - `resources/config/mimetypenames.dist.json`: display names (optional)
#[derive(Debug, Clone, Default)]
pub struct JsonMimetypeRegistry {
    defaults: BTreeMap<String, String>,
    custom: BTreeMap<String, String>,
    names: BTreeMap<String, String>,
}

impl JsonMimetypeRegistry {
    pub fn new(
        defaults: BTreeMap<String, String>,
        custom: BTreeMap<String, String>,
        names: BTreeMap<String, String>,
    ) -> Self {
        JsonMimetypeRegistry {
            defaults,
            custom,
            names,
        }
    }

    /// Load the alias files below a platform root; missing files are empty
    pub fn load(server_root: &Path) -> Result<Self> {
        Ok(JsonMimetypeRegistry {
            defaults: load_map(&server_root.join("resources/config/mimetypealiases.dist.json"))?,
            custom: load_map(&server_root.join("config/mimetypealiases.json"))?,
            names: load_map(&server_root.join("resources/config/mimetypenames.dist.json"))?,
        })
    }
}

fn load_map(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read mimetype file: {}", path.display()))?;
    let map: BTreeMap<String, String> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse mimetype file: {}", path.display()))?;
    // keys starting with '_' are comments in the shipped files
    Ok(map.into_iter().filter(|(k, _)| !k.starts_with('_')).collect())
}

impl MimetypeRegistry for JsonMimetypeRegistry {
    fn all_aliases(&self) -> BTreeMap<String, String> {
        let mut merged = self.defaults.clone();
        merged.extend(self.custom.clone());
        merged
    }

    fn default_aliases(&self) -> BTreeMap<String, String> {
        self.defaults.clone()
    }

    fn all_namings(&self) -> BTreeMap<String, String> {
        self.names.clone()
    }
}
