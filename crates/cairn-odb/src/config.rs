use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, DatabaseResult};

/// Settings for opening an [`ObjectDatabase`](crate::ObjectDatabase) over
/// loose object directories.
///
/// ```toml
/// root = "/var/lib/game/objects"
/// overflow_root = "/home/me/.cache/game/objects"
/// read_only = true
/// default_bundle = "default"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Primary loose object directory.
    pub root: PathBuf,
    /// Open the primary directory read-only.
    pub read_only: bool,
    /// Writable directory receiving writes when the primary is read-only.
    pub overflow_root: Option<PathBuf>,
    /// File name of the index inside each loose directory.
    pub index_name: String,
    /// Where bundles live; `<root>/bundles` when unset.
    pub bundle_directory: Option<PathBuf>,
    /// Bundle loaded by `initialize`; `None` disables it.
    pub default_bundle: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("objects"),
            read_only: false,
            overflow_root: None,
            index_name: "index".to_string(),
            bundle_directory: None,
            default_bundle: Some("default".to_string()),
        }
    }
}

impl DatabaseConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> DatabaseResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| DatabaseError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> DatabaseResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Effective bundle directory.
    pub fn bundle_directory(&self) -> PathBuf {
        self.bundle_directory
            .clone()
            .unwrap_or_else(|| self.root.join("bundles"))
    }

    pub fn validate(&self) -> DatabaseResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(DatabaseError::Config("root must not be empty".into()));
        }
        if self.index_name.is_empty() || self.index_name.contains(['/', '\\']) {
            return Err(DatabaseError::Config(format!(
                "index_name must be a plain file name, got {:?}",
                self.index_name
            )));
        }
        if self.overflow_root.as_deref() == Some(self.root.as_path()) {
            return Err(DatabaseError::Config("overflow_root must differ from root".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = DatabaseConfig::default();
        assert_eq!(c.root, PathBuf::from("objects"));
        assert!(!c.read_only);
        assert!(c.overflow_root.is_none());
        assert_eq!(c.index_name, "index");
        assert_eq!(c.default_bundle.as_deref(), Some("default"));
        assert_eq!(c.bundle_directory(), PathBuf::from("objects").join("bundles"));
    }

    #[test]
    fn parse_full_toml() {
        let c = DatabaseConfig::from_toml_str(
            r#"
            root = "/data/objects"
            read_only = true
            overflow_root = "/cache/objects"
            index_name = "names"
            bundle_directory = "/data/bundles"
            default_bundle = "startup"
            "#,
        )
        .unwrap();
        assert!(c.read_only);
        assert_eq!(c.overflow_root, Some(PathBuf::from("/cache/objects")));
        assert_eq!(c.index_name, "names");
        assert_eq!(c.bundle_directory(), PathBuf::from("/data/bundles"));
        assert_eq!(c.default_bundle.as_deref(), Some("startup"));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let c = DatabaseConfig::from_toml_str("root = \"db\"").unwrap();
        assert_eq!(c, DatabaseConfig::new("db"));
    }

    #[test]
    fn invalid_toml_is_config_error() {
        assert!(matches!(
            DatabaseConfig::from_toml_str("root = [1, 2"),
            Err(DatabaseError::Config(_))
        ));
        assert!(matches!(
            DatabaseConfig::from_toml_str("index_name = \"a/b\""),
            Err(DatabaseError::Config(_))
        ));
        assert!(matches!(
            DatabaseConfig::from_toml_str("root = \"same\"\noverflow_root = \"same\""),
            Err(DatabaseError::Config(_))
        ));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odb.toml");
        std::fs::write(&path, "root = \"x\"\nread_only = true\n").unwrap();
        let c = DatabaseConfig::from_file(&path).unwrap();
        assert!(c.read_only);
        assert!(matches!(
            DatabaseConfig::from_file(&dir.path().join("missing.toml")),
            Err(DatabaseError::Io(_))
        ));
    }
}
