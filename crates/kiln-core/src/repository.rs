//! On-disk model repository: enumeration, fingerprinting, and config reads.
//!
//! A repository root maps each subdirectory to a logical model; a version is
//! any child directory whose name parses as a positive integer. Fingerprints
//! let the manager's poll cycle tell modified versions from untouched ones
//! without hashing artifact contents.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::Error;
use crate::model::ModelConfig;

/// Content fingerprint of one version subtree.
///
/// Stable under idempotent re-reads: built from the newest modification time
/// anywhere in the subtree plus its recursive byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModificationKey {
    pub mtime: SystemTime,
    pub total_bytes: u64,
}

/// One discovered model directory.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    /// Directory holding `config.pbtxt` and the version subdirectories.
    pub path: PathBuf,
    /// Version number to fingerprint, ascending.
    pub versions: BTreeMap<i64, ModificationKey>,
}

/// Scans one or more repository roots.
#[derive(Debug, Clone)]
pub struct RepositoryStore {
    roots: Vec<PathBuf>,
    strict_model_config: bool,
}

impl RepositoryStore {
    pub fn new(roots: Vec<PathBuf>, strict_model_config: bool) -> Self {
        Self {
            roots,
            strict_model_config,
        }
    }

    /// Enumerate every model directory across all roots.
    ///
    /// When the same model name appears under two roots the first root wins.
    /// An unreadable root is fatal under strict model config, otherwise it is
    /// skipped with a warning.
    pub fn scan(&self) -> Result<BTreeMap<String, ModelEntry>, Error> {
        let mut models = BTreeMap::new();
        for root in &self.roots {
            let entries = match std::fs::read_dir(root) {
                Ok(entries) => entries,
                Err(e) if self.strict_model_config => {
                    return Err(Error::Internal(format!(
                        "model repository '{}' unreadable: {e}",
                        root.display()
                    )));
                }
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "skipping unreadable repository root");
                    continue;
                }
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if models.contains_key(&name) {
                    warn!(model = %name, root = %root.display(), "duplicate model directory ignored");
                    continue;
                }
                let versions = self.scan_versions(&path);
                debug!(model = %name, versions = versions.len(), "discovered model directory");
                models.insert(name, ModelEntry { path, versions });
            }
        }
        Ok(models)
    }

    fn scan_versions(&self, model_dir: &Path) -> BTreeMap<i64, ModificationKey> {
        let mut versions = BTreeMap::new();
        let Ok(entries) = std::fs::read_dir(model_dir) else {
            return versions;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match name.parse::<i64>() {
                Ok(version) if version >= 1 => {
                    versions.insert(version, Self::version_key(&path));
                }
                _ => {
                    warn!(
                        model_dir = %model_dir.display(),
                        directory = %name,
                        "ignoring version directory that is not a positive integer"
                    );
                }
            }
        }
        versions
    }

    /// Fingerprint one version subtree.
    fn version_key(version_dir: &Path) -> ModificationKey {
        let mut mtime = SystemTime::UNIX_EPOCH;
        let mut total_bytes = 0u64;
        for entry in WalkDir::new(version_dir).into_iter().flatten() {
            if let Ok(meta) = entry.metadata() {
                if let Ok(modified) = meta.modified() {
                    mtime = mtime.max(modified);
                }
                if meta.is_file() {
                    total_bytes += meta.len();
                }
            }
        }
        ModificationKey { mtime, total_bytes }
    }

    /// Read and validate a model's configuration.
    ///
    /// Returns the configuration together with the model directory that holds
    /// it. Without strict model config, a missing `config.pbtxt` produces a
    /// minimal auto-generated configuration instead of an error.
    pub fn read_config(&self, name: &str) -> Result<(ModelConfig, PathBuf), Error> {
        let model_dir = self
            .roots
            .iter()
            .map(|root| root.join(name))
            .find(|path| path.is_dir())
            .ok_or_else(|| Error::NotFound(format!("model '{name}'")))?;

        let config_path = model_dir.join("config.pbtxt");
        if !config_path.is_file() {
            if self.strict_model_config {
                return Err(Error::invalid_config(
                    "config.pbtxt",
                    format!("missing for model '{name}'"),
                ));
            }
            debug!(model = %name, "no config.pbtxt; using auto-generated configuration");
            return Ok((ModelConfig::auto_generated(name), model_dir));
        }

        let text = std::fs::read_to_string(&config_path).map_err(|e| {
            Error::Internal(format!("reading '{}': {e}", config_path.display()))
        })?;
        let config = ModelConfig::from_pbtxt(&text, name)?;
        config.validate()?;
        Ok((config, model_dir))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_model(
        root: &Path,
        name: &str,
        versions: &[i64],
        config: Option<&str>,
    ) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        if let Some(text) = config {
            fs::write(dir.join("config.pbtxt"), text).unwrap();
        }
        for v in versions {
            let vdir = dir.join(v.to_string());
            fs::create_dir_all(&vdir).unwrap();
            fs::write(vdir.join("weights.bin"), format!("weights-v{v}")).unwrap();
        }
        dir
    }

    const SIMPLE_CONFIG: &str = r#"
        input { name: "x" data_type: TYPE_FP32 dims: [ 2 ] }
        output { name: "y" data_type: TYPE_FP32 dims: [ 2 ] }
    "#;

    #[test]
    fn scan_discovers_models_and_versions() {
        let root = tempfile::tempdir().unwrap();
        write_model(root.path(), "alpha", &[1, 3], Some(SIMPLE_CONFIG));
        write_model(root.path(), "beta", &[2], Some(SIMPLE_CONFIG));

        let store = RepositoryStore::new(vec![root.path().to_path_buf()], false);
        let models = store.scan().unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(
            models["alpha"].versions.keys().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(
            models["beta"].versions.keys().copied().collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[tracing_test::traced_test]
    #[test]
    fn scan_ignores_non_numeric_version_dirs() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_model(root.path(), "m", &[1], Some(SIMPLE_CONFIG));
        fs::create_dir_all(dir.join("latest")).unwrap();
        fs::create_dir_all(dir.join("0")).unwrap();
        fs::create_dir_all(dir.join("-2")).unwrap();

        let store = RepositoryStore::new(vec![root.path().to_path_buf()], false);
        let models = store.scan().unwrap();
        assert_eq!(
            models["m"].versions.keys().copied().collect::<Vec<_>>(),
            vec![1]
        );
        assert!(logs_contain("not a positive integer"));
    }

    #[test]
    fn modification_key_tracks_content_growth() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_model(root.path(), "m", &[1], Some(SIMPLE_CONFIG));

        let store = RepositoryStore::new(vec![root.path().to_path_buf()], false);
        let before = store.scan().unwrap()["m"].versions[&1];
        fs::write(dir.join("1").join("extra.bin"), "more bytes").unwrap();
        let after = store.scan().unwrap()["m"].versions[&1];
        assert_ne!(before, after);

        // Idempotent re-read keeps the key stable.
        let again = store.scan().unwrap()["m"].versions[&1];
        assert_eq!(after, again);
    }

    #[test]
    fn first_root_wins_on_duplicate_names() {
        let root_a = tempfile::tempdir().unwrap();
        let root_b = tempfile::tempdir().unwrap();
        write_model(root_a.path(), "m", &[1], Some(SIMPLE_CONFIG));
        write_model(root_b.path(), "m", &[1, 2], Some(SIMPLE_CONFIG));

        let store = RepositoryStore::new(
            vec![root_a.path().to_path_buf(), root_b.path().to_path_buf()],
            false,
        );
        let models = store.scan().unwrap();
        assert_eq!(
            models["m"].versions.keys().copied().collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[test]
    fn unreadable_root_fatal_only_when_strict() {
        let missing = PathBuf::from("/definitely/not/a/repo/root");
        let lax = RepositoryStore::new(vec![missing.clone()], false);
        assert!(lax.scan().unwrap().is_empty());

        let strict = RepositoryStore::new(vec![missing], true);
        assert!(strict.scan().is_err());
    }

    #[test]
    fn read_config_parses_and_validates() {
        let root = tempfile::tempdir().unwrap();
        write_model(root.path(), "m", &[1], Some(SIMPLE_CONFIG));

        let store = RepositoryStore::new(vec![root.path().to_path_buf()], false);
        let (config, path) = store.read_config("m").unwrap();
        assert_eq!(config.name, "m");
        assert_eq!(path, root.path().join("m"));
    }

    #[test]
    fn missing_config_strictness() {
        let root = tempfile::tempdir().unwrap();
        write_model(root.path(), "m", &[1], None);

        let lax = RepositoryStore::new(vec![root.path().to_path_buf()], false);
        let (config, _) = lax.read_config("m").unwrap();
        assert!(config.auto_generated);

        let strict = RepositoryStore::new(vec![root.path().to_path_buf()], true);
        assert!(strict.read_config("m").is_err());
    }

    #[test]
    fn malformed_config_is_invalid() {
        let root = tempfile::tempdir().unwrap();
        write_model(root.path(), "m", &[1], Some("max_batch_size: \"oops\""));

        let store = RepositoryStore::new(vec![root.path().to_path_buf()], false);
        let err = store.read_config("m").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn unknown_model_not_found() {
        let root = tempfile::tempdir().unwrap();
        let store = RepositoryStore::new(vec![root.path().to_path_buf()], false);
        assert!(matches!(
            store.read_config("ghost").unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
