//! Atomic promotion into immutable, checksummed bundles.
//!
//! Layout under a promotion root:
//!
//! ```text
//! <root>/bundles/<tag>/<artifact files...>
//! <root>/bundles/<tag>/manifest.json
//! <root>/latest.json     -> {"tag": ..}
//! <root>/stable.json     -> {"tag": ..}
//! ```
//!
//! A bundle directory is fully written and fsynced before any pointer names
//! it, and pointers are replaced by atomic rename, so a reader resolving a
//! pointer never sees a partial bundle or a partial pointer.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::decision::{Decision, DecisionNote};
use crate::error::{Error, Result};
use crate::gate::{GateMetrics, GateOutcome, GateReason};
use crate::store;

pub const MANIFEST_FILE: &str = "manifest.json";
const BUNDLES_DIR: &str = "bundles";
const MAX_TAG_SUFFIX: u32 = 1000;

/// One artifact and its SHA-256 (lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    pub file: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub tag: String,
    pub created_at: DateTime<Utc>,
    pub metrics: GateMetrics,
    pub files: Vec<BundleFile>,
    pub baseline_test_r2: Option<f64>,
    pub gate_reason: GateReason,
}

/// Operator-facing indirection to a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerName {
    Latest,
    Stable,
}

impl PointerName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Stable => "stable",
        }
    }

    fn file_name(self) -> String {
        format!("{}.json", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Pointer {
    tag: String,
    updated_at: DateTime<Utc>,
}

/// Hex SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = File::open(path).map_err(|e| Error::io("open", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).map_err(|e| Error::io("read", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Promotion root holding bundles and pointers.
#[derive(Debug, Clone)]
pub struct BundleStore {
    root: PathBuf,
}

impl BundleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn bundle_dir(&self, tag: &str) -> PathBuf {
        self.root.join(BUNDLES_DIR).join(tag)
    }

    fn pointer_path(&self, name: PointerName) -> PathBuf {
        self.root.join(name.file_name())
    }

    /// Reserve a fresh bundle directory named after `now`, suffixing `-N` on collision.
    fn reserve(&self, now: DateTime<Utc>) -> Result<(String, PathBuf)> {
        let parent = self.root.join(BUNDLES_DIR);
        fs::create_dir_all(&parent).map_err(|e| Error::io("create_dir", &parent, e))?;
        let base = now.format("%Y%m%dT%H%M%SZ").to_string();
        for i in 0..MAX_TAG_SUFFIX {
            let tag = if i == 0 { base.clone() } else { format!("{base}-{i}") };
            let dir = parent.join(&tag);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((tag, dir)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Error::io("create_bundle_dir", &dir, e)),
            }
        }
        Err(Error::io(
            "reserve_tag",
            &parent,
            io::Error::new(io::ErrorKind::AlreadyExists, "bundle tag space exhausted"),
        ))
    }

    /// Copy `artifacts` into a new bundle, write its manifest and repoint
    /// `latest` and `stable`. Refuses candidates the gate did not pass.
    pub fn promote(&self, artifacts: &[PathBuf], outcome: &GateOutcome, now: DateTime<Utc>) -> Result<Manifest> {
        if !outcome.pass {
            return Err(Error::config(
                "promotion",
                format!("gate did not pass (reason={})", outcome.reason.as_str()),
            ));
        }
        let mut names: Vec<String> = Vec::with_capacity(artifacts.len());
        for a in artifacts {
            let name = a
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::config("artifact", format!("{} has no file name", a.display())))?;
            if name == MANIFEST_FILE || names.contains(&name) {
                return Err(Error::config("artifact", format!("duplicate or reserved name {name}")));
            }
            names.push(name);
        }

        let (tag, dir) = self.reserve(now)?;
        let manifest = match self.fill(&tag, &dir, artifacts, &names, outcome, now) {
            Ok(m) => m,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    warn!(dir = %dir.display(), error = %cleanup, "could not remove partial bundle");
                }
                return Err(e);
            }
        };

        self.repoint(PointerName::Latest, &tag, now)?;
        self.repoint(PointerName::Stable, &tag, now)?;
        info!(tag = %tag, files = manifest.files.len(), gate_reason = outcome.reason.as_str(), "bundle promoted");
        Ok(manifest)
    }

    fn fill(
        &self,
        tag: &str,
        dir: &Path,
        artifacts: &[PathBuf],
        names: &[String],
        outcome: &GateOutcome,
        now: DateTime<Utc>,
    ) -> Result<Manifest> {
        let mut files = Vec::with_capacity(artifacts.len());
        for (src, name) in artifacts.iter().zip(names) {
            let dst = dir.join(name);
            fs::copy(src, &dst).map_err(|e| Error::io("copy_artifact", src, e))?;
            File::open(&dst)
                .and_then(|f| f.sync_all())
                .map_err(|e| Error::io("fsync_artifact", &dst, e))?;
            files.push(BundleFile {
                file: name.clone(),
                checksum: sha256_file(&dst)?,
            });
        }
        let manifest = Manifest {
            tag: tag.to_string(),
            created_at: now,
            metrics: outcome.metrics,
            files,
            baseline_test_r2: outcome.baseline,
            gate_reason: outcome.reason,
        };
        store::save_json(&dir.join(MANIFEST_FILE), &manifest)?;
        store::sync_dir(dir)?;
        store::sync_dir(&self.root.join(BUNDLES_DIR))?;
        Ok(manifest)
    }

    /// Point `name` at an existing bundle.
    pub fn repoint(&self, name: PointerName, tag: &str, now: DateTime<Utc>) -> Result<()> {
        let manifest_path = self.bundle_dir(tag).join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(Error::BundleIntegrity {
                tag: tag.to_string(),
                reason: "no manifest; refusing to point at it".into(),
            });
        }
        store::save_json(
            &self.pointer_path(name),
            &Pointer {
                tag: tag.to_string(),
                updated_at: now,
            },
        )
    }

    /// Manifest of the bundle `tag`.
    pub fn manifest(&self, tag: &str) -> Result<Manifest> {
        let path = self.bundle_dir(tag).join(MANIFEST_FILE);
        store::load_json(&path)?.ok_or_else(|| Error::BundleIntegrity {
            tag: tag.to_string(),
            reason: "manifest missing".into(),
        })
    }

    /// The bundle a pointer names, or `None` if nothing was promoted yet.
    pub fn resolve_pointer(&self, name: PointerName) -> Result<Option<Manifest>> {
        match store::load_json::<Pointer>(&self.pointer_path(name))? {
            Some(p) => self.manifest(&p.tag).map(Some),
            None => Ok(None),
        }
    }

    /// Primary score of the `stable` bundle, used as the relative-gate baseline.
    pub fn stable_baseline(&self) -> Result<Option<f64>> {
        Ok(self.resolve_pointer(PointerName::Stable)?.map(|m| m.metrics.primary()))
    }

    /// Re-hash every file of `tag` against its manifest.
    pub fn verify_bundle(&self, tag: &str) -> Result<Manifest> {
        let manifest = self.manifest(tag)?;
        if manifest.tag != tag {
            return Err(Error::BundleIntegrity {
                tag: tag.to_string(),
                reason: format!("manifest names tag {}", manifest.tag),
            });
        }
        let dir = self.bundle_dir(tag);
        for f in &manifest.files {
            let path = dir.join(&f.file);
            if !path.is_file() {
                return Err(Error::BundleIntegrity {
                    tag: tag.to_string(),
                    reason: format!("{} missing", f.file),
                });
            }
            let actual = sha256_file(&path)?;
            if actual != f.checksum {
                warn!(tag, file = %f.file, expected = %f.checksum, actual = %actual, "bundle checksum mismatch");
                return Err(Error::BundleIntegrity {
                    tag: tag.to_string(),
                    reason: format!("{} checksum mismatch", f.file),
                });
            }
        }
        Ok(manifest)
    }
}

impl Manifest {
    /// Annotate a gate decision with the promoted tag.
    #[must_use]
    pub fn annotate(&self, d: Decision) -> Decision {
        d.label("tag", self.tag.clone())
            .value("files", self.files.len() as f64)
            .note(DecisionNote::Promoted {
                tag: self.tag.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{evaluate_gate, AbsoluteThresholds, RelativeThresholds};
    use chrono::TimeZone;

    fn passing() -> GateOutcome {
        let m = GateMetrics::Model {
            r2_gap: 0.01,
            mse_ratio: 1.0,
            nrmse_ratio: 1.0,
            test_r2: 0.85,
        };
        evaluate_gate(&m, &AbsoluteThresholds::default(), None, &RelativeThresholds::default())
    }

    fn artifact(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn sha256_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let p = artifact(dir.path(), "abc", "abc");
        assert_eq!(
            sha256_file(&p).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn tags_get_suffixes_on_collision() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let store = BundleStore::new(root.path());
        let a = artifact(src.path(), "model.bin", "weights");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let m1 = store.promote(&[a.clone()], &passing(), now).unwrap();
        let m2 = store.promote(&[a], &passing(), now).unwrap();
        assert_eq!(m1.tag, "20260301T120000Z");
        assert_eq!(m2.tag, "20260301T120000Z-1");
        let latest = store.resolve_pointer(PointerName::Latest).unwrap().unwrap();
        assert_eq!(latest.tag, m2.tag);
    }

    #[test]
    fn failed_gate_is_not_promoted() {
        let root = tempfile::tempdir().unwrap();
        let store = BundleStore::new(root.path());
        let mut o = passing();
        o.pass = false;
        o.reason = GateReason::Rel;
        assert!(store.promote(&[], &o, Utc::now()).is_err());
        assert!(store.resolve_pointer(PointerName::Stable).unwrap().is_none());
    }

    #[test]
    fn repoint_requires_existing_bundle() {
        let root = tempfile::tempdir().unwrap();
        let store = BundleStore::new(root.path());
        let err = store.repoint(PointerName::Stable, "nope", Utc::now()).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
