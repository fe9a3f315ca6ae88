//! Manifest files declaring resources.
//!
//! One resource per file, YAML (`.yaml`, `.yml`) or JSON (`.json`), tagged by
//! `kind`:
//!
//! ```yaml
//! kind: RoleMapping
//! metadata:
//!   name: admins
//! spec:
//!   roles: [superuser]
//!   rules: '{"field": {"username": "*"}}'
//!   connection:
//!     managed:
//!       name: logging
//! ```
//!
//! [`ManifestSync`] mirrors a directory into the stores: new and changed
//! files are applied, resources whose file disappeared are deleted. Every
//! applied resource is labelled with its file name so a restarted sync still
//! knows which files the persisted resources came from.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use eskeeper_reconcile::{Declared, ResourceKey, ResourceSpec};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::reconciler::{
    LifecyclePolicySpec, RoleMappingSpec, SnapshotLifecyclePolicySpec, WatchSpec,
};
use crate::runtime::{Stores, apply_to, delete_from, labelled};

/// Label holding the name of the manifest file a resource came from.
pub const SOURCE_LABEL: &str = "eskeeper.io/manifest";

/// A parsed manifest.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    RoleMapping(Declared<RoleMappingSpec>),
    LifecyclePolicy(Declared<LifecyclePolicySpec>),
    SnapshotLifecyclePolicy(Declared<SnapshotLifecyclePolicySpec>),
    Watch(Declared<WatchSpec>),
}

/// Kind and key of a declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestRef {
    pub kind: &'static str,
    pub key: ResourceKey,
}

impl std::fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

fn reference<S: ResourceSpec>(resource: &Declared<S>) -> ManifestRef {
    ManifestRef {
        kind: S::KIND,
        key: resource.key(),
    }
}

fn label<S: ResourceSpec>(resource: &mut Declared<S>, file: &str) {
    resource
        .metadata
        .labels
        .insert(SOURCE_LABEL.to_string(), file.to_string());
}

impl Manifest {
    /// Parse a manifest, as JSON for `.json` files and YAML otherwise.
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let manifest: Manifest = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(content).context("invalid JSON manifest")?
        } else {
            serde_yaml::from_str(content).context("invalid YAML manifest")?
        };
        if manifest.reference().key.name.is_empty() {
            anyhow::bail!("manifest has no metadata.name");
        }
        Ok(manifest)
    }

    /// Record `file` as the source of the declared resource.
    pub fn set_source(&mut self, file: &str) {
        match self {
            Manifest::RoleMapping(r) => label(r, file),
            Manifest::LifecyclePolicy(r) => label(r, file),
            Manifest::SnapshotLifecyclePolicy(r) => label(r, file),
            Manifest::Watch(r) => label(r, file),
        }
    }

    pub fn reference(&self) -> ManifestRef {
        match self {
            Manifest::RoleMapping(r) => reference(r),
            Manifest::LifecyclePolicy(r) => reference(r),
            Manifest::SnapshotLifecyclePolicy(r) => reference(r),
            Manifest::Watch(r) => reference(r),
        }
    }
}

fn is_manifest(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext, "yaml" | "yml" | "json"))
}

/// Outcome of one sync.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub applied: usize,
    pub deleted: usize,
    pub invalid: usize,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.applied > 0 || self.deleted > 0
    }
}

/// Keeps the stores in line with a manifest directory.
pub struct ManifestSync {
    dir: PathBuf,
    stores: Stores,
    /// Resource declared by each file at the last sync.
    known: HashMap<PathBuf, ManifestRef>,
}

impl ManifestSync {
    pub fn new(dir: impl Into<PathBuf>, stores: Stores) -> Self {
        Self {
            dir: dir.into(),
            stores,
            known: HashMap::new(),
        }
    }

    /// Sync over stores that may hold resources from an earlier run. Their
    /// source labels seed the known files, so a file removed while the
    /// controller was down still deletes its resource on the first sync.
    pub async fn open(dir: impl Into<PathBuf>, stores: Stores) -> Result<Self> {
        let mut sync = Self::new(dir, stores);
        let stores = &sync.stores;

        let mut sources = Vec::new();
        let tagged = |kind: &'static str, found: Vec<(String, ResourceKey)>| {
            found
                .into_iter()
                .map(move |(file, key)| (file, ManifestRef { kind, key }))
        };
        sources.extend(tagged(
            RoleMappingSpec::KIND,
            labelled(&stores.role_mappings, SOURCE_LABEL).await?,
        ));
        sources.extend(tagged(
            LifecyclePolicySpec::KIND,
            labelled(&stores.lifecycle_policies, SOURCE_LABEL).await?,
        ));
        sources.extend(tagged(
            SnapshotLifecyclePolicySpec::KIND,
            labelled(&stores.snapshot_policies, SOURCE_LABEL).await?,
        ));
        sources.extend(tagged(
            WatchSpec::KIND,
            labelled(&stores.watches, SOURCE_LABEL).await?,
        ));

        for (file, reference) in sources {
            debug!("{} was declared by {}", reference, file);
            sync.known.insert(sync.dir.join(file), reference);
        }
        if !sync.known.is_empty() {
            info!("Restored {} previously declared resources", sync.known.len());
        }
        Ok(sync)
    }

    /// Read the directory once and apply the differences.
    ///
    /// A file that cannot be read or parsed keeps the resource it declared
    /// before, so a half-written edit never deletes anything.
    pub async fn sync(&mut self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut current = HashMap::new();

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read manifest directory {}", self.dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_manifest(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(content) => Manifest::parse(&path, &content),
                Err(e) => Err(e.into()),
            };
            let mut manifest = match parsed {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("Skipping invalid manifest {}: {:#}", path.display(), e);
                    report.invalid += 1;
                    if let Some(previous) = self.known.get(&path) {
                        current.insert(path, previous.clone());
                    }
                    continue;
                }
            };

            let reference = manifest.reference();
            if let Some((other, _)) = current.iter().find(|(_, r)| **r == reference) {
                warn!(
                    "{} declared by both {} and {}, ignoring the latter",
                    reference,
                    other.display(),
                    path.display()
                );
                report.invalid += 1;
                continue;
            }

            manifest.set_source(&path.file_name().unwrap_or_default().to_string_lossy());
            if self.apply(manifest).await? {
                debug!("Applied {} from {}", reference, path.display());
                report.applied += 1;
            }
            current.insert(path, reference);
        }

        let live: HashSet<&ManifestRef> = current.values().collect();
        for gone in self.known.values().filter(|r| !live.contains(r)) {
            info!("Manifest for {} removed, deleting", gone);
            self.delete(gone).await?;
            report.deleted += 1;
        }

        self.known = current;
        Ok(report)
    }

    async fn apply(&self, manifest: Manifest) -> Result<bool> {
        let stores = &self.stores;
        let changed = match manifest {
            Manifest::RoleMapping(r) => apply_to(&stores.role_mappings, r).await?,
            Manifest::LifecyclePolicy(r) => apply_to(&stores.lifecycle_policies, r).await?,
            Manifest::SnapshotLifecyclePolicy(r) => apply_to(&stores.snapshot_policies, r).await?,
            Manifest::Watch(r) => apply_to(&stores.watches, r).await?,
        };
        Ok(changed)
    }

    async fn delete(&self, reference: &ManifestRef) -> Result<()> {
        let stores = &self.stores;
        let key = &reference.key;
        let kind = reference.kind;
        if kind == RoleMappingSpec::KIND {
            delete_from(&stores.role_mappings, key).await?;
        } else if kind == LifecyclePolicySpec::KIND {
            delete_from(&stores.lifecycle_policies, key).await?;
        } else if kind == SnapshotLifecyclePolicySpec::KIND {
            delete_from(&stores.snapshot_policies, key).await?;
        } else if kind == WatchSpec::KIND {
            delete_from(&stores.watches, key).await?;
        } else {
            warn!("Unknown kind {} for {}", kind, key);
        }
        Ok(())
    }
}
