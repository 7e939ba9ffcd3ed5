use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;

use super::registry::{Dossier, DossierRegistry};
use crate::files::{read_json_object, write_json_atomic, FileLock};

/// Dossiers persisted as one JSON object keyed by `source_hash`, next to
/// the story file.
///
/// Every read refreshes from disk. Writes hold `<file>.lock` while they
/// merge the changed key into what is on disk and swap the file in with a
/// rename, so registries in other threads or processes never lose each
/// other's upserts. A file that exists but cannot be parsed is never
/// overwritten.
#[derive(Debug)]
pub struct JsonDossierRegistry {
    path: PathBuf,
}

impl JsonDossierRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> anyhow::Result<BTreeMap<String, Dossier>> {
        Ok(read_json_object(&self.path)?
            .into_iter()
            .filter_map(|(key, value)| {
                serde_json::from_value::<Dossier>(value)
                    .ok()
                    .map(|dossier| (key, dossier))
            })
            .collect())
    }
}

impl DossierRegistry for JsonDossierRegistry {
    fn lookup(&self, source_hash: &str) -> Option<Dossier> {
        self.read_entries().ok()?.remove(source_hash)
    }

    fn upsert(&self, mut dossier: Dossier) -> anyhow::Result<Dossier> {
        dossier.last_used = Utc::now();
        let _lock = FileLock::acquire(&self.path)?;
        let mut on_disk = read_json_object(&self.path)?;
        on_disk.insert(dossier.source_hash.clone(), serde_json::to_value(&dossier)?);
        write_json_atomic(&self.path, &Value::Object(on_disk))?;
        Ok(dossier)
    }

    fn list(&self) -> Vec<Dossier> {
        let mut entries: Vec<Dossier> = self
            .read_entries()
            .map(|entries| entries.into_values().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        entries
    }
}
