use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Character,
    Object,
    Location,
}

impl SubjectKind {
    pub const ALL: [SubjectKind; 3] = [Self::Character, Self::Object, Self::Location];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Object => "object",
            Self::Location => "location",
        }
    }
}

impl FromStr for SubjectKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "character" => Ok(Self::Character),
            "object" => Ok(Self::Object),
            "location" => Ok(Self::Location),
            other => bail!("unknown subject kind '{other}'"),
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recurring character, object or location whose look must stay stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dossier {
    pub source_hash: String,
    #[serde(rename = "type")]
    pub kind: SubjectKind,
    pub role_label: String,
    pub description: String,
    pub reference_image_url: String,
    pub last_used: DateTime<Utc>,
}

impl Dossier {
    pub fn new(
        source_hash: impl Into<String>,
        kind: SubjectKind,
        role_label: impl Into<String>,
        description: impl Into<String>,
        reference_image_url: impl Into<String>,
    ) -> Self {
        Self {
            source_hash: source_hash.into(),
            kind,
            role_label: role_label.into(),
            description: description.into(),
            reference_image_url: reference_image_url.into(),
            last_used: Utc::now(),
        }
    }
}

/// Keyed store of dossiers, at most one per `source_hash`.
///
/// Concurrent upserts of the same hash are last-write-wins. An upsert is
/// visible to every lookup issued after it returns.
pub trait DossierRegistry: Send + Sync {
    fn lookup(&self, source_hash: &str) -> Option<Dossier>;

    /// Inserts or replaces by `source_hash`, stamping `last_used`.
    fn upsert(&self, dossier: Dossier) -> anyhow::Result<Dossier>;

    /// Stamps `last_used` on an existing entry.
    fn touch(&self, source_hash: &str) -> anyhow::Result<Option<Dossier>> {
        let Some(existing) = self.lookup(source_hash) else {
            return Ok(None);
        };
        self.upsert(existing).map(Some)
    }

    fn list(&self) -> Vec<Dossier>;
}

#[derive(Debug, Default)]
pub struct InMemoryDossierRegistry {
    entries: RwLock<BTreeMap<String, Dossier>>,
}

impl InMemoryDossierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = Dossier>) -> Self {
        let map = entries
            .into_iter()
            .map(|dossier| (dossier.source_hash.clone(), dossier))
            .collect();
        Self {
            entries: RwLock::new(map),
        }
    }
}

impl DossierRegistry for InMemoryDossierRegistry {
    fn lookup(&self, source_hash: &str) -> Option<Dossier> {
        self.entries.read().ok()?.get(source_hash).cloned()
    }

    fn upsert(&self, mut dossier: Dossier) -> anyhow::Result<Dossier> {
        dossier.last_used = Utc::now();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("dossier registry lock poisoned"))?;
        entries.insert(dossier.source_hash.clone(), dossier.clone());
        Ok(dossier)
    }

    fn list(&self) -> Vec<Dossier> {
        self.entries
            .read()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn robot(description: &str) -> Dossier {
        Dossier::new(
            "hash-robot",
            SubjectKind::Character,
            "Robot-7",
            description,
            "data:image/png;base64,AA==",
        )
    }

    #[test]
    fn upsert_then_lookup_returns_written_entry() -> anyhow::Result<()> {
        let registry = InMemoryDossierRegistry::new();
        assert!(registry.lookup("hash-robot").is_none());

        let written = registry.upsert(robot("rusty plating"))?;
        assert_eq!(registry.lookup("hash-robot"), Some(written));
        Ok(())
    }

    #[test]
    fn upsert_replaces_and_keeps_one_entry_per_hash() -> anyhow::Result<()> {
        let registry = InMemoryDossierRegistry::new();
        registry.upsert(robot("rusty plating"))?;
        registry.upsert(robot("polished chrome"))?;

        let entries = registry.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].description, "polished chrome");
        Ok(())
    }

    #[test]
    fn touch_advances_last_used() -> anyhow::Result<()> {
        let mut stale = robot("rusty plating");
        stale.last_used = DateTime::<Utc>::UNIX_EPOCH;
        let registry = InMemoryDossierRegistry::with_entries([stale.clone()]);

        let touched = registry.touch("hash-robot")?;
        assert!(touched.is_some_and(|dossier| dossier.last_used > stale.last_used));
        assert!(registry.touch("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn concurrent_upserts_are_last_write_wins() -> anyhow::Result<()> {
        let registry = Arc::new(InMemoryDossierRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|idx| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.upsert(robot(&format!("take {idx}"))))
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
        assert_eq!(registry.list().len(), 1);
        Ok(())
    }

    #[test]
    fn dossier_serializes_kind_as_type() -> anyhow::Result<()> {
        let value = serde_json::to_value(robot("x"))?;
        assert_eq!(value["type"], "character");
        assert_eq!(value["role_label"], "Robot-7");
        Ok(())
    }
}
