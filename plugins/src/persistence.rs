use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use harvest_core::api::{ClassifiedError, PersistencePlugin, Taxonomy};
use serde_json::Value;
use tokio::sync::Mutex;

pub const DERIVED_EVENTS: &str = "derived_events";
pub const CATEGORIES: &str = "categories";
pub const TAGS: &str = "tags";

type Table = BTreeMap<String, Value>;

/// Entity store keyed by conflict keys, one JSON file per entity type.
///
/// Without a directory everything stays in memory. Writes replace the whole
/// file through a temp file and a rename, so readers never see a partial file.
pub struct FilePersistence {
    dir: Option<PathBuf>,
    tables: Mutex<HashMap<String, Table>>,
}

impl FilePersistence {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| anyhow::anyhow!("create {}: {e}", dir.display()))?;
        Ok(Self {
            dir: Some(dir),
            tables: Mutex::new(HashMap::new()),
        })
    }

    pub fn directory(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Every stored row of `entity_type`, ordered by key.
    pub async fn rows(&self, entity_type: &str) -> anyhow::Result<Vec<Value>> {
        let mut tables = self.tables.lock().await;
        let table = self.table(&mut tables, entity_type).await?;
        Ok(table.values().cloned().collect())
    }

    fn file_for(dir: &Path, entity_type: &str) -> PathBuf {
        dir.join(format!("{entity_type}.json"))
    }

    async fn table<'a>(
        &self,
        tables: &'a mut HashMap<String, Table>,
        entity_type: &str,
    ) -> anyhow::Result<&'a mut Table> {
        if !tables.contains_key(entity_type) {
            let loaded = match &self.dir {
                Some(dir) => read_table(&Self::file_for(dir, entity_type)).await?,
                None => Table::new(),
            };
            tables.insert(entity_type.to_string(), loaded);
        }
        tables
            .get_mut(entity_type)
            .ok_or_else(|| ClassifiedError::persistence("table vanished").into_propagated())
    }
}

async fn read_table(path: &Path) -> anyhow::Result<Table> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            ClassifiedError::persistence(format!("corrupt {}: {e}", path.display()))
                .into_propagated()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Table::new()),
        Err(e) => Err(
            ClassifiedError::persistence(format!("read {}: {e}", path.display())).into_propagated(),
        ),
    }
}

async fn write_table(path: &Path, table: &Table) -> anyhow::Result<()> {
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
    let bytes = serde_json::to_vec_pretty(table)?;
    let persist = |e: std::io::Error| {
        ClassifiedError::persistence(format!("write {}: {e}", path.display())).into_propagated()
    };
    tokio::fs::write(&tmp, &bytes).await.map_err(persist)?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(persist(e));
    }
    Ok(())
}

fn row_key(row: &Value, conflict_keys: &[&str]) -> Result<String, ClassifiedError> {
    let mut parts = Vec::with_capacity(conflict_keys.len());
    for key in conflict_keys {
        match row.get(*key) {
            Some(Value::String(s)) => parts.push(s.clone()),
            Some(Value::Null) | None => {
                return Err(ClassifiedError::application(format!(
                    "row is missing conflict key '{key}'"
                )))
            }
            Some(other) => parts.push(other.to_string()),
        }
    }
    Ok(parts.join("\u{1f}"))
}

fn names(table: &Table) -> Vec<String> {
    table
        .values()
        .filter_map(|row| match row {
            Value::String(s) => Some(s.clone()),
            other => other.get("name").and_then(Value::as_str).map(str::to_string),
        })
        .collect()
}

#[async_trait]
impl PersistencePlugin for FilePersistence {
    fn name(&self) -> &str {
        if self.dir.is_some() {
            "file"
        } else {
            "memory"
        }
    }

    async fn upsert(
        &self,
        entity_type: &str,
        rows: Vec<Value>,
        conflict_keys: &[&str],
    ) -> anyhow::Result<usize> {
        if conflict_keys.is_empty() {
            return Err(ClassifiedError::configuration("upsert requires conflict keys")
                .into_propagated());
        }
        let keyed = rows
            .into_iter()
            .map(|row| row_key(&row, conflict_keys).map(|k| (k, row)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ClassifiedError::into_propagated)?;
        let written = keyed.len();

        let mut tables = self.tables.lock().await;
        let table = self.table(&mut tables, entity_type).await?;
        let mut next = table.clone();
        for (key, row) in keyed {
            next.insert(key, row);
        }
        if let Some(dir) = &self.dir {
            write_table(&Self::file_for(dir, entity_type), &next).await?;
        }
        *table = next;

        tracing::debug!(
            target: "harvest.persistence",
            entity_type,
            rows = written,
            total = table.len(),
            "upserted"
        );
        Ok(written)
    }

    async fn load_taxonomy(&self, recent_limit: usize) -> anyhow::Result<Taxonomy> {
        let mut tables = self.tables.lock().await;
        let categories = names(self.table(&mut tables, CATEGORIES).await?);
        let tags = names(self.table(&mut tables, TAGS).await?);

        let events = self.table(&mut tables, DERIVED_EVENTS).await?;
        let mut recent: Vec<(&str, &str)> = events
            .values()
            .filter_map(|row| {
                let at = row.get("analyzed_at").and_then(Value::as_str)?;
                let event_type = row.get("event_type").and_then(Value::as_str)?;
                Some((at, event_type))
            })
            .collect();
        // RFC 3339 timestamps in UTC sort lexicographically.
        recent.sort_by(|a, b| b.0.cmp(a.0));
        let mut recent_events: Vec<String> = Vec::new();
        for (_, event_type) in recent {
            if recent_events.len() >= recent_limit {
                break;
            }
            if !recent_events.iter().any(|e| e == event_type) {
                recent_events.push(event_type.to_string());
            }
        }

        Ok(Taxonomy {
            categories,
            tags,
            recent_events,
        })
    }
}
