use crate::source::Source;
use crate::traits::SourceRegistry;
use crate::{LeadflowError, LeadflowResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Source catalogue kept in process memory. Used by tests and by embedders
/// that load their catalogue from elsewhere.
#[derive(Debug, Default)]
pub struct InMemorySourceRegistry {
    sources: RwLock<Vec<Source>>,
}

impl InMemorySourceRegistry {
    pub fn new(sources: Vec<Source>) -> Self {
        Self {
            sources: RwLock::new(sources),
        }
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }
}

fn insert_source(sources: &mut Vec<Source>, source: &Source) -> LeadflowResult<()> {
    source.validate()?;
    if sources.iter().any(|s| s.id == source.id) {
        return Err(LeadflowError::Registry(format!(
            "source '{}' already exists",
            source.id
        )));
    }
    sources.push(source.clone());
    Ok(())
}

fn replace_source(sources: &mut [Source], source: &Source) -> LeadflowResult<()> {
    source.validate()?;
    let slot = sources
        .iter_mut()
        .find(|s| s.id == source.id)
        .ok_or_else(|| LeadflowError::Registry(format!("unknown source '{}'", source.id)))?;
    *slot = source.clone();
    Ok(())
}

fn delete_source(sources: &mut Vec<Source>, id: &str) -> LeadflowResult<()> {
    let before = sources.len();
    sources.retain(|s| s.id != id);
    if sources.len() == before {
        return Err(LeadflowError::Registry(format!("unknown source '{id}'")));
    }
    Ok(())
}

#[async_trait]
impl SourceRegistry for InMemorySourceRegistry {
    async fn load(&self) -> LeadflowResult<Vec<Source>> {
        Ok(self.sources.read().clone())
    }

    async fn add(&self, source: &Source) -> LeadflowResult<()> {
        insert_source(&mut self.sources.write(), source)
    }

    async fn update(&self, source: &Source) -> LeadflowResult<()> {
        replace_source(&mut self.sources.write(), source)
    }

    async fn remove(&self, id: &str) -> LeadflowResult<()> {
        delete_source(&mut self.sources.write(), id)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalogue {
    #[serde(default)]
    sources: Vec<Source>,
}

/// Source catalogue stored as a single TOML file with a `[[sources]]` array.
///
/// Every mutation rewrites the whole file through a temporary sibling and a
/// rename, so readers never observe a half-written catalogue.
pub struct FileSourceRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSourceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_catalogue(&self) -> LeadflowResult<Catalogue> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Catalogue::default());
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        let catalogue: Catalogue = toml::from_str(&data)?;
        for source in &catalogue.sources {
            source.validate()?;
        }
        Ok(catalogue)
    }

    async fn write_catalogue(&self, catalogue: &Catalogue) -> LeadflowResult<()> {
        let body = toml::to_string_pretty(catalogue)
            .map_err(|e| LeadflowError::Registry(format!("Failed to encode catalogue: {e}")))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), sources = catalogue.sources.len(), "Catalogue written");
        Ok(())
    }

    async fn mutate<F>(&self, f: F) -> LeadflowResult<()>
    where
        F: FnOnce(&mut Vec<Source>) -> LeadflowResult<()> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut catalogue = self.read_catalogue().await?;
        f(&mut catalogue.sources)?;
        self.write_catalogue(&catalogue).await
    }
}

#[async_trait]
impl SourceRegistry for FileSourceRegistry {
    async fn load(&self) -> LeadflowResult<Vec<Source>> {
        let catalogue = self.read_catalogue().await?;
        info!(
            path = %self.path.display(),
            sources = catalogue.sources.len(),
            "Loaded source catalogue"
        );
        Ok(catalogue.sources)
    }

    async fn add(&self, source: &Source) -> LeadflowResult<()> {
        self.mutate(|sources| insert_source(sources, source)).await
    }

    async fn update(&self, source: &Source) -> LeadflowResult<()> {
        self.mutate(|sources| replace_source(sources, source)).await
    }

    async fn remove(&self, id: &str) -> LeadflowResult<()> {
        self.mutate(|sources| delete_source(sources, id)).await
    }
}
