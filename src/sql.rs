use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::tables::{TABLES, TRANSFORM_STEPS, transform_query_name};
use crate::{EtlError, Result};

/// Named SQL texts: `query/<table>` for extracts, `transform/<step>` for the
/// mart statements.
#[derive(Debug, Clone, Default)]
pub struct SqlCatalog {
    statements: HashMap<String, String>,
}

impl SqlCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names every pipeline run needs.
    pub fn required_names() -> impl Iterator<Item = String> {
        TABLES
            .iter()
            .map(|t| t.query_name())
            .chain(TRANSFORM_STEPS.iter().map(|s| transform_query_name(s)))
    }

    /// Reads `<dir>/<name>.sql` for every required name.
    pub async fn load_dir(dir: &Path) -> Result<Self> {
        let mut catalog = Self::new();
        for name in Self::required_names() {
            let path = dir.join(format!("{name}.sql"));
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| EtlError::Config(format!("cannot read {}: {e}", path.display())))?;
            debug!(name = %name, path = %path.display(), "loaded sql");
            catalog.insert(name, text);
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, name: impl Into<String>, sql: impl Into<String>) {
        self.statements.insert(name.into(), sql.into());
    }

    pub fn with(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.insert(name, sql);
        self
    }

    pub fn get(&self, name: &str) -> Result<&str> {
        self.statements
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| EtlError::Config(format!("no sql named {name}")))
    }

    pub fn missing(&self) -> Vec<String> {
        Self::required_names()
            .filter(|name| !self.statements.contains_key(name))
            .collect()
    }
}
