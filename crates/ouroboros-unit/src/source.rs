//! Discovery collaborators: where test metadata and data rows come from

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::metadata::TestMetadata;
use crate::value::ArgValue;

/// A row of arguments
pub type Row = Vec<ArgValue>;

/// Produces test metadata (one or more sources are merged per run)
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn test_metadata(&self) -> Result<Vec<TestMetadata>>;
}

/// Resolves named data sources into rows
#[async_trait]
pub trait DataSourceResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> std::result::Result<Vec<Row>, String>;
}

/// Metadata held in memory
#[derive(Default, Clone)]
pub struct StaticMetadataSource {
    tests: Vec<TestMetadata>,
}

impl StaticMetadataSource {
    pub fn new(tests: Vec<TestMetadata>) -> Self {
        Self { tests }
    }

    pub fn with(mut self, test: TestMetadata) -> Self {
        self.tests.push(test);
        self
    }
}

#[async_trait]
impl MetadataSource for StaticMetadataSource {
    async fn test_metadata(&self) -> Result<Vec<TestMetadata>> {
        Ok(self.tests.clone())
    }
}

type Provider = Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<Vec<Row>, String>> + Send + Sync>;

/// Named data sources backed by fixed rows or async providers
#[derive(Default, Clone)]
pub struct DataSourceRegistry {
    providers: HashMap<String, Provider>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register fixed rows under `name`
    pub fn with_rows(mut self, name: impl Into<String>, rows: Vec<Row>) -> Self {
        let rows = Arc::new(rows);
        self.providers.insert(
            name.into(),
            Arc::new(move || {
                let rows = rows.clone();
                async move { Ok(rows.as_ref().clone()) }.boxed()
            }),
        );
        self
    }

    /// Register an async provider under `name`
    pub fn with_provider<F, Fut>(mut self, name: impl Into<String>, provider: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<Row>, String>> + Send + 'static,
    {
        self.providers
            .insert(name.into(), Arc::new(move || provider().boxed()));
        self
    }
}

#[async_trait]
impl DataSourceResolver for DataSourceRegistry {
    async fn resolve(&self, name: &str) -> std::result::Result<Vec<Row>, String> {
        let provider = self
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| format!("no data source registered under '{}'", name))?;
        provider().await
    }
}

/// Collect metadata from every source, rejecting duplicate ids
pub async fn collect_metadata(sources: &[Arc<dyn MetadataSource>]) -> Result<Vec<TestMetadata>> {
    let batches = futures::future::try_join_all(sources.iter().map(|s| s.test_metadata())).await?;

    let mut seen = std::collections::HashSet::new();
    let mut all = Vec::new();
    for meta in batches.into_iter().flatten() {
        if !seen.insert(meta.id.clone()) {
            return Err(EngineError::Discovery(format!(
                "duplicate test metadata id '{}'",
                meta.id
            )));
        }
        all.push(meta);
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::FnInvoker;
    use crate::metadata::{ClassInfo, InvokerBinding};

    fn meta(method: &str) -> TestMetadata {
        let invoker = Arc::new(FnInvoker::stateless(|_a, _c| async { Ok(()) }));
        TestMetadata::new(ClassInfo::new("S"), method, InvokerBinding::Direct(invoker))
    }

    #[tokio::test]
    async fn test_registry_resolves_rows_and_providers() {
        let registry = DataSourceRegistry::new()
            .with_rows("fixed", vec![crate::args![1], crate::args![2]])
            .with_provider("lazy", || async { Ok(vec![crate::args!["x", 'y']]) });

        assert_eq!(registry.resolve("fixed").await.unwrap().len(), 2);
        assert_eq!(registry.resolve("lazy").await.unwrap(), vec![crate::args!["x", 'y']]);
        assert!(registry.resolve("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_collect_merges_sources() {
        let a: Arc<dyn MetadataSource> = Arc::new(StaticMetadataSource::new(vec![meta("a")]));
        let b: Arc<dyn MetadataSource> = Arc::new(StaticMetadataSource::default().with(meta("b")));
        let all = collect_metadata(&[a, b]).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_collect_rejects_duplicates() {
        let a: Arc<dyn MetadataSource> = Arc::new(StaticMetadataSource::new(vec![meta("a")]));
        let b: Arc<dyn MetadataSource> = Arc::new(StaticMetadataSource::new(vec![meta("a")]));
        assert!(matches!(
            collect_metadata(&[a, b]).await,
            Err(EngineError::Discovery(_))
        ));
    }
}
