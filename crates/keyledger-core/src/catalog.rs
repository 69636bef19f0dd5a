use crate::error::{Error, Result};
use crate::model::{ModelDescriptor, Provider, Settings};
use crate::store::{Filter, Query, Store, from_row, from_rows, tables};
use std::sync::Arc;

/// Read side of the provider reference data.
pub struct ProviderCatalog {
    store: Arc<dyn Store>,
}

impl ProviderCatalog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: &str) -> Result<Provider> {
        let row = self
            .store
            .get_by_id(tables::PROVIDERS, id)
            .await?
            .ok_or_else(|| Error::not_found("Provider", id))?;
        from_row(row)
    }

    /// Like `get`, but a missing provider is `None` rather than an error.
    pub async fn find(&self, id: &str) -> Result<Option<Provider>> {
        self.store
            .get_by_id(tables::PROVIDERS, id)
            .await?
            .map(from_row)
            .transpose()
    }

    pub async fn list_active(&self) -> Result<Vec<Provider>> {
        let rows = self
            .store
            .select(
                tables::PROVIDERS,
                &Query::filtered(Filter::new().eq("is_active", true)).asc("name"),
            )
            .await?;
        from_rows(rows)
    }

    pub async fn models(&self, id: &str) -> Result<Vec<ModelDescriptor>> {
        Ok(self.get(id).await?.available_models)
    }

    pub async fn default_settings(&self, id: &str) -> Result<Settings> {
        Ok(self.get(id).await?.default_settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::to_row;
    use serde_json::json;

    async fn catalog() -> ProviderCatalog {
        let store = Arc::new(MemoryStore::new());
        for (id, name, active) in [("p2", "OpenAI", true), ("p1", "Anthropic", true), ("p3", "Legacy", false)] {
            let provider: Provider = serde_json::from_value(json!({
                "id": id,
                "name": name,
                "is_active": active,
                "available_models": [{"id": format!("{id}-large")}, {"id": format!("{id}-small")}],
                "default_settings": {"temperature": 0.7}
            }))
            .unwrap();
            store
                .insert(tables::PROVIDERS, to_row(&provider).unwrap())
                .await
                .unwrap();
        }
        ProviderCatalog::new(store)
    }

    #[tokio::test]
    async fn test_list_active_sorted_by_name() {
        let c = catalog().await;
        let names: Vec<_> = c.list_active().await.unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Anthropic", "OpenAI"]);
    }

    #[tokio::test]
    async fn test_models_keep_order() {
        let c = catalog().await;
        let models = c.models("p2").await.unwrap();
        assert_eq!(models[0].id, "p2-large");
        assert_eq!(models[1].id, "p2-small");
        assert_eq!(c.default_settings("p2").await.unwrap()["temperature"], json!(0.7));
    }

    #[tokio::test]
    async fn test_missing_provider() {
        let c = catalog().await;
        assert!(matches!(c.get("nope").await, Err(Error::NotFound { .. })));
        assert!(c.find("nope").await.unwrap().is_none());
    }
}
