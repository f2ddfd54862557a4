//! Transformer Store.
//!
//! Both transformer kinds are looked up by their natural key (the metric's
//! template id for ingestion, the dashboard chart id for charts). They are
//! never mutated in place: regeneration deletes and recreates, and deleting
//! a transformer that does not exist is an ordinary outcome, not an error.

use anyhow::Result;
use chrono::Utc;

use super::chart::ChartSpec;
use super::db::DbHandle;
use super::ingestion::IngestionSpec;
use super::models::{ChartTransformer, IngestionTransformer};

/// Result of a delete-if-exists call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

impl DeleteOutcome {
    fn from_rows(rows: usize) -> Self {
        if rows > 0 { Self::Deleted } else { Self::NotFound }
    }
}

#[derive(Clone)]
pub struct TransformerStore {
    db: DbHandle,
}

impl TransformerStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn ingestion(&self, template_id: &str) -> Result<Option<IngestionTransformer>> {
        let template_id = template_id.to_string();
        self.db
            .call(move |db| db.get_ingestion_transformer(&template_id))
            .await
    }

    /// Delete any existing transformer for `template_id` and store `spec`.
    pub async fn replace_ingestion(
        &self,
        template_id: &str,
        spec: IngestionSpec,
    ) -> Result<IngestionTransformer> {
        let template_id = template_id.to_string();
        self.db
            .call(move |db| {
                db.delete_ingestion_transformer(&template_id)?;
                db.insert_ingestion_transformer(&template_id, &spec, Utc::now())
            })
            .await
    }

    pub async fn delete_ingestion(&self, template_id: &str) -> Result<DeleteOutcome> {
        let template_id = template_id.to_string();
        let rows = self
            .db
            .call(move |db| db.delete_ingestion_transformer(&template_id))
            .await?;
        Ok(DeleteOutcome::from_rows(rows))
    }

    pub async fn chart(&self, dashboard_chart_id: &str) -> Result<Option<ChartTransformer>> {
        let chart_id = dashboard_chart_id.to_string();
        self.db
            .call(move |db| db.get_chart_transformer(&chart_id))
            .await
    }

    /// Delete any existing transformer for the chart and store `spec`.
    pub async fn replace_chart(
        &self,
        dashboard_chart_id: &str,
        spec: ChartSpec,
    ) -> Result<ChartTransformer> {
        let chart_id = dashboard_chart_id.to_string();
        self.db
            .call(move |db| {
                db.delete_chart_transformer(&chart_id)?;
                db.insert_chart_transformer(&chart_id, &spec, Utc::now())
            })
            .await
    }

    pub async fn delete_chart(&self, dashboard_chart_id: &str) -> Result<DeleteOutcome> {
        let chart_id = dashboard_chart_id.to_string();
        let rows = self
            .db
            .call(move |db| db.delete_chart_transformer(&chart_id))
            .await?;
        Ok(DeleteOutcome::from_rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::PipelineDb;
    use crate::pipeline::models::NewMetric;

    fn store() -> TransformerStore {
        let db = PipelineDb::new_in_memory().unwrap();
        db.create_metric(&NewMetric {
            id: Some("m1".into()),
            organization_id: "org".into(),
            name: "Signups".into(),
            template_id: Some("m1".into()),
            ..Default::default()
        })
        .unwrap();
        TransformerStore::new(DbHandle::new(db))
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = store();
        assert_eq!(store.delete_ingestion("m1").await.unwrap(), DeleteOutcome::NotFound);

        store
            .replace_ingestion("m1", IngestionSpec::counting("", "/at"))
            .await
            .unwrap();
        assert_eq!(store.delete_ingestion("m1").await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete_ingestion("m1").await.unwrap(), DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn replace_swaps_the_definition() {
        let store = store();
        let first = store
            .replace_ingestion("m1", IngestionSpec::counting("/a", "/at"))
            .await
            .unwrap();
        let second = store
            .replace_ingestion("m1", IngestionSpec::counting("/b", "/at"))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        let current = store.ingestion("m1").await.unwrap().unwrap();
        assert_eq!(current.id, second.id);
        assert_eq!(current.spec.records_pointer, "/b");
    }

    #[tokio::test]
    async fn missing_chart_transformer_reports_not_found() {
        let store = store();
        assert!(store.chart("c-missing").await.unwrap().is_none());
        assert_eq!(store.delete_chart("c-missing").await.unwrap(), DeleteOutcome::NotFound);
    }
}
