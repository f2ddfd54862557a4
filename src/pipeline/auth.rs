use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::api::ApiError;
use super::db::DbHandle;
use super::models::Metric;
use crate::errors::PipelineError;

/// Header carrying the caller's organization, set by the upstream auth layer.
pub const ORGANIZATION_HEADER: &str = "x-organization-id";

/// Access check run before every pipeline operation.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn get_metric_and_verify_access(
        &self,
        db: &DbHandle,
        metric_id: &str,
        organization_id: &str,
    ) -> Result<Metric, PipelineError>;
}

/// Grants access when the metric belongs to the caller's organization.
/// A metric of another organization is reported as not found.
pub struct OrganizationAuthorizer;

#[async_trait]
impl Authorizer for OrganizationAuthorizer {
    async fn get_metric_and_verify_access(
        &self,
        db: &DbHandle,
        metric_id: &str,
        organization_id: &str,
    ) -> Result<Metric, PipelineError> {
        let id = metric_id.to_string();
        let metric = db
            .call(move |db| db.get_metric(&id))
            .await
            .map_err(PipelineError::Database)?;
        match metric {
            Some(metric) if metric.organization_id == organization_id => Ok(metric),
            Some(_) => {
                tracing::warn!(metric_id, organization_id, "Cross-organization metric access denied");
                Err(PipelineError::MetricNotFound {
                    id: metric_id.to_string(),
                })
            }
            None => Err(PipelineError::MetricNotFound {
                id: metric_id.to_string(),
            }),
        }
    }
}

/// The authenticated caller's organization.
#[derive(Debug, Clone)]
pub struct OrgContext {
    pub organization_id: String,
}

impl<S: Send + Sync> FromRequestParts<S> for OrgContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let organization_id = parts
            .headers
            .get(ORGANIZATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized(format!("Missing {} header", ORGANIZATION_HEADER)))?;
        Ok(Self {
            organization_id: organization_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::PipelineDb;
    use crate::pipeline::models::NewMetric;

    fn db() -> DbHandle {
        let db = PipelineDb::new_in_memory().unwrap();
        db.create_metric(&NewMetric {
            id: Some("m1".into()),
            organization_id: "org_a".into(),
            name: "Stars".into(),
            ..Default::default()
        })
        .unwrap();
        DbHandle::new(db)
    }

    #[tokio::test]
    async fn owner_organization_gets_metric() {
        let metric = OrganizationAuthorizer
            .get_metric_and_verify_access(&db(), "m1", "org_a")
            .await
            .unwrap();
        assert_eq!(metric.name, "Stars");
    }

    #[tokio::test]
    async fn other_organization_sees_not_found() {
        let db = db();
        let err = OrganizationAuthorizer
            .get_metric_and_verify_access(&db, "m1", "org_b")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MetricNotFound { .. }));

        let err = OrganizationAuthorizer
            .get_metric_and_verify_access(&db, "nope", "org_a")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MetricNotFound { .. }));
    }

    #[tokio::test]
    async fn extractor_requires_header() {
        let (mut parts, _) = axum::http::Request::builder()
            .uri("/")
            .body(())
            .unwrap()
            .into_parts();
        assert!(OrgContext::from_request_parts(&mut parts, &()).await.is_err());

        let (mut parts, _) = axum::http::Request::builder()
            .uri("/")
            .header(ORGANIZATION_HEADER, "org_a")
            .body(())
            .unwrap()
            .into_parts();
        let ctx = OrgContext::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(ctx.organization_id, "org_a");
    }
}
