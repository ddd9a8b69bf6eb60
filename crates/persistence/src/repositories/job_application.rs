//! Job application reader used by the export generator.

use domain::models::{FilterSpec, JobApplication, RecordCursor};
use domain::services::{ApplicationSource, StoreError};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::map_sqlx_error;
use crate::entities::JobApplicationEntity;
use crate::metrics::QueryTimer;

/// Postgres-backed record source.
#[derive(Clone)]
pub struct PgApplicationSource {
    pool: PgPool,
}

impl PgApplicationSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Escape `LIKE` metacharacters so user text matches literally.
fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Append the owner and filter predicates.
fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, owner_id: Uuid, filter: &FilterSpec) {
    builder.push(" WHERE owner_id = ");
    builder.push_bind(owner_id);

    if !filter.statuses.is_empty() {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.to_lowercase()).collect();
        builder.push(" AND LOWER(status) = ANY(");
        builder.push_bind(statuses);
        builder.push(")");
    }
    if let Some(ref company) = filter.company {
        builder.push(" AND company ILIKE ");
        builder.push_bind(format!("%{}%", escape_like(company)));
    }
    if let Some(ref position) = filter.position {
        builder.push(" AND position ILIKE ");
        builder.push_bind(format!("%{}%", escape_like(position)));
    }
    if let Some(from) = filter.applied_from {
        builder.push(" AND applied_at >= ");
        builder.push_bind(from);
    }
    if let Some(to) = filter.applied_to {
        builder.push(" AND applied_at <= ");
        builder.push_bind(to);
    }
}

#[async_trait::async_trait]
impl ApplicationSource for PgApplicationSource {
    async fn ping(&self) -> Result<(), StoreError> {
        let timer = QueryTimer::new("job_applications_ping");
        let result = sqlx::query("SELECT 1").execute(&self.pool).await;
        timer.observe(&result);
        result.map(|_| ()).map_err(map_sqlx_error)
    }

    async fn count(&self, owner_id: Uuid, filter: &FilterSpec) -> Result<i64, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM job_applications");
        push_filter(&mut builder, owner_id, filter);

        let timer = QueryTimer::new("job_applications_count");
        let result: Result<i64, _> = builder.build_query_scalar().fetch_one(&self.pool).await;
        timer.observe(&result);
        result.map_err(map_sqlx_error)
    }

    async fn fetch_batch(
        &self,
        owner_id: Uuid,
        filter: &FilterSpec,
        after: Option<RecordCursor>,
        limit: i64,
    ) -> Result<Vec<JobApplication>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT id, owner_id, company, position, status, location, salary_min, salary_max, \
             source, job_url, notes, applied_at, created_at, updated_at FROM job_applications",
        );
        push_filter(&mut builder, owner_id, filter);

        if let Some(cursor) = after {
            builder.push(" AND (created_at, id) > (");
            builder.push_bind(cursor.created_at);
            builder.push(", ");
            builder.push_bind(cursor.id);
            builder.push(")");
        }
        builder.push(" ORDER BY created_at ASC, id ASC LIMIT ");
        builder.push_bind(limit);

        let timer = QueryTimer::new("job_applications_fetch_batch");
        let result = builder
            .build_query_as::<JobApplicationEntity>()
            .fetch_all(&self.pool)
            .await;
        timer.observe(&result);

        Ok(result
            .map_err(map_sqlx_error)?
            .into_iter()
            .map(JobApplication::from)
            .collect())
    }
}
