//! Job application entity.

use chrono::{DateTime, Utc};
use domain::models::JobApplication;
use sqlx::FromRow;
use uuid::Uuid;

/// Database row for a job application.
#[derive(Debug, Clone, FromRow)]
pub struct JobApplicationEntity {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub company: String,
    pub position: String,
    pub status: String,
    pub location: Option<String>,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub source: Option<String>,
    pub job_url: Option<String>,
    pub notes: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobApplicationEntity> for JobApplication {
    fn from(entity: JobApplicationEntity) -> Self {
        Self {
            id: entity.id,
            owner_id: entity.owner_id,
            company: entity.company,
            position: entity.position,
            status: entity.status,
            location: entity.location,
            salary_min: entity.salary_min,
            salary_max: entity.salary_max,
            source: entity.source,
            job_url: entity.job_url,
            notes: entity.notes,
            applied_at: entity.applied_at,
            created_at: entity.created_at,
            updated_at: entity.updated_at,
        }
    }
}
