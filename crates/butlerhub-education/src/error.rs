use thiserror::Error;
use uuid::Uuid;

use crate::curriculum::CurriculumError;

#[derive(Debug, Error)]
pub enum EducationError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("malformed education row: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] butlerhub_scheduler::SchedulerError),

    #[error("mind map not found: {0}")]
    MindMapNotFound(Uuid),

    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error(transparent)]
    Curriculum(#[from] CurriculumError),
}

pub type Result<T> = std::result::Result<T, EducationError>;
