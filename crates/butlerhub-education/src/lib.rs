pub mod curriculum;
pub mod db;
pub mod error;
pub mod mastery;
pub mod service;
pub mod sm2;
pub mod types;

pub use curriculum::{CurriculumError, CurriculumNode, PrerequisiteEdge};
pub use error::{EducationError, Result};
pub use mastery::{MasteryStatus, MasteryUpdate, ResponseType, StruggleReason};
pub use sm2::Sm2Outcome;
pub use types::{
    MindMap, MindMapEdge, MindMapNode, MindMapStatus, NewMindMapNode, NewQuizResponse,
    QuizResponse, PREREQUISITE_EDGE_TYPE,
};
