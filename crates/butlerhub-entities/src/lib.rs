pub mod db;
pub mod error;
pub mod manager;
pub mod types;

pub use error::{EntityError, Result};
pub use manager::EntityResolver;
pub use types::{
    ContextHints, Entity, EntityCandidate, Fact, NameMatch, NewEntity, NewFact, ResolveInput,
};
