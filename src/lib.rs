pub mod blocking;
pub mod classify;
pub mod cluster;
pub mod dto;
pub mod engine;
pub mod error;
pub mod gazetteer;
pub mod model;
pub mod normalize;
pub mod response;
pub mod scorer;
pub mod util;

pub use engine::{Cancellation, Engine};
pub use error::{EngineError, ServiceError};
pub use model::ScoringModel;
