//! The session aggregate: one logical entity stored as several rows under a
//! shared partition key.

pub mod model;
pub mod rows;
pub mod store;

pub use model::{
    ParticipantView, SessionAggregate, SessionView, StartRequest, User, UserRole, UserView,
};
pub use rows::SessionRow;
pub use store::{SessionError, SessionStore};
