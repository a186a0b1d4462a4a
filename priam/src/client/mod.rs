pub mod session;
pub mod session_builder;

pub use session::{QueryOptions, Session, SessionConfig};
pub use session_builder::SessionBuilder;
