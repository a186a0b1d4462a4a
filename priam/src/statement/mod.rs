mod prepared;

pub use prepared::{PreparedQuery, QueryValues};
