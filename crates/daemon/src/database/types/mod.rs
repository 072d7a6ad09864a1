mod pending;

pub use pending::{ParsePendingError, Pending};
