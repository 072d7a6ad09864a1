pub mod op;
pub mod ops;
