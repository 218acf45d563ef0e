//! CLI command implementations.

pub mod machine_id;
pub mod serve;
