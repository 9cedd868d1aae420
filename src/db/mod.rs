pub mod pool;
pub mod queries;
pub mod queries_articles;
pub mod queries_posting;

pub use pool::{create_pool, run_migrations};
pub use queries::*;
pub use queries_articles::*;
pub use queries_posting::*;
