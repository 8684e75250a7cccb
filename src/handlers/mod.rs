mod health;
mod query;

pub use health::*;
pub use query::*;
