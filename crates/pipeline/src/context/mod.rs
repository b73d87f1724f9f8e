//! Token-bounded generation context.
//!
//! Selected pages from every source are ranked (composite score, then
//! source rank, then page number) and accepted greedily until the next page
//! would exceed the budget.

pub mod builder;
pub mod token;

pub use builder::{ContextBuilder, rank};
pub use token::{estimate_page_tokens, estimate_tokens};
