//! Functions that check the validity of user input.
//!
//! The checks on the shape of a bill are pure and live in `bill`; the ones that
//! need to look at workspace membership run queries and live in `database`.

mod bill;
mod database;

pub use bill::{validate_bill, validate_item_shares};
pub use database::{validate_members, validate_user_exists, validate_workspace_exists};
