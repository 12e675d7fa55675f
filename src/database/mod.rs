//! Internal representation of data.

use chrono::{DateTime, Utc};

use crate::{
    error::DatabaseError,
    ledger::LedgerRecorder,
    types::{Bill, BillId, NewBill, NewTransaction, User, UserId, WorkspaceId},
};

type DatabaseResult<T> = Result<T, DatabaseError>;

pub mod sqlite;

/// This trait abstracts over the type of database.
///
/// The implementation must also record ledger transactions, since settling a
/// bill and recording the matching transactions happen in the same write.
pub trait Database: LedgerRecorder {
    /// Register a user profile and return its ID.
    fn register_user(&mut self, name: &str, account_number: &str) -> DatabaseResult<UserId>;

    /// Get the profile of the given user, if it exists.
    fn get_user(&self, user: UserId) -> DatabaseResult<Option<User>>;

    /// Create a workspace owned by *owner*. The owner is also a member.
    fn create_workspace(&mut self, owner: UserId) -> DatabaseResult<WorkspaceId>;

    /// Add members to the given workspace.
    ///
    /// If some members are already present, they are ignored.
    fn add_workspace_members_if_not_exist(
        &mut self,
        workspace: WorkspaceId,
        members: &[UserId],
    ) -> DatabaseResult<()>;

    /// Get the list of all members of the given workspace.
    fn get_workspace_members(&self, workspace: WorkspaceId) -> DatabaseResult<Vec<UserId>>;

    /// Get the owner of the given workspace, if it exists.
    fn get_workspace_owner(&self, workspace: WorkspaceId) -> DatabaseResult<Option<UserId>>;

    /// Save a new bill with all its items, shares and round entries.
    fn save_bill(&mut self, bill: NewBill, created_at: DateTime<Utc>) -> DatabaseResult<Bill>;

    /// Get the bill with the given *bill_id*.
    fn get_bill(&self, bill_id: BillId) -> DatabaseResult<Option<Bill>>;

    /// Persist the current state of a bill together with the transactions its
    /// settlement produced, and return the new version.
    ///
    /// The write only happens if the stored version is still `bill.version`;
    /// otherwise [`DatabaseError::Concurrency`] is returned and nothing changes.
    /// A transaction whose reference already exists fails the whole write with
    /// [`DatabaseError::DuplicateTransaction`].
    fn commit_bill(&mut self, bill: &Bill, transactions: &[NewTransaction])
        -> DatabaseResult<i64>;

    /// Delete the bill with the given *bill_id*, returning whether it existed.
    ///
    /// Ledger transactions referencing the bill are kept.
    fn delete_bill(&mut self, bill_id: BillId) -> DatabaseResult<bool>;
}
