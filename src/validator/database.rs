//! Functions that check the validity of user input by running query to the database.
//!
//! These checks are necessary in order to return nice error messages; the
//! database still enforces what it can when the actual query is run.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::database::Database;
use crate::error::SettlementError;
use crate::types::{BillDraft, User, UserId, WorkspaceId};

/// Check that the creator and every participant of the bill are members of its workspace.
pub async fn validate_members<D: Database>(
    bill: &BillDraft,
    database: &Arc<Mutex<D>>,
) -> Result<(), SettlementError> {
    validate_workspace_exists(bill.workspace, database).await?;

    let members = database.lock().await.get_workspace_members(bill.workspace)?;
    let members: HashSet<_> = members.into_iter().collect();

    let participants = bill
        .items
        .iter()
        .flat_map(|i| i.shared_with.iter().map(|s| s.user));

    for user in std::iter::once(bill.creator).chain(participants) {
        if !members.contains(&user) {
            return Err(SettlementError::validation(format!(
                "user {user} is not a member of workspace {}",
                bill.workspace
            )));
        }
    }
    Ok(())
}

/// Verify that a workspace exists and return its owner.
pub async fn validate_workspace_exists<D: Database>(
    workspace: WorkspaceId,
    database: &Arc<Mutex<D>>,
) -> Result<UserId, SettlementError> {
    database
        .lock()
        .await
        .get_workspace_owner(workspace)?
        .ok_or_else(|| SettlementError::not_found("workspace", workspace))
}

/// Verify that a user is registered and return the profile.
pub async fn validate_user_exists<D: Database>(
    user: UserId,
    database: &Arc<Mutex<D>>,
) -> Result<User, SettlementError> {
    database
        .lock()
        .await
        .get_user(user)?
        .ok_or_else(|| SettlementError::not_found("user", user))
}
