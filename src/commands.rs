//! Dispatch of parsed requests to the bill operations.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use log::debug;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::database::Database;
use crate::endpoints::{
    handle_accumulated_pending, handle_add_members, handle_bill_transactions, handle_cancel,
    handle_confirm, handle_create_bill, handle_create_workspace, handle_delete_bill,
    handle_get_bill, handle_pay, handle_register_user, handle_update_bill, handle_update_round,
    Evidence,
};
use crate::error::InputError;
use crate::evidence::EvidenceStore;
use crate::parser::{EvidenceFile, Request};

/// Everything a request needs to run.
pub struct Context<D, E> {
    pub database: Arc<Mutex<D>>,
    pub store: E,
    pub max_commit_retries: u32,
}

pub async fn execute<D: Database, E: EvidenceStore>(
    request: Request,
    context: &Context<D, E>,
) -> anyhow::Result<Value> {
    let database = &context.database;
    let store = &context.store;
    let retries = context.max_commit_retries;
    let now = Utc::now();

    let response = match request {
        Request::RegisterUser {
            name,
            account_number,
        } => {
            let user = handle_register_user(&name, &account_number, database).await?;
            json!({ "user": user })
        }
        Request::CreateWorkspace { owner } => {
            let workspace = handle_create_workspace(owner, database).await?;
            json!({ "workspace": workspace })
        }
        Request::AddMembers { workspace, members } => {
            let members = handle_add_members(workspace, &members, database).await?;
            json!({ "workspace": workspace, "members": members })
        }
        Request::CreateBill { bill, evidence } => {
            let evidence = match evidence {
                Some(file) => Some(read_evidence(&file).await?),
                None => None,
            };
            let bill = handle_create_bill(bill, evidence.as_ref(), database, store, now).await?;
            serde_json::to_value(bill)?
        }
        Request::Pay {
            bill,
            payer,
            items,
            evidence,
        } => {
            let evidence = read_evidence(&evidence).await?;
            let report =
                handle_pay(bill, payer, &items, &evidence, database, store, retries, now).await?;
            serde_json::to_value(report)?
        }
        Request::Confirm {
            bill,
            confirmations,
        } => {
            let report = handle_confirm(bill, &confirmations, database, retries, now).await?;
            serde_json::to_value(report)?
        }
        Request::Cancel { bill, actor } => {
            let report = handle_cancel(bill, actor, database, store, retries, now).await?;
            serde_json::to_value(report)?
        }
        Request::UpdateRound { bill, schedule } => {
            let report = handle_update_round(bill, &schedule, database, store, retries, now).await?;
            serde_json::to_value(report)?
        }
        Request::UpdateBill { bill, patch } => {
            let bill = handle_update_bill(bill, &patch, database, retries, now).await?;
            serde_json::to_value(bill)?
        }
        Request::DeleteBill { bill } => {
            let cleanup = handle_delete_bill(bill, database, store).await?;
            json!({ "bill": bill, "cleanup": cleanup })
        }
        Request::GetBill { bill } => {
            serde_json::to_value(handle_get_bill(bill, database).await?)?
        }
        Request::BillTransactions { bill } => {
            serde_json::to_value(handle_bill_transactions(bill, database).await?)?
        }
        Request::AccumulatedPending { bill, user } => {
            let amount = handle_accumulated_pending(bill, user, database).await?;
            json!({ "bill": bill, "user": user, "amount": amount })
        }
    };

    Ok(response)
}

async fn read_evidence(file: &EvidenceFile) -> Result<Evidence, InputError> {
    let bytes = tokio::fs::read(&file.path)
        .await
        .map_err(|e| InputError::unreadable_evidence(&file.path, e))?;
    debug!("Read {} bytes of evidence from {}", bytes.len(), file.path.display());

    Ok(Evidence {
        file_name: file_name(&file.path),
        bytes,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
