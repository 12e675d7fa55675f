//! Core implementation of the bill operations.
//!
//! Each handler loads the bill, runs the settlement engine on it and commits the
//! result with a compare-and-swap on the bill version. Evidence is uploaded and
//! deleted without holding the database lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    database::Database,
    error::{ErrorKind, SettlementError},
    evidence::{
        delete_all, evidence_path, CleanupManifest, EvidenceKind, EvidenceMetadata,
        EvidenceStore,
    },
    settlement::{
        cancel_bill, confirm_payment, ensure_current_round, settle, submit_payment,
        update_round_schedule, Submission,
    },
    types::{
        Amount, Bill, BillDraft, BillId, BillPatch, BillStatus, Creator, ItemId, NewBill,
        NewItem, NewTransaction, PaymentType, RoundSchedulePatch, Share, ShareStatus,
        Transaction, UserId, WorkspaceId,
    },
    validator::{
        validate_bill, validate_item_shares, validate_members, validate_user_exists,
        validate_workspace_exists,
    },
};

pub const ALL_PAYMENTS_COMPLETED: &str = "All payments completed";
pub const SOME_PAYMENTS_PENDING: &str = "Some payments pending";

/// An uploaded file, as received from the caller.
#[derive(Clone, Debug)]
pub struct Evidence {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// The outcome of one entry of a bulk operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryOutcome {
    pub item: ItemId,
    pub user: UserId,
    pub round: Option<u32>,
    pub status: Option<ShareStatus>,
    pub error: Option<EntryError>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EntryOutcome {
    fn success(item: ItemId, user: UserId, round: Option<u32>, status: ShareStatus) -> Self {
        EntryOutcome {
            item,
            user,
            round,
            status: Some(status),
            error: None,
        }
    }

    fn failure(item: ItemId, user: UserId, round: Option<u32>, e: &SettlementError) -> Self {
        EntryOutcome {
            item,
            user,
            round,
            status: None,
            error: Some(EntryError {
                kind: e.kind(),
                message: e.to_string(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PaymentReport {
    pub bill: Bill,
    pub items: Vec<EntryOutcome>,
    /// Replaced slips that could not be deleted are reported here.
    pub cleanup: CleanupManifest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct Confirmation {
    pub item: ItemId,
    pub user: UserId,
    #[serde(default)]
    pub round: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConfirmReport {
    pub bill: Bill,
    pub entries: Vec<EntryOutcome>,
    pub summary: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct CleanupReport {
    pub bill: Bill,
    pub cleanup: CleanupManifest,
}

pub async fn handle_register_user<D: Database>(
    name: &str,
    account_number: &str,
    database: &Arc<Mutex<D>>,
) -> Result<UserId, SettlementError> {
    if name.trim().is_empty() {
        return Err(SettlementError::validation("missing user name"));
    }
    let user = database
        .lock()
        .await
        .register_user(name.trim(), account_number.trim())?;
    debug!("Registered user {user}");
    Ok(user)
}

pub async fn handle_create_workspace<D: Database>(
    owner: UserId,
    database: &Arc<Mutex<D>>,
) -> Result<WorkspaceId, SettlementError> {
    validate_user_exists(owner, database).await?;
    let workspace = database.lock().await.create_workspace(owner)?;
    debug!("Created workspace {workspace} owned by {owner}");
    Ok(workspace)
}

pub async fn handle_add_members<D: Database>(
    workspace: WorkspaceId,
    members: &[UserId],
    database: &Arc<Mutex<D>>,
) -> Result<Vec<UserId>, SettlementError> {
    validate_workspace_exists(workspace, database).await?;
    for member in members {
        validate_user_exists(*member, database).await?;
    }

    let mut database = database.lock().await;
    database.add_workspace_members_if_not_exist(workspace, members)?;
    Ok(database.get_workspace_members(workspace)?)
}

/// Validate and persist a new bill.
///
/// The creator's evidence, if any, is uploaded first: a failed upload aborts the
/// creation, and the upload is deleted again if the bill cannot be saved.
pub async fn handle_create_bill<D: Database, E: EvidenceStore>(
    draft: BillDraft,
    evidence: Option<&Evidence>,
    database: &Arc<Mutex<D>>,
    store: &E,
    now: DateTime<Utc>,
) -> Result<Bill, SettlementError> {
    validate_bill(&draft)?;
    validate_members(&draft, database).await?;

    let creator = validate_user_exists(draft.creator, database).await?;
    let rounds = match draft.payment_type {
        PaymentType::Round => draft.round_details.as_ref().map(|d| d.total_period),
        PaymentType::Normal => None,
    };

    let mut items = Vec::with_capacity(draft.items.len());
    for item in draft.items {
        let mut shared_with = Vec::with_capacity(item.shared_with.len());
        for share in item.shared_with {
            let user = validate_user_exists(share.user, database).await?;
            shared_with.push(Share::new(user.id, &user.name, share.share_amount, rounds));
        }
        items.push(NewItem {
            description: item.description.trim().to_string(),
            amount: item.amount,
            shared_with,
        });
    }

    let e_slip = match evidence {
        Some(evidence) => {
            let kind = EvidenceKind::BillCreate {
                workspace: draft.workspace,
                user: creator.id,
            };
            Some(upload(store, kind, evidence, creator.id, now)?)
        }
        None => None,
    };

    let new_bill = NewBill {
        workspace: draft.workspace,
        creator: Creator {
            user: creator.id,
            name: creator.name,
            account_number: creator.account_number,
        },
        payment_type: draft.payment_type,
        round_details: draft.round_details,
        items,
        note: draft.note,
        e_slip: e_slip.clone(),
    };

    let saved = database.lock().await.save_bill(new_bill, now);
    match saved {
        Ok(bill) => {
            info!(
                "Created {} bill {} in workspace {} with {} items",
                bill.payment_type,
                bill.id,
                bill.workspace,
                bill.items.len()
            );
            Ok(bill)
        }
        Err(e) => {
            if let Some(url) = e_slip {
                delete_all(store, &[url]);
            }
            Err(e.into())
        }
    }
}

/// Submit one evidence file for the share of `payer` on each of the given items.
///
/// Each item is handled on its own: a failure is reported in the outcome of that
/// item and does not stop the others. The payer pays their own share straight
/// away when they own the workspace.
///
/// On round bills every item is paid for the round that was current when the
/// request started; items left over after that round closes fail with
/// `RoundNotActionable`.
#[allow(clippy::too_many_arguments)]
pub async fn handle_pay<D: Database, E: EvidenceStore>(
    bill_id: BillId,
    payer: UserId,
    items: &[ItemId],
    evidence: &Evidence,
    database: &Arc<Mutex<D>>,
    store: &E,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<PaymentReport, SettlementError> {
    if items.is_empty() {
        return Err(SettlementError::validation("no items to pay"));
    }

    let bill = load_bill(bill_id, database).await?;
    let owner = validate_workspace_exists(bill.workspace, database).await?;
    let is_self_pay = owner == payer;
    let round = bill.current_round().filter(|_| bill.is_round());

    let mut outcomes = Vec::with_capacity(items.len());
    let mut replaced = vec![];
    for &item in items {
        let kind = EvidenceKind::PaymentSubmit {
            bill: bill_id,
            item,
            user: payer,
            round,
        };
        let url = match upload(store, kind, evidence, payer, now) {
            Ok(url) => url,
            Err(e) => {
                outcomes.push(EntryOutcome::failure(item, payer, round, &e));
                continue;
            }
        };

        let submitted = commit_with_retries(bill_id, database, max_retries, |bill, ledger| {
            ensure_current_round(bill, round)?;
            let submission = submit_payment(bill, item, payer, &url, is_self_pay, ledger, now)?;
            let transactions = submission.transaction.clone().into_iter().collect();
            Ok((submission, transactions))
        })
        .await;

        match submitted {
            Ok((
                _,
                Submission {
                    status,
                    replaced_slip,
                    ..
                },
            )) => {
                if status == ShareStatus::Paid {
                    info!(
                        "Bill {bill_id}: user {payer} paid item {item} round {round:?} themselves"
                    );
                } else {
                    debug!("Bill {bill_id}: user {payer} submitted evidence for item {item}");
                }
                replaced.extend(replaced_slip);
                outcomes.push(EntryOutcome::success(item, payer, round, status));
            }
            Err(e) => {
                debug!("Bill {bill_id}: payment of item {item} by {payer} failed: {e}");
                delete_all(store, &[url]);
                outcomes.push(EntryOutcome::failure(item, payer, round, &e));
            }
        }
    }

    let cleanup = delete_all(store, &replaced);
    let bill = load_bill(bill_id, database).await?;

    Ok(PaymentReport {
        bill,
        items: outcomes,
        cleanup,
    })
}

/// Confirm the payments of several participants.
///
/// Every confirmation is committed on its own, together with its ledger
/// transaction, and reported in the outcome of that entry.
pub async fn handle_confirm<D: Database>(
    bill_id: BillId,
    confirmations: &[Confirmation],
    database: &Arc<Mutex<D>>,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<ConfirmReport, SettlementError> {
    if confirmations.is_empty() {
        return Err(SettlementError::validation("no payments to confirm"));
    }
    load_bill(bill_id, database).await?;

    let mut entries = Vec::with_capacity(confirmations.len());
    for confirmation in confirmations {
        let Confirmation { item, user, round } = *confirmation;

        let confirmed = commit_with_retries(bill_id, database, max_retries, |bill, ledger| {
            let transaction = confirm_payment(bill, item, user, round, ledger, now)?;
            let round = transaction.reference.round;
            Ok((round, vec![transaction]))
        })
        .await;

        match confirmed {
            Ok((bill, round)) => {
                info!(
                    "Bill {bill_id}: confirmed {user} on item {item} round {round:?}, bill {}",
                    bill.status
                );
                entries.push(EntryOutcome::success(item, user, round, ShareStatus::Paid));
            }
            Err(e) => {
                warn!("Bill {bill_id}: cannot confirm payment of user {user} for item {item}: {e}");
                entries.push(EntryOutcome::failure(item, user, round, &e));
            }
        }
    }

    let confirmed = entries.iter().filter(|e| e.is_success()).count();
    debug!(
        "Bill {bill_id}: {confirmed} of {} confirmations succeeded",
        entries.len()
    );

    let bill = load_bill(bill_id, database).await?;
    let summary = if bill.status == BillStatus::Paid {
        ALL_PAYMENTS_COMPLETED
    } else {
        SOME_PAYMENTS_PENDING
    };

    Ok(ConfirmReport {
        bill,
        entries,
        summary: summary.to_string(),
    })
}

/// Cancel a bill, then delete the evidence it referenced.
///
/// The canceled state is committed before any file is touched, so a failing
/// deletion only shows up in the manifest.
pub async fn handle_cancel<D: Database, E: EvidenceStore>(
    bill_id: BillId,
    actor: UserId,
    database: &Arc<Mutex<D>>,
    store: &E,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<CleanupReport, SettlementError> {
    let (bill, slips) = commit_with_retries(bill_id, database, max_retries, |bill, _| {
        let slips = cancel_bill(bill, actor, now)?;
        Ok((slips, vec![]))
    })
    .await?;

    info!("Bill {bill_id} canceled by user {actor}");

    let cleanup = delete_all(store, &slips);
    if !cleanup.is_complete() {
        warn!(
            "Bill {bill_id}: {} evidence files could not be deleted",
            cleanup.failed.len()
        );
    }

    Ok(CleanupReport { bill, cleanup })
}

/// Change the installment schedule of a round bill. The slips of rounds that
/// were dropped are deleted afterwards.
pub async fn handle_update_round<D: Database, E: EvidenceStore>(
    bill_id: BillId,
    patch: &RoundSchedulePatch,
    database: &Arc<Mutex<D>>,
    store: &E,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<CleanupReport, SettlementError> {
    let (bill, dropped) = commit_with_retries(bill_id, database, max_retries, |bill, _| {
        let dropped = update_round_schedule(bill, patch, now)?;
        Ok((dropped, vec![]))
    })
    .await?;

    if let Some(details) = &bill.round_details {
        info!(
            "Bill {bill_id}: schedule is now round {} of {}",
            details.current_round, details.total_period
        );
    }

    let cleanup = delete_all(store, &dropped);
    Ok(CleanupReport { bill, cleanup })
}

pub async fn handle_update_bill<D: Database>(
    bill_id: BillId,
    patch: &BillPatch,
    database: &Arc<Mutex<D>>,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<Bill, SettlementError> {
    let (bill, ()) = commit_with_retries(bill_id, database, max_retries, |bill, _| {
        apply_bill_patch(bill, patch, now)?;
        Ok(((), vec![]))
    })
    .await?;

    debug!("Bill {bill_id} updated");
    Ok(bill)
}

/// Delete a bill and every evidence file it references.
///
/// Files are deleted first and best-effort; the bill is deleted whatever their
/// outcome. Ledger transactions referencing the bill are kept.
pub async fn handle_delete_bill<D: Database, E: EvidenceStore>(
    bill_id: BillId,
    database: &Arc<Mutex<D>>,
    store: &E,
) -> Result<CleanupManifest, SettlementError> {
    let bill = load_bill(bill_id, database).await?;

    let cleanup = delete_all(store, &bill.evidence_urls());
    if !database.lock().await.delete_bill(bill_id)? {
        return Err(SettlementError::not_found("bill", bill_id));
    }

    info!(
        "Deleted bill {bill_id}, {} evidence files deleted, {} failed",
        cleanup.deleted.len(),
        cleanup.failed.len()
    );
    Ok(cleanup)
}

pub async fn handle_get_bill<D: Database>(
    bill_id: BillId,
    database: &Arc<Mutex<D>>,
) -> Result<Bill, SettlementError> {
    load_bill(bill_id, database).await
}

pub async fn handle_bill_transactions<D: Database>(
    bill_id: BillId,
    database: &Arc<Mutex<D>>,
) -> Result<Vec<Transaction>, SettlementError> {
    Ok(database.lock().await.bill_transactions(bill_id)?)
}

pub async fn handle_accumulated_pending<D: Database>(
    bill_id: BillId,
    user: UserId,
    database: &Arc<Mutex<D>>,
) -> Result<Amount, SettlementError> {
    let bill = load_bill(bill_id, database).await?;
    bill.accumulated_pending(user).ok_or_else(|| {
        SettlementError::validation(format!(
            "the pending amount of user {user} on bill {bill_id} is too large"
        ))
    })
}

async fn load_bill<D: Database>(
    bill_id: BillId,
    database: &Arc<Mutex<D>>,
) -> Result<Bill, SettlementError> {
    database
        .lock()
        .await
        .get_bill(bill_id)?
        .ok_or_else(|| SettlementError::not_found("bill", bill_id))
}

/// Run `operation` on a fresh copy of the bill and commit the result.
///
/// The database lock is released between the load and the commit, so the commit
/// can lose against a concurrent writer; in that case the whole cycle is run
/// again, at most `max_retries` times.
async fn commit_with_retries<D, T, F>(
    bill_id: BillId,
    database: &Arc<Mutex<D>>,
    max_retries: u32,
    mut operation: F,
) -> Result<(Bill, T), SettlementError>
where
    D: Database,
    F: FnMut(&mut Bill, &D) -> Result<(T, Vec<NewTransaction>), SettlementError>,
{
    let mut attempt = 0;
    loop {
        let (mut bill, value, transactions) = {
            let database = database.lock().await;
            let mut bill = database
                .get_bill(bill_id)?
                .ok_or_else(|| SettlementError::not_found("bill", bill_id))?;
            let (value, transactions) = operation(&mut bill, &*database)?;
            (bill, value, transactions)
        };

        let committed = database.lock().await.commit_bill(&bill, &transactions);
        match committed.map_err(SettlementError::from) {
            Ok(version) => {
                bill.version = version;
                return Ok((bill, value));
            }
            Err(e) if e.is_conflict() && attempt < max_retries => {
                attempt += 1;
                warn!("Bill {bill_id}: {e}, retrying ({attempt}/{max_retries})");
            }
            Err(e) => return Err(e),
        }
    }
}

fn upload<E: EvidenceStore>(
    store: &E,
    kind: EvidenceKind,
    evidence: &Evidence,
    user: UserId,
    now: DateTime<Utc>,
) -> Result<String, SettlementError> {
    if evidence.bytes.is_empty() {
        return Err(SettlementError::validation("the evidence file is empty"));
    }
    let path = evidence_path(kind, &evidence.file_name, now);
    let metadata = EvidenceMetadata::new(&evidence.file_name, user, now);
    Ok(store.store(&evidence.bytes, &path, &metadata)?)
}

/// Apply the creator's edits to a pending bill.
///
/// The shares of every edited item must still add up to its amount. Paid
/// shares keep their amount; in round mode the rounds that are not paid yet
/// follow the new share amount.
fn apply_bill_patch(
    bill: &mut Bill,
    patch: &BillPatch,
    now: DateTime<Utc>,
) -> Result<(), SettlementError> {
    if bill.status != BillStatus::Pending {
        return Err(SettlementError::BillNotPending(bill.status));
    }
    let is_round = bill.is_round();

    if let Some(note) = &patch.note {
        bill.note = note.trim().to_string();
    }

    for item_patch in &patch.items {
        let item = bill
            .item_mut(item_patch.id)
            .ok_or_else(|| SettlementError::not_found("item", item_patch.id))?;

        if let Some(description) = &item_patch.description {
            if description.trim().is_empty() {
                return Err(SettlementError::validation("every item needs a description"));
            }
            item.description = description.trim().to_string();
        }
        if let Some(amount) = item_patch.amount {
            item.amount = amount;
        }

        for share_patch in &item_patch.shares {
            let share = item
                .shared_with
                .iter_mut()
                .find(|s| s.user == share_patch.user)
                .ok_or_else(|| SettlementError::not_found("share of user", share_patch.user))?;

            if share.share_amount == share_patch.share_amount {
                continue;
            }
            if !is_round && share.status == ShareStatus::Paid {
                return Err(SettlementError::AlreadyPaid);
            }

            share.share_amount = share_patch.share_amount;
            for payment in &mut share.round_payments {
                if payment.status != ShareStatus::Paid {
                    payment.amount = share_patch.share_amount;
                }
            }
        }

        validate_item_shares(
            &item.description,
            item.amount,
            item.shared_with.iter().map(|s| (s.user, s.share_amount)),
        )?;
    }

    settle(bill);
    bill.updated_at = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::sqlite::SqliteDatabase;
    use crate::evidence::testing::MemoryEvidenceStore;
    use crate::error::DatabaseError;
    use crate::ledger::LedgerRecorder;
    use crate::types::fixtures::{date, normal_bill, ALICE, BOB};
    use crate::types::{
        ItemDraft, ItemPatch, RoundDetails, ShareDraft, SharePatch, TransactionReference, User,
    };

    struct Fixture {
        database: Arc<Mutex<SqliteDatabase>>,
        store: MemoryEvidenceStore,
        workspace: WorkspaceId,
        carol: UserId,
        alice: UserId,
        bob: UserId,
    }

    async fn make_fixture() -> Fixture {
        let database = Arc::new(Mutex::new(SqliteDatabase::in_memory().unwrap()));
        let carol = handle_register_user("carol", "123-456", &database)
            .await
            .unwrap();
        let alice = handle_register_user("alice", "111", &database)
            .await
            .unwrap();
        let bob = handle_register_user("bob", "222", &database).await.unwrap();
        let workspace = handle_create_workspace(carol, &database).await.unwrap();
        handle_add_members(workspace, &[alice, bob], &database)
            .await
            .unwrap();

        Fixture {
            database,
            store: MemoryEvidenceStore::default(),
            workspace,
            carol,
            alice,
            bob,
        }
    }

    fn slip(name: &str) -> Evidence {
        Evidence {
            file_name: format!("{name}.jpg"),
            bytes: name.as_bytes().to_vec(),
        }
    }

    fn make_draft(
        f: &Fixture,
        shares: &[(UserId, Amount)],
        rounds: Option<u32>,
    ) -> BillDraft {
        BillDraft {
            workspace: f.workspace,
            creator: f.carol,
            payment_type: if rounds.is_some() {
                PaymentType::Round
            } else {
                PaymentType::Normal
            },
            round_details: rounds.map(|total_period| RoundDetails {
                due_date: date(31),
                total_period,
                current_round: 1,
            }),
            items: vec![ItemDraft {
                description: "dinner".to_string(),
                amount: shares.iter().map(|(_, a)| a).sum(),
                shared_with: shares
                    .iter()
                    .map(|&(user, share_amount)| ShareDraft { user, share_amount })
                    .collect(),
            }],
            note: "friday".to_string(),
        }
    }

    async fn pay(f: &Fixture, bill: &Bill, user: UserId, day: u32) -> PaymentReport {
        handle_pay(
            bill.id,
            user,
            &[bill.items[0].id],
            &slip(&format!("{user}-{day}")),
            &f.database,
            &f.store,
            3,
            date(day),
        )
        .await
        .unwrap()
    }

    async fn confirm(f: &Fixture, bill: &Bill, user: UserId, day: u32) -> ConfirmReport {
        let confirmation = Confirmation {
            item: bill.items[0].id,
            user,
            round: None,
        };
        handle_confirm(bill.id, &[confirmation], &f.database, 3, date(day))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_normal_bill_end_to_end() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.alice, 60), (f.bob, 40)], None),
            None,
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();

        let report = pay(&f, &bill, f.alice, 2).await;
        assert!(report.items[0].is_success());
        assert_eq!(report.items[0].status, Some(ShareStatus::AwaitingConfirmation));

        let report = confirm(&f, &bill, f.alice, 3).await;
        assert!(report.entries[0].is_success());
        assert_eq!(report.bill.status, BillStatus::Pending);
        assert_eq!(report.summary, SOME_PAYMENTS_PENDING);

        pay(&f, &bill, f.bob, 4).await;
        let report = confirm(&f, &bill, f.bob, 5).await;
        assert_eq!(report.bill.status, BillStatus::Paid);
        assert_eq!(report.summary, ALL_PAYMENTS_COMPLETED);

        let transactions = handle_bill_transactions(bill.id, &f.database)
            .await
            .unwrap();
        let amounts: Vec<_> = transactions.iter().map(|t| t.amount).collect();
        assert_eq!(amounts, vec![60, 40]);
        assert!(transactions.iter().all(|t| t.user == f.carol));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_bill_end_to_end() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.alice, 50)], Some(2)),
            None,
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();
        let rounds = &bill.items[0].shared_with[0].round_payments;
        assert_eq!(rounds.len(), 2);
        assert!(rounds.iter().all(|p| p.status == ShareStatus::Pending));
        assert_eq!(
            handle_accumulated_pending(bill.id, f.alice, &f.database)
                .await
                .unwrap(),
            100
        );

        pay(&f, &bill, f.alice, 2).await;
        let report = confirm(&f, &bill, f.alice, 3).await;
        assert_eq!(report.entries[0].round, Some(1));
        assert_eq!(report.bill.current_round(), Some(2));
        assert_eq!(report.bill.status, BillStatus::Pending);

        pay(&f, &bill, f.alice, 4).await;
        let report = confirm(&f, &bill, f.alice, 5).await;
        assert_eq!(report.entries[0].round, Some(2));
        assert_eq!(report.bill.status, BillStatus::Paid);

        let transactions = handle_bill_transactions(bill.id, &f.database)
            .await
            .unwrap();
        let recorded: Vec<_> = transactions
            .iter()
            .map(|t| (t.reference.round, t.amount))
            .collect();
        assert_eq!(recorded, vec![(Some(1), 50), (Some(2), 50)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_confirming_twice_records_one_transaction() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.alice, 60), (f.bob, 40)], None),
            None,
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();
        pay(&f, &bill, f.alice, 2).await;
        confirm(&f, &bill, f.alice, 3).await;
        let before = handle_get_bill(bill.id, &f.database).await.unwrap();

        let report = confirm(&f, &bill, f.alice, 4).await;

        let error = report.entries[0].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::DuplicateTransaction);
        assert_eq!(report.bill.items, before.items);
        assert_eq!(report.bill.status, before.status);
        assert_eq!(report.bill.version, before.version);
        let transactions = handle_bill_transactions(bill.id, &f.database)
            .await
            .unwrap();
        assert_eq!(transactions.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_owner_pays_own_share() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.carol, 30), (f.alice, 70)], None),
            None,
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();

        let report = pay(&f, &bill, f.carol, 2).await;

        assert_eq!(report.items[0].status, Some(ShareStatus::Paid));
        assert_eq!(report.bill.status, BillStatus::Pending);
        let transactions = handle_bill_transactions(bill.id, &f.database)
            .await
            .unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].amount, 30);
        assert_eq!(transactions[0].reference.user, f.carol);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bulk_payment_reports_each_item() {
        let f = make_fixture().await;
        let mut draft = make_draft(&f, &[(f.alice, 60)], None);
        draft.items.push(ItemDraft {
            description: "taxi".to_string(),
            amount: 20,
            shared_with: vec![ShareDraft {
                user: f.bob,
                share_amount: 20,
            }],
        });
        let bill = handle_create_bill(draft, None, &f.database, &f.store, date(1))
            .await
            .unwrap();
        let items = [bill.items[0].id, bill.items[1].id, 999];

        let report = handle_pay(
            bill.id,
            f.alice,
            &items,
            &slip("alice"),
            &f.database,
            &f.store,
            3,
            date(2),
        )
        .await
        .unwrap();

        assert!(report.items[0].is_success());
        assert_eq!(
            report.items[1].error.as_ref().unwrap().kind,
            ErrorKind::NotFound
        );
        assert_eq!(
            report.items[2].error.as_ref().unwrap().kind,
            ErrorKind::NotFound
        );
        // Uploads of the failed items are rolled back.
        assert_eq!(f.store.len(), 1);
        assert_eq!(
            report.bill.items[0].shared_with[0].status,
            ShareStatus::AwaitingConfirmation
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bulk_payment_stays_on_the_starting_round() {
        let f = make_fixture().await;
        let mut draft = make_draft(&f, &[(f.carol, 30)], Some(2));
        draft.items.push(ItemDraft {
            description: "taxi".to_string(),
            amount: 20,
            shared_with: vec![ShareDraft {
                user: f.carol,
                share_amount: 20,
            }],
        });
        let bill = handle_create_bill(draft, None, &f.database, &f.store, date(1))
            .await
            .unwrap();
        let (dinner, taxi) = (bill.items[0].id, bill.items[1].id);

        let report = handle_pay(
            bill.id,
            f.carol,
            &[taxi],
            &slip("taxi"),
            &f.database,
            &f.store,
            3,
            date(2),
        )
        .await
        .unwrap();
        assert_eq!(report.items[0].status, Some(ShareStatus::Paid));

        // Paying the dinner closes round 1, so the taxi must not slip into round 2.
        let report = handle_pay(
            bill.id,
            f.carol,
            &[dinner, taxi],
            &slip("both"),
            &f.database,
            &f.store,
            3,
            date(3),
        )
        .await
        .unwrap();

        assert_eq!(report.items[0].round, Some(1));
        assert_eq!(report.items[0].status, Some(ShareStatus::Paid));
        assert_eq!(report.items[1].round, Some(1));
        assert_eq!(
            report.items[1].error.as_ref().unwrap().kind,
            ErrorKind::InvalidState
        );
        assert_eq!(report.bill.current_round(), Some(2));

        let taxi_round_2 = report.bill.items[1].shared_with[0]
            .round_payment(2)
            .unwrap();
        assert_eq!(taxi_round_2.status, ShareStatus::Pending);
        assert!(taxi_round_2.e_slip.is_none());

        let transactions = handle_bill_transactions(bill.id, &f.database)
            .await
            .unwrap();
        let references: Vec<_> = transactions
            .iter()
            .map(|t| (t.reference.item, t.reference.round))
            .collect();
        assert_eq!(references, vec![(taxi, Some(1)), (dinner, Some(1))]);
        // The upload of the rejected item is rolled back.
        assert_eq!(f.store.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resubmission_deletes_replaced_slip() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.alice, 60)], None),
            None,
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();

        let first = pay(&f, &bill, f.alice, 2).await;
        let first_slip = first.bill.items[0].shared_with[0].e_slip.clone().unwrap();
        let second = pay(&f, &bill, f.alice, 3).await;

        assert!(second.cleanup.is_complete());
        assert_eq!(second.cleanup.deleted, vec![first_slip.clone()]);
        assert!(!f.store.contains(&first_slip));
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_upload_is_reported() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.alice, 60)], None),
            None,
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();
        f.store.fail_uploads(true);

        let report = pay(&f, &bill, f.alice, 2).await;

        assert_eq!(
            report.items[0].error.as_ref().unwrap().kind,
            ErrorKind::StorageFailure
        );
        assert_eq!(report.bill.items[0].shared_with[0].status, ShareStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_bill_validation() {
        let f = make_fixture().await;
        let stranger = handle_register_user("dave", "333", &f.database)
            .await
            .unwrap();

        let result = handle_create_bill(
            make_draft(&f, &[(f.alice, 60), (stranger, 40)], None),
            Some(&slip("main")),
            &f.database,
            &f.store,
            date(1),
        )
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);

        let mut draft = make_draft(&f, &[(f.alice, 60)], None);
        draft.items[0].amount = 70;
        let result = handle_create_bill(draft, None, &f.database, &f.store, date(1)).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);

        assert_eq!(f.store.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_bill_aborts_on_failed_upload() {
        let f = make_fixture().await;
        f.store.fail_uploads(true);

        let result = handle_create_bill(
            make_draft(&f, &[(f.alice, 60)], None),
            Some(&slip("main")),
            &f.database,
            &f.store,
            date(1),
        )
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::StorageFailure);
        assert!(handle_get_bill(1, &f.database).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_reports_failed_cleanup() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.alice, 60), (f.bob, 40)], None),
            Some(&slip("main")),
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();
        pay(&f, &bill, f.alice, 2).await;
        pay(&f, &bill, f.bob, 3).await;
        let bill = handle_get_bill(bill.id, &f.database).await.unwrap();
        let urls = bill.evidence_urls();
        assert_eq!(urls.len(), 3);
        f.store.fail_delete_of(&urls[1]);

        let report = handle_cancel(bill.id, f.carol, &f.database, &f.store, 3, date(4))
            .await
            .unwrap();

        assert_eq!(report.bill.status, BillStatus::Canceled);
        assert_eq!(report.bill.canceled_by, Some(f.carol));
        assert_eq!(report.cleanup.deleted.len(), 2);
        assert_eq!(report.cleanup.failed.len(), 1);
        assert_eq!(report.cleanup.failed[0].url, urls[1]);
        assert!(report.bill.evidence_urls().is_empty());

        let result = handle_cancel(bill.id, f.carol, &f.database, &f.store, 3, date(5)).await;
        assert!(matches!(result, Err(SettlementError::AlreadyCanceled)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_round_rejects_shrinking_past_paid_rounds() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.alice, 50)], Some(4)),
            None,
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();
        for day in [2, 4] {
            pay(&f, &bill, f.alice, day).await;
            confirm(&f, &bill, f.alice, day + 1).await;
        }

        let patch = RoundSchedulePatch {
            total_period: Some(1),
            ..Default::default()
        };
        let result = handle_update_round(bill.id, &patch, &f.database, &f.store, 3, date(6)).await;
        assert_eq!(
            result.unwrap_err().kind(),
            ErrorKind::CannotShrinkPastPaidRounds
        );

        let patch = RoundSchedulePatch {
            total_period: Some(3),
            ..Default::default()
        };
        let report = handle_update_round(bill.id, &patch, &f.database, &f.store, 3, date(6))
            .await
            .unwrap();
        let details = report.bill.round_details.unwrap();
        assert_eq!((details.current_round, details.total_period), (3, 3));
        assert_eq!(report.bill.items[0].shared_with[0].round_payments.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_round_on_normal_bill() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.alice, 50)], None),
            None,
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();

        let result = handle_update_round(
            bill.id,
            &RoundSchedulePatch::default(),
            &f.database,
            &f.store,
            3,
            date(2),
        )
        .await;
        assert!(matches!(result, Err(SettlementError::NotRoundBill)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_bill_fields() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.alice, 50)], Some(2)),
            None,
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();
        let item = bill.items[0].id;

        let mut patch = BillPatch {
            note: Some("saturday".to_string()),
            items: vec![ItemPatch {
                id: item,
                description: None,
                amount: Some(80),
                shares: vec![SharePatch {
                    user: f.alice,
                    share_amount: 70,
                }],
            }],
        };
        let result = handle_update_bill(bill.id, &patch, &f.database, 3, date(2)).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);

        patch.items[0].shares[0].share_amount = 80;
        let updated = handle_update_bill(bill.id, &patch, &f.database, 3, date(2))
            .await
            .unwrap();
        assert_eq!(updated.note, "saturday");
        assert_eq!(updated.items[0].amount, 80);
        let amounts: Vec<_> = updated.items[0].shared_with[0]
            .round_payments
            .iter()
            .map(|p| p.amount)
            .collect();
        assert_eq!(amounts, vec![80, 80]);
        assert_eq!(
            handle_accumulated_pending(bill.id, f.alice, &f.database)
                .await
                .unwrap(),
            160
        );
    }

    #[test]
    fn test_patch_keeps_paid_rounds() {
        let mut bill = crate::types::fixtures::round_bill(&[(ALICE, 50)], 2);
        let share = &mut bill.items[0].shared_with[0];
        share.round_payment_mut(1).unwrap().status = ShareStatus::Paid;
        let patch = BillPatch {
            note: None,
            items: vec![ItemPatch {
                id: 20,
                description: Some("rent".to_string()),
                amount: Some(60),
                shares: vec![SharePatch {
                    user: ALICE,
                    share_amount: 60,
                }],
            }],
        };

        apply_bill_patch(&mut bill, &patch, date(3)).unwrap();

        let amounts: Vec<_> = bill.items[0].shared_with[0]
            .round_payments
            .iter()
            .map(|p| p.amount)
            .collect();
        assert_eq!(amounts, vec![50, 60]);
        assert_eq!(bill.items[0].description, "rent");
    }

    #[test]
    fn test_patch_rejects_terminal_and_paid() {
        let mut bill = normal_bill(&[(ALICE, 60), (BOB, 40)]);
        bill.items[0].shared_with[0].status = ShareStatus::Paid;
        let patch = BillPatch {
            note: None,
            items: vec![ItemPatch {
                id: 20,
                description: None,
                amount: None,
                shares: vec![
                    SharePatch {
                        user: ALICE,
                        share_amount: 50,
                    },
                    SharePatch {
                        user: BOB,
                        share_amount: 50,
                    },
                ],
            }],
        };
        let result = apply_bill_patch(&mut bill, &patch, date(3));
        assert!(matches!(result, Err(SettlementError::AlreadyPaid)));

        let mut bill = normal_bill(&[(ALICE, 60)]);
        bill.status = BillStatus::Canceled;
        let result = apply_bill_patch(&mut bill, &BillPatch::default(), date(3));
        assert!(matches!(
            result,
            Err(SettlementError::BillNotPending(BillStatus::Canceled))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_bill_keeps_ledger_and_reports_cleanup() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.alice, 60), (f.bob, 40)], None),
            Some(&slip("main")),
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();
        pay(&f, &bill, f.alice, 2).await;
        confirm(&f, &bill, f.alice, 3).await;
        let main = bill.e_slip.clone().unwrap();
        f.store.fail_delete_of(&main);

        let cleanup = handle_delete_bill(bill.id, &f.database, &f.store)
            .await
            .unwrap();

        assert_eq!(cleanup.deleted.len(), 1);
        assert_eq!(cleanup.failed.len(), 1);
        assert_eq!(cleanup.failed[0].url, main);
        assert!(matches!(
            handle_get_bill(bill.id, &f.database).await,
            Err(SettlementError::NotFound(_))
        ));
        let database = f.database.lock().await;
        assert_eq!(database.bill_transactions(bill.id).unwrap().len(), 1);
    }

    /// Reports a version conflict on the first `conflicts` commits.
    struct ConflictingDatabase {
        inner: SqliteDatabase,
        conflicts: u32,
    }

    impl LedgerRecorder for ConflictingDatabase {
        fn transaction_exists(
            &self,
            reference: &TransactionReference,
        ) -> Result<bool, DatabaseError> {
            self.inner.transaction_exists(reference)
        }

        fn append_transaction(
            &mut self,
            transaction: NewTransaction,
        ) -> Result<Transaction, DatabaseError> {
            self.inner.append_transaction(transaction)
        }

        fn bill_transactions(&self, bill_id: BillId) -> Result<Vec<Transaction>, DatabaseError> {
            self.inner.bill_transactions(bill_id)
        }
    }

    impl Database for ConflictingDatabase {
        fn register_user(
            &mut self,
            name: &str,
            account_number: &str,
        ) -> Result<UserId, DatabaseError> {
            self.inner.register_user(name, account_number)
        }

        fn get_user(&self, user: UserId) -> Result<Option<User>, DatabaseError> {
            self.inner.get_user(user)
        }

        fn create_workspace(&mut self, owner: UserId) -> Result<WorkspaceId, DatabaseError> {
            self.inner.create_workspace(owner)
        }

        fn add_workspace_members_if_not_exist(
            &mut self,
            workspace: WorkspaceId,
            members: &[UserId],
        ) -> Result<(), DatabaseError> {
            self.inner.add_workspace_members_if_not_exist(workspace, members)
        }

        fn get_workspace_members(
            &self,
            workspace: WorkspaceId,
        ) -> Result<Vec<UserId>, DatabaseError> {
            self.inner.get_workspace_members(workspace)
        }

        fn get_workspace_owner(
            &self,
            workspace: WorkspaceId,
        ) -> Result<Option<UserId>, DatabaseError> {
            self.inner.get_workspace_owner(workspace)
        }

        fn save_bill(
            &mut self,
            bill: NewBill,
            created_at: DateTime<Utc>,
        ) -> Result<Bill, DatabaseError> {
            self.inner.save_bill(bill, created_at)
        }

        fn get_bill(&self, bill_id: BillId) -> Result<Option<Bill>, DatabaseError> {
            self.inner.get_bill(bill_id)
        }

        fn commit_bill(
            &mut self,
            bill: &Bill,
            transactions: &[NewTransaction],
        ) -> Result<i64, DatabaseError> {
            if self.conflicts > 0 {
                self.conflicts -= 1;
                return Err(DatabaseError::concurrency("bill was modified"));
            }
            self.inner.commit_bill(bill, transactions)
        }

        fn delete_bill(&mut self, bill_id: BillId) -> Result<bool, DatabaseError> {
            self.inner.delete_bill(bill_id)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_edits_retry_on_conflict() {
        let database = Arc::new(Mutex::new(ConflictingDatabase {
            inner: SqliteDatabase::in_memory().unwrap(),
            conflicts: 0,
        }));
        let store = MemoryEvidenceStore::default();
        let carol = handle_register_user("carol", "123", &database)
            .await
            .unwrap();
        let alice = handle_register_user("alice", "111", &database)
            .await
            .unwrap();
        let workspace = handle_create_workspace(carol, &database).await.unwrap();
        handle_add_members(workspace, &[alice], &database)
            .await
            .unwrap();
        let draft = BillDraft {
            workspace,
            creator: carol,
            payment_type: PaymentType::Normal,
            round_details: None,
            items: vec![ItemDraft {
                description: "dinner".to_string(),
                amount: 60,
                shared_with: vec![ShareDraft {
                    user: alice,
                    share_amount: 60,
                }],
            }],
            note: String::new(),
        };
        let bill = handle_create_bill(draft, None, &database, &store, date(1))
            .await
            .unwrap();

        let patch = BillPatch {
            note: Some("saturday".to_string()),
            ..BillPatch::default()
        };
        database.lock().await.conflicts = 1;
        let result = handle_update_bill(bill.id, &patch, &database, 0, date(2)).await;
        assert!(result.unwrap_err().is_conflict());

        database.lock().await.conflicts = 1;
        let updated = handle_update_bill(bill.id, &patch, &database, 1, date(2))
            .await
            .unwrap();
        assert_eq!(updated.note, "saturday");

        database.lock().await.conflicts = 2;
        let report = handle_cancel(bill.id, carol, &database, &store, 3, date(3))
            .await
            .unwrap();
        assert_eq!(report.bill.status, BillStatus::Canceled);
        assert_eq!(database.lock().await.conflicts, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_commit_is_retried() {
        let f = make_fixture().await;
        let bill = handle_create_bill(
            make_draft(&f, &[(f.alice, 60)], None),
            None,
            &f.database,
            &f.store,
            date(1),
        )
        .await
        .unwrap();

        // A bill whose version moved on behaves like one overtaken by another writer.
        let mut calls = 0;
        let (saved, seen) = commit_with_retries(bill.id, &f.database, 1, |bill, _| {
            calls += 1;
            if calls == 1 {
                bill.version += 1;
            }
            bill.note = format!("attempt {calls}");
            Ok((calls, vec![]))
        })
        .await
        .unwrap();
        assert_eq!(seen, 2);
        assert_eq!(saved.note, "attempt 2");
        assert_eq!(saved.version, 1);

        let result = commit_with_retries(bill.id, &f.database, 0, |bill, _| {
            bill.version += 1;
            Ok(((), vec![]))
        })
        .await;
        let e = result.unwrap_err();
        assert!(e.is_conflict());
        assert_eq!(
            handle_get_bill(bill.id, &f.database).await.unwrap().note,
            "attempt 2"
        );
    }
}
