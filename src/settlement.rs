//! The core of the settlement logic: the state machine that moves shares from
//! `pending` to `paid` and derives the status of the whole bill.
//!
//! Each (item, participant) pair goes through
//! `pending -> awaiting_confirmation -> paid`; round bills run the same machine
//! once per round, but only the entry of the current round can be acted upon.
//! `canceled` is only reached by canceling the whole bill.
//!
//! These functions mutate a [`Bill`] loaded in memory. They never do I/O except
//! for the ledger lookup that guards against double-crediting; persisting the
//! result (and deleting evidence) is up to the caller.

use chrono::{DateTime, Utc};
use log::debug;

use crate::error::SettlementError;
use crate::ledger::{settlement_transaction, LedgerRecorder};
use crate::types::{
    Bill, BillStatus, ItemId, NewTransaction, RoundPayment, RoundSchedulePatch, Share,
    ShareStatus, TransactionReference, UserId,
};

/// What happened when a participant submitted payment evidence.
#[derive(Debug)]
pub struct Submission {
    pub status: ShareStatus,
    /// The slip of a previous submission that was replaced by this one.
    pub replaced_slip: Option<String>,
    /// Only present for self-payments, which are confirmed on submission.
    pub transaction: Option<NewTransaction>,
}

/// Attach payment evidence to the share of `user` on the given item.
///
/// Regular submissions move the share (or its current round) to
/// `awaiting_confirmation`. When `is_self_pay` is set the payer owns the
/// workspace, so the entry is marked `paid` straight away and the resulting
/// transaction is returned for recording.
pub fn submit_payment<L: LedgerRecorder>(
    bill: &mut Bill,
    item_id: ItemId,
    user: UserId,
    evidence_url: &str,
    is_self_pay: bool,
    ledger: &L,
    now: DateTime<Utc>,
) -> Result<Submission, SettlementError> {
    ensure_pending(bill)?;
    let round = bill.current_round().filter(|_| bill.is_round());

    if entry_status(find_share(bill, item_id, user)?, round)? == ShareStatus::Paid {
        return Err(SettlementError::AlreadyPaid);
    }

    if is_self_pay {
        let reference = TransactionReference::bill(bill.id, item_id, user, round);
        if ledger.transaction_exists(&reference)? {
            return Err(SettlementError::DuplicateTransaction(reference));
        }
    }

    let status = if is_self_pay {
        ShareStatus::Paid
    } else {
        ShareStatus::AwaitingConfirmation
    };

    let share = find_share_mut(bill, item_id, user)?;
    let replaced_slip = {
        let mut entry = payment_entry_mut(share, round)?;
        let previous = entry.e_slip.replace(evidence_url.to_string());
        *entry.status = status;
        if is_self_pay {
            entry.mark_paid(now);
        }
        previous.filter(|p| p != evidence_url)
    };

    debug!(
        "Bill {}: item {item_id} user {user} round {:?} is now {status}",
        bill.id, round
    );

    let transaction = if is_self_pay {
        let share = find_share(bill, item_id, user)?;
        let transaction = settlement_transaction(bill, item_id, share, round, now);
        settle(bill);
        Some(transaction)
    } else {
        None
    };
    bill.updated_at = now;

    Ok(Submission {
        status,
        replaced_slip,
        transaction,
    })
}

/// Confirm the payment of `user` on the given item and return the transaction
/// that must be recorded for it.
///
/// The ledger is checked first: if a transaction for the same reference exists
/// the confirmation is rejected and the bill is left untouched. For round bills
/// `round` defaults to the current round and must be equal to it.
pub fn confirm_payment<L: LedgerRecorder>(
    bill: &mut Bill,
    item_id: ItemId,
    user: UserId,
    round: Option<u32>,
    ledger: &L,
    now: DateTime<Utc>,
) -> Result<NewTransaction, SettlementError> {
    find_share(bill, item_id, user)?;

    let current = bill.current_round().filter(|_| bill.is_round());
    let round = match (current, round) {
        (None, Some(_)) => return Err(SettlementError::NotRoundBill),
        (None, None) => None,
        (Some(current), requested) => Some(requested.unwrap_or(current)),
    };

    let reference = TransactionReference::bill(bill.id, item_id, user, round);
    if ledger.transaction_exists(&reference)? {
        return Err(SettlementError::DuplicateTransaction(reference));
    }

    ensure_pending(bill)?;
    if let (Some(current), Some(requested)) = (current, round) {
        if requested != current {
            return Err(SettlementError::RoundNotActionable { requested, current });
        }
    }

    let share = find_share_mut(bill, item_id, user)?;
    {
        let mut entry = payment_entry_mut(share, round)?;
        if entry.e_slip.is_none() {
            return Err(SettlementError::MissingEvidence);
        }
        if *entry.status != ShareStatus::AwaitingConfirmation {
            return Err(SettlementError::NotAwaitingConfirmation);
        }
        *entry.status = ShareStatus::Paid;
        entry.mark_paid(now);
    }

    let share = find_share(bill, item_id, user)?;
    let transaction = settlement_transaction(bill, item_id, share, round, now);

    debug!(
        "Bill {}: confirmed item {item_id} user {user} round {:?}",
        bill.id, round
    );

    settle(bill);
    bill.updated_at = now;
    Ok(transaction)
}

/// Cancel a pending bill.
///
/// Every share and round entry becomes `canceled` and every slip field is
/// cleared. The slips that were referenced are returned so that the caller can
/// delete them once the canceled bill is persisted.
pub fn cancel_bill(
    bill: &mut Bill,
    actor: UserId,
    now: DateTime<Utc>,
) -> Result<Vec<String>, SettlementError> {
    match bill.status {
        BillStatus::Canceled => return Err(SettlementError::AlreadyCanceled),
        BillStatus::Paid => return Err(SettlementError::BillNotPending(BillStatus::Paid)),
        BillStatus::Pending => {}
    }

    let slips = bill.evidence_urls();

    bill.e_slip = None;
    for share in bill.shares_mut() {
        share.status = ShareStatus::Canceled;
        share.e_slip = None;
        for payment in &mut share.round_payments {
            payment.status = ShareStatus::Canceled;
            payment.e_slip = None;
        }
    }
    bill.status = BillStatus::Canceled;
    bill.canceled_at = Some(now);
    bill.canceled_by = Some(actor);
    bill.updated_at = now;

    debug!("Bill {} canceled by {actor}", bill.id);
    Ok(slips)
}

/// Change the installment schedule of a round bill.
///
/// When the number of rounds changes, the round entries of every share are
/// rebuilt: paid rounds are kept as they are, every other round starts over as
/// pending. The slips of entries that were thrown away are returned.
pub fn update_round_schedule(
    bill: &mut Bill,
    patch: &RoundSchedulePatch,
    now: DateTime<Utc>,
) -> Result<Vec<String>, SettlementError> {
    if !bill.is_round() {
        return Err(SettlementError::NotRoundBill);
    }
    ensure_pending(bill)?;
    let details = bill
        .round_details
        .clone()
        .ok_or(SettlementError::NotRoundBill)?;

    let total_period = patch.total_period.unwrap_or(details.total_period);
    if total_period == 0 {
        return Err(SettlementError::validation(
            "a round bill needs at least one round",
        ));
    }
    if let Some(highest_paid) = bill.highest_paid_round() {
        if total_period < highest_paid {
            return Err(SettlementError::CannotShrinkPastPaidRounds {
                requested: total_period,
                highest_paid,
            });
        }
    }

    let current_round = patch.current_round.unwrap_or(details.current_round);
    if current_round == 0 || current_round > total_period {
        return Err(SettlementError::RoundOutOfRange {
            round: current_round,
            total_period,
        });
    }

    let mut dropped = vec![];
    if total_period != details.total_period {
        for share in bill.shares_mut() {
            dropped.extend(rebuild_round_payments(share, total_period));
        }
    }

    let details = bill
        .round_details
        .as_mut()
        .ok_or(SettlementError::NotRoundBill)?;
    if let Some(due_date) = patch.due_date {
        details.due_date = due_date;
    }
    details.total_period = total_period;
    details.current_round = current_round;

    settle(bill);
    bill.updated_at = now;
    Ok(dropped)
}

/// Derive the bill status from its shares.
///
/// Round bills move on to the next round as long as the current one is fully
/// paid; the bill is paid once the last round (or, for normal bills, every
/// share) is. Bills that are not pending are left alone.
pub fn settle(bill: &mut Bill) {
    while bill.status == BillStatus::Pending && bill.all_shares_paid() {
        let is_round = bill.is_round();
        match bill.round_details.as_mut() {
            Some(details) if is_round && details.current_round < details.total_period => {
                details.current_round += 1;
                debug!("Bill {}: advancing to round {}", bill.id, details.current_round);
            }
            _ => {
                bill.status = BillStatus::Paid;
                debug!("Bill {} is paid", bill.id);
            }
        }
    }
}

/// Fail with `RoundNotActionable` if a round bill is no longer on `expected`.
///
/// Bulk operations read the round once and use it to pin every entry, so an
/// entry that advances the bill cannot move the following ones to a new round.
pub fn ensure_current_round(bill: &Bill, expected: Option<u32>) -> Result<(), SettlementError> {
    let current = bill.current_round().filter(|_| bill.is_round());
    match (current, expected) {
        (Some(current), Some(requested)) if current != requested => {
            Err(SettlementError::RoundNotActionable { requested, current })
        }
        _ => Ok(()),
    }
}

fn ensure_pending(bill: &Bill) -> Result<(), SettlementError> {
    match bill.status {
        BillStatus::Pending => Ok(()),
        status => Err(SettlementError::BillNotPending(status)),
    }
}

fn rebuild_round_payments(share: &mut Share, total_period: u32) -> Vec<String> {
    let old = std::mem::take(&mut share.round_payments);
    let (kept, dropped): (Vec<_>, Vec<_>) = old
        .into_iter()
        .partition(|p| p.status == ShareStatus::Paid && p.round <= total_period);

    share.round_payments = (1..=total_period)
        .map(|round| {
            kept.iter()
                .find(|p| p.round == round)
                .cloned()
                .unwrap_or_else(|| RoundPayment::pending(round, share.share_amount))
        })
        .collect();

    dropped.into_iter().filter_map(|p| p.e_slip).collect()
}

fn find_share(bill: &Bill, item_id: ItemId, user: UserId) -> Result<&Share, SettlementError> {
    bill.item(item_id)
        .ok_or_else(|| SettlementError::not_found("item", item_id))?
        .shared_with
        .iter()
        .find(|s| s.user == user)
        .ok_or_else(|| SettlementError::not_found("share of user", user))
}

fn find_share_mut(
    bill: &mut Bill,
    item_id: ItemId,
    user: UserId,
) -> Result<&mut Share, SettlementError> {
    bill.item_mut(item_id)
        .ok_or_else(|| SettlementError::not_found("item", item_id))?
        .shared_with
        .iter_mut()
        .find(|s| s.user == user)
        .ok_or_else(|| SettlementError::not_found("share of user", user))
}

/// Mutable view over either a share (normal bills) or one of its rounds.
struct EntryMut<'a> {
    status: &'a mut ShareStatus,
    e_slip: &'a mut Option<String>,
    paid_date: Option<&'a mut Option<DateTime<Utc>>>,
}

impl EntryMut<'_> {
    fn mark_paid(&mut self, now: DateTime<Utc>) {
        if let Some(paid_date) = self.paid_date.as_mut() {
            **paid_date = Some(now);
        }
    }
}

fn entry_status(share: &Share, round: Option<u32>) -> Result<ShareStatus, SettlementError> {
    match round {
        None => Ok(share.status),
        Some(round) => share
            .round_payment(round)
            .map(|p| p.status)
            .ok_or_else(|| SettlementError::not_found("round", round)),
    }
}

fn payment_entry_mut(
    share: &mut Share,
    round: Option<u32>,
) -> Result<EntryMut<'_>, SettlementError> {
    match round {
        None => Ok(EntryMut {
            status: &mut share.status,
            e_slip: &mut share.e_slip,
            paid_date: None,
        }),
        Some(round) => share
            .round_payment_mut(round)
            .map(|p| EntryMut {
                status: &mut p.status,
                e_slip: &mut p.e_slip,
                paid_date: Some(&mut p.paid_date),
            })
            .ok_or_else(|| SettlementError::not_found("round", round)),
    }
}
