//! Financial ledger records produced by settlement.
//!
//! A transaction is written only when a share, or one round of a share, becomes
//! paid. The reference tuple `(bill, item, user, round)` identifies it: at most
//! one transaction may exist per tuple, and the storage layer enforces this with
//! a unique index so that concurrent confirmations cannot double-credit.

use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::types::{
    Bill, BillId, ItemId, NewTransaction, Share, Transaction, TransactionKind,
    TransactionReference,
};

pub const BILL_PAYMENT_CATEGORY: &str = "Bill Payment";

pub trait LedgerRecorder {
    /// Check whether a transaction with exactly this reference was recorded.
    fn transaction_exists(&self, reference: &TransactionReference) -> Result<bool, DatabaseError>;

    /// Append a transaction on its own.
    ///
    /// Settlement does not go through here:
    /// [`commit_bill`](crate::database::Database::commit_bill) writes the
    /// transactions together with the bill that produced them.
    ///
    /// If a transaction with the same reference exists,
    /// [`DatabaseError::DuplicateTransaction`] is returned and nothing is written.
    fn append_transaction(&mut self, transaction: NewTransaction)
        -> Result<Transaction, DatabaseError>;

    /// Get all transactions referencing the given bill, oldest first.
    fn bill_transactions(&self, bill_id: BillId) -> Result<Vec<Transaction>, DatabaseError>;
}

/// Build the income record for a share (or one of its rounds) that was just paid.
///
/// The creator of the bill is the receiver. In round mode the amount is the one of
/// the round entry, otherwise the share amount.
pub fn settlement_transaction(
    bill: &Bill,
    item_id: ItemId,
    share: &Share,
    round: Option<u32>,
    now: DateTime<Utc>,
) -> NewTransaction {
    let round_payment = round.and_then(|r| share.round_payment(r));
    let amount = round_payment.map_or(share.share_amount, |p| p.amount);
    let slip_image = round_payment
        .and_then(|p| p.e_slip.clone())
        .or_else(|| share.e_slip.clone())
        .unwrap_or_default();

    NewTransaction {
        workspace: bill.workspace,
        user: bill.creator.user,
        kind: TransactionKind::Income,
        amount,
        category: BILL_PAYMENT_CATEGORY.to_string(),
        description: format!("Bill payment received from {}", share.name),
        slip_image,
        transaction_date: now,
        reference: TransactionReference::bill(bill.id, item_id, share.user, round),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::*;

    #[test]
    fn test_settlement_transaction_normal() {
        let mut bill = normal_bill(&[(ALICE, 60), (BOB, 40)]);
        bill.items[0].shared_with[1].e_slip = Some("slip-b".to_string());
        let share = &bill.items[0].shared_with[1];

        let t = settlement_transaction(&bill, 20, share, None, date(2));

        assert_eq!(t.amount, 40);
        assert_eq!(t.user, CREATOR);
        assert_eq!(t.slip_image, "slip-b");
        assert_eq!(t.description, "Bill payment received from user3");
        assert_eq!(t.reference, TransactionReference::bill(10, 20, BOB, None));
    }

    #[test]
    fn test_settlement_transaction_uses_round_entry() {
        let mut bill = round_bill(&[(ALICE, 50)], 2);
        let payment = bill.items[0].shared_with[0].round_payment_mut(2).unwrap();
        payment.amount = 45;
        payment.e_slip = Some("round-2".to_string());
        let share = &bill.items[0].shared_with[0];

        let t = settlement_transaction(&bill, 20, share, Some(2), date(2));

        assert_eq!(t.amount, 45);
        assert_eq!(t.slip_image, "round-2");
        assert_eq!(t.reference.round, Some(2));
        assert_eq!(t.category, BILL_PAYMENT_CATEGORY);
    }
}
