//! Sanity checks on a bill submitted for creation.

use std::collections::HashSet;

use crate::error::SettlementError;
use crate::types::{Amount, BillDraft, ItemDraft, PaymentType, UserId};

/// Some sanity checks on the bill that was submitted.
///
/// List of checks:
/// - there is at least one item
/// - every item has a description, a positive amount and at least one share
/// - every share amount is positive
/// - the shares of an item sum up to the item amount
/// - a user appears at most once in the shares of an item
/// - round bills have round details with at least one round and a current
///   round inside the schedule; normal bills have none
pub fn validate_bill(bill: &BillDraft) -> Result<(), SettlementError> {
    if bill.items.is_empty() {
        return Err(SettlementError::validation("a bill needs at least one item"));
    }

    for item in &bill.items {
        validate_item(item)?;
    }

    validate_round_details(bill)
}

fn validate_item(item: &ItemDraft) -> Result<(), SettlementError> {
    if item.description.trim().is_empty() {
        return Err(SettlementError::validation("every item needs a description"));
    }
    if item.amount <= 0 {
        return Err(SettlementError::validation(format!(
            "the amount of `{}` must be positive",
            item.description
        )));
    }
    if item.shared_with.is_empty() {
        return Err(SettlementError::validation(format!(
            "`{}` is not shared with anybody",
            item.description
        )));
    }

    let mut users = HashSet::new();
    for share in &item.shared_with {
        if !users.insert(share.user) {
            return Err(SettlementError::validation(format!(
                "user {} appears more than once in `{}`",
                share.user, item.description
            )));
        }
    }

    validate_item_shares(
        &item.description,
        item.amount,
        item.shared_with.iter().map(|s| (s.user, s.share_amount)),
    )
}

/// Check that the shares of an item are positive and add up to its amount.
pub fn validate_item_shares<I>(
    description: &str,
    amount: Amount,
    shares: I,
) -> Result<(), SettlementError>
where
    I: IntoIterator<Item = (UserId, Amount)>,
{
    let mut total: Amount = 0;
    for (user, share_amount) in shares {
        if share_amount <= 0 {
            return Err(SettlementError::validation(format!(
                "the share of user {user} in `{description}` must be positive"
            )));
        }
        total = total.checked_add(share_amount).ok_or_else(|| {
            SettlementError::validation(format!(
                "the shares of `{description}` exceed the largest supported amount"
            ))
        })?;
    }

    if total != amount {
        return Err(SettlementError::validation(format!(
            "the shares of `{description}` add up to {total} instead of {amount}"
        )));
    }
    Ok(())
}

fn validate_round_details(bill: &BillDraft) -> Result<(), SettlementError> {
    match (bill.payment_type, &bill.round_details) {
        (PaymentType::Normal, None) => Ok(()),
        (PaymentType::Normal, Some(_)) => Err(SettlementError::validation(
            "round details are only allowed on round bills",
        )),
        (PaymentType::Round, None) => Err(SettlementError::validation(
            "a round bill needs round details",
        )),
        (PaymentType::Round, Some(details)) => {
            if details.total_period == 0 {
                return Err(SettlementError::validation(
                    "a round bill needs at least one round",
                ));
            }
            if details.current_round == 0 || details.current_round > details.total_period {
                return Err(SettlementError::RoundOutOfRange {
                    round: details.current_round,
                    total_period: details.total_period,
                });
            }
            Ok(())
        }
    }
}
