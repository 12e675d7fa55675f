//! The bill aggregate and the ledger records derived from it.
//!
//! The methods on [`Bill`] are pure: they read or reshape the aggregate in memory
//! and never touch the database or the evidence store.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Amount = i64;
pub type BillId = i64;
pub type ItemId = i64;
pub type UserId = i64;
pub type WorkspaceId = i64;
pub type TransactionId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Normal,
    Round,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Pending,
    Paid,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareStatus {
    Pending,
    AwaitingConfirmation,
    Paid,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Income,
    Expenses,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    Request,
    Bill,
}

#[derive(Error, Debug)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(PaymentType, "payment type", { Normal => "normal", Round => "round" });
text_enum!(BillStatus, "bill status", {
    Pending => "pending",
    Paid => "paid",
    Canceled => "canceled",
});
text_enum!(ShareStatus, "share status", {
    Pending => "pending",
    AwaitingConfirmation => "awaiting_confirmation",
    Paid => "paid",
    Canceled => "canceled",
});
text_enum!(TransactionKind, "transaction kind", { Income => "Income", Expenses => "Expenses" });
text_enum!(ReferenceKind, "reference kind", { Request => "Request", Bill => "Bill" });

/// The bill creator, copied from the user profile when the bill is created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    pub user: UserId,
    pub name: String,
    pub account_number: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundDetails {
    pub due_date: DateTime<Utc>,
    pub total_period: u32,
    #[serde(default = "first_round")]
    pub current_round: u32,
}

fn first_round() -> u32 {
    1
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundPayment {
    pub round: u32,
    pub amount: Amount,
    pub status: ShareStatus,
    pub paid_date: Option<DateTime<Utc>>,
    pub e_slip: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub user: UserId,
    pub name: String,
    pub share_amount: Amount,
    pub status: ShareStatus,
    pub e_slip: Option<String>,
    pub round_payments: Vec<RoundPayment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillItem {
    pub id: ItemId,
    pub description: String,
    pub amount: Amount,
    pub shared_with: Vec<Share>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub id: BillId,
    pub workspace: WorkspaceId,
    pub creator: Creator,
    pub payment_type: PaymentType,
    pub round_details: Option<RoundDetails>,
    pub items: Vec<BillItem>,
    pub note: String,
    pub status: BillStatus,
    pub e_slip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub canceled_by: Option<UserId>,
    /// Incremented by every committed write; used for compare-and-swap.
    pub version: i64,
}

/// A bill as submitted by its creator, before validation.
#[derive(Clone, Debug, Deserialize)]
pub struct BillDraft {
    pub workspace: WorkspaceId,
    pub creator: UserId,
    pub payment_type: PaymentType,
    #[serde(default)]
    pub round_details: Option<RoundDetails>,
    pub items: Vec<ItemDraft>,
    #[serde(default)]
    pub note: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ItemDraft {
    pub description: String,
    pub amount: Amount,
    pub shared_with: Vec<ShareDraft>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ShareDraft {
    pub user: UserId,
    pub share_amount: Amount,
}

/// A bill that has been validated but not persisted yet.
#[derive(Clone, Debug)]
pub struct NewBill {
    pub workspace: WorkspaceId,
    pub creator: Creator,
    pub payment_type: PaymentType,
    pub round_details: Option<RoundDetails>,
    pub items: Vec<NewItem>,
    pub note: String,
    pub e_slip: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewItem {
    pub description: String,
    pub amount: Amount,
    pub shared_with: Vec<Share>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionReference {
    pub kind: ReferenceKind,
    pub bill: BillId,
    pub item: ItemId,
    pub user: UserId,
    pub round: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub workspace: WorkspaceId,
    pub user: UserId,
    pub kind: TransactionKind,
    pub amount: Amount,
    pub category: String,
    pub description: String,
    pub slip_image: String,
    pub transaction_date: DateTime<Utc>,
    pub reference: TransactionReference,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub workspace: WorkspaceId,
    pub user: UserId,
    pub kind: TransactionKind,
    pub amount: Amount,
    pub category: String,
    pub description: String,
    pub slip_image: String,
    pub transaction_date: DateTime<Utc>,
    pub reference: TransactionReference,
}

/// Changes to the installment schedule of a round bill. Absent fields are kept.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RoundSchedulePatch {
    pub due_date: Option<DateTime<Utc>>,
    pub total_period: Option<u32>,
    pub current_round: Option<u32>,
}

/// Field edits the creator may apply while the bill is pending.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BillPatch {
    pub note: Option<String>,
    #[serde(default)]
    pub items: Vec<ItemPatch>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ItemPatch {
    pub id: ItemId,
    pub description: Option<String>,
    pub amount: Option<Amount>,
    #[serde(default)]
    pub shares: Vec<SharePatch>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SharePatch {
    pub user: UserId,
    pub share_amount: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub account_number: String,
}

impl fmt::Display for TransactionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} item {} user {}",
            self.kind, self.bill, self.item, self.user
        )?;
        if let Some(round) = self.round {
            write!(f, " round {round}")?;
        }
        Ok(())
    }
}

impl TransactionReference {
    pub fn bill(bill: BillId, item: ItemId, user: UserId, round: Option<u32>) -> Self {
        TransactionReference {
            kind: ReferenceKind::Bill,
            bill,
            item,
            user,
            round,
        }
    }
}

impl Share {
    /// A fresh share in `pending`. Round bills get one pending entry per round.
    pub fn new(user: UserId, name: &str, share_amount: Amount, rounds: Option<u32>) -> Share {
        let round_payments = match rounds {
            Some(total) => (1..=total)
                .map(|round| RoundPayment::pending(round, share_amount))
                .collect(),
            None => vec![],
        };
        Share {
            user,
            name: name.to_string(),
            share_amount,
            status: ShareStatus::Pending,
            e_slip: None,
            round_payments,
        }
    }

    pub fn round_payment(&self, round: u32) -> Option<&RoundPayment> {
        self.round_payments.iter().find(|p| p.round == round)
    }

    pub fn round_payment_mut(&mut self, round: u32) -> Option<&mut RoundPayment> {
        self.round_payments.iter_mut().find(|p| p.round == round)
    }
}

impl RoundPayment {
    pub fn pending(round: u32, amount: Amount) -> RoundPayment {
        RoundPayment {
            round,
            amount,
            status: ShareStatus::Pending,
            paid_date: None,
            e_slip: None,
        }
    }
}

impl Bill {
    pub fn is_round(&self) -> bool {
        self.payment_type == PaymentType::Round
    }

    /// The actionable round, `None` for normal bills.
    pub fn current_round(&self) -> Option<u32> {
        self.round_details.as_ref().map(|d| d.current_round)
    }

    pub fn item(&self, item_id: ItemId) -> Option<&BillItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn item_mut(&mut self, item_id: ItemId) -> Option<&mut BillItem> {
        self.items.iter_mut().find(|i| i.id == item_id)
    }

    pub fn shares(&self) -> impl Iterator<Item = &Share> {
        self.items.iter().flat_map(|i| i.shared_with.iter())
    }

    pub fn shares_mut(&mut self) -> impl Iterator<Item = &mut Share> {
        self.items.iter_mut().flat_map(|i| i.shared_with.iter_mut())
    }

    /// Normal bills: every share is paid. Round bills: every share's entry for
    /// the current round is paid; later rounds are not looked at.
    pub fn all_shares_paid(&self) -> bool {
        match self.current_round() {
            Some(round) if self.is_round() => self.shares().all(|s| {
                s.round_payment(round)
                    .map_or(false, |p| p.status == ShareStatus::Paid)
            }),
            _ => self.shares().all(|s| s.status == ShareStatus::Paid),
        }
    }

    /// Sum of the user's pending round entries across all items, or `None` if
    /// it does not fit in an `Amount`.
    pub fn accumulated_pending(&self, user: UserId) -> Option<Amount> {
        if !self.is_round() {
            return Some(0);
        }
        self.shares()
            .filter(|s| s.user == user)
            .flat_map(|s| s.round_payments.iter())
            .filter(|p| p.status == ShareStatus::Pending)
            .try_fold(0 as Amount, |total, p| total.checked_add(p.amount))
    }

    pub fn highest_paid_round(&self) -> Option<u32> {
        self.shares()
            .flat_map(|s| s.round_payments.iter())
            .filter(|p| p.status == ShareStatus::Paid)
            .map(|p| p.round)
            .max()
    }

    /// Every slip referenced by the bill: the creator's slip first, then share
    /// and round slips in document order. Duplicates are reported once.
    pub fn evidence_urls(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let share_slips = self.shares().flat_map(|s| {
            s.e_slip
                .iter()
                .chain(s.round_payments.iter().filter_map(|p| p.e_slip.as_ref()))
        });

        self.e_slip
            .iter()
            .chain(share_slips)
            .filter(|url| seen.insert(url.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub mod fixtures {
    //! Bills built in memory for tests across the crate.

    use chrono::TimeZone;

    use super::*;

    pub const CREATOR: UserId = 1;
    pub const ALICE: UserId = 2;
    pub const BOB: UserId = 3;

    pub fn date(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()
    }

    pub fn creator() -> Creator {
        Creator {
            user: CREATOR,
            name: "carol".to_string(),
            account_number: "123-456".to_string(),
        }
    }

    pub fn normal_bill(shares: &[(UserId, Amount)]) -> Bill {
        let amount = shares.iter().map(|(_, a)| a).sum();
        Bill {
            id: 10,
            workspace: 100,
            creator: creator(),
            payment_type: PaymentType::Normal,
            round_details: None,
            items: vec![BillItem {
                id: 20,
                description: "dinner".to_string(),
                amount,
                shared_with: shares
                    .iter()
                    .map(|(u, a)| Share::new(*u, &format!("user{u}"), *a, None))
                    .collect(),
            }],
            note: String::new(),
            status: BillStatus::Pending,
            e_slip: None,
            created_at: date(1),
            updated_at: date(1),
            canceled_at: None,
            canceled_by: None,
            version: 0,
        }
    }

    pub fn round_bill(shares: &[(UserId, Amount)], total_period: u32) -> Bill {
        let mut bill = normal_bill(shares);
        bill.payment_type = PaymentType::Round;
        bill.round_details = Some(RoundDetails {
            due_date: date(31),
            total_period,
            current_round: 1,
        });
        for share in bill.shares_mut() {
            *share = Share::new(share.user, &share.name, share.share_amount, Some(total_period));
        }
        bill
    }
}
