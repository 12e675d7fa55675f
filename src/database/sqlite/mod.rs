//! The implementation of a data storage using Sqlite.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    Connection, ErrorCode, OptionalExtension, ToSql,
};
use tokio::task::block_in_place;

use crate::{
    error::DatabaseError,
    ledger::LedgerRecorder,
    types::{
        Bill, BillId, BillItem, BillStatus, Creator, ItemId, NewBill, NewTransaction,
        PaymentType, ReferenceKind, RoundDetails, RoundPayment, Share, ShareStatus,
        Transaction, TransactionId, TransactionKind, TransactionReference, User, UserId,
        WorkspaceId,
    },
};

use super::{Database, DatabaseResult};

mod schema;

pub struct SqliteDatabase {
    connection: Connection,
}

impl SqliteDatabase {
    pub fn new<P: AsRef<Path>>(path: P) -> DatabaseResult<SqliteDatabase> {
        block_in_place(|| {
            let connection = Connection::open(path)
                .map_err(|e| DatabaseError::new("cannot open database", e.into()))?;
            SqliteDatabase::with_connection(connection)
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> DatabaseResult<SqliteDatabase> {
        let connection = Connection::open_in_memory()
            .map_err(|e| DatabaseError::new("cannot open database", e.into()))?;
        SqliteDatabase::with_connection(connection)
    }

    fn with_connection(connection: Connection) -> DatabaseResult<SqliteDatabase> {
        schema::create_all_tables(&connection)
            .map_err(|e| DatabaseError::new("cannot create tables", e))?;
        Ok(SqliteDatabase { connection })
    }
}

impl Database for SqliteDatabase {
    fn register_user(&mut self, name: &str, account_number: &str) -> DatabaseResult<UserId> {
        let fn_impl = || {
            let user_id = self.connection.query_row(
                "INSERT INTO user_account (name, account_number) VALUES (?1, ?2) RETURNING id",
                params![name, account_number],
                |row| row.get(0),
            )?;
            Ok(user_id)
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot register user", e)))
    }

    fn get_user(&self, user: UserId) -> DatabaseResult<Option<User>> {
        let fn_impl = || {
            let user = self
                .connection
                .query_row(
                    "SELECT id, name, account_number FROM user_account WHERE id = ?1",
                    params![user],
                    |row| {
                        Ok(User {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            account_number: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(user)
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot get user", e)))
    }

    fn create_workspace(&mut self, owner: UserId) -> DatabaseResult<WorkspaceId> {
        let mut fn_impl = || {
            let tx = self.connection.transaction()?;

            let workspace_id: WorkspaceId = tx.query_row(
                "INSERT INTO workspace (owner_id) VALUES (?1) RETURNING id",
                params![owner],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO workspace_member (workspace_id, user_id) VALUES (?1, ?2)",
                params![workspace_id, owner],
            )?;

            tx.commit()?;
            Ok(workspace_id)
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot create workspace", e)))
    }

    fn add_workspace_members_if_not_exist(
        &mut self,
        workspace: WorkspaceId,
        members: &[UserId],
    ) -> DatabaseResult<()> {
        let mut fn_impl = || {
            let tx = self.connection.transaction()?;

            {
                let mut insert_member_stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO workspace_member (workspace_id, user_id)
                     SELECT id, ?2 FROM workspace WHERE id = ?1",
                )?;
                for member in members {
                    insert_member_stmt.execute(params![workspace, member])?;
                }
            }

            tx.commit()?;
            Ok(())
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot add workspace members", e)))
    }

    fn get_workspace_members(&self, workspace: WorkspaceId) -> DatabaseResult<Vec<UserId>> {
        let fn_impl = || {
            let mut stmt = self.connection.prepare_cached(
                "SELECT user_id FROM workspace_member WHERE workspace_id = ?1 ORDER BY user_id",
            )?;
            let member_iter = stmt.query_map(params![workspace], |row| row.get(0))?;
            let members = member_iter.collect::<Result<_, _>>()?;
            Ok(members)
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot get workspace members", e)))
    }

    fn get_workspace_owner(&self, workspace: WorkspaceId) -> DatabaseResult<Option<UserId>> {
        let fn_impl = || {
            let owner = self
                .connection
                .query_row(
                    "SELECT owner_id FROM workspace WHERE id = ?1",
                    params![workspace],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(owner)
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot get workspace owner", e)))
    }

    fn save_bill(&mut self, bill: NewBill, created_at: DateTime<Utc>) -> DatabaseResult<Bill> {
        let mut fn_impl = || {
            let tx = self.connection.transaction()?;

            let (due_date, total_period, current_round) = round_columns(&bill.round_details);
            let bill_id: BillId = tx.query_row(
                "INSERT INTO bill (workspace_id, creator_id, creator_name, creator_account_number,
                    payment_type, due_date, total_period, current_round, note, status, e_slip,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
                 RETURNING id",
                params![
                    bill.workspace,
                    bill.creator.user,
                    bill.creator.name,
                    bill.creator.account_number,
                    bill.payment_type,
                    due_date,
                    total_period,
                    current_round,
                    bill.note,
                    BillStatus::Pending,
                    bill.e_slip,
                    created_at,
                ],
                |row| row.get(0),
            )?;

            debug!("bill_id is {bill_id}");

            {
                let mut insert_item_stmt = tx.prepare_cached(
                    "INSERT INTO bill_item (bill_id, position, description, amount)
                     VALUES (?1, ?2, ?3, ?4) RETURNING id",
                )?;
                let mut insert_share_stmt = tx.prepare_cached(
                    "INSERT INTO bill_share
                        (item_id, user_id, position, name, share_amount, status, e_slip)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                let mut insert_round_stmt = tx.prepare_cached(INSERT_ROUND_PAYMENT)?;

                for (position, item) in bill.items.iter().enumerate() {
                    let item_id: ItemId = insert_item_stmt.query_row(
                        params![bill_id, position, item.description, item.amount],
                        |row| row.get(0),
                    )?;

                    for (position, share) in item.shared_with.iter().enumerate() {
                        insert_share_stmt.execute(params![
                            item_id,
                            share.user,
                            position,
                            share.name,
                            share.share_amount,
                            share.status,
                            share.e_slip,
                        ])?;
                        for payment in &share.round_payments {
                            insert_round_stmt.execute(round_payment_params(
                                item_id, share.user, payment,
                            ))?;
                        }
                    }
                }
            }

            let saved = load_bill(&tx, bill_id)?
                .ok_or_else(|| DatabaseError::concurrency("the new bill disappeared"))?;

            tx.commit()?;

            Ok(saved)
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot save bill", e)))
    }

    fn get_bill(&self, bill_id: BillId) -> DatabaseResult<Option<Bill>> {
        let fn_impl = || load_bill(&self.connection, bill_id);

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot get bill", e)))
    }

    fn commit_bill(
        &mut self,
        bill: &Bill,
        transactions: &[NewTransaction],
    ) -> DatabaseResult<i64> {
        debug!(
            "Committing bill {} at version {} with {} transactions",
            bill.id,
            bill.version,
            transactions.len()
        );
        let mut fn_impl = || {
            let tx = self.connection.transaction()?;

            let (due_date, total_period, current_round) = round_columns(&bill.round_details);
            let num_updated_rows = tx.execute(
                "UPDATE bill SET due_date = ?1, total_period = ?2, current_round = ?3, note = ?4,
                    status = ?5, e_slip = ?6, updated_at = ?7, canceled_at = ?8, canceled_by = ?9,
                    version = version + 1
                 WHERE id = ?10 AND version = ?11",
                params![
                    due_date,
                    total_period,
                    current_round,
                    bill.note,
                    bill.status,
                    bill.e_slip,
                    bill.updated_at,
                    bill.canceled_at,
                    bill.canceled_by,
                    bill.id,
                    bill.version,
                ],
            )?;
            if num_updated_rows == 0 {
                return Err(DatabaseError::concurrency(&format!(
                    "bill {} was changed or deleted since version {}",
                    bill.id, bill.version
                ))
                .into());
            }

            {
                let mut update_item_stmt = tx.prepare_cached(
                    "UPDATE bill_item SET description = ?1, amount = ?2
                     WHERE id = ?3 AND bill_id = ?4",
                )?;
                let mut update_share_stmt = tx.prepare_cached(
                    "UPDATE bill_share SET share_amount = ?1, status = ?2, e_slip = ?3
                     WHERE item_id = ?4 AND user_id = ?5",
                )?;
                let mut delete_rounds_stmt =
                    tx.prepare_cached("DELETE FROM round_payment WHERE item_id = ?1")?;
                let mut insert_round_stmt = tx.prepare_cached(INSERT_ROUND_PAYMENT)?;

                for item in &bill.items {
                    update_item_stmt.execute(params![
                        item.description,
                        item.amount,
                        item.id,
                        bill.id
                    ])?;
                    delete_rounds_stmt.execute(params![item.id])?;

                    for share in &item.shared_with {
                        update_share_stmt.execute(params![
                            share.share_amount,
                            share.status,
                            share.e_slip,
                            item.id,
                            share.user,
                        ])?;
                        for payment in &share.round_payments {
                            insert_round_stmt.execute(round_payment_params(
                                item.id, share.user, payment,
                            ))?;
                        }
                    }
                }
            }

            for transaction in transactions {
                insert_transaction(&tx, transaction)?;
            }

            tx.commit()?;

            Ok(bill.version + 1)
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot commit bill", e)))
    }

    fn delete_bill(&mut self, bill_id: BillId) -> DatabaseResult<bool> {
        debug!("Deleting bill {bill_id}");
        let mut fn_impl = || {
            let tx = self.connection.transaction()?;

            tx.execute(
                "DELETE FROM round_payment
                 WHERE item_id IN (SELECT id FROM bill_item WHERE bill_id = ?1)",
                params![bill_id],
            )?;
            tx.execute(
                "DELETE FROM bill_share
                 WHERE item_id IN (SELECT id FROM bill_item WHERE bill_id = ?1)",
                params![bill_id],
            )?;
            tx.execute("DELETE FROM bill_item WHERE bill_id = ?1", params![bill_id])?;
            let num_deleted_rows = tx.execute("DELETE FROM bill WHERE id = ?1", params![bill_id])?;

            tx.commit()?;

            Ok(num_deleted_rows > 0)
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot delete bill", e)))
    }
}

impl LedgerRecorder for SqliteDatabase {
    fn transaction_exists(&self, reference: &TransactionReference) -> DatabaseResult<bool> {
        let fn_impl = || {
            let exists = self.connection.query_row(
                "SELECT EXISTS(SELECT 1 FROM ledger_transaction
                 WHERE ref_type = ?1 AND ref_bill_id = ?2 AND ref_item_id = ?3
                 AND ref_user_id = ?4 AND ref_round = ?5)",
                params![
                    reference.kind,
                    reference.bill,
                    reference.item,
                    reference.user,
                    reference.round.unwrap_or(0),
                ],
                |row| row.get(0),
            )?;
            Ok(exists)
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot look up transaction", e)))
    }

    fn append_transaction(&mut self, transaction: NewTransaction) -> DatabaseResult<Transaction> {
        let fn_impl = || {
            let id = insert_transaction(&self.connection, &transaction)?;
            Ok(Transaction {
                id,
                workspace: transaction.workspace,
                user: transaction.user,
                kind: transaction.kind,
                amount: transaction.amount,
                category: transaction.category.clone(),
                description: transaction.description.clone(),
                slip_image: transaction.slip_image.clone(),
                transaction_date: transaction.transaction_date,
                reference: transaction.reference,
            })
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot append transaction", e)))
    }

    fn bill_transactions(&self, bill_id: BillId) -> DatabaseResult<Vec<Transaction>> {
        let fn_impl = || {
            let mut stmt = self.connection.prepare_cached(
                "SELECT id, workspace_id, user_id, kind, amount, category, description, slip_image,
                    transaction_date, ref_type, ref_bill_id, ref_item_id, ref_user_id, ref_round
                 FROM ledger_transaction
                 WHERE ref_type = ?1 AND ref_bill_id = ?2
                 ORDER BY id",
            )?;

            let transaction_iter =
                stmt.query_map(params![ReferenceKind::Bill, bill_id], |row| {
                    let round: u32 = row.get(13)?;
                    Ok(Transaction {
                        id: row.get(0)?,
                        workspace: row.get(1)?,
                        user: row.get(2)?,
                        kind: row.get(3)?,
                        amount: row.get(4)?,
                        category: row.get(5)?,
                        description: row.get(6)?,
                        slip_image: row.get(7)?,
                        transaction_date: row.get(8)?,
                        reference: TransactionReference {
                            kind: row.get(9)?,
                            bill: row.get(10)?,
                            item: row.get(11)?,
                            user: row.get(12)?,
                            round: if round == 0 { None } else { Some(round) },
                        },
                    })
                })?;

            let transactions = transaction_iter.collect::<Result<_, _>>()?;
            Ok(transactions)
        };

        block_in_place(|| fn_impl().map_err(|e| map_error("cannot get bill transactions", e)))
    }
}

const INSERT_ROUND_PAYMENT: &str =
    "INSERT INTO round_payment (item_id, user_id, round, amount, status, paid_date, e_slip)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

fn round_payment_params<'a>(
    item_id: ItemId,
    user: UserId,
    payment: &'a RoundPayment,
) -> (
    ItemId,
    UserId,
    u32,
    i64,
    ShareStatus,
    &'a Option<DateTime<Utc>>,
    &'a Option<String>,
) {
    (
        item_id,
        user,
        payment.round,
        payment.amount,
        payment.status,
        &payment.paid_date,
        &payment.e_slip,
    )
}

fn round_columns(
    details: &Option<RoundDetails>,
) -> (Option<DateTime<Utc>>, Option<u32>, Option<u32>) {
    match details {
        Some(d) => (Some(d.due_date), Some(d.total_period), Some(d.current_round)),
        None => (None, None, None),
    }
}

/// Insert a ledger transaction, turning a violation of the reference index into
/// [`DatabaseError::DuplicateTransaction`].
fn insert_transaction(
    connection: &Connection,
    transaction: &NewTransaction,
) -> anyhow::Result<TransactionId> {
    let reference = &transaction.reference;
    let result = connection
        .prepare_cached(
            "INSERT INTO ledger_transaction (workspace_id, user_id, kind, amount, category,
                description, slip_image, transaction_date, ref_type, ref_bill_id, ref_item_id,
                ref_user_id, ref_round)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             RETURNING id",
        )?
        .query_row(
            params![
                transaction.workspace,
                transaction.user,
                transaction.kind,
                transaction.amount,
                transaction.category,
                transaction.description,
                transaction.slip_image,
                transaction.transaction_date,
                reference.kind,
                reference.bill,
                reference.item,
                reference.user,
                reference.round.unwrap_or(0),
            ],
            |row| row.get(0),
        );

    match result {
        Ok(id) => {
            debug!("Recorded transaction {id} for {reference}");
            Ok(id)
        }
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(DatabaseError::duplicate_transaction(*reference).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn load_bill(connection: &Connection, bill_id: BillId) -> anyhow::Result<Option<Bill>> {
    let bill = connection
        .query_row(
            "SELECT id, workspace_id, creator_id, creator_name, creator_account_number,
                payment_type, due_date, total_period, current_round, note, status, e_slip,
                created_at, updated_at, canceled_at, canceled_by, version
             FROM bill WHERE id = ?1",
            params![bill_id],
            |row| {
                let payment_type: PaymentType = row.get(5)?;
                let due_date: Option<DateTime<Utc>> = row.get(6)?;
                let total_period: Option<u32> = row.get(7)?;
                let current_round: Option<u32> = row.get(8)?;
                let round_details = match (due_date, total_period, current_round) {
                    (Some(due_date), Some(total_period), Some(current_round))
                        if payment_type == PaymentType::Round =>
                    {
                        Some(RoundDetails {
                            due_date,
                            total_period,
                            current_round,
                        })
                    }
                    _ => None,
                };

                Ok(Bill {
                    id: row.get(0)?,
                    workspace: row.get(1)?,
                    creator: Creator {
                        user: row.get(2)?,
                        name: row.get(3)?,
                        account_number: row.get(4)?,
                    },
                    payment_type,
                    round_details,
                    items: vec![],
                    note: row.get(9)?,
                    status: row.get(10)?,
                    e_slip: row.get(11)?,
                    created_at: row.get(12)?,
                    updated_at: row.get(13)?,
                    canceled_at: row.get(14)?,
                    canceled_by: row.get(15)?,
                    version: row.get(16)?,
                })
            },
        )
        .optional()?;

    let mut bill = match bill {
        Some(bill) => bill,
        None => return Ok(None),
    };

    let mut rounds: HashMap<(ItemId, UserId), Vec<RoundPayment>> = HashMap::new();
    {
        let mut stmt = connection.prepare_cached(
            "SELECT r.item_id, r.user_id, r.round, r.amount, r.status, r.paid_date, r.e_slip
             FROM round_payment r INNER JOIN bill_item i ON r.item_id = i.id
             WHERE i.bill_id = ?1
             ORDER BY r.round",
        )?;
        let round_iter = stmt.query_map(params![bill_id], |row| {
            Ok((
                (row.get(0)?, row.get(1)?),
                RoundPayment {
                    round: row.get(2)?,
                    amount: row.get(3)?,
                    status: row.get(4)?,
                    paid_date: row.get(5)?,
                    e_slip: row.get(6)?,
                },
            ))
        })?;
        for round in round_iter {
            let (key, payment) = round?;
            rounds.entry(key).or_default().push(payment);
        }
    }

    let mut shares: HashMap<ItemId, Vec<Share>> = HashMap::new();
    {
        let mut stmt = connection.prepare_cached(
            "SELECT s.item_id, s.user_id, s.name, s.share_amount, s.status, s.e_slip
             FROM bill_share s INNER JOIN bill_item i ON s.item_id = i.id
             WHERE i.bill_id = ?1
             ORDER BY s.item_id, s.position",
        )?;
        let share_iter = stmt.query_map(params![bill_id], |row| {
            let item_id: ItemId = row.get(0)?;
            Ok((
                item_id,
                Share {
                    user: row.get(1)?,
                    name: row.get(2)?,
                    share_amount: row.get(3)?,
                    status: row.get(4)?,
                    e_slip: row.get(5)?,
                    round_payments: vec![],
                },
            ))
        })?;
        for share in share_iter {
            let (item_id, mut share) = share?;
            share.round_payments = rounds.remove(&(item_id, share.user)).unwrap_or_default();
            shares.entry(item_id).or_default().push(share);
        }
    }

    {
        let mut stmt = connection.prepare_cached(
            "SELECT id, description, amount FROM bill_item WHERE bill_id = ?1 ORDER BY position",
        )?;
        let item_iter = stmt.query_map(params![bill_id], |row| {
            Ok(BillItem {
                id: row.get(0)?,
                description: row.get(1)?,
                amount: row.get(2)?,
                shared_with: vec![],
            })
        })?;
        for item in item_iter {
            let mut item = item?;
            item.shared_with = shares.remove(&item.id).unwrap_or_default();
            bill.items.push(item);
        }
    }

    Ok(Some(bill))
}

macro_rules! text_column {
    ($($t:ty),+ $(,)?) => {$(
        impl ToSql for $t {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $t {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    )+};
}

text_column!(
    PaymentType,
    BillStatus,
    ShareStatus,
    TransactionKind,
    ReferenceKind,
);

fn map_error<T: AsRef<str>>(message: T, e: anyhow::Error) -> DatabaseError {
    match e.downcast::<DatabaseError>() {
        Ok(e) => e,
        Err(e) => DatabaseError::new(message, e),
    }
}
