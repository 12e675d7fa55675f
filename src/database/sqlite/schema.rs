const CREATE_USER_ACCOUNT_TABLE: &str = "CREATE TABLE IF NOT EXISTS user_account (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  account_number TEXT NOT NULL
)";

const CREATE_WORKSPACE_TABLE: &str = "CREATE TABLE IF NOT EXISTS workspace (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  owner_id INTEGER NOT NULL,
  created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

const CREATE_WORKSPACE_MEMBER_TABLE: &str = "CREATE TABLE IF NOT EXISTS workspace_member (
  workspace_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  UNIQUE(workspace_id, user_id)
)";

const CREATE_BILL_TABLE: &str = "CREATE TABLE IF NOT EXISTS bill (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  workspace_id INTEGER NOT NULL,
  creator_id INTEGER NOT NULL,
  creator_name TEXT NOT NULL,
  creator_account_number TEXT NOT NULL,
  payment_type TEXT NOT NULL,
  due_date DATETIME,
  total_period INTEGER,
  current_round INTEGER,
  note TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL,
  e_slip TEXT,
  version INTEGER NOT NULL DEFAULT 0,
  created_at DATETIME NOT NULL,
  updated_at DATETIME NOT NULL,
  canceled_at DATETIME,
  canceled_by INTEGER
)";

const CREATE_BILL_ITEM_TABLE: &str = "CREATE TABLE IF NOT EXISTS bill_item (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  bill_id INTEGER NOT NULL,
  position INTEGER NOT NULL,
  description TEXT NOT NULL,
  amount INTEGER NOT NULL
)";

const CREATE_BILL_SHARE_TABLE: &str = "CREATE TABLE IF NOT EXISTS bill_share (
  item_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  position INTEGER NOT NULL,
  name TEXT NOT NULL,
  share_amount INTEGER NOT NULL,
  status TEXT NOT NULL,
  e_slip TEXT,
  UNIQUE(item_id, user_id)
)";

const CREATE_ROUND_PAYMENT_TABLE: &str = "CREATE TABLE IF NOT EXISTS round_payment (
  item_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  round INTEGER NOT NULL,
  amount INTEGER NOT NULL,
  status TEXT NOT NULL,
  paid_date DATETIME,
  e_slip TEXT,
  UNIQUE(item_id, user_id, round)
)";

// `ref_round` is 0 for normal bills: NULLs never collide in a UNIQUE index.
const CREATE_LEDGER_TRANSACTION_TABLE: &str = "CREATE TABLE IF NOT EXISTS ledger_transaction (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  workspace_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  kind TEXT NOT NULL,
  amount INTEGER NOT NULL,
  category TEXT NOT NULL,
  description TEXT NOT NULL,
  slip_image TEXT NOT NULL,
  transaction_date DATETIME NOT NULL,
  ref_type TEXT NOT NULL,
  ref_bill_id INTEGER NOT NULL,
  ref_item_id INTEGER NOT NULL,
  ref_user_id INTEGER NOT NULL,
  ref_round INTEGER NOT NULL DEFAULT 0,
  created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

const CREATE_LEDGER_REFERENCE_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS ledger_transaction_reference
  ON ledger_transaction (ref_type, ref_bill_id, ref_item_id, ref_user_id, ref_round)";

pub fn create_all_tables(connection: &rusqlite::Connection) -> anyhow::Result<()> {
    connection.execute(CREATE_USER_ACCOUNT_TABLE, ())?;
    connection.execute(CREATE_WORKSPACE_TABLE, ())?;
    connection.execute(CREATE_WORKSPACE_MEMBER_TABLE, ())?;
    connection.execute(CREATE_BILL_TABLE, ())?;
    connection.execute(CREATE_BILL_ITEM_TABLE, ())?;
    connection.execute(CREATE_BILL_SHARE_TABLE, ())?;
    connection.execute(CREATE_ROUND_PAYMENT_TABLE, ())?;
    connection.execute(CREATE_LEDGER_TRANSACTION_TABLE, ())?;
    connection.execute(CREATE_LEDGER_REFERENCE_INDEX, ())?;
    Ok(())
}
