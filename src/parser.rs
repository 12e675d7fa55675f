//! Parsing of the requests read by the binary, one JSON object per line.

use std::path::PathBuf;

use serde::Deserialize;

use crate::endpoints::Confirmation;
use crate::error::InputError;
use crate::types::{
    BillDraft, BillId, BillPatch, ItemId, RoundSchedulePatch, UserId, WorkspaceId,
};

/// A file on the local disk that is uploaded as payment evidence.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct EvidenceFile {
    pub path: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RegisterUser {
        name: String,
        #[serde(default)]
        account_number: String,
    },
    CreateWorkspace {
        owner: UserId,
    },
    AddMembers {
        workspace: WorkspaceId,
        members: Vec<UserId>,
    },
    CreateBill {
        bill: BillDraft,
        #[serde(default)]
        evidence: Option<EvidenceFile>,
    },
    Pay {
        bill: BillId,
        payer: UserId,
        items: Vec<ItemId>,
        evidence: EvidenceFile,
    },
    Confirm {
        bill: BillId,
        confirmations: Vec<Confirmation>,
    },
    Cancel {
        bill: BillId,
        actor: UserId,
    },
    UpdateRound {
        bill: BillId,
        #[serde(default)]
        schedule: RoundSchedulePatch,
    },
    UpdateBill {
        bill: BillId,
        #[serde(default)]
        patch: BillPatch,
    },
    DeleteBill {
        bill: BillId,
    },
    GetBill {
        bill: BillId,
    },
    BillTransactions {
        bill: BillId,
    },
    AccumulatedPending {
        bill: BillId,
        user: UserId,
    },
}

pub fn parse_request(line: &str) -> Result<Request, InputError> {
    serde_json::from_str(line).map_err(InputError::invalid_request)
}
