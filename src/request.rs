//! Replenishment requests and their durable store
use super::error::{AbortOnErr, OrderError, OrderResult, TxResult};
use super::state_machine;
use super::types::{Money, TimeStamp};
use super::utils;
use chrono::Utc;
use sled::transaction::TransactionalTree;

pub const REQUESTS_TREE: &str = "requests";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    ReadyForShipment,
    #[n(3)]
    SoldOut,
    #[n(4)]
    Rejected,
    #[n(5)]
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::SoldOut | RequestStatus::Rejected | RequestStatus::Cancelled
        )
    }
}

/// One line of the append-only request log.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct NoteEntry {
    #[n(0)]
    pub at: TimeStamp<Utc>,
    #[n(1)]
    pub actor: String,
    #[n(2)]
    pub tag: String, // e.g. "REJECTED"
    #[n(3)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Request {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7, "req_" prefix
    #[n(1)]
    pub product_id: u64,
    #[n(2)]
    pub warehouse_id: String,
    #[n(3)]
    pub requested_quantity: u64,
    #[n(4)]
    pub unit_cost_at_creation: Money,
    #[n(5)]
    pub status: RequestStatus,
    #[n(6)]
    pub requested_by: String,
    #[n(7)]
    pub approved_by: Option<String>,
    #[n(8)]
    pub received_by: Option<String>,
    #[n(9)]
    pub requested_at: TimeStamp<Utc>,
    #[n(10)]
    pub decided_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub received_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub notes: Vec<NoteEntry>,
    #[n(13)]
    pub version: u64,
    #[n(14)]
    pub pending_saga: Option<String>,
}

impl Request {
    pub fn new(
        product_id: u64,
        warehouse_id: String,
        requested_quantity: u64,
        unit_cost_at_creation: Money,
        requested_by: String,
    ) -> OrderResult<Self> {
        // quantities become signed inventory deltas later on
        if requested_quantity == 0 || i64::try_from(requested_quantity).is_err() {
            return Err(OrderError::InvalidQuantity);
        }
        if requested_by.trim().is_empty() {
            return Err(OrderError::MissingActor);
        }
        // both the debit and the eventual delivery credit must be representable
        let total_cost = unit_cost_at_creation.try_mul(requested_quantity)?;
        state_machine::delivery_amount(total_cost)?;
        let id = utils::new_uuid_to_bech32("req_")
            .map_err(|e| OrderError::StorageFailure(format!("id generation: {e}")))?;

        Ok(Self {
            id,
            product_id,
            warehouse_id,
            requested_quantity,
            unit_cost_at_creation,
            status: RequestStatus::Pending,
            requested_by,
            approved_by: None,
            received_by: None,
            requested_at: TimeStamp::new(),
            decided_at: None,
            received_at: None,
            notes: vec![],
            version: 0,
            pending_saga: None,
        })
    }

    /// Always derived from the creation-time price, never re-priced.
    pub fn total_cost(&self) -> OrderResult<Money> {
        self.unit_cost_at_creation.try_mul(self.requested_quantity)
    }

    pub fn append_note(&mut self, actor: &str, tag: &str, text: &str) {
        let at = match self.notes.last() {
            Some(last) => TimeStamp::not_before(&last.at),
            None => TimeStamp::not_before(&self.requested_at),
        };
        self.notes.push(NoteEntry {
            at,
            actor: actor.to_string(),
            tag: tag.to_string(),
            text: text.to_string(),
        });
    }

    /// Latest timestamp recorded on the request, used to keep audit fields monotonic.
    pub fn last_activity(&self) -> TimeStamp<Utc> {
        [
            Some(&self.requested_at),
            self.decided_at.as_ref(),
            self.received_at.as_ref(),
            self.notes.last().map(|n| &n.at),
        ]
        .into_iter()
        .flatten()
        .max()
        .cloned()
        .unwrap_or_default()
    }
}

/// Durable request rows, one per order.
#[derive(Clone)]
pub struct RequestStore {
    tree: sled::Tree,
}

impl RequestStore {
    pub fn open(db: &sled::Db) -> OrderResult<Self> {
        Ok(Self {
            tree: db.open_tree(REQUESTS_TREE)?,
        })
    }

    pub fn tree(&self) -> &sled::Tree {
        &self.tree
    }

    pub fn get(&self, request_id: &str) -> OrderResult<Request> {
        match self.tree.get(request_id.as_bytes())? {
            Some(bytes) => utils::decode(&bytes),
            None => Err(OrderError::RequestNotFound(request_id.to_string())),
        }
    }

    pub fn list(&self, status: Option<RequestStatus>) -> OrderResult<Vec<Request>> {
        let mut out = vec![];
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let request: Request = utils::decode(&bytes)?;
            if status.is_none_or(|s| s == request.status) {
                out.push(request);
            }
        }
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(out)
    }

    /// Reads a request inside a unit of work.
    pub(crate) fn load_tx(tree: &TransactionalTree, request_id: &str) -> TxResult<Request> {
        match tree.get(request_id.as_bytes())? {
            Some(bytes) => utils::decode(&bytes).or_abort(),
            None => super::error::abort(OrderError::RequestNotFound(request_id.to_string())),
        }
    }

    /// Reads a request and checks it still carries the version the caller planned against.
    pub(crate) fn load_versioned_tx(
        tree: &TransactionalTree,
        request_id: &str,
        expected_version: u64,
    ) -> TxResult<Request> {
        let current = Self::load_tx(tree, request_id)?;
        if current.version != expected_version {
            return super::error::abort(OrderError::ConcurrentModification(
                request_id.to_string(),
            ));
        }
        Ok(current)
    }

    /// Writes the request, bumping its version.
    pub(crate) fn save_tx(tree: &TransactionalTree, request: &Request) -> TxResult<Request> {
        let mut next = request.clone();
        next.version = request.version + 1;
        tree.insert(next.id.as_bytes(), utils::encode(&next).or_abort()?)?;
        Ok(next)
    }

    pub(crate) fn remove_tx(tree: &TransactionalTree, request_id: &str) -> TxResult<()> {
        tree.remove(request_id.as_bytes())?;
        Ok(())
    }
}
