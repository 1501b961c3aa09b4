//! Transitions against a ledger that lives in another process.
//!
//! When the ledger cannot join the local sled transaction, every mutation runs as a
//! three step saga recorded in the `saga_log` tree:
//!
//! 1. **reserve**: the request is written in its tentative state, marked with
//!    `pending_saga`, and a `Reserved` record keeps the pre-call snapshot.
//! 2. **remote**: the ledger op goes to the [`LedgerGateway`] under a bounded timeout.
//! 3. **confirm**: inventory delta plus final request state, record `Completed`.
//!
//! A failure in step 2 or 3 reverts the remote op and restores the snapshot (record
//! `Compensated`). Records left `Reserved` by a crash are compensated by
//! [`SagaCoordinator::recover`].
use super::catalog::PriceLookup;
use super::config::EngineConfig;
use super::error::{AbortOnErr, OrderError, OrderResult, TxResult, abort};
use super::inventory::InventoryStore;
use super::ledger::{CreditReason, EntryContext, Ledger, LedgerAccount, LedgerOp};
use super::request::{Request, RequestStatus, RequestStore};
use super::service::{PlaceOrder, TransitionOutcome};
use super::state_machine::{self, Decision, Transition};
use super::types::{Money, TimeStamp};
use super::utils;
use chrono::Utc;
use sled::Transactional;
use std::sync::{Arc, mpsc};
use std::time::Duration;

pub const SAGA_LOG_TREE: &str = "saga_log";

/// Remote ledger contract. Both calls must be idempotent per `op_id`, and `revert` of an
/// op id that never applied must make any later `apply` of it fail.
pub trait LedgerGateway: Send + Sync {
    /// Applies the op and returns `balance_after`.
    fn apply(&self, op_id: &str, op: &LedgerOp, ctx: &EntryContext) -> OrderResult<Money>;
    fn revert(&self, op_id: &str) -> OrderResult<()>;
    fn account(&self) -> OrderResult<LedgerAccount>;
}

/// A sled-backed ledger served as a gateway, e.g. by the ledger service itself.
impl LedgerGateway for Ledger {
    fn apply(&self, op_id: &str, op: &LedgerOp, ctx: &EntryContext) -> OrderResult<Money> {
        Ok(self.apply_once(op_id, op, ctx)?.balance_after)
    }

    fn revert(&self, op_id: &str) -> OrderResult<()> {
        Ledger::revert(self, op_id, "saga").map(|_| ())
    }

    fn account(&self) -> OrderResult<LedgerAccount> {
        Ledger::account(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum SagaStep {
    #[n(0)]
    Reserved,
    #[n(1)]
    Completed,
    #[n(2)]
    Compensated,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct SagaRecord {
    #[n(0)]
    pub saga_id: String,
    #[n(1)]
    pub request_id: String,
    #[n(2)]
    pub step: SagaStep,
    #[n(3)]
    pub op: LedgerOp,
    #[n(4)]
    pub inventory_delta: i64,
    #[n(5)]
    pub before: Option<Request>, // None: request did not exist yet
    #[n(6)]
    pub after: Option<Request>, // None: request is removed on success
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
    #[n(8)]
    pub updated_at: TimeStamp<Utc>,
    #[n(9)]
    pub error: Option<String>,
}

impl SagaRecord {
    fn located(&self) -> OrderResult<&Request> {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .ok_or_else(|| OrderError::StorageFailure(format!("saga {} has no request", self.saga_id)))
    }
}

/// Runs `f` on a worker thread and gives up after `timeout`.
///
/// The worker is detached. After a timeout it keeps running to completion and its
/// result is dropped, so a late remote effect has to be refused by the remote side
/// (see `Ledger::revert` tombstones).
fn call_with_timeout<T, F>(timeout: Duration, f: F) -> OrderResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> OrderResult<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        // receiver may be gone after a timeout
        let _ = tx.send(f());
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(OrderError::RemoteTimeout(
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        )),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(OrderError::StorageFailure(
            "remote call worker exited without a result".into(),
        )),
    }
}

/// Orchestrator for deployments where the ledger is remote.
#[derive(Clone)]
pub struct SagaCoordinator {
    requests: RequestStore,
    inventory: InventoryStore,
    saga_log: sled::Tree,
    gateway: Arc<dyn LedgerGateway>,
    prices: Arc<dyn PriceLookup>,
    timeout: Duration,
    default_warehouse: String,
}

impl SagaCoordinator {
    pub fn open(
        db: &sled::Db,
        gateway: Arc<dyn LedgerGateway>,
        prices: Arc<dyn PriceLookup>,
        config: &EngineConfig,
    ) -> OrderResult<Self> {
        Ok(Self {
            requests: RequestStore::open(db)?,
            inventory: InventoryStore::open(db)?,
            saga_log: db.open_tree(SAGA_LOG_TREE)?,
            gateway,
            prices,
            timeout: config.remote_timeout,
            default_warehouse: config.default_warehouse.clone(),
        })
    }

    pub fn inventory(&self) -> &InventoryStore {
        &self.inventory
    }

    pub fn get_request(&self, request_id: &str) -> OrderResult<Request> {
        self.requests.get(request_id)
    }

    pub fn get_account(&self) -> OrderResult<LedgerAccount> {
        let gateway = self.gateway.clone();
        call_with_timeout(self.timeout, move || gateway.account())
    }

    pub fn saga(&self, saga_id: &str) -> OrderResult<Option<SagaRecord>> {
        match self.saga_log.get(saga_id.as_bytes())? {
            Some(bytes) => Ok(Some(utils::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn sagas_for(&self, request_id: &str) -> OrderResult<Vec<SagaRecord>> {
        let mut out = vec![];
        for entry in self.saga_log.iter() {
            let (_, bytes) = entry?;
            let record: SagaRecord = utils::decode(&bytes)?;
            if record.request_id == request_id {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn place_order(&self, order: PlaceOrder) -> OrderResult<Request> {
        let unit_cost = self.prices.unit_price(order.product_id)?;
        let warehouse_id = order
            .warehouse_id
            .unwrap_or_else(|| self.default_warehouse.clone());
        let mut request = Request::new(
            order.product_id,
            warehouse_id,
            order.requested_quantity,
            unit_cost,
            order.requested_by,
        )?;
        let requested_by = request.requested_by.clone();
        let text = if order.notes.trim().is_empty() {
            "order placed"
        } else {
            order.notes.trim()
        };
        request.append_note(&requested_by, "CREATED", text);

        let op = LedgerOp::Deduct {
            amount: request.total_cost()?,
        };
        let ctx = EntryContext::new(
            Some(&request.id),
            &requested_by,
            format!("order {} x{}", request.id, request.requested_quantity),
        );
        let (placed, _, _) = self.run(None, Some(request), op, 0, ctx)?;
        placed.ok_or_else(|| OrderError::StorageFailure("order saga finished without a request".into()))
    }

    pub fn execute(
        &self,
        request_id: &str,
        transition_name: &str,
        actor: &str,
        notes: &str,
    ) -> OrderResult<TransitionOutcome> {
        let transition: Transition = transition_name.parse()?;
        self.transition(request_id, transition, actor, notes)
    }

    pub fn transition(
        &self,
        request_id: &str,
        transition: Transition,
        actor: &str,
        notes: &str,
    ) -> OrderResult<TransitionOutcome> {
        let request = self.requests.get(request_id)?;
        if request.pending_saga.is_some() {
            return Err(OrderError::ConcurrentModification(request.id));
        }
        let plan = match state_machine::plan(&request, transition, actor, notes)? {
            Decision::AlreadyApplied => {
                return Ok(TransitionOutcome {
                    request_id: request.id,
                    new_status: request.status,
                    applied: false,
                    version: request.version,
                    inventory_quantity: None,
                    ledger_balance_after: None,
                });
            }
            Decision::Apply(plan) => plan,
        };
        if plan.inventory_delta < 0 {
            self.inventory
                .check(request.product_id, &request.warehouse_id, plan.inventory_delta)?;
        }

        let mut next = request.clone();
        state_machine::apply(&mut next, &plan, actor, notes);

        let Some(op) = plan.ledger.clone() else {
            return self.commit_local(&request, &next, plan.inventory_delta);
        };
        let ctx = EntryContext::new(Some(&request.id), actor, format!("{transition} {}", request.id));
        let (saved, quantity, balance) =
            self.run(Some(request), Some(next), op, plan.inventory_delta, ctx)?;
        let saved = saved.ok_or_else(|| {
            OrderError::StorageFailure("transition saga finished without a request".into())
        })?;

        Ok(TransitionOutcome {
            request_id: saved.id,
            new_status: saved.status,
            applied: true,
            version: saved.version,
            inventory_quantity: quantity,
            ledger_balance_after: Some(balance),
        })
    }

    pub fn delete_request(&self, request_id: &str, actor: &str) -> OrderResult<()> {
        if actor.trim().is_empty() {
            return Err(OrderError::MissingActor);
        }
        let request = self.requests.get(request_id)?;
        if request.pending_saga.is_some() {
            return Err(OrderError::ConcurrentModification(request.id));
        }
        if request.status != RequestStatus::Pending {
            return Err(OrderError::NotDeletable(request.status));
        }
        let op = LedgerOp::Restore {
            amount: request.total_cost()?,
            reason: CreditReason::Deleted,
        };
        let ctx = EntryContext::new(
            Some(&request.id),
            actor,
            format!("pending request {} deleted", request.id),
        );
        self.run(Some(request), None, op, 0, ctx)?;
        Ok(())
    }

    /// Compensates every saga a crash left in `Reserved`. Returns how many were rolled back.
    pub fn recover(&self) -> OrderResult<usize> {
        let mut stuck = vec![];
        for entry in self.saga_log.iter() {
            let (_, bytes) = entry?;
            let record: SagaRecord = utils::decode(&bytes)?;
            if record.step == SagaStep::Reserved {
                stuck.push(record);
            }
        }
        let count = stuck.len();
        for record in stuck {
            tracing::warn!(saga_id = %record.saga_id, request_id = %record.request_id, "recovering interrupted saga");
            self.compensate(&record, "interrupted before completion")?;
        }
        Ok(count)
    }

    /// Transitions with no ledger effect need no saga.
    fn commit_local(
        &self,
        request: &Request,
        next: &Request,
        inventory_delta: i64,
    ) -> OrderResult<TransitionOutcome> {
        let (saved, quantity) = (self.requests.tree(), self.inventory.tree())
            .transaction(|(requests, inventory)| -> TxResult<(Request, Option<u64>)> {
                RequestStore::load_versioned_tx(requests, &request.id, request.version)?;
                let quantity = match inventory_delta {
                    0 => None,
                    delta => Some(InventoryStore::adjust_tx(
                        inventory,
                        request.product_id,
                        &request.warehouse_id,
                        delta,
                    )?),
                };
                Ok((RequestStore::save_tx(requests, next)?, quantity))
            })?;
        Ok(TransitionOutcome {
            request_id: saved.id,
            new_status: saved.status,
            applied: true,
            version: saved.version,
            inventory_quantity: quantity,
            ledger_balance_after: None,
        })
    }

    fn run(
        &self,
        before: Option<Request>,
        after: Option<Request>,
        op: LedgerOp,
        inventory_delta: i64,
        ctx: EntryContext,
    ) -> OrderResult<(Option<Request>, Option<u64>, Money)> {
        let record = self.reserve(before, after, op, inventory_delta)?;
        tracing::debug!(saga_id = %record.saga_id, request_id = %record.request_id, "saga reserved");

        let gateway = self.gateway.clone();
        let (saga_id, op) = (record.saga_id.clone(), record.op.clone());
        let remote = call_with_timeout(self.timeout, move || gateway.apply(&saga_id, &op, &ctx));

        let balance = match remote {
            Ok(balance) => balance,
            Err(e) => {
                self.compensate(&record, &e.to_string())?;
                return Err(e);
            }
        };

        match self.confirm(&record) {
            Ok((saved, quantity)) => {
                tracing::info!(
                    saga_id = %record.saga_id,
                    request_id = %record.request_id,
                    balance_after = %balance,
                    "saga completed"
                );
                Ok((saved, quantity, balance))
            }
            Err(e) => {
                self.compensate(&record, &e.to_string())?;
                Err(e)
            }
        }
    }

    pub(crate) fn reserve(
        &self,
        before: Option<Request>,
        after: Option<Request>,
        op: LedgerOp,
        inventory_delta: i64,
    ) -> OrderResult<SagaRecord> {
        let saga_id = utils::new_uuid_to_bech32("saga_")
            .map_err(|e| OrderError::StorageFailure(format!("id generation: {e}")))?;
        let now = TimeStamp::new();
        let mut record = SagaRecord {
            saga_id: saga_id.clone(),
            request_id: String::new(),
            step: SagaStep::Reserved,
            op,
            inventory_delta,
            before,
            after,
            created_at: now.clone(),
            updated_at: now,
            error: None,
        };
        record.request_id = record.located()?.id.clone();

        // the tentative row: final state if there is one, otherwise the current one
        let mut tentative = record.located()?.clone();
        tentative.pending_saga = Some(saga_id);

        let saved = (self.requests.tree(), &self.saga_log).transaction(
            |(requests, log)| -> TxResult<SagaRecord> {
                let mut record = record.clone();
                let mut tentative = tentative.clone();
                match &record.before {
                    Some(before) => {
                        let current =
                            RequestStore::load_versioned_tx(requests, &before.id, before.version)?;
                        tentative.version = current.version;
                    }
                    None => {
                        if requests.get(record.request_id.as_bytes())?.is_some() {
                            return abort(OrderError::ConcurrentModification(
                                record.request_id.clone(),
                            ));
                        }
                    }
                }
                let written = RequestStore::save_tx(requests, &tentative)?;
                if let Some(after) = record.after.as_mut() {
                    after.version = written.version;
                }
                log.insert(record.saga_id.as_bytes(), utils::encode(&record).or_abort()?)?;
                Ok(record)
            },
        )?;
        Ok(saved)
    }

    fn confirm(&self, record: &SagaRecord) -> OrderResult<(Option<Request>, Option<u64>)> {
        let located = record.located()?.clone();
        let result = (self.requests.tree(), self.inventory.tree(), &self.saga_log).transaction(
            |(requests, inventory, log)| -> TxResult<(Option<Request>, Option<u64>)> {
                let current = RequestStore::load_tx(requests, &record.request_id)?;
                if current.pending_saga.as_deref() != Some(record.saga_id.as_str()) {
                    return abort(OrderError::ConcurrentModification(record.request_id.clone()));
                }
                let quantity = match record.inventory_delta {
                    0 => None,
                    delta => Some(InventoryStore::adjust_tx(
                        inventory,
                        located.product_id,
                        &located.warehouse_id,
                        delta,
                    )?),
                };
                let saved = match &record.after {
                    Some(after) => {
                        let mut finished = after.clone();
                        finished.pending_saga = None;
                        finished.version = current.version;
                        Some(RequestStore::save_tx(requests, &finished)?)
                    }
                    None => {
                        RequestStore::remove_tx(requests, &record.request_id)?;
                        None
                    }
                };
                let mut done = record.clone();
                done.step = SagaStep::Completed;
                done.updated_at = TimeStamp::not_before(&record.updated_at);
                log.insert(done.saga_id.as_bytes(), utils::encode(&done).or_abort()?)?;
                Ok((saved, quantity))
            },
        )?;
        Ok(result)
    }

    /// Reverts the remote op, then puts the request back the way it was before the saga.
    fn compensate(&self, record: &SagaRecord, reason: &str) -> OrderResult<()> {
        let gateway = self.gateway.clone();
        let saga_id = record.saga_id.clone();
        if let Err(e) = call_with_timeout(self.timeout, move || gateway.revert(&saga_id)) {
            // record stays Reserved so recover() retries it
            tracing::error!(saga_id = %record.saga_id, error = %e, "remote compensation failed");
            return Err(e);
        }

        (self.requests.tree(), &self.saga_log).transaction(|(requests, log)| -> TxResult<()> {
            let current = match requests.get(record.request_id.as_bytes())? {
                Some(bytes) => Some(utils::decode::<Request>(&bytes).or_abort()?),
                None => None,
            };
            match (&record.before, current) {
                (Some(before), Some(current)) => {
                    let mut restored = before.clone();
                    restored.pending_saga = None;
                    restored.version = current.version;
                    RequestStore::save_tx(requests, &restored)?;
                }
                (None, Some(_)) => RequestStore::remove_tx(requests, &record.request_id)?,
                // already gone: the reservation never landed or was cleaned up
                (_, None) => {}
            }
            let mut undone = record.clone();
            undone.step = SagaStep::Compensated;
            undone.updated_at = TimeStamp::not_before(&record.updated_at);
            undone.error = Some(reason.to_string());
            log.insert(undone.saga_id.as_bytes(), utils::encode(&undone).or_abort()?)?;
            Ok(())
        })?;

        tracing::warn!(saga_id = %record.saga_id, request_id = %record.request_id, reason, "saga compensated");
        Ok(())
    }
}
