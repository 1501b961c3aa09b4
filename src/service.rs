//! Service layer API: the orchestrator every caller goes through
use super::catalog::{PriceLookup, ProductCatalog};
use super::config::EngineConfig;
use super::error::{OrderError, OrderResult, TxResult};
use super::inventory::InventoryStore;
use super::ledger::{
    CreditReason, EntryContext, Ledger, LedgerAccount, LedgerAudit, LedgerTransaction, LedgerTx,
};
use super::request::{Request, RequestStatus, RequestStore};
use super::state_machine::{self, Decision, Transition};
use super::types::Money;
use sled::Transactional;
use std::sync::Arc;

/// Order placement payload from the ordering collaborator.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub product_id: u64,
    pub warehouse_id: Option<String>,
    pub requested_quantity: u64,
    pub requested_by: String,
    pub notes: String,
}

impl PlaceOrder {
    pub fn new(product_id: u64, requested_quantity: u64, requested_by: &str) -> Self {
        Self {
            product_id,
            warehouse_id: None,
            requested_quantity,
            requested_by: requested_by.to_string(),
            notes: String::new(),
        }
    }
    pub fn in_warehouse(mut self, warehouse_id: &str) -> Self {
        self.warehouse_id = Some(warehouse_id.to_string());
        self
    }
    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = notes.to_string();
        self
    }
}

/// What a transition call reports back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub request_id: String,
    pub new_status: RequestStatus,
    /// false when the request already sat in the target state
    pub applied: bool,
    pub version: u64,
    pub inventory_quantity: Option<u64>,
    pub ledger_balance_after: Option<Money>,
}

/// Runs every request mutation as one sled transaction over the request, inventory and
/// ledger trees.
#[derive(Clone)]
pub struct OrderService {
    instance: Arc<sled::Db>,
    requests: RequestStore,
    inventory: InventoryStore,
    ledger: Ledger,
    catalog: ProductCatalog,
    prices: Arc<dyn PriceLookup>,
    default_warehouse: String,
}

impl OrderService {
    /// Opens the engine's trees and records the opening budget on a fresh ledger.
    pub fn open(instance: Arc<sled::Db>, config: &EngineConfig) -> OrderResult<Self> {
        let catalog = ProductCatalog::open(&instance)?;
        let ledger = Ledger::open(&instance)?;
        ledger.initialize(config.initial_budget, state_machine::SYSTEM_ACTOR)?;

        Ok(Self {
            requests: RequestStore::open(&instance)?,
            inventory: InventoryStore::open(&instance)?,
            ledger,
            prices: Arc::new(catalog.clone()),
            catalog,
            default_warehouse: config.default_warehouse.clone(),
            instance,
        })
    }

    /// Replaces the built-in catalog as the price source.
    pub fn with_price_lookup(mut self, prices: Arc<dyn PriceLookup>) -> Self {
        self.prices = prices;
        self
    }

    pub fn db(&self) -> &Arc<sled::Db> {
        &self.instance
    }

    pub fn catalog(&self) -> &ProductCatalog {
        &self.catalog
    }

    pub fn inventory(&self) -> &InventoryStore {
        &self.inventory
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Creates the request and its DEBIT_ORDER row together.
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
        let text = if order.notes.trim().is_empty() {
            "order placed"
        } else {
            order.notes.trim()
        };
        let requested_by = request.requested_by.clone();
        request.append_note(&requested_by, "CREATED", text);

        let total_cost = request.total_cost()?;
        let ctx = EntryContext::new(
            Some(&request.id),
            &request.requested_by,
            format!(
                "order {} x{} of product {}",
                request.id, request.requested_quantity, request.product_id
            ),
        );

        let (saved, row) = (
            self.requests.tree(),
            self.ledger.account_tree(),
            self.ledger.journal_tree(),
        )
            .transaction(
                |(requests, account, journal)| -> TxResult<(Request, LedgerTransaction)> {
                    let row = LedgerTx::new(account, journal).deduct(total_cost, &ctx)?;
                    let saved = RequestStore::save_tx(requests, &request)?;
                    Ok((saved, row))
                },
            )?;

        tracing::info!(
            request_id = %saved.id,
            product_id = saved.product_id,
            quantity = saved.requested_quantity,
            total_cost = %total_cost,
            balance_after = %row.balance_after,
            "order placed"
        );
        Ok(saved)
    }

    /// Parses `transition_name` and runs it. See [`OrderService::transition`].
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

    /// Moves a request through one transition, applying its inventory and ledger effects
    /// in the same unit of work.
    pub fn transition(
        &self,
        request_id: &str,
        transition: Transition,
        actor: &str,
        notes: &str,
    ) -> OrderResult<TransitionOutcome> {
        let request = self.requests.get(request_id)?;
        self.run_transition(request, transition, actor, notes)
    }

    /// Same as [`OrderService::transition`], for a caller that planned against an earlier
    /// read. Fails with `ConcurrentModification` if the request changed since.
    pub fn transition_at(
        &self,
        request_id: &str,
        expected_version: u64,
        transition: Transition,
        actor: &str,
        notes: &str,
    ) -> OrderResult<TransitionOutcome> {
        let request = self.requests.get(request_id)?;
        if request.version != expected_version {
            return Err(OrderError::ConcurrentModification(request_id.to_string()));
        }
        self.run_transition(request, transition, actor, notes)
    }

    fn run_transition(
        &self,
        request: Request,
        transition: Transition,
        actor: &str,
        notes: &str,
    ) -> OrderResult<TransitionOutcome> {
        if request.pending_saga.is_some() {
            return Err(OrderError::ConcurrentModification(request.id));
        }
        let plan = match state_machine::plan(&request, transition, actor, notes)? {
            Decision::AlreadyApplied => {
                tracing::debug!(request_id = %request.id, %transition, "already applied");
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

        let mut next = request.clone();
        state_machine::apply(&mut next, &plan, actor, notes);
        let ctx = EntryContext::new(
            Some(&request.id),
            actor,
            format!("{transition} {}", request.id),
        );

        let (saved, quantity, row) = (
            self.requests.tree(),
            self.inventory.tree(),
            self.ledger.account_tree(),
            self.ledger.journal_tree(),
        )
            .transaction(
                |(requests, inventory, account, journal)| -> TxResult<(
                    Request,
                    Option<u64>,
                    Option<LedgerTransaction>,
                )> {
                    RequestStore::load_versioned_tx(requests, &request.id, request.version)?;
                    let quantity = match plan.inventory_delta {
                        0 => None,
                        delta => Some(InventoryStore::adjust_tx(
                            inventory,
                            request.product_id,
                            &request.warehouse_id,
                            delta,
                        )?),
                    };
                    let row = match &plan.ledger {
                        Some(op) => Some(LedgerTx::new(account, journal).apply(op, &ctx)?),
                        None => None,
                    };
                    let saved = RequestStore::save_tx(requests, &next)?;
                    Ok((saved, quantity, row))
                },
            )
            .map_err(OrderError::from)
            .inspect_err(|e| {
                tracing::warn!(request_id = %request.id, %transition, error = %e, "transition rolled back")
            })?;

        tracing::info!(
            request_id = %saved.id,
            %transition,
            from = ?plan.from,
            to = ?plan.to,
            inventory_delta = plan.inventory_delta,
            balance_after = ?row.as_ref().map(|r| r.balance_after.to_string()),
            "transition applied"
        );

        Ok(TransitionOutcome {
            request_id: saved.id,
            new_status: saved.status,
            applied: true,
            version: saved.version,
            inventory_quantity: quantity,
            ledger_balance_after: row.map(|r| r.balance_after),
        })
    }

    /// Removes a pending request after crediting its cost back.
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
        let refund = request.total_cost()?;
        let ctx = EntryContext::new(
            Some(&request.id),
            actor,
            format!("pending request {} deleted", request.id),
        );

        let row = (
            self.requests.tree(),
            self.ledger.account_tree(),
            self.ledger.journal_tree(),
        )
            .transaction(
                |(requests, account, journal)| -> TxResult<LedgerTransaction> {
                    RequestStore::load_versioned_tx(requests, &request.id, request.version)?;
                    let row = LedgerTx::new(account, journal).restore(
                        refund,
                        CreditReason::Deleted,
                        &ctx,
                    )?;
                    RequestStore::remove_tx(requests, &request.id)?;
                    Ok(row)
                },
            )?;

        tracing::info!(request_id = %request.id, actor, balance_after = %row.balance_after, "pending request deleted");
        Ok(())
    }

    pub fn get_request(&self, request_id: &str) -> OrderResult<Request> {
        self.requests.get(request_id)
    }

    pub fn list_requests(&self, status: Option<RequestStatus>) -> OrderResult<Vec<Request>> {
        self.requests.list(status)
    }

    pub fn get_account(&self) -> OrderResult<LedgerAccount> {
        self.ledger.account()
    }

    /// Newest first.
    pub fn list_transactions(&self, limit: usize) -> OrderResult<Vec<LedgerTransaction>> {
        self.ledger.list_transactions(limit)
    }

    pub fn adjust_budget(
        &self,
        delta: Money,
        actor: &str,
        reason: &str,
    ) -> OrderResult<LedgerTransaction> {
        self.ledger.adjust(delta, actor, reason)
    }

    pub fn verify_ledger(&self) -> OrderResult<LedgerAudit> {
        self.ledger.verify()
    }
}
