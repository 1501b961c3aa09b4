//! Distributed-mode tests: the ledger sits in its own database behind a gateway that
//! can fail or stall, and the coordinator must leave both sides consistent.
use replenishment_engine::{
    OrderError, OrderResult, PlaceOrder, RequestStatus, Transition,
    catalog::{Product, ProductCatalog},
    config::EngineConfig,
    inventory::InventoryStore,
    ledger::{EntryContext, Ledger, LedgerAccount, LedgerOp},
    saga::{LedgerGateway, SagaCoordinator, SagaStep},
    types::Money,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Forwards to a real ledger, optionally failing or stalling profit credits.
struct FlakyGateway {
    ledger: Ledger,
    fail_profit: AtomicBool,
    stall: Option<Duration>,
    on_apply: Option<Box<dyn Fn() + Send + Sync>>,
}

impl FlakyGateway {
    fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            fail_profit: AtomicBool::new(false),
            stall: None,
            on_apply: None,
        }
    }
}

impl LedgerGateway for FlakyGateway {
    fn apply(&self, op_id: &str, op: &LedgerOp, ctx: &EntryContext) -> OrderResult<Money> {
        if let Some(hook) = &self.on_apply {
            hook();
        }
        if matches!(op, LedgerOp::AddProfit { .. }) {
            if self.fail_profit.load(Ordering::SeqCst) {
                return Err(OrderError::StorageFailure("ledger service unavailable".into()));
            }
            if let Some(stall) = self.stall {
                std::thread::sleep(stall);
            }
        }
        Ok(self.ledger.apply_once(op_id, op, ctx)?.balance_after)
    }

    fn revert(&self, op_id: &str) -> OrderResult<()> {
        self.ledger.revert(op_id, "saga").map(|_| ())
    }

    fn account(&self) -> OrderResult<LedgerAccount> {
        self.ledger.account()
    }
}

struct Harness {
    coordinator: SagaCoordinator,
    ledger: Ledger,
    inventory: InventoryStore,
}

fn harness(configure: impl FnOnce(&mut FlakyGateway, &InventoryStore)) -> Harness {
    let local = sled::Config::new().temporary(true).open().unwrap();
    let remote = sled::Config::new().temporary(true).open().unwrap();

    let ledger = Ledger::open(&remote).unwrap();
    ledger.initialize(Money::from_units(1000), "system").unwrap();

    let catalog = ProductCatalog::open(&local).unwrap();
    catalog
        .upsert(&Product {
            id: 7,
            name: "widget".into(),
            unit_price: Money::new(dec!(5)),
        })
        .unwrap();

    let inventory = InventoryStore::open(&local).unwrap();
    let mut gateway = FlakyGateway::new(ledger.clone());
    configure(&mut gateway, &inventory);

    let config = EngineConfig::default().with_remote_timeout(Duration::from_millis(100));
    let coordinator =
        SagaCoordinator::open(&local, Arc::new(gateway), Arc::new(catalog), &config).unwrap();
    Harness {
        coordinator,
        ledger,
        inventory,
    }
}

fn ready_request(h: &Harness) -> String {
    let request = h
        .coordinator
        .place_order(PlaceOrder::new(7, 10, "alice"))
        .unwrap();
    h.coordinator
        .transition(&request.id, Transition::Approve, "bob", "")
        .unwrap();
    h.coordinator
        .transition(&request.id, Transition::MarkReady, "bob", "")
        .unwrap();
    request.id
}

#[test]
fn saga_runs_the_full_lifecycle() {
    let h = harness(|_, _| {});
    let id = ready_request(&h);
    assert_eq!(h.ledger.account().unwrap().available_budget, Money::from_units(950));
    assert_eq!(h.inventory.get(7, "main").unwrap().unwrap().quantity_in_stock, 10);

    let sold = h
        .coordinator
        .transition(&id, Transition::Deliver, "dave", "")
        .unwrap();
    assert_eq!(sold.new_status, RequestStatus::SoldOut);
    assert_eq!(sold.ledger_balance_after, Some(Money::from_units(1025)));
    assert_eq!(h.coordinator.get_account().unwrap().current_revenue, Money::from_units(75));
    assert_eq!(h.inventory.get(7, "main").unwrap().unwrap().quantity_in_stock, 0);

    let request = h.coordinator.get_request(&id).unwrap();
    assert!(request.pending_saga.is_none());
    let steps: Vec<_> = h
        .coordinator
        .sagas_for(&id)
        .unwrap()
        .into_iter()
        .map(|s| s.step)
        .collect();
    // place + deliver; approve and mark_ready have no ledger effect
    assert_eq!(steps, vec![SagaStep::Completed, SagaStep::Completed]);
    h.ledger.verify().unwrap();
}

#[test]
fn remote_failure_restores_the_request() {
    let h = harness(|gateway, _| gateway.fail_profit.store(true, Ordering::SeqCst));
    let id = ready_request(&h);
    let before = h.coordinator.get_request(&id).unwrap();

    let err = h
        .coordinator
        .transition(&id, Transition::Deliver, "dave", "")
        .unwrap_err();
    assert_eq!(err, OrderError::StorageFailure("ledger service unavailable".into()));

    let after = h.coordinator.get_request(&id).unwrap();
    assert_eq!(after.status, RequestStatus::ReadyForShipment);
    assert!(after.pending_saga.is_none());
    assert_eq!(after.notes, before.notes);
    assert_eq!(h.inventory.get(7, "main").unwrap().unwrap().quantity_in_stock, 10);
    assert_eq!(h.ledger.account().unwrap().available_budget, Money::from_units(950));

    let compensated = h
        .coordinator
        .sagas_for(&id)
        .unwrap()
        .into_iter()
        .filter(|s| s.step == SagaStep::Compensated)
        .count();
    assert_eq!(compensated, 1);
}

#[test]
fn remote_timeout_is_compensated() {
    let h = harness(|gateway, _| gateway.stall = Some(Duration::from_millis(400)));
    let id = ready_request(&h);

    let err = h
        .coordinator
        .transition(&id, Transition::Deliver, "dave", "")
        .unwrap_err();
    assert_eq!(err, OrderError::RemoteTimeout(100));
    assert_eq!(
        h.coordinator.get_request(&id).unwrap().status,
        RequestStatus::ReadyForShipment
    );

    // the stalled call lands after compensation and must be refused
    std::thread::sleep(Duration::from_millis(600));
    let account = h.ledger.account().unwrap();
    assert_eq!(account.available_budget, Money::from_units(950));
    assert_eq!(account.current_revenue, Money::ZERO);
    h.ledger.verify().unwrap();
}

#[test]
fn local_failure_after_remote_success_reverts_the_remote() {
    // stock disappears while the remote credit is in flight
    let h = harness(|gateway, inventory| {
        let inventory = inventory.clone();
        gateway.on_apply = Some(Box::new(move || {
            if let Some(counter) = inventory.get(7, "main").unwrap() {
                if counter.quantity_in_stock == 10 {
                    inventory.adjust(7, "main", -5).unwrap();
                }
            }
        }));
    });
    let id = ready_request(&h);

    let err = h
        .coordinator
        .transition(&id, Transition::Deliver, "dave", "")
        .unwrap_err();
    assert!(matches!(err, OrderError::InsufficientStock { in_stock: 5, .. }));

    assert_eq!(
        h.coordinator.get_request(&id).unwrap().status,
        RequestStatus::ReadyForShipment
    );
    let account = h.ledger.account().unwrap();
    assert_eq!(account.available_budget, Money::from_units(950));
    assert_eq!(account.current_revenue, Money::ZERO);
    h.ledger.verify().unwrap();
}

#[test]
fn saga_delete_and_reject_credit_the_remote_ledger() {
    let h = harness(|_, _| {});
    let a = h
        .coordinator
        .place_order(PlaceOrder::new(7, 4, "alice"))
        .unwrap();
    let b = h
        .coordinator
        .place_order(PlaceOrder::new(7, 6, "alice"))
        .unwrap();
    assert_eq!(h.ledger.account().unwrap().available_budget, Money::from_units(950));

    h.coordinator.delete_request(&a.id, "alice").unwrap();
    assert_eq!(
        h.coordinator.get_request(&a.id).unwrap_err(),
        OrderError::RequestNotFound(a.id.clone())
    );
    h.coordinator
        .execute(&b.id, "reject", "bob", "wrong size")
        .unwrap();
    assert_eq!(h.ledger.account().unwrap().available_budget, Money::from_units(1000));
    assert_eq!(h.coordinator.recover().unwrap(), 0);
}

#[test]
fn saga_cancel_after_approval_returns_stock() {
    let h = harness(|_, _| {});
    let request = h
        .coordinator
        .place_order(PlaceOrder::new(7, 6, "alice"))
        .unwrap();
    h.coordinator
        .transition(&request.id, Transition::Approve, "bob", "")
        .unwrap();
    assert_eq!(h.inventory.get(7, "main").unwrap().unwrap().quantity_in_stock, 6);

    let outcome = h
        .coordinator
        .transition(&request.id, Transition::Cancel, "bob", "supplier closed")
        .unwrap();
    assert_eq!(outcome.new_status, RequestStatus::Cancelled);
    assert_eq!(h.inventory.get(7, "main").unwrap().unwrap().quantity_in_stock, 0);
    assert_eq!(h.ledger.account().unwrap().available_budget, Money::from_units(1000));
    h.ledger.verify().unwrap();
}
