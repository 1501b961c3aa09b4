//! Property-based tests for the ledger and inventory invariants
//!
//! Random sequences of orders, transitions and deletions are played against a fresh
//! engine. Whatever subset of them succeeds, the account must agree with the final
//! request states, stock must match what was received and not yet sold, and the
//! journal must replay to the stored account.

use proptest::prelude::*;
use replenishment_engine::{
    OrderError, OrderService, PlaceOrder, RequestStatus,
    catalog::Product,
    config::EngineConfig,
    ledger::EntryType,
    types::Money,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

const TRANSITIONS: [&str; 6] = ["approve", "reject", "cancel", "mark_ready", "abort", "deliver"];

#[derive(Debug, Clone)]
enum Step {
    Place { product_id: u64, quantity: u64 },
    Transition { target: usize, name: &'static str },
    Delete { target: usize },
}

// PROPERTY TEST STRATEGIES

/// Strategy weighted towards transitions so requests actually move through the lifecycle
fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        2 => (1u64..=2, 1u64..=40).prop_map(|(product_id, quantity)| Step::Place { product_id, quantity }),
        5 => (0usize..8, 0usize..TRANSITIONS.len())
            .prop_map(|(target, i)| Step::Transition { target, name: TRANSITIONS[i] }),
        1 => (0usize..8).prop_map(|target| Step::Delete { target }),
    ]
}

fn engine() -> OrderService {
    let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
    let service = OrderService::open(db, &EngineConfig::default()).unwrap();
    service
        .catalog()
        .upsert(&Product {
            id: 1,
            name: "small".into(),
            unit_price: Money::new(dec!(2.50)),
        })
        .unwrap();
    service
        .catalog()
        .upsert(&Product {
            id: 2,
            name: "large".into(),
            unit_price: Money::new(dec!(7)),
        })
        .unwrap();
    service
}

/// Plays the steps, returning every request id ever created
fn play(service: &OrderService, steps: &[Step]) -> Vec<String> {
    let mut ids: Vec<String> = vec![];
    for step in steps {
        let result = match step {
            Step::Place { product_id, quantity } => service
                .place_order(PlaceOrder::new(*product_id, *quantity, "buyer"))
                .map(|r| ids.push(r.id)),
            Step::Transition { target, name } if !ids.is_empty() => service
                .execute(&ids[target % ids.len()], name, "clerk", "because")
                .map(|_| ()),
            Step::Delete { target } if !ids.is_empty() => {
                service.delete_request(&ids[target % ids.len()], "clerk")
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            assert!(
                !matches!(e, OrderError::StorageFailure(_)),
                "unexpected storage failure: {e}"
            );
        }
    }
    ids
}

// PROPERTY TESTS
proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: the budget equals the opening budget minus open commitments plus the
    /// profit of everything sold
    ///
    /// Rejected, cancelled and deleted requests net to zero, sold requests net to half
    /// their cost, and every other live request is still a debit.
    #[test]
    fn prop_budget_follows_request_states(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let service = engine();
        play(&service, &steps);

        let mut expected = Decimal::new(1000, 0);
        for request in service.list_requests(None).unwrap() {
            let cost = request.total_cost().unwrap().amount();
            expected += match request.status {
                RequestStatus::Rejected | RequestStatus::Cancelled => Decimal::ZERO,
                RequestStatus::SoldOut => cost * dec!(0.5),
                _ => -cost,
            };
        }
        let account = service.get_account().unwrap();
        prop_assert_eq!(account.available_budget.amount(), expected);
        prop_assert!(!account.available_budget.is_negative());
        prop_assert!(!account.total_spent.is_negative());
    }

    /// Property: stock equals what was received and not yet sold or cancelled
    ///
    /// Approval is the only increment. Delivery and a cancel after approval are the only
    /// decrements, so repeated transitions can never count a request twice.
    #[test]
    fn prop_stock_matches_received_goods(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let service = engine();
        play(&service, &steps);

        for product_id in [1u64, 2] {
            let expected: u64 = service
                .list_requests(None)
                .unwrap()
                .iter()
                .filter(|r| r.product_id == product_id)
                .filter(|r| {
                    r.approved_by.is_some()
                        && !matches!(r.status, RequestStatus::SoldOut | RequestStatus::Cancelled)
                })
                .map(|r| r.requested_quantity)
                .sum();
            let in_stock = service
                .inventory()
                .get(product_id, "main")
                .unwrap()
                .map(|c| c.quantity_in_stock)
                .unwrap_or(0);
            prop_assert_eq!(in_stock, expected);
        }
    }

    /// Property: every request has exactly one debit, and at most one closing credit
    #[test]
    fn prop_one_debit_per_request(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let service = engine();
        let ids = play(&service, &steps);

        for id in ids {
            let rows = service.ledger().transactions_for(&id).unwrap();
            let debits = rows.iter().filter(|r| r.entry_type == EntryType::DebitOrder).count();
            let credits = rows.len() - debits;
            prop_assert_eq!(debits, 1);
            prop_assert!(credits <= 1);
        }
    }

    /// Property: replaying the journal reproduces the stored account, digests included
    #[test]
    fn prop_journal_replays_to_account(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let service = engine();
        play(&service, &steps);

        let audit = service.verify_ledger().unwrap();
        prop_assert_eq!(audit.replayed.available_budget, audit.stored.available_budget);
        prop_assert_eq!(audit.replayed.current_revenue, audit.stored.current_revenue);
        prop_assert_eq!(audit.rows, audit.stored.transaction_count);
    }
}
