//! Smoke Screen Unit tests for the replenishment engine components
//!
//! These tests span the public surface of the crate and check each piece in
//! isolation from the integration scenarios. They are intended as a smoke-screen
//! and mostly cover the happy path.
//!
use chrono::{Datelike, Timelike, Utc};
use replenishment_engine::{
    OrderError, RequestStatus, Transition,
    inventory::InventoryStore,
    request::Request,
    state_machine::{self, Decision},
    types::{Money, TimeStamp},
    utils::new_uuid_to_bech32,
};
use rust_decimal_macros::dec;

// UTILS MODULE TESTS
#[cfg(test)]
mod utils_tests {
    use super::*;

    /// Ids carry their human-readable prefix
    #[test]
    fn generates_valid_bech32_with_hrp() {
        let encoded = new_uuid_to_bech32("req_").unwrap();
        assert!(encoded.starts_with("req_1"));
        assert!(encoded.len() > 10);
    }

    /// An empty prefix is not a valid bech32 hrp
    #[test]
    fn handles_empty_hrp() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    #[test]
    fn generates_unique_ids() {
        let id1 = new_uuid_to_bech32("ltx_").unwrap();
        let id2 = new_uuid_to_bech32("ltx_").unwrap();
        assert_ne!(id1, id2);
    }
}

// TYPES MODULE TESTS
#[cfg(test)]
mod types_tests {
    use super::*;

    /// TimeStamp::new() is close to the current time
    #[test]
    fn timestamp_new_creates_current_time() {
        let ts = TimeStamp::new();
        let diff = (Utc::now() - ts.to_datetime_utc()).num_seconds().abs();
        assert!(diff < 1);
    }

    #[test]
    fn timestamp_new_with_sets_fields() {
        let ts = TimeStamp::new_with(2024, 6, 15, 10, 30, 45);
        let dt = ts.to_datetime_utc();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2024, 6, 15));
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (10, 30, 45));
    }

    /// not_before never goes backwards, even when the floor lies in the future
    #[test]
    fn timestamp_not_before_is_monotonic() {
        let future = TimeStamp::new_with(2200, 1, 1, 0, 0, 0);
        assert_eq!(TimeStamp::not_before(&future), future);
    }

    #[test]
    fn money_arithmetic_is_exact() {
        let price = Money::new(dec!(0.10));
        assert_eq!(price.try_mul(3).unwrap(), Money::new(dec!(0.30)));
        assert_eq!(
            Money::from_units(1).try_sub(Money::new(dec!(0.01))).unwrap(),
            Money::new(dec!(0.99))
        );
        assert_eq!("12.5".parse::<Money>().unwrap(), Money::new(dec!(12.50)));
        assert_eq!(Money::new(dec!(7)).to_string(), "7.00");
    }
}

// STATE MACHINE TESTS
#[cfg(test)]
mod state_machine_tests {
    use super::*;

    fn pending() -> Request {
        Request::new(7, "main".into(), 10, Money::new(dec!(5)), "alice".into()).unwrap()
    }

    #[test]
    fn transition_names_parse() {
        assert_eq!("approve".parse::<Transition>().unwrap(), Transition::Approve);
        assert_eq!("Mark-Ready".parse::<Transition>().unwrap(), Transition::MarkReady);
        assert_eq!("deliver".parse::<Transition>().unwrap(), Transition::Deliver);
        assert!("sold".parse::<Transition>().is_err());
        assert!(matches!(
            "ship-it".parse::<Transition>(),
            Err(OrderError::UnknownTransition(_))
        ));
    }

    #[test]
    fn approve_plans_stock_but_no_ledger_row() {
        let plan = match state_machine::plan(&pending(), Transition::Approve, "bob", "").unwrap() {
            Decision::Apply(plan) => plan,
            Decision::AlreadyApplied => panic!("approve should apply"),
        };
        assert_eq!(plan.to, RequestStatus::Approved);
        assert_eq!(plan.inventory_delta, 10);
        assert!(plan.ledger.is_none());
    }

    #[test]
    fn delivery_amount_is_one_and_a_half_times_cost() {
        assert_eq!(
            state_machine::delivery_amount(Money::from_units(50)).unwrap(),
            Money::from_units(75)
        );
        assert_eq!(
            state_machine::delivery_amount(Money::new(dec!(0.01))).unwrap(),
            Money::new(dec!(0.015))
        );
    }

    #[test]
    fn terminal_states() {
        assert!(RequestStatus::SoldOut.is_terminal());
        assert!(RequestStatus::Rejected.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(!RequestStatus::ReadyForShipment.is_terminal());
    }
}

// INVENTORY TESTS
#[cfg(test)]
mod inventory_tests {
    use super::*;

    #[test]
    fn counters_are_per_warehouse() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let inventory = InventoryStore::open(&db).unwrap();
        inventory.register(7, "north", 5, 50).unwrap();

        assert_eq!(inventory.adjust(7, "north", 3).unwrap(), 3);
        assert_eq!(inventory.adjust(7, "south", 8).unwrap(), 8);
        assert_eq!(inventory.get_by_product(7).unwrap().len(), 2);

        let below: Vec<_> = inventory
            .below_minimum()
            .unwrap()
            .into_iter()
            .map(|c| c.warehouse_id)
            .collect();
        assert_eq!(below, vec!["north".to_string()]);
        assert_eq!(inventory.list_low(3).unwrap().len(), 1);
    }
}
