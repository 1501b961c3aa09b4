//! Walks two requests through the engine against a throwaway database:
//! one delivered at a profit, one rejected and refunded.
use anyhow::Context;
use replenishment_engine::{
    OrderService, PlaceOrder, Transition,
    catalog::Product,
    config::EngineConfig,
    logging::init_logger,
    types::Money,
};
use rust_decimal::Decimal;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_logger(&config.log_level, config.log_json)?;

    let db = Arc::new(sled::Config::new().temporary(true).open()?);
    let service = OrderService::open(db, &config)?;

    service.catalog().upsert(&Product {
        id: 7,
        name: "espresso beans 1kg".into(),
        unit_price: Money::from_units(5),
    })?;
    service.catalog().upsert(&Product {
        id: 8,
        name: "paper cups x100".into(),
        unit_price: Money::new(Decimal::new(300, 2)),
    })?;
    service
        .inventory()
        .register(7, &config.default_warehouse, 5, 40)?;

    println!("opening budget: {}", service.get_account()?.available_budget);

    // r1: ordered, stocked, shipped, sold
    let r1 = service
        .place_order(PlaceOrder::new(7, 10, "alice").with_notes("weekly restock"))
        .context("placing r1")?;
    println!("r1 placed, budget {}", service.get_account()?.available_budget);

    for (transition, actor) in [
        (Transition::Approve, "bob"),
        (Transition::MarkReady, "carol"),
        (Transition::Deliver, "dave"),
    ] {
        let outcome = service.transition(&r1.id, transition, actor, "")?;
        println!(
            "r1 {transition}: {:?}, stock {:?}, budget {:?}",
            outcome.new_status, outcome.inventory_quantity, outcome.ledger_balance_after
        );
    }

    // r2: rejected before approval
    let r2 = service.place_order(PlaceOrder::new(8, 10, "alice"))?;
    println!("r2 placed, budget {}", service.get_account()?.available_budget);
    service.execute(&r2.id, "reject", "bob", "damaged in transit")?;
    match service.execute(&r2.id, "approve", "bob", "") {
        Ok(_) => println!("r2 approved after rejection?"),
        Err(e) => println!("r2 approve refused: {e}"),
    }

    let account = service.get_account()?;
    println!(
        "closing budget {}, revenue {}, spent {}",
        account.available_budget, account.current_revenue, account.total_spent
    );
    for row in service.list_transactions(10)? {
        println!(
            "  #{} {:?} {} -> {}",
            row.seq, row.entry_type, row.amount, row.balance_after
        );
    }

    let audit = service.verify_ledger()?;
    println!("journal verified: {} rows", audit.rows);
    Ok(())
}
