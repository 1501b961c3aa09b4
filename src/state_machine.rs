//! Request lifecycle: the closed set of transitions and the side effects each one implies.
//!
//! ```text
//! Pending ──approve──▶ Approved ──mark_ready──▶ ReadyForShipment ──deliver──▶ SoldOut
//!    │                  │   ▲                          │
//!    │ reject           │   └──────────abort───────────┘
//!    ▼                  │ cancel
//! Rejected   Cancelled ◀┘  (cancel also from Pending; from Approved it takes the stock back out)
//! ```
//!
//! [`plan`] never touches storage. It turns (request, transition) into a
//! [`TransitionPlan`] that the orchestrator applies as one unit of work.
use super::error::{OrderError, OrderResult};
use super::ledger::{CreditReason, LedgerOp};
use super::request::{Request, RequestStatus};
use super::types::{Money, TimeStamp};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// Actor used for cancellations issued by the system itself (no reason required).
pub const SYSTEM_ACTOR: &str = "system";

/// Fixed delivery markup: a sold request credits 1.5 × its cost.
pub fn delivery_markup() -> Decimal {
    Decimal::new(15, 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum Transition {
    #[n(0)]
    Approve,
    #[n(1)]
    Reject,
    #[n(2)]
    Cancel,
    #[n(3)]
    MarkReady,
    #[n(4)]
    Abort,
    #[n(5)]
    Deliver,
}

impl Transition {
    pub const ALL: [Transition; 6] = [
        Transition::Approve,
        Transition::Reject,
        Transition::Cancel,
        Transition::MarkReady,
        Transition::Abort,
        Transition::Deliver,
    ];

    pub fn target(self) -> RequestStatus {
        match self {
            Transition::Approve | Transition::Abort => RequestStatus::Approved,
            Transition::Reject => RequestStatus::Rejected,
            Transition::Cancel => RequestStatus::Cancelled,
            Transition::MarkReady => RequestStatus::ReadyForShipment,
            Transition::Deliver => RequestStatus::SoldOut,
        }
    }

    /// States this transition may start from.
    pub fn sources(self) -> &'static [RequestStatus] {
        match self {
            Transition::Approve | Transition::Reject => &[RequestStatus::Pending],
            Transition::Cancel => &[RequestStatus::Pending, RequestStatus::Approved],
            Transition::MarkReady => &[RequestStatus::Approved],
            Transition::Abort | Transition::Deliver => &[RequestStatus::ReadyForShipment],
        }
    }

    fn requires_reason(self, actor: &str) -> bool {
        match self {
            Transition::Reject | Transition::Abort => true,
            Transition::Cancel => actor != SYSTEM_ACTOR,
            Transition::Approve | Transition::MarkReady | Transition::Deliver => false,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Transition::Approve => "APPROVED",
            Transition::Reject => "REJECTED",
            Transition::Cancel => "CANCELLED",
            Transition::MarkReady => "READY_FOR_SHIPMENT",
            Transition::Abort => "SHIPMENT_ABORTED",
            Transition::Deliver => "SOLD_OUT",
        }
    }
}

impl FromStr for Transition {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "approve" => Ok(Transition::Approve),
            "reject" => Ok(Transition::Reject),
            "cancel" => Ok(Transition::Cancel),
            "mark_ready" | "markready" => Ok(Transition::MarkReady),
            "abort" => Ok(Transition::Abort),
            "deliver" => Ok(Transition::Deliver),
            _ => Err(OrderError::UnknownTransition(s.to_string())),
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Approve => "approve",
            Transition::Reject => "reject",
            Transition::Cancel => "cancel",
            Transition::MarkReady => "mark_ready",
            Transition::Abort => "abort",
            Transition::Deliver => "deliver",
        };
        f.write_str(name)
    }
}

/// Side effects of one validated transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub transition: Transition,
    pub from: RequestStatus,
    pub to: RequestStatus,
    pub inventory_delta: i64,
    pub ledger: Option<LedgerOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Request already sits in the target state; nothing to do.
    AlreadyApplied,
    Apply(TransitionPlan),
}

/// Validates `transition` against the request's current state and guards.
pub fn plan(
    request: &Request,
    transition: Transition,
    actor: &str,
    notes: &str,
) -> OrderResult<Decision> {
    if actor.trim().is_empty() {
        return Err(OrderError::MissingActor);
    }
    let target = transition.target();
    if request.status == target {
        return Ok(Decision::AlreadyApplied);
    }
    if !transition.sources().contains(&request.status) {
        return Err(OrderError::InvalidTransition {
            current: request.status,
            requested: target,
        });
    }
    if transition.requires_reason(actor) && notes.trim().is_empty() {
        return Err(OrderError::MissingReason(target));
    }

    let quantity = i64::try_from(request.requested_quantity).map_err(|_| OrderError::InvalidQuantity)?;
    let total_cost = request.total_cost()?;

    let (inventory_delta, ledger) = match transition {
        // goods arrive in the warehouse
        Transition::Approve => (quantity, None),
        Transition::Reject => (
            0,
            Some(LedgerOp::Restore {
                amount: total_cost,
                reason: CreditReason::Rejected,
            }),
        ),
        // goods already received go back out with the refund
        Transition::Cancel => (
            if request.status == RequestStatus::Approved { -quantity } else { 0 },
            Some(LedgerOp::Restore {
                amount: total_cost,
                reason: CreditReason::Cancelled,
            }),
        ),
        Transition::MarkReady | Transition::Abort => (0, None),
        // goods leave the warehouse
        Transition::Deliver => (
            -quantity,
            Some(LedgerOp::AddProfit {
                amount: delivery_amount(total_cost)?,
            }),
        ),
    };

    Ok(Decision::Apply(TransitionPlan {
        transition,
        from: request.status,
        to: target,
        inventory_delta,
        ledger,
    }))
}

pub fn delivery_amount(total_cost: Money) -> OrderResult<Money> {
    total_cost.try_scale(delivery_markup())
}

/// Writes the planned status, audit fields and note onto the request.
pub fn apply(request: &mut Request, plan: &TransitionPlan, actor: &str, notes: &str) {
    let now = TimeStamp::not_before(&request.last_activity());
    match plan.transition {
        Transition::Approve => {
            request.approved_by.get_or_insert_with(|| actor.to_string());
            request.decided_at.get_or_insert(now);
        }
        Transition::Reject | Transition::Cancel => {
            request.decided_at.get_or_insert(now);
        }
        Transition::Deliver => {
            request.received_by.get_or_insert_with(|| actor.to_string());
            request.received_at.get_or_insert(now);
        }
        Transition::MarkReady | Transition::Abort => {}
    }
    request.status = plan.to;

    let text = if notes.trim().is_empty() {
        format!("{:?} -> {:?}", plan.from, plan.to)
    } else {
        notes.trim().to_string()
    };
    request.append_note(actor, plan.transition.tag(), &text);
}
