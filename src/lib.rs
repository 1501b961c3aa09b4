pub mod catalog;
pub mod config;
pub mod error;
pub mod inventory;
pub mod ledger;
pub mod logging;
pub mod request;
pub mod saga;
pub mod service;
pub mod state_machine;
pub mod types;
pub mod utils;

pub use error::{OrderError, OrderResult};
pub use request::{Request, RequestStatus};
pub use service::{OrderService, PlaceOrder, TransitionOutcome};
pub use state_machine::Transition;
pub use types::{Money, TimeStamp};
