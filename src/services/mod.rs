pub mod credit_gate;
pub mod generation;
pub mod ledger;
pub mod notifier;
pub mod payment_provider;
pub mod payment_store;
pub mod session_bridge;
pub mod webhook;
