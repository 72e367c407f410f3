use std::sync::Arc;

use crate::services::credit_gate::CreditGate;
use crate::services::generation::GenerationClient;
use crate::services::ledger::CreditLedger;
use crate::services::payment_store::PaymentStore;
use crate::services::session_bridge::SessionBridge;
use crate::services::webhook::WebhookReconciler;

/// Names and flags for the session cookies of both auth systems.
#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub primary_name: String,
    pub legacy_name: String,
    pub secure: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub ledger: CreditLedger,
    pub payments: PaymentStore,
    pub webhooks: WebhookReconciler,
    pub credit_gate: CreditGate,
    pub generator: Arc<dyn GenerationClient>,
    pub sessions: SessionBridge,
    pub cookies: Arc<CookieSettings>,
}
