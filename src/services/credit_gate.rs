//! Credit protocol for generation requests: pre-check the balance, run the
//! external work outside any lock, then spend against the task id.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::credit::{CreditMutation, CreditSource, CreditTransaction, SpendOutcome};
use crate::services::generation::{
    GenerationClient, GenerationError, GenerationRequest, GenerationResult,
};
use crate::services::ledger::{CreditLedger, LedgerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Low resolution draft; free.
    Preview,
    Image,
    ImageHd,
    Video,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Preview => "preview",
            OperationType::Image => "image",
            OperationType::ImageHd => "image_hd",
            OperationType::Video => "video",
        }
    }

    pub fn cost(&self) -> i64 {
        match self {
            OperationType::Preview => 0,
            OperationType::Image => 10,
            OperationType::ImageHd => 20,
            OperationType::Video => 50,
        }
    }

    pub fn uses_points(&self) -> bool {
        self.cost() > 0
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditCheckDetails {
    pub current_balance: i64,
    pub required_points: i64,
    pub shortfall: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditCheck {
    pub uses_points: bool,
    pub can_proceed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<CreditCheckDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deduction {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<CreditTransaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Deduction {
    fn ok(transaction: Option<CreditTransaction>) -> Self {
        Self {
            success: true,
            transaction,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreditGateError {
    #[error("insufficient credits: have {}, need {}", .0.current_balance, .0.required_points)]
    InsufficientCredits(CreditCheckDetails),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),
    /// The user received the generated output but was not charged.
    #[error("generation {} succeeded but credit deduction failed: {reason}", .result.task_id)]
    DeductionFailed {
        result: GenerationResult,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOutcome {
    pub result: GenerationResult,
    pub credits_spent: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_after: Option<i64>,
}

#[derive(Clone)]
pub struct CreditGate {
    ledger: CreditLedger,
}

impl CreditGate {
    pub fn new(ledger: CreditLedger) -> Self {
        Self { ledger }
    }

    pub async fn check_credits(
        &self,
        user_id: Uuid,
        operation: OperationType,
    ) -> Result<CreditCheck, LedgerError> {
        let required = operation.cost();
        if !operation.uses_points() {
            return Ok(CreditCheck {
                uses_points: false,
                can_proceed: true,
                details: None,
            });
        }

        let balance = self
            .ledger
            .get_balance(user_id)
            .await?
            .map(|account| account.balance)
            .unwrap_or(0);

        Ok(CreditCheck {
            uses_points: true,
            can_proceed: balance >= required,
            details: Some(CreditCheckDetails {
                current_balance: balance,
                required_points: required,
                shortfall: (required - balance).max(0),
            }),
        })
    }

    /// Spends the operation's cost against `task_id`. A repeated call for the
    /// same task reports success with the original transaction.
    pub async fn deduct_credits(
        &self,
        user_id: Uuid,
        operation: OperationType,
        task_id: &str,
        metadata: Value,
    ) -> Deduction {
        if !operation.uses_points() {
            return Deduction::ok(None);
        }

        let mutation = CreditMutation::new(
            user_id,
            operation.cost(),
            CreditSource::GenerationCost,
            format!("{operation} generation"),
        )
        .with_reference(task_id)
        .with_metadata(metadata);

        match self.ledger.spend(mutation).await {
            Ok(SpendOutcome::Spent { transaction, .. })
            | Ok(SpendOutcome::AlreadySpent { transaction }) => Deduction::ok(Some(transaction)),
            Ok(SpendOutcome::InsufficientBalance { balance, required }) => Deduction::failed(
                format!("insufficient credits: balance {balance}, required {required}"),
            ),
            Ok(SpendOutcome::NotFound) => Deduction::failed("no credit account"),
            Err(err) => Deduction::failed(err.to_string()),
        }
    }

    /// Full request protocol. The ledger is not held during the external call,
    /// so a concurrent spend may drain the balance in between; that surfaces as
    /// `DeductionFailed`.
    pub async fn run(
        &self,
        user_id: Uuid,
        request: &GenerationRequest,
        generator: &dyn GenerationClient,
    ) -> Result<GateOutcome, CreditGateError> {
        let check = self.check_credits(user_id, request.operation).await?;
        if !check.can_proceed {
            if let Some(details) = check.details {
                info!(
                    %user_id,
                    operation = %request.operation,
                    balance = details.current_balance,
                    required = details.required_points,
                    "generation rejected before external call"
                );
                return Err(CreditGateError::InsufficientCredits(details));
            }
        }

        let result = generator.generate(request).await.map_err(|err| {
            warn!(%user_id, operation = %request.operation, ?err, "generation failed, nothing charged");
            err
        })?;

        let deduction = self
            .deduct_credits(
                user_id,
                request.operation,
                &result.task_id,
                json!({"operation": request.operation.as_str()}),
            )
            .await;

        if !deduction.success {
            let reason = deduction.error.unwrap_or_default();
            error!(
                critical = true,
                %user_id,
                task_id = %result.task_id,
                operation = %request.operation,
                cost = request.operation.cost(),
                %reason,
                "generation delivered but credit deduction failed"
            );
            return Err(CreditGateError::DeductionFailed { result, reason });
        }

        Ok(GateOutcome {
            credits_spent: deduction
                .transaction
                .as_ref()
                .map(|t| t.amount)
                .unwrap_or(0),
            balance_after: deduction.transaction.as_ref().map(|t| t.balance_after),
            result,
        })
    }
}
