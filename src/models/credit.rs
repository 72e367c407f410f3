use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "credit_transaction_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CreditTransactionType {
    Earn,
    Spend,
    Freeze,
    Unfreeze,
}

impl CreditTransactionType {
    /// Signed effect of a transaction of this type on the spendable balance.
    pub fn signed_amount(&self, amount: i64) -> i64 {
        match self {
            CreditTransactionType::Earn | CreditTransactionType::Unfreeze => amount,
            CreditTransactionType::Spend | CreditTransactionType::Freeze => -amount,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "credit_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditSource {
    SubscriptionGrant,
    CreditPurchase,
    GenerationCost,
    SignupBonus,
    Admin,
    Refund,
    DisputeHold,
}

impl CreditSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditSource::SubscriptionGrant => "subscription_grant",
            CreditSource::CreditPurchase => "credit_purchase",
            CreditSource::GenerationCost => "generation_cost",
            CreditSource::SignupBonus => "signup_bonus",
            CreditSource::Admin => "admin",
            CreditSource::Refund => "refund",
            CreditSource::DisputeHold => "dispute_hold",
        }
    }
}

impl fmt::Display for CreditSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditAccount {
    pub user_id: Uuid,
    pub balance: i64,
    pub total_earned: i64,
    pub total_spent: i64,
    pub frozen_balance: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl CreditAccount {
    pub fn empty(user_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            balance: 0,
            total_earned: 0,
            total_spent: 0,
            frozen_balance: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub transaction_type: CreditTransactionType,
    pub amount: i64,
    pub balance_after: i64,
    pub source: CreditSource,
    pub description: String,
    pub reference_id: Option<String>,
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Input for a balance-affecting ledger call (grant or spend).
#[derive(Debug, Clone, PartialEq)]
pub struct CreditMutation {
    pub user_id: Uuid,
    pub amount: i64,
    pub source: CreditSource,
    pub description: String,
    pub reference_id: Option<String>,
    pub metadata: Value,
}

impl CreditMutation {
    pub fn new(
        user_id: Uuid,
        amount: i64,
        source: CreditSource,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            amount,
            source,
            description: description.into(),
            reference_id: None,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GrantOutcome {
    Granted {
        account: CreditAccount,
        transaction: CreditTransaction,
    },
    /// A transaction with the same reference already exists; nothing changed.
    AlreadyGranted { transaction: CreditTransaction },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpendOutcome {
    Spent {
        account: CreditAccount,
        transaction: CreditTransaction,
    },
    AlreadySpent { transaction: CreditTransaction },
    InsufficientBalance { balance: i64, required: i64 },
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FreezeOutcome {
    Frozen {
        account: CreditAccount,
        transaction: CreditTransaction,
    },
    InsufficientBalance { balance: i64, required: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnfreezeOutcome {
    Unfrozen {
        account: CreditAccount,
        transaction: CreditTransaction,
    },
    InsufficientFrozenBalance { frozen_balance: i64, required: i64 },
}
