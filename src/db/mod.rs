pub mod auth_repository;
pub mod credit_repository;
pub mod payment_repository;
pub mod postgres_auth_repository;
pub mod postgres_credit_repository;
pub mod postgres_payment_repository;
pub mod postgres_user_mapping_repository;
pub mod user_mapping_repository;

#[cfg(test)]
pub mod mock_credit_repository;
#[cfg(test)]
pub mod mock_db;
#[cfg(test)]
pub mod mock_payment_repository;
