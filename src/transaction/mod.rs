//! Transaction Module - Saga Pattern
//! Multi-step operations with compensating actions

pub mod manager;
pub mod saga;
pub mod step;
pub mod types;

pub use manager::{TransactionManager, TransactionRecord};
pub use saga::SagaTransaction;
pub use step::TransactionStep;
pub use types::{
    TransactionError, TransactionEvent, TransactionOptions, TransactionResult, TransactionState,
};
