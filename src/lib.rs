//! Private transaction manager: encrypts payloads for a chosen set of
//! recipients, stores them, distributes per-recipient copies to peer nodes and
//! enforces privacy-mode rules across related transactions.

pub mod codec;
pub mod config;
pub mod enclave;
pub mod error;
pub mod network;
pub mod payload;
pub mod pipeline;
pub mod privacy;
pub mod publisher;
pub mod shutdown;
pub mod storage;
pub mod transaction_manager;
pub mod types;
