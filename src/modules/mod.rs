pub mod gateway;
pub mod health;
pub mod ingest;
pub mod producer;
pub mod public_key;
pub mod registry;
pub mod signer;
