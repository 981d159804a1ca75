pub mod api;
pub mod client;
pub mod party_info;
pub mod peer_validator;
pub mod poller;
pub mod server;
