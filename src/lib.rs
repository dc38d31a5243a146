pub mod classifier;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod mailbox;
pub mod oauth;
pub mod output;
pub mod server;
pub mod sync;
