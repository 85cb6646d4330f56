//! Client for the Amazon Glacier archive service.
//!
//! Three layers: SigV4 request signing ([`signing`]), an explicit
//! single-connection HTTP(S) transport ([`http_connection`]), and the
//! vault/archive operations themselves ([`glacier`]).

pub mod glacier;
pub mod http_connection;
pub mod signing;

pub use glacier::{GlacierClient, VaultDescription, VaultList};
