//! Secret handling utilities.
//!
//! Re-exports the secrecy types the config uses, plus a helper for the one
//! place the database URL has to be exposed.

pub use secrecy::{ExposeSecret, SecretString};

/// The raw connection string, for handing to the connection pool only.
pub fn expose_database_url(url: &SecretString) -> &str {
    url.expose_secret()
}
