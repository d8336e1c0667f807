//! Transport backend implementations.
//!
//! Each backend is a separate type implementing the `Transport` trait; only
//! the factory maps tags to types.

pub mod amqp;
pub mod memory;
pub mod sqs;

pub use amqp::AmqpTransport;
pub use memory::InMemoryTransport;
pub use sqs::SqsTransport;

/// Address with any password replaced, safe to log and to put in errors
pub(crate) fn redact_address(address: &str) -> String {
    match url::Url::parse(address) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("***")).is_ok() {
                parsed.to_string()
            } else {
                "<redacted>".to_string()
            }
        }
        Ok(_) => address.to_string(),
        Err(_) => "<unparseable address>".to_string(),
    }
}
