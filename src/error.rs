use thiserror::Error;

use crate::storage::StoreError;

/// Failures surfaced by the gate.
#[derive(Error, Debug)]
pub enum Error {
    /// The capture source is unavailable. Fatal to the polling loop.
    #[error("device error: {0:#}")]
    Device(anyhow::Error),

    /// Template store read or write failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A template that cannot be matched or stored.
    #[error("malformed template: {0}")]
    MalformedTemplate(String),

    /// The operator console could not be read or written.
    #[error("operator console: {0}")]
    Operator(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
