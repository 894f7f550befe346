//! Errors returned by the item store.

use thiserror::Error;

use crate::model::DataType;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The key, or the aux name of a `key.aux` address, is not defined.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// An item with this key was already added to the store.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The owner already registered this handler on the address.
    #[error("Duplicate subscription by {owner} on {address}")]
    DuplicateSubscription { owner: String, address: String },

    #[error("Unknown flag: {0}")]
    UnknownFlag(String),

    /// The value could not be converted to the item's declared type.
    #[error("Cannot convert '{value}' to {data_type} for {key}")]
    BadValue {
        key: String,
        value: String,
        data_type: DataType,
    },
}
