// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Remote Procedure Call (RPC) over the broker.

/// This module contains the lookup responder implementation.
pub mod responder;

/// This module contains the client-side correlation router implementation.
pub mod router;

use std::env::{self, VarError};

/// Read an optional environment variable.
pub(crate) fn string_from_environment(key: &str) -> Result<Option<String>, String> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(format!("{key} is not valid unicode")),
    }
}

/// Read and parse an optional environment variable.
pub(crate) fn parsed_from_environment<T>(key: &str) -> Result<Option<T>, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    string_from_environment(key)?
        .map(|v| v.parse::<T>())
        .transpose()
        .map_err(|e| format!("{key}: {e}"))
}
