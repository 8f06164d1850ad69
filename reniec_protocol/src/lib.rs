// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Request/response RPC over a shared MQTT broker.
//!
//! Requests are consumed from a durable shared queue by an [`rpc::responder::RpcResponder`]
//! and answered on the reply topic named by the caller, echoing its correlation data.
//! Callers multiplex many in-flight calls over one reply subscription with an
//! [`rpc::router::CorrelationRouter`]. The [`load`] module drives a multi-worker scenario
//! through routers and aggregates latencies.

#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod envelope;
pub mod load;
pub mod lookup;
pub mod rpc;

#[macro_use]
extern crate derive_builder;
