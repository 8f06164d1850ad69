// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Load generation against a request/response service: the call scenario, the workers
//! running it and the aggregation of their results.

pub mod metrics;
pub mod scenario;
pub mod worker_pool;
