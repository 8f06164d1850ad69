// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-client scenario of the load run: register, then deposits and loans against the
//! registered account.

use std::fmt;

use serde_json::{json, Value};

use crate::rpc::router::random_hex;
use crate::rpc::{parsed_from_environment, string_from_environment};

/// DNIs known to be seeded, mixed into the run when fixed DNIs are enabled
pub const FIXED_DNIS: [&str; 7] = [
    "12345678", "23456789", "34567890", "45678901", "56789012", "67890123", "78901234",
];

/// Amounts a deposit is drawn from
pub const DEPOSIT_AMOUNTS: [u32; 6] = [50, 75, 100, 150, 200, 250];

/// Principals a loan is drawn from
pub const LOAN_PRINCIPALS: [u32; 4] = [200, 300, 400, 500];

/// Kind of call, as recorded in the metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Create a client and its account
    Register,
    /// The register reply lacked the client or account id
    RegisterParse,
    /// Deposit into the account
    Deposit,
    /// Request a loan for the client
    CreateLoan,
}

impl OperationKind {
    /// Name of the kind
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Register => "Register",
            OperationKind::RegisterParse => "RegisterParse",
            OperationKind::Deposit => "Deposit",
            OperationKind::CreateLoan => "CreateLoan",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the load run
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct ScenarioOptions {
    /// Independent workers, each with its own connection
    #[builder(default = "20")]
    workers: usize,
    /// Simulated clients registered by each worker
    #[builder(default = "60")]
    clients_per_worker: usize,
    /// Deposits per registered client
    #[builder(default = "2")]
    tx_per_client: usize,
    /// Loans per registered client
    #[builder(default = "1")]
    loans_per_client: usize,
    /// First DNI of the seeded range
    #[builder(default = "10_000_000")]
    seed_base: u32,
    /// Size of the seeded range
    #[builder(default = "10_000")]
    seed_count: u32,
    /// Mix the [`FIXED_DNIS`] into the run
    #[builder(default = "false")]
    use_fixed_dnis: bool,
}

impl ScenarioOptionsBuilder {
    /// Initialize the [`ScenarioOptionsBuilder`] from `WORKERS`, `CLIENTS_PER_WORKER`,
    /// `TX_PER_CLIENT`, `LOANS_PER_CLIENT`, `RENIEC_SEED_BASE`, `RENIEC_SEED_COUNT` and
    /// `USE_FIXED_DNIS` (`1`, `true` or `yes` enable it).
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of the environment variables are invalid.
    pub fn from_environment() -> Result<Self, String> {
        let mut builder = Self::default();
        builder.workers = parsed_from_environment("WORKERS")?;
        builder.clients_per_worker = parsed_from_environment("CLIENTS_PER_WORKER")?;
        builder.tx_per_client = parsed_from_environment("TX_PER_CLIENT")?;
        builder.loans_per_client = parsed_from_environment("LOANS_PER_CLIENT")?;
        builder.seed_base = parsed_from_environment("RENIEC_SEED_BASE")?;
        builder.seed_count = parsed_from_environment("RENIEC_SEED_COUNT")?;
        builder.use_fixed_dnis = string_from_environment("USE_FIXED_DNIS")?
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"));
        Ok(builder)
    }

    fn validate(&self) -> Result<(), String> {
        if self.seed_count == Some(0) {
            return Err("seed_count must be greater than zero".to_string());
        }
        Ok(())
    }
}

impl ScenarioOptions {
    /// Independent workers
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Simulated clients per worker
    #[must_use]
    pub fn clients_per_worker(&self) -> usize {
        self.clients_per_worker
    }

    /// Deposits per registered client
    #[must_use]
    pub fn tx_per_client(&self) -> usize {
        self.tx_per_client
    }

    /// Loans per registered client
    #[must_use]
    pub fn loans_per_client(&self) -> usize {
        self.loans_per_client
    }

    /// Whether fixed DNIs are mixed in
    #[must_use]
    pub fn use_fixed_dnis(&self) -> bool {
        self.use_fixed_dnis
    }

    /// DNI registered by client `client` of worker `worker`.
    ///
    /// Within one run no two workers pick the same seeded DNI, as long as the seeded range
    /// covers every client.
    #[must_use]
    pub fn pick_dni(&self, worker: usize, client: usize) -> String {
        if self.use_fixed_dnis && (worker + client) % 8 == 0 {
            return FIXED_DNIS[(worker + client) % FIXED_DNIS.len()].to_string();
        }
        let index = (worker * self.clients_per_worker + client) % self.seed_count as usize;
        format!("{:08}", u64::from(self.seed_base) + index as u64)
    }

    /// The seeded range as `(base, count)`
    #[must_use]
    pub fn seed_range(&self) -> (u32, u32) {
        (self.seed_base, self.seed_count)
    }
}

/// `m-` followed by six random hex characters
#[must_use]
pub fn message_id() -> String {
    format!("m-{}", random_hex(6))
}

/// Body registering a client with `dni` and an account holding `saldo`.
#[must_use]
pub fn register_body(dni: &str, saldo: f64) -> Value {
    json!({
        "type": "Register",
        "messageId": message_id(),
        "dni": dni,
        "password": "test123",
        "nombres": "TEST NOMBRE",
        "apellidoPat": "APELLIDO1",
        "apellidoMat": "APELLIDO2",
        "saldo": saldo,
    })
}

/// Body depositing `amount` into `account_id`.
#[must_use]
pub fn deposit_body(account_id: &Value, amount: u32) -> Value {
    json!({
        "type": "Deposit",
        "messageId": message_id(),
        "accountId": account_id,
        "amount": f64::from(amount),
    })
}

/// Body requesting a loan of `principal` for `client_id`, paid into `account_id`.
#[must_use]
pub fn create_loan_body(client_id: &Value, account_id: &Value, principal: u32) -> Value {
    json!({
        "type": "CreateLoan",
        "messageId": message_id(),
        "clientId": client_id,
        "accountId": account_id,
        "principal": f64::from(principal),
    })
}

/// Client and account ids of a register reply.
///
/// The client id is read from `data.clientId`, or `data.clienteId`. Ids that are missing,
/// null, false, zero or empty do not count.
#[must_use]
pub fn registration_ids(response: &Value) -> Option<(Value, Value)> {
    let data = response.get("data")?;
    let client_id = ["clientId", "clienteId"]
        .iter()
        .find_map(|field| data.get(field).filter(|v| is_present(v)))?;
    let account_id = data.get("accountId").filter(|v| is_present(v))?;
    Some((client_id.clone(), account_id.clone()))
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
