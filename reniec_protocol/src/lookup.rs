// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lookup of person records by DNI, and the health checks that keep the lookup connection alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error performing a lookup or managing its connection
#[derive(Debug, Error)]
pub enum LookupError {
    /// The backing store could not be reached
    #[error("lookup store unavailable: {0}")]
    Unavailable(String),
    /// The store was reached but the query failed
    #[error("lookup query failed: {0}")]
    Query(String),
    /// Schema or seed provisioning failed
    #[error("lookup setup failed: {0}")]
    Setup(String),
}

/// Fields of a person record other than the DNI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonDetails {
    /// Given names
    pub nombres: String,
    /// Paternal surname
    #[serde(rename = "apellidoPat")]
    pub apellido_pat: String,
    /// Maternal surname
    #[serde(rename = "apellidoMat")]
    pub apellido_mat: String,
    /// Date of birth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_naci: Option<NaiveDate>,
    /// Sex, `M` or `F`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sexo: Option<String>,
    /// Address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direccion: Option<String>,
    /// Marital status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estado_civil: Option<String>,
    /// Place of birth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lugar_nacimiento: Option<String>,
}

/// A person record as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonRecord {
    /// Normalized DNI
    pub dni: String,
    /// Remaining fields
    pub details: PersonDetails,
}

/// Storage collaborator resolving a normalized DNI to a record.
///
/// Implementations hold one connection that is not shared between concurrent callers.
#[async_trait]
pub trait Lookup: Send {
    /// Satisfy schema and seed prerequisites.
    async fn prepare(&mut self) -> Result<(), LookupError>;

    /// Find the record of `dni`. `Ok(None)` when the DNI is unknown.
    async fn lookup(&mut self, dni: &str) -> Result<Option<PersonRecord>, LookupError>;

    /// Cheap liveness check of the connection.
    async fn probe(&mut self) -> Result<(), LookupError>;

    /// Discard the connection and open a new one.
    async fn reconnect(&mut self) -> Result<(), LookupError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), LookupError>;
}

/// Health of the lookup connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupHealth {
    /// The last probe succeeded, or the connection was re-established
    Healthy,
    /// A probe is in progress
    Probing,
    /// The probe failed and a reconnect attempt is in progress
    Reconnecting {
        /// Attempt number, starting at 1
        attempt: u32,
    },
    /// Every reconnect attempt failed. The next check starts over.
    Unhealthy,
}

/// Options for [`HealthMonitor`]
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned", setter(into))]
pub struct HealthMonitorOptions {
    /// Reconnect attempts before giving up until the next check
    #[builder(default = "3")]
    max_attempts: u32,
    /// Wait after the first failed reconnect. Doubles after every further failure.
    #[builder(default = "Duration::from_millis(100)")]
    initial_backoff: Duration,
}

/// Probes a [`Lookup`] and re-establishes its connection with bounded retries.
pub struct HealthMonitor {
    health: LookupHealth,
    options: HealthMonitorOptions,
}

impl HealthMonitor {
    /// Create a monitor for a connection assumed healthy.
    #[must_use]
    pub fn new(options: HealthMonitorOptions) -> Self {
        Self {
            health: LookupHealth::Healthy,
            options,
        }
    }

    /// Current health
    #[must_use]
    pub fn health(&self) -> LookupHealth {
        self.health
    }

    /// Probe `lookup`, reconnecting it if the probe fails.
    ///
    /// Returns the resulting health, either [`LookupHealth::Healthy`] or
    /// [`LookupHealth::Unhealthy`].
    pub async fn check<L: Lookup + ?Sized>(&mut self, lookup: &mut L) -> LookupHealth {
        self.health = LookupHealth::Probing;
        let Err(e) = lookup.probe().await else {
            self.health = LookupHealth::Healthy;
            return self.health;
        };
        log::warn!("[reniec] Lookup probe failed: {e}");

        let mut backoff = self.options.initial_backoff;
        for attempt in 1..=self.options.max_attempts {
            self.health = LookupHealth::Reconnecting { attempt };
            match lookup.reconnect().await {
                Ok(()) => {
                    log::info!("[reniec] Lookup reconnected after {attempt} attempt(s)");
                    self.health = LookupHealth::Healthy;
                    return self.health;
                }
                Err(e) => {
                    log::warn!("[reniec] Lookup reconnect attempt {attempt} failed: {e}");
                    if attempt < self.options.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }
        log::error!(
            "[reniec] Lookup unhealthy after {} reconnect attempts",
            self.options.max_attempts
        );
        self.health = LookupHealth::Unhealthy;
        self.health
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthMonitorOptions {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
        })
    }
}

fn persona(
    dni: &str,
    apellido_pat: &str,
    apellido_mat: &str,
    nombres: &str,
    (year, month, day): (i32, u32, u32),
    sexo: &str,
    direccion: &str,
) -> PersonRecord {
    PersonRecord {
        dni: dni.to_string(),
        details: PersonDetails {
            nombres: nombres.to_string(),
            apellido_pat: apellido_pat.to_string(),
            apellido_mat: apellido_mat.to_string(),
            fecha_naci: NaiveDate::from_ymd_opt(year, month, day),
            sexo: Some(sexo.to_string()),
            direccion: Some(direccion.to_string()),
            estado_civil: None,
            lugar_nacimiento: None,
        },
    }
}

/// The fixed personas every store is seeded with.
#[must_use]
#[rustfmt::skip]
pub fn fixed_personas() -> Vec<PersonRecord> {
    vec![
        persona("12345678", "TORRES", "MENDOZA", "LUIS ALBERTO", (1992, 11, 5), "M", "Sacsayhuamán 789"),
        persona("23456789", "PEREZ", "GOMEZ", "ANA MARIA", (1990, 3, 12), "F", "Jr. Cusco 123"),
        persona("34567890", "QUISPE", "HUAMAN", "JOSE CARLOS", (1988, 1, 20), "M", "Av. Grau 456"),
        persona("45678901", "RAMIREZ", "LOPEZ", "MARIA ELENA", (1995, 7, 8), "F", "Av. Arequipa 1020"),
        persona("56789012", "ROJAS", "SALAZAR", "CARLOS ANDRÉS", (1993, 5, 17), "M", "Jr. Junín 321"),
        persona("67890123", "FLORES", "CASTILLO", "KAREN LUCÍA", (1998, 11, 30), "F", "Psje. Libertad 55"),
        persona("78901234", "DIAZ", "PALOMINO", "SERGIO ARTURO", (1987, 2, 14), "M", "Calle Los Olivos 12"),
        persona("89012345", "GARCIA", "MORI", "NATALIA SOFÍA", (1999, 9, 22), "F", "Av. La Marina 200"),
        persona("90123457", "CHÁVEZ", "RIVAS", "FRANCISCO JAVIER", (1991, 4, 3), "M", "Jr. Tarapacá 88"),
        persona("01234568", "MENDOZA", "CRUZ", "VALERIA PAOLA", (2000, 12, 1), "F", "Malecón Balta 300"),
        persona("11223344", "SANCHEZ", "ARIAS", "EDUARDO MANUEL", (1994, 6, 15), "M", "Calle Colmena 17"),
        persona("55667788", "AGUILAR", "VERA", "ANDREA NICOLE", (1996, 10, 5), "F", "Jr. Puno 740"),
    ]
}

/// In-memory [`Lookup`] with controllable failures.
///
/// Clones share the same store, so a test can keep a clone to sever the connection of a
/// lookup owned by a responder.
#[derive(Clone, Default)]
pub struct InMemoryLookup {
    inner: Arc<Mutex<InMemoryState>>,
}

#[derive(Default)]
struct InMemoryState {
    records: HashMap<String, PersonRecord>,
    severed: bool,
    fail_lookups: usize,
    fail_reconnects: usize,
    prepared: bool,
    closed: bool,
    lookups: usize,
    reconnects: usize,
}

impl InMemoryLookup {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the [`fixed_personas`].
    #[must_use]
    pub fn seeded() -> Self {
        let lookup = Self::new();
        for record in fixed_personas() {
            lookup.insert(record);
        }
        lookup
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a record.
    pub fn insert(&self, record: PersonRecord) {
        self.lock().records.insert(record.dni.clone(), record);
    }

    /// Drop the connection. Lookups and probes fail until a reconnect.
    pub fn sever(&self) {
        self.lock().severed = true;
    }

    /// Fail the next `count` lookups with a query error.
    pub fn fail_next_lookups(&self, count: usize) {
        self.lock().fail_lookups = count;
    }

    /// Fail the next `count` reconnect attempts.
    pub fn fail_next_reconnects(&self, count: usize) {
        self.lock().fail_reconnects = count;
    }

    /// Whether [`Lookup::prepare`] has run
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.lock().prepared
    }

    /// Whether [`Lookup::close`] has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of lookups performed, failed or not
    #[must_use]
    pub fn lookup_count(&self) -> usize {
        self.lock().lookups
    }

    /// Number of successful reconnects
    #[must_use]
    pub fn reconnect_count(&self) -> usize {
        self.lock().reconnects
    }
}

#[async_trait]
impl Lookup for InMemoryLookup {
    async fn prepare(&mut self) -> Result<(), LookupError> {
        self.lock().prepared = true;
        Ok(())
    }

    async fn lookup(&mut self, dni: &str) -> Result<Option<PersonRecord>, LookupError> {
        let mut state = self.lock();
        state.lookups += 1;
        if state.severed {
            return Err(LookupError::Unavailable("connection closed".to_string()));
        }
        if state.fail_lookups > 0 {
            state.fail_lookups -= 1;
            return Err(LookupError::Query("injected failure".to_string()));
        }
        Ok(state.records.get(dni).cloned())
    }

    async fn probe(&mut self) -> Result<(), LookupError> {
        if self.lock().severed {
            Err(LookupError::Unavailable("connection closed".to_string()))
        } else {
            Ok(())
        }
    }

    async fn reconnect(&mut self) -> Result<(), LookupError> {
        let mut state = self.lock();
        if state.fail_reconnects > 0 {
            state.fail_reconnects -= 1;
            return Err(LookupError::Unavailable("connection refused".to_string()));
        }
        state.severed = false;
        state.reconnects += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LookupError> {
        self.lock().closed = true;
        Ok(())
    }
}
