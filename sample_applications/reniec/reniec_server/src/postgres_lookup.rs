// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`Lookup`] backed by the `personas` table of a Postgres database.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reniec_protocol::lookup::{fixed_personas, Lookup, LookupError, PersonDetails, PersonRecord};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{FromRow, PgPool};

/// Time to wait for the lookup connection before failing the request
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS personas (
  dni              VARCHAR(8) PRIMARY KEY,
  apell_pat        TEXT NOT NULL,
  apell_mat        TEXT NOT NULL,
  nombres          TEXT NOT NULL,
  fecha_naci       DATE,
  sexo             CHAR(1),
  direccion        TEXT,
  estado_civil     TEXT,
  lugar_nacimiento TEXT
)";

const INSERT_PERSONA: &str = r"
INSERT INTO personas (dni, apell_pat, apell_mat, nombres, fecha_naci, sexo, direccion)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (dni) DO NOTHING";

const INSERT_BULK: &str = r"
INSERT INTO personas (dni, apell_pat, apell_mat, nombres, sexo)
SELECT lpad(($1::bigint + g)::text, 8, '0'),
       'PATERNO',
       'MATERNO',
       'PERSONA ' || g,
       CASE WHEN g % 2 = 0 THEN 'M' ELSE 'F' END
FROM generate_series(0, $2::bigint - 1) AS g
ON CONFLICT (dni) DO NOTHING";

const SELECT_PERSONA: &str = r"
SELECT dni, apell_pat, apell_mat, nombres, fecha_naci, sexo, direccion, estado_civil, lugar_nacimiento
FROM personas
WHERE dni = $1";

const DEFAULT_SEED_BASE: u32 = 10_000_000;
const DEFAULT_SEED_COUNT: u32 = 10_000;
/// Largest DNI that fits the `dni VARCHAR(8)` column
const MAX_DNI: u64 = 99_999_999;

/// Options for a [`PostgresLookup`]
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct PostgresLookupOptions {
    /// Where to connect. Holds credentials, never logged.
    connect_options: PgConnectOptions,
    /// Create the `personas` table if it does not exist
    #[builder(default = "true")]
    init_schema: bool,
    /// Insert the fixed personas
    #[builder(default = "true")]
    seed_fixed: bool,
    /// Insert a deterministic range of generated personas
    #[builder(default = "false")]
    seed_bulk: bool,
    /// First DNI of the generated range
    #[builder(default = "DEFAULT_SEED_BASE")]
    seed_base: u32,
    /// Size of the generated range
    #[builder(default = "DEFAULT_SEED_COUNT")]
    seed_count: u32,
}

impl PostgresLookupOptionsBuilder {
    /// Initialize the [`PostgresLookupOptionsBuilder`] from the environment.
    ///
    /// The connection is read from `PG_DSN`, or else from `PGHOST`, `PGPORT`, `PGUSER`,
    /// `PGPASSWORD` and `PGDATABASE`. Provisioning is controlled by `RENIEC_INIT_SCHEMA`,
    /// `RENIEC_SEED_FIXED`, `RENIEC_SEED_BULK`, `RENIEC_SEED_BASE` and `RENIEC_SEED_COUNT`.
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of the environment variables are invalid.
    pub fn from_environment() -> Result<Self, String> {
        let connect_options = match env::var("PG_DSN") {
            Ok(dsn) => PgConnectOptions::from_str(&dsn).map_err(|e| format!("PG_DSN: {e}"))?,
            Err(_) => PgConnectOptions::new()
                .host(&var_or("PGHOST", "127.0.0.1"))
                .port(
                    var_or("PGPORT", "5432")
                        .parse()
                        .map_err(|e| format!("PGPORT: {e}"))?,
                )
                .username(&var_or("PGUSER", "reniec"))
                .password(&var_or("PGPASSWORD", "reniec"))
                .database(&var_or("PGDATABASE", "reniec"))
                .ssl_mode(PgSslMode::Disable),
        };

        let mut builder = Self::default().connect_options(connect_options);
        builder.init_schema = flag_from_environment("RENIEC_INIT_SCHEMA");
        builder.seed_fixed = flag_from_environment("RENIEC_SEED_FIXED");
        builder.seed_bulk = flag_from_environment("RENIEC_SEED_BULK");
        builder.seed_base = number_from_environment("RENIEC_SEED_BASE")?;
        builder.seed_count = number_from_environment("RENIEC_SEED_COUNT")?;
        Ok(builder)
    }

    /// Validate the options.
    ///
    /// # Errors
    /// Returns a `String` describing the error if the bulk seed is enabled and its last DNI
    /// does not fit in 8 digits.
    fn validate(&self) -> Result<(), String> {
        if !self.seed_bulk.unwrap_or(false) {
            return Ok(());
        }
        let base = self.seed_base.unwrap_or(DEFAULT_SEED_BASE);
        let count = self.seed_count.unwrap_or(DEFAULT_SEED_COUNT);
        if count > 0 && u64::from(base) + u64::from(count) - 1 > MAX_DNI {
            return Err(format!(
                "bulk seed range {base}..{} exceeds the 8-digit DNI {MAX_DNI}",
                u64::from(base) + u64::from(count)
            ));
        }
        Ok(())
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// `1`, `true` and `yes` enable a flag, anything else disables it.
fn flag_from_environment(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
}

fn number_from_environment(key: &str) -> Result<Option<u32>, String> {
    env::var(key)
        .ok()
        .map(|v| v.parse::<u32>().map_err(|e| format!("{key}: {e}")))
        .transpose()
}

#[derive(Debug, FromRow)]
struct DbPersona {
    dni: String,
    apell_pat: String,
    apell_mat: String,
    nombres: String,
    fecha_naci: Option<NaiveDate>,
    sexo: Option<String>,
    direccion: Option<String>,
    estado_civil: Option<String>,
    lugar_nacimiento: Option<String>,
}

impl From<DbPersona> for PersonRecord {
    fn from(row: DbPersona) -> Self {
        PersonRecord {
            dni: row.dni,
            details: PersonDetails {
                nombres: row.nombres,
                apellido_pat: row.apell_pat,
                apellido_mat: row.apell_mat,
                fecha_naci: row.fecha_naci,
                sexo: row.sexo.map(|s| s.trim().to_string()),
                direccion: row.direccion,
                estado_civil: row.estado_civil,
                lugar_nacimiento: row.lugar_nacimiento,
            },
        }
    }
}

/// Looks persons up over a single database connection.
pub struct PostgresLookup {
    options: PostgresLookupOptions,
    pool: Option<PgPool>,
}

impl PostgresLookup {
    /// Create a lookup. Nothing is connected until [`Lookup::prepare`].
    #[must_use]
    pub fn new(options: PostgresLookupOptions) -> Self {
        Self {
            options,
            pool: None,
        }
    }

    async fn connect(&self) -> Result<PgPool, LookupError> {
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(self.options.connect_options.clone())
            .await
            .map_err(|e| LookupError::Unavailable(e.to_string()))
    }

    fn pool(&self) -> Result<&PgPool, LookupError> {
        self.pool
            .as_ref()
            .ok_or_else(|| LookupError::Unavailable("not connected".to_string()))
    }

    async fn seed_fixed(pool: &PgPool) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for record in fixed_personas() {
            sqlx::query(INSERT_PERSONA)
                .bind(&record.dni)
                .bind(&record.details.apellido_pat)
                .bind(&record.details.apellido_mat)
                .bind(&record.details.nombres)
                .bind(record.details.fecha_naci)
                .bind(&record.details.sexo)
                .bind(&record.details.direccion)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl Lookup for PostgresLookup {
    async fn prepare(&mut self) -> Result<(), LookupError> {
        let pool = self.connect().await?;
        let setup_error = |e: sqlx::Error| LookupError::Setup(e.to_string());

        if self.options.init_schema {
            sqlx::query(CREATE_SCHEMA)
                .execute(&pool)
                .await
                .map_err(setup_error)?;
            log::info!("[db] Table personas ready");
        }
        if self.options.seed_fixed {
            Self::seed_fixed(&pool).await.map_err(setup_error)?;
            log::info!("[db] Fixed personas seeded");
        }
        if self.options.seed_bulk && self.options.seed_count > 0 {
            let inserted = sqlx::query(INSERT_BULK)
                .bind(i64::from(self.options.seed_base))
                .bind(i64::from(self.options.seed_count))
                .execute(&pool)
                .await
                .map_err(setup_error)?
                .rows_affected();
            log::info!(
                "[db] Bulk seed base={} count={} inserted={inserted}",
                self.options.seed_base,
                self.options.seed_count
            );
        }

        log::info!(
            "[db] Connected to {}:{}/{}",
            self.options.connect_options.get_host(),
            self.options.connect_options.get_port(),
            self.options.connect_options.get_database().unwrap_or_default()
        );
        self.pool = Some(pool);
        Ok(())
    }

    async fn lookup(&mut self, dni: &str) -> Result<Option<PersonRecord>, LookupError> {
        let row = sqlx::query_as::<_, DbPersona>(SELECT_PERSONA)
            .bind(dni)
            .fetch_optional(self.pool()?)
            .await
            .map_err(|e| match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                    LookupError::Unavailable(e.to_string())
                }
                e => LookupError::Query(e.to_string()),
            })?;
        Ok(row.map(PersonRecord::from))
    }

    async fn probe(&mut self) -> Result<(), LookupError> {
        sqlx::query("SELECT 1")
            .execute(self.pool()?)
            .await
            .map(|_| ())
            .map_err(|e| LookupError::Unavailable(e.to_string()))
    }

    async fn reconnect(&mut self) -> Result<(), LookupError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        let pool = self.connect().await?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| LookupError::Unavailable(e.to_string()))?;
        self.pool = Some(pool);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LookupError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }
}
