//! Postgres persistence for the tender sync pipeline.
//!
//! All mutation goes through natural-key-guarded bulk statements: reference
//! and tender inserts use `ON CONFLICT DO NOTHING`, so concurrent walks and
//! retried pages collide harmlessly instead of duplicating rows. No
//! transaction ever spans more than one page of work.

use std::collections::HashMap;
use std::hash::Hash;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pncp_core::{NewContractingEntity, NewLegalBasis, NewOrganizationalUnit, NewTender};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pncp-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub async fn connect(database_url: &str) -> StoreResult<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?)
}

pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    Ok(MIGRATOR.run(pool).await?)
}

/// A row created-if-absent and resolved to an internal id by natural key.
pub trait ReferenceRecord: Send + Sync {
    type Key: Clone + Hash + Eq + Send + Sync;

    fn key(&self) -> Self::Key;
}

impl ReferenceRecord for NewOrganizationalUnit {
    type Key = String;

    fn key(&self) -> String {
        self.unit_code.clone()
    }
}

impl ReferenceRecord for NewContractingEntity {
    type Key = String;

    fn key(&self) -> String {
        self.tax_id.clone()
    }
}

impl ReferenceRecord for NewLegalBasis {
    type Key = i32;

    fn key(&self) -> i32 {
        self.code
    }
}

/// Batched lookup + collision-skipping insert for one reference-entity type.
#[async_trait]
pub trait ReferenceStore<R: ReferenceRecord>: Send + Sync {
    /// Internal ids of the rows already present for the given natural keys.
    async fn existing_ids(&self, keys: &[R::Key]) -> StoreResult<HashMap<R::Key, i64>>;

    /// Inserts the given rows, silently skipping natural-key collisions.
    async fn insert_missing(&self, rows: &[R]) -> StoreResult<u64>;
}

/// Identity and change marker of a tender already in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredTender {
    pub id: i64,
    pub global_update_date: Option<DateTime<Utc>>,
}

/// Composite key a resumable walk checkpoints under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgressKey {
    pub modality: u8,
    pub range_start: NaiveDate,
    pub range_end: NaiveDate,
    pub endpoint: String,
}

/// Notification recipient who follows a tender and opted into updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Follower {
    pub email: String,
    pub display_name: Option<String>,
}

/// Everything the pipeline needs from storage. Generic so the orchestration
/// loop runs against an in-memory fake in tests.
#[async_trait]
pub trait SyncStore:
    ReferenceStore<NewOrganizationalUnit>
    + ReferenceStore<NewContractingEntity>
    + ReferenceStore<NewLegalBasis>
{
    async fn existing_tenders(
        &self,
        control_numbers: &[String],
    ) -> StoreResult<HashMap<String, StoredTender>>;

    /// Bulk insert; retrying an identical page is a no-op per control number.
    async fn insert_tenders(&self, rows: &[NewTender]) -> StoreResult<u64>;

    async fn update_tender(&self, id: i64, row: &NewTender) -> StoreResult<()>;

    async fn followers(&self, tender_id: i64) -> StoreResult<Vec<Follower>>;

    /// First page a walk for `key` should request: `last_page + 1`, or 1.
    async fn resume_page(&self, key: &ProgressKey) -> StoreResult<u32>;

    /// Records `page` as durably applied; only ever advances the marker.
    async fn checkpoint(&self, key: &ProgressKey, page: u32) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct PgSyncStore {
    pool: PgPool,
}

impl PgSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ids_by_text_key(
        &self,
        table: &str,
        key_column: &str,
        keys: &[String],
    ) -> StoreResult<HashMap<String, i64>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!("SELECT id, {key_column} FROM {table} WHERE {key_column} = ANY($1)");
        let rows = sqlx::query(&sql).bind(keys).fetch_all(&self.pool).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get(key_column)?, row.try_get("id")?);
        }
        Ok(out)
    }
}

#[async_trait]
impl ReferenceStore<NewOrganizationalUnit> for PgSyncStore {
    async fn existing_ids(&self, keys: &[String]) -> StoreResult<HashMap<String, i64>> {
        self.ids_by_text_key("organizational_units", "unit_code", keys).await
    }

    async fn insert_missing(&self, rows: &[NewOrganizationalUnit]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new(
            "INSERT INTO organizational_units (unit_code, name, city, state_name, state_abbr, ibge_code) ",
        );
        qb.push_values(rows, |mut b, unit| {
            b.push_bind(&unit.unit_code)
                .push_bind(&unit.name)
                .push_bind(&unit.city)
                .push_bind(&unit.state_name)
                .push_bind(&unit.state_abbr)
                .push_bind(&unit.ibge_code);
        });
        qb.push(" ON CONFLICT (unit_code) DO NOTHING");
        let result = qb.build().execute(&self.pool).await?;
        debug!(inserted = result.rows_affected(), "organizational units created");
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ReferenceStore<NewContractingEntity> for PgSyncStore {
    async fn existing_ids(&self, keys: &[String]) -> StoreResult<HashMap<String, i64>> {
        self.ids_by_text_key("contracting_entities", "tax_id", keys).await
    }

    async fn insert_missing(&self, rows: &[NewContractingEntity]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new(
            "INSERT INTO contracting_entities (tax_id, name, branch_code, sphere_code) ",
        );
        qb.push_values(rows, |mut b, entity| {
            b.push_bind(&entity.tax_id)
                .push_bind(&entity.name)
                .push_bind(&entity.branch_code)
                .push_bind(&entity.sphere_code);
        });
        qb.push(" ON CONFLICT (tax_id) DO NOTHING");
        let result = qb.build().execute(&self.pool).await?;
        debug!(inserted = result.rows_affected(), "contracting entities created");
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ReferenceStore<NewLegalBasis> for PgSyncStore {
    async fn existing_ids(&self, keys: &[i32]) -> StoreResult<HashMap<i32, i64>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query("SELECT id, code FROM legal_bases WHERE code = ANY($1)")
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("code")?, row.try_get("id")?);
        }
        Ok(out)
    }

    async fn insert_missing(&self, rows: &[NewLegalBasis]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new("INSERT INTO legal_bases (code, name, description) ");
        qb.push_values(rows, |mut b, basis| {
            b.push_bind(basis.code)
                .push_bind(&basis.name)
                .push_bind(&basis.description);
        });
        qb.push(" ON CONFLICT (code) DO NOTHING");
        let result = qb.build().execute(&self.pool).await?;
        debug!(inserted = result.rows_affected(), "legal bases created");
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn existing_tenders(
        &self,
        control_numbers: &[String],
    ) -> StoreResult<HashMap<String, StoredTender>> {
        if control_numbers.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT id, control_number, global_update_date FROM tenders WHERE control_number = ANY($1)",
        )
        .bind(control_numbers)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let control: String = row.try_get("control_number")?;
            out.insert(
                control,
                StoredTender {
                    id: row.try_get("id")?,
                    global_update_date: row.try_get("global_update_date")?,
                },
            );
        }
        Ok(out)
    }

    async fn insert_tenders(&self, rows: &[NewTender]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new(
            "INSERT INTO tenders (control_number, purchase_number, purchase_year, \
             purchase_sequence, process, modality_id, modality_name, instrument_type_name, \
             status_id, status_name, object, estimated_total, approved_total, inclusion_date, \
             publication_date, global_update_date, proposal_opening_date, proposal_closing_date, \
             dispute_mode_id, dispute_mode_name, srp, submitted_by, source_system_url, \
             eprocess_url, organizational_unit_id, contracting_entity_id, legal_basis_id) ",
        );
        qb.push_values(rows, |mut b, tender| {
            b.push_bind(&tender.control_number)
                .push_bind(&tender.purchase_number)
                .push_bind(tender.purchase_year)
                .push_bind(tender.purchase_sequence)
                .push_bind(&tender.process)
                .push_bind(tender.modality_id)
                .push_bind(&tender.modality_name)
                .push_bind(&tender.instrument_type_name)
                .push_bind(tender.status_id)
                .push_bind(&tender.status_name)
                .push_bind(&tender.object)
                .push_bind(tender.estimated_total)
                .push_bind(tender.approved_total)
                .push_bind(tender.inclusion_date)
                .push_bind(tender.publication_date)
                .push_bind(tender.global_update_date)
                .push_bind(tender.proposal_opening_date)
                .push_bind(tender.proposal_closing_date)
                .push_bind(tender.dispute_mode_id)
                .push_bind(&tender.dispute_mode_name)
                .push_bind(tender.srp)
                .push_bind(&tender.submitted_by)
                .push_bind(&tender.source_system_url)
                .push_bind(&tender.eprocess_url)
                .push_bind(tender.organizational_unit_id)
                .push_bind(tender.contracting_entity_id)
                .push_bind(tender.legal_basis_id);
        });
        qb.push(" ON CONFLICT (control_number) DO NOTHING");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn update_tender(&self, id: i64, row: &NewTender) -> StoreResult<()> {
        sqlx::query(
            "UPDATE tenders SET purchase_number = $1, purchase_year = $2, \
             purchase_sequence = $3, process = $4, modality_id = $5, modality_name = $6, \
             instrument_type_name = $7, status_id = $8, status_name = $9, object = $10, \
             estimated_total = $11, approved_total = $12, inclusion_date = $13, \
             publication_date = $14, global_update_date = $15, proposal_opening_date = $16, \
             proposal_closing_date = $17, dispute_mode_id = $18, dispute_mode_name = $19, \
             srp = $20, submitted_by = $21, source_system_url = $22, eprocess_url = $23, \
             organizational_unit_id = $24, contracting_entity_id = $25, legal_basis_id = $26, \
             updated_at = NOW() WHERE id = $27",
        )
        .bind(&row.purchase_number)
        .bind(row.purchase_year)
        .bind(row.purchase_sequence)
        .bind(&row.process)
        .bind(row.modality_id)
        .bind(&row.modality_name)
        .bind(&row.instrument_type_name)
        .bind(row.status_id)
        .bind(&row.status_name)
        .bind(&row.object)
        .bind(row.estimated_total)
        .bind(row.approved_total)
        .bind(row.inclusion_date)
        .bind(row.publication_date)
        .bind(row.global_update_date)
        .bind(row.proposal_opening_date)
        .bind(row.proposal_closing_date)
        .bind(row.dispute_mode_id)
        .bind(&row.dispute_mode_name)
        .bind(row.srp)
        .bind(&row.submitted_by)
        .bind(&row.source_system_url)
        .bind(&row.eprocess_url)
        .bind(row.organizational_unit_id)
        .bind(row.contracting_entity_id)
        .bind(row.legal_basis_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn followers(&self, tender_id: i64) -> StoreResult<Vec<Follower>> {
        let rows = sqlx::query(
            "SELECT email, display_name FROM tender_followers \
             WHERE tender_id = $1 AND notify_on_update ORDER BY email",
        )
        .bind(tender_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Follower {
                email: row.try_get("email")?,
                display_name: row.try_get("display_name")?,
            });
        }
        Ok(out)
    }

    async fn resume_page(&self, key: &ProgressKey) -> StoreResult<u32> {
        let row = sqlx::query(
            "SELECT last_page FROM sync_progress WHERE modality_code = $1 \
             AND range_start = $2 AND range_end = $3 AND endpoint = $4",
        )
        .bind(i32::from(key.modality))
        .bind(key.range_start)
        .bind(key.range_end)
        .bind(&key.endpoint)
        .fetch_optional(&self.pool)
        .await?;

        let last_page: i32 = match row {
            Some(row) => row.try_get("last_page")?,
            None => 0,
        };
        Ok(last_page as u32 + 1)
    }

    async fn checkpoint(&self, key: &ProgressKey, page: u32) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO sync_progress (modality_code, range_start, range_end, endpoint, last_page) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (modality_code, range_start, range_end, endpoint) \
             DO UPDATE SET last_page = GREATEST(sync_progress.last_page, EXCLUDED.last_page), \
                           updated_at = NOW()",
        )
        .bind(i32::from(key.modality))
        .bind(key.range_start)
        .bind(key.range_end)
        .bind(&key.endpoint)
        .bind(page as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
