// 🗄️ Ledger Store - SQLite persistence for owners, entries, sync records and audit events
//
// One `ledger_entries` table holds both claim streams; `kind` partitions them and
// `owner_id` partitions each stream further. Money is stored as TEXT and parsed
// back into exact decimals; timestamps are RFC 3339 UTC with microseconds so that
// lexical order equals chronological order.

use crate::entities::{
    ClaimInput, CorrelationKey, EntryId, LedgerEntry, Owner, OwnerId, OwnerKind,
};
use crate::error::{LedgerError, LedgerResult};
use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// STORE HANDLE
// ============================================================================

/// Shared handle to the ledger database.
/// Every statement runs under the connection mutex; cloning shares the connection.
#[derive(Clone)]
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerStore {
    /// Open (or create) a database file and make sure the schema exists
    pub fn open(path: &Path) -> LedgerResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> LedgerResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        setup_database(&conn)?;
        Ok(LedgerStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_conn<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut Connection) -> LedgerResult<T>,
    {
        // A panic while holding the lock leaves SQLite consistent (open
        // transactions roll back on drop), so a poisoned mutex is still usable.
        let mut guard = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> LedgerResult<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS owners (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            lookup_key TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (kind, lookup_key)
        )",
        [],
    )?;

    // ==========================================================================
    // Ledger entries (both streams, partitioned by kind + owner_id)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            owner_id INTEGER NOT NULL REFERENCES owners(id),
            created_at TEXT NOT NULL,
            claim_value TEXT NOT NULL,
            copies INTEGER NOT NULL,
            rate TEXT NOT NULL,
            exchange_rate TEXT NOT NULL,
            invoice_date TEXT,
            note TEXT,
            recorded_by TEXT NOT NULL,
            own_duty TEXT NOT NULL,
            past_total TEXT NOT NULL,
            running_total TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            sync_pending INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Sync records (local id → external correlation state)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_records (
            kind TEXT NOT NULL,
            entry_id INTEGER NOT NULL,
            correlation_key TEXT NOT NULL,
            synced_version INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            outcome TEXT NOT NULL,
            synced_at TEXT NOT NULL,
            PRIMARY KEY (kind, entry_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Recalculation locks (shared by every process on this database)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS recalc_locks (
            lock_key TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL,
            rerun INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_owner_order
         ON ledger_entries(kind, owner_id, created_at, id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// COLUMN HELPERS
// ============================================================================

pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Drop precision SQLite will not keep, so in-memory values equal stored ones
pub fn storage_time(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(6)
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn kind_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<OwnerKind> {
    let text: String = row.get(idx)?;
    OwnerKind::from_str(&text).map_err(|e| {
        conversion_error(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

// ============================================================================
// OWNERS
// ============================================================================

const OWNER_COLUMNS: &str = "id, kind, name, created_at";

fn owner_from_row(row: &Row<'_>) -> rusqlite::Result<Owner> {
    Ok(Owner {
        id: row.get(0)?,
        kind: kind_col(row, 1)?,
        name: row.get(2)?,
        created_at: time_col(row, 3)?,
    })
}

pub fn insert_owner(conn: &Connection, kind: OwnerKind, name: &str) -> LedgerResult<Owner> {
    let name = Owner::normalize_name(name);
    let now = storage_time(Utc::now());

    conn.execute(
        "INSERT INTO owners (kind, name, lookup_key, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![kind.as_str(), name, Owner::lookup_key(&name), format_time(&now)],
    )?;

    Ok(Owner {
        id: conn.last_insert_rowid(),
        kind,
        name,
        created_at: now,
    })
}

pub fn get_owner(conn: &Connection, id: OwnerId) -> LedgerResult<Option<Owner>> {
    let owner = conn
        .query_row(
            &format!("SELECT {} FROM owners WHERE id = ?1", OWNER_COLUMNS),
            params![id],
            owner_from_row,
        )
        .optional()?;
    Ok(owner)
}

/// Case-insensitive lookup within one stream
pub fn find_owner_by_name(conn: &Connection, kind: OwnerKind, name: &str) -> LedgerResult<Option<Owner>> {
    let owner = conn
        .query_row(
            &format!(
                "SELECT {} FROM owners WHERE kind = ?1 AND lookup_key = ?2",
                OWNER_COLUMNS
            ),
            params![kind.as_str(), Owner::lookup_key(name)],
            owner_from_row,
        )
        .optional()?;
    Ok(owner)
}

pub fn list_owners(conn: &Connection, kind: OwnerKind) -> LedgerResult<Vec<Owner>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM owners WHERE kind = ?1 ORDER BY name",
        OWNER_COLUMNS
    ))?;
    let owners = stmt
        .query_map(params![kind.as_str()], owner_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(owners)
}

// ============================================================================
// LEDGER ENTRIES
// ============================================================================

const ENTRY_COLUMNS: &str = "id, kind, owner_id, created_at, claim_value, copies, rate, exchange_rate,
     invoice_date, note, recorded_by, own_duty, past_total, running_total,
     version, sync_pending, updated_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let sync_pending: i64 = row.get(15)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        kind: kind_col(row, 1)?,
        owner_id: row.get(2)?,
        created_at: time_col(row, 3)?,
        claim_value: decimal_col(row, 4)?,
        copies: row.get(5)?,
        rate: decimal_col(row, 6)?,
        exchange_rate: decimal_col(row, 7)?,
        invoice_date: date_col(row, 8)?,
        note: row.get(9)?,
        recorded_by: row.get(10)?,
        own_duty: decimal_col(row, 11)?,
        past_total: decimal_col(row, 12)?,
        running_total: decimal_col(row, 13)?,
        version: row.get(14)?,
        sync_pending: sync_pending != 0,
        updated_at: time_col(row, 16)?,
    })
}

/// Insert a new entry. Totals start provisional (past_total = 0); the
/// recalculation engine settles them and hands the entry to sync.
pub fn insert_entry(
    conn: &Connection,
    owner: &Owner,
    claim: &ClaimInput,
    own_duty: Decimal,
) -> LedgerResult<LedgerEntry> {
    let now = storage_time(Utc::now());
    let created_at = storage_time(claim.recorded_at.unwrap_or(now));
    let recorded_by = claim
        .recorded_by
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "system".to_string());

    conn.execute(
        "INSERT INTO ledger_entries (
            kind, owner_id, created_at, claim_value, copies, rate, exchange_rate,
            invoice_date, note, recorded_by, own_duty, past_total, running_total,
            version, sync_pending, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1, 1, ?14)",
        params![
            owner.kind.as_str(),
            owner.id,
            format_time(&created_at),
            claim.claim_value.to_string(),
            claim.copies,
            claim.rate.to_string(),
            claim.exchange_rate.to_string(),
            claim.invoice_date.map(|d| d.format("%Y-%m-%d").to_string()),
            claim.note,
            recorded_by,
            own_duty.to_string(),
            Decimal::ZERO.to_string(),
            own_duty.to_string(),
            format_time(&now),
        ],
    )?;

    Ok(LedgerEntry {
        id: conn.last_insert_rowid(),
        kind: owner.kind,
        owner_id: owner.id,
        created_at,
        claim_value: claim.claim_value,
        copies: claim.copies,
        rate: claim.rate,
        exchange_rate: claim.exchange_rate,
        invoice_date: claim.invoice_date,
        note: claim.note.clone(),
        recorded_by,
        own_duty,
        past_total: Decimal::ZERO,
        running_total: own_duty,
        version: 1,
        sync_pending: true,
        updated_at: now,
    })
}

pub fn get_entry(conn: &Connection, id: EntryId) -> LedgerResult<Option<LedgerEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {} FROM ledger_entries WHERE id = ?1", ENTRY_COLUMNS),
            params![id],
            entry_from_row,
        )
        .optional()?;
    Ok(entry)
}

pub fn entry_exists(conn: &Connection, id: EntryId) -> LedgerResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM ledger_entries WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Persist new claim inputs and own duty. Marks the row for sync.
/// Returns the entry as stored (version bumped).
pub fn update_entry_inputs(conn: &Connection, entry: &LedgerEntry) -> LedgerResult<LedgerEntry> {
    let now = storage_time(Utc::now());

    let changed = conn.execute(
        "UPDATE ledger_entries
         SET claim_value = ?1, copies = ?2, rate = ?3, exchange_rate = ?4,
             invoice_date = ?5, note = ?6, own_duty = ?7,
             version = version + 1, sync_pending = 1, updated_at = ?8
         WHERE id = ?9",
        params![
            entry.claim_value.to_string(),
            entry.copies,
            entry.rate.to_string(),
            entry.exchange_rate.to_string(),
            entry.invoice_date.map(|d| d.format("%Y-%m-%d").to_string()),
            entry.note,
            entry.own_duty.to_string(),
            format_time(&now),
            entry.id,
        ],
    )?;

    if changed == 0 {
        return Err(LedgerError::EntryNotFound(entry.id));
    }

    get_entry(conn, entry.id)?.ok_or(LedgerError::EntryNotFound(entry.id))
}

/// Remove an entry. Returns false if it was already gone.
pub fn delete_entry(conn: &Connection, id: EntryId) -> LedgerResult<bool> {
    let removed = conn.execute("DELETE FROM ledger_entries WHERE id = ?1", params![id])?;
    Ok(removed > 0)
}

/// All entries of one owner in ledger order (created_at, then id)
pub fn entries_for_owner(
    conn: &Connection,
    kind: OwnerKind,
    owner_id: OwnerId,
) -> LedgerResult<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ledger_entries
         WHERE kind = ?1 AND owner_id = ?2
         ORDER BY created_at ASC, id ASC",
        ENTRY_COLUMNS
    ))?;

    let entries = stmt
        .query_map(params![kind.as_str(), owner_id], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

/// Entries of a stream, optionally narrowed to one owner, in ledger order
pub fn entries_for_stream(
    conn: &Connection,
    kind: OwnerKind,
    owner_id: Option<OwnerId>,
) -> LedgerResult<Vec<LedgerEntry>> {
    match owner_id {
        Some(owner_id) => entries_for_owner(conn, kind, owner_id),
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM ledger_entries
                 WHERE kind = ?1
                 ORDER BY owner_id ASC, created_at ASC, id ASC",
                ENTRY_COLUMNS
            ))?;
            let entries = stmt
                .query_map(params![kind.as_str()], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        }
    }
}

// ============================================================================
// BATCHED TOTALS WRITE
// ============================================================================

/// New derived totals for one entry, guarded by the version that was read
#[derive(Debug, Clone, PartialEq)]
pub struct TotalsUpdate {
    pub id: EntryId,
    pub expected_version: i64,
    pub past_total: Decimal,
    pub running_total: Decimal,

    /// Totals actually changed (vs. a settled row still waiting for sync)
    pub totals_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Rows written, with their new version
    pub written: Vec<(EntryId, i64)>,

    /// Rows modified or deleted since they were read; left untouched
    pub conflicts: Vec<EntryId>,
}

/// Write every update in one transaction. Rows whose version moved since the
/// read are skipped and reported as conflicts. sync_pending is left alone:
/// only a confirmed sync clears it (see `mark_synced`).
pub fn apply_totals_batch(conn: &mut Connection, updates: &[TotalsUpdate]) -> LedgerResult<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    if updates.is_empty() {
        return Ok(outcome);
    }

    let now = format_time(&storage_time(Utc::now()));
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "UPDATE ledger_entries
             SET past_total = ?1, running_total = ?2,
                 version = version + ?3, updated_at = ?4
             WHERE id = ?5 AND version = ?6",
        )?;

        for update in updates {
            let bump: i64 = if update.totals_changed { 1 } else { 0 };
            let changed = stmt.execute(params![
                update.past_total.to_string(),
                update.running_total.to_string(),
                bump,
                now,
                update.id,
                update.expected_version,
            ])?;

            if changed == 0 {
                outcome.conflicts.push(update.id);
            } else {
                outcome.written.push((update.id, update.expected_version + bump));
            }
        }
    }
    tx.commit()?;

    Ok(outcome)
}

// ============================================================================
// SYNC RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub key: CorrelationKey,
    pub synced_version: i64,
    pub fingerprint: String,
    pub outcome: String,
    pub synced_at: DateTime<Utc>,
}

pub fn get_sync_record(conn: &Connection, key: &CorrelationKey) -> LedgerResult<Option<SyncRecord>> {
    let record = conn
        .query_row(
            "SELECT synced_version, fingerprint, outcome, synced_at
             FROM sync_records WHERE kind = ?1 AND entry_id = ?2",
            params![key.kind.as_str(), key.entry_id],
            |row| {
                Ok(SyncRecord {
                    key: *key,
                    synced_version: row.get(0)?,
                    fingerprint: row.get(1)?,
                    outcome: row.get(2)?,
                    synced_at: time_col(row, 3)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

pub fn upsert_sync_record(conn: &Connection, record: &SyncRecord) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO sync_records (kind, entry_id, correlation_key, synced_version, fingerprint, outcome, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (kind, entry_id) DO UPDATE SET
            synced_version = excluded.synced_version,
            fingerprint = excluded.fingerprint,
            outcome = excluded.outcome,
            synced_at = excluded.synced_at
         WHERE excluded.synced_version >= sync_records.synced_version",
        params![
            record.key.kind.as_str(),
            record.key.entry_id,
            record.key.to_string(),
            record.synced_version,
            record.fingerprint,
            record.outcome,
            format_time(&record.synced_at),
        ],
    )?;
    Ok(())
}

/// Clear sync_pending once the external system holds exactly `version`.
/// Returns false when the row moved on (or is gone) in the meantime.
pub fn mark_synced(conn: &Connection, id: EntryId, version: i64) -> LedgerResult<bool> {
    let changed = conn.execute(
        "UPDATE ledger_entries SET sync_pending = 0 WHERE id = ?1 AND version = ?2",
        params![id, version],
    )?;
    Ok(changed > 0)
}

pub fn delete_sync_record(conn: &Connection, key: &CorrelationKey) -> LedgerResult<()> {
    conn.execute(
        "DELETE FROM sync_records WHERE kind = ?1 AND entry_id = ?2",
        params![key.kind.as_str(), key.entry_id],
    )?;
    Ok(())
}

// ============================================================================
// AUDIT EVENTS ("every change is an event")
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: storage_time(Utc::now()),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    /// Event about one ledger entry ("company_claim" / "sector_claim")
    pub fn for_entry(event_type: &str, kind: OwnerKind, id: EntryId, data: serde_json::Value, actor: &str) -> Self {
        Self::new(event_type, &entry_entity_type(kind), &id.to_string(), data, actor)
    }
}

pub fn entry_entity_type(kind: OwnerKind) -> String {
    format!("{}_claim", kind.as_str())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> LedgerResult<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            format_time(&event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Events for a specific entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> LedgerResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp ASC, id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: time_col(row, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| conversion_error(5, e))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = test_conn();
        setup_database(&conn).unwrap();
        assert!(entries_for_stream(&conn, OwnerKind::Company, None).unwrap().is_empty());
    }

    #[test]
    fn test_owner_names_unique_per_kind_case_insensitive() {
        let conn = test_conn();
        let acme = insert_owner(&conn, OwnerKind::Company, "Acme  Ltd").unwrap();
        assert_eq!(acme.name, "Acme Ltd");

        let found = find_owner_by_name(&conn, OwnerKind::Company, "ACME ltd").unwrap().unwrap();
        assert_eq!(found.id, acme.id);

        // Same name in the other stream is a different owner
        assert!(find_owner_by_name(&conn, OwnerKind::Sector, "Acme Ltd").unwrap().is_none());
        insert_owner(&conn, OwnerKind::Sector, "Acme Ltd").unwrap();

        // Duplicate within the stream violates the unique index
        assert!(insert_owner(&conn, OwnerKind::Company, "acme ltd").is_err());
    }

    #[test]
    fn test_entry_round_trip_keeps_exact_decimals() {
        let conn = test_conn();
        let owner = insert_owner(&conn, OwnerKind::Company, "Acme").unwrap();
        let claim = ClaimInput::new(dec("12345.67"), 3)
            .with_exchange_rate(dec("3.6725"))
            .with_invoice_date(NaiveDate::from_ymd_opt(2023, 6, 30).unwrap())
            .with_note("first claim");

        let inserted = insert_entry(&conn, &owner, &claim, dec("204.02")).unwrap();
        let loaded = get_entry(&conn, inserted.id).unwrap().unwrap();

        assert_eq!(loaded, inserted);
        assert_eq!(loaded.rate, dec("0.0015"));
        assert_eq!(loaded.recorded_by, "system");
        assert!(loaded.sync_pending);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_entries_for_owner_orders_by_created_at_then_id() {
        let conn = test_conn();
        let owner = insert_owner(&conn, OwnerKind::Sector, "Energy").unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t0 = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();

        let a = insert_entry(&conn, &owner, &ClaimInput::new(dec("1"), 1).backdated(t1), dec("1")).unwrap();
        let b = insert_entry(&conn, &owner, &ClaimInput::new(dec("2"), 1).backdated(t0), dec("2")).unwrap();
        let c = insert_entry(&conn, &owner, &ClaimInput::new(dec("3"), 1).backdated(t1), dec("3")).unwrap();

        let ids: Vec<EntryId> = entries_for_owner(&conn, OwnerKind::Sector, owner.id)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![b.id, a.id, c.id]);
    }

    #[test]
    fn test_update_inputs_bumps_version_and_marks_pending() {
        let conn = test_conn();
        let owner = insert_owner(&conn, OwnerKind::Company, "Acme").unwrap();
        let mut entry = insert_entry(&conn, &owner, &ClaimInput::new(dec("100"), 1), dec("0.15")).unwrap();

        entry.claim_value = dec("200");
        entry.own_duty = dec("0.30");
        let stored = update_entry_inputs(&conn, &entry).unwrap();

        assert_eq!(stored.version, 2);
        assert_eq!(stored.own_duty, dec("0.30"));
        assert!(stored.sync_pending);

        entry.id = 999;
        assert!(matches!(update_entry_inputs(&conn, &entry), Err(LedgerError::EntryNotFound(999))));
    }

    #[test]
    fn test_batch_skips_rows_whose_version_moved() {
        let mut conn = test_conn();
        let owner = insert_owner(&conn, OwnerKind::Company, "Acme").unwrap();
        let a = insert_entry(&conn, &owner, &ClaimInput::new(dec("1"), 1), dec("10")).unwrap();
        let b = insert_entry(&conn, &owner, &ClaimInput::new(dec("1"), 1), dec("20")).unwrap();

        let updates = vec![
            TotalsUpdate {
                id: a.id,
                expected_version: 1,
                past_total: Decimal::ZERO,
                running_total: dec("10"),
                totals_changed: false,
            },
            TotalsUpdate {
                id: b.id,
                expected_version: 7, // stale read
                past_total: dec("10"),
                running_total: dec("30"),
                totals_changed: true,
            },
        ];

        let outcome = apply_totals_batch(&mut conn, &updates).unwrap();
        assert_eq!(outcome.written, vec![(a.id, 1)]);
        assert_eq!(outcome.conflicts, vec![b.id]);

        // Totals written, but the row waits for a confirmed sync
        let a = get_entry(&conn, a.id).unwrap().unwrap();
        assert!(a.sync_pending);
        let b = get_entry(&conn, b.id).unwrap().unwrap();
        assert_eq!(b.past_total, Decimal::ZERO);
    }

    #[test]
    fn test_mark_synced_only_clears_the_synced_version() {
        let conn = test_conn();
        let owner = insert_owner(&conn, OwnerKind::Company, "Acme").unwrap();
        let mut entry = insert_entry(&conn, &owner, &ClaimInput::new(dec("1"), 1), dec("10")).unwrap();

        entry.own_duty = dec("12");
        let stored = update_entry_inputs(&conn, &entry).unwrap();
        assert_eq!(stored.version, 2);

        // Sync of the old version lands late
        assert!(!mark_synced(&conn, entry.id, 1).unwrap());
        assert!(get_entry(&conn, entry.id).unwrap().unwrap().sync_pending);

        assert!(mark_synced(&conn, entry.id, 2).unwrap());
        assert!(!get_entry(&conn, entry.id).unwrap().unwrap().sync_pending);

        delete_entry(&conn, entry.id).unwrap();
        assert!(!mark_synced(&conn, entry.id, 2).unwrap());
    }

    #[test]
    fn test_sync_record_never_moves_backwards() {
        let conn = test_conn();
        let key = CorrelationKey {
            kind: OwnerKind::Company,
            entry_id: 1,
        };

        let mut record = SyncRecord {
            key,
            synced_version: 3,
            fingerprint: "v3".to_string(),
            outcome: "updated".to_string(),
            synced_at: storage_time(Utc::now()),
        };
        upsert_sync_record(&conn, &record).unwrap();

        record.synced_version = 2;
        record.fingerprint = "v2".to_string();
        upsert_sync_record(&conn, &record).unwrap();

        let stored = get_sync_record(&conn, &key).unwrap().unwrap();
        assert_eq!(stored.synced_version, 3);
        assert_eq!(stored.fingerprint, "v3");

        delete_sync_record(&conn, &key).unwrap();
        assert!(get_sync_record(&conn, &key).unwrap().is_none());
    }

    #[test]
    fn test_event_log() {
        let conn = test_conn();

        let event = Event::for_entry(
            "entry_created",
            OwnerKind::Company,
            42,
            serde_json::json!({"own_duty": "300"}),
            "clerk",
        );
        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "company_claim", "42").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "entry_created");
        assert_eq!(events[0].actor, "clerk");
        assert!(get_events_for_entity(&conn, "sector_claim", "42").unwrap().is_empty());
    }

    #[test]
    fn test_store_on_disk_reopens_with_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        {
            let store = LedgerStore::open(&path).unwrap();
            store
                .with_conn(|conn| insert_owner(conn, OwnerKind::Company, "Acme").map(|_| ()))
                .unwrap();
        }

        let store = LedgerStore::open(&path).unwrap();
        let owners = store.with_conn(|conn| list_owners(conn, OwnerKind::Company)).unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "Acme");
    }
}
