// 📤 CSV export of a claim stream
//
// One row per entry in ledger order, with the owner's name resolved. Money
// columns keep their exact decimal text.

use crate::db::{self, LedgerStore};
use crate::entities::{LedgerEntry, OwnerId, OwnerKind};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    id: i64,
    kind: &'a str,
    owner: &'a str,
    created_at: String,
    invoice_date: String,
    claim_value: String,
    copies: i64,
    rate: String,
    exchange_rate: String,
    own_duty: String,
    past_total: String,
    running_total: String,
    recorded_by: &'a str,
    note: &'a str,
    version: i64,
}

pub fn write_csv<W: Write>(
    entries: &[LedgerEntry],
    owner_names: &HashMap<OwnerId, String>,
    writer: W,
) -> Result<usize> {
    let mut wtr = csv::Writer::from_writer(writer);

    for entry in entries {
        let owner = owner_names
            .get(&entry.owner_id)
            .map(String::as_str)
            .unwrap_or("");

        wtr.serialize(ExportRow {
            id: entry.id,
            kind: entry.kind.as_str(),
            owner,
            created_at: db::format_time(&entry.created_at),
            invoice_date: entry
                .invoice_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            claim_value: entry.claim_value.to_string(),
            copies: entry.copies,
            rate: entry.rate.to_string(),
            exchange_rate: entry.exchange_rate.to_string(),
            own_duty: entry.own_duty.to_string(),
            past_total: entry.past_total.to_string(),
            running_total: entry.running_total.to_string(),
            recorded_by: &entry.recorded_by,
            note: entry.note.as_deref().unwrap_or(""),
            version: entry.version,
        })
        .with_context(|| format!("Failed to write CSV row for entry {}", entry.id))?;
    }

    wtr.flush().context("Failed to flush CSV output")?;
    Ok(entries.len())
}

/// Export a whole stream (every owner) from the store
pub fn export_stream<W: Write>(store: &LedgerStore, kind: OwnerKind, writer: W) -> Result<usize> {
    let (entries, owners) = store
        .with_conn(|conn| {
            Ok((
                db::entries_for_stream(conn, kind, None)?,
                db::list_owners(conn, kind)?,
            ))
        })
        .context("Failed to read ledger for export")?;

    let names: HashMap<OwnerId, String> = owners.into_iter().map(|o| (o.id, o.name)).collect();
    write_csv(&entries, &names, writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ClaimInput;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn test_export_stream_writes_header_and_rows() {
        let store = LedgerStore::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let owner = db::insert_owner(conn, OwnerKind::Sector, "Energy, Water")?;
                let claim = ClaimInput::new(Decimal::from_str("1000.50").unwrap(), 2).with_note("q1");
                db::insert_entry(conn, &owner, &claim, Decimal::from_str("3.00").unwrap())?;
                Ok(())
            })
            .unwrap();

        let mut out = Vec::new();
        let written = export_stream(&store, OwnerKind::Sector, &mut out).unwrap();
        assert_eq!(written, 1);

        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("id,kind,owner,created_at"));

        let row = lines.next().unwrap();
        assert!(row.contains("\"Energy, Water\""));
        assert!(row.contains("1000.50"));
        assert!(row.contains(",q1,"));

        // Other stream is empty
        let mut out = Vec::new();
        assert_eq!(export_stream(&store, OwnerKind::Company, &mut out).unwrap(), 0);
    }
}
