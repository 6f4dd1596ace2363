// 📊 Aggregate Reporter - read-only views over a claim stream
//
// Every view starts from a filter (stream, owner, reporting-date range) and
// only reads the store. An entry's reporting date is its invoice date, or the
// day it was recorded when it has none.

use crate::db::{self, LedgerStore};
use crate::entities::{LedgerEntry, OwnerId, OwnerKind};
use crate::error::{LedgerError, LedgerResult};
use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Share of the filtered total that goes to the pension fund
pub const PENSION_SHARE: Decimal = Decimal::from_parts(2, 0, 0, false, 1);

/// Share of the previous year's total that goes to the pension fund
pub const PREVIOUS_YEAR_SHARE: Decimal = Decimal::from_parts(7, 0, 0, false, 1);

pub const MONTHS_PER_YEAR: u32 = 12;

// ============================================================================
// FILTER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFilter {
    pub kind: OwnerKind,
    pub owner_id: Option<OwnerId>,

    /// Inclusive bounds on the reporting date
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl EntryFilter {
    pub fn stream(kind: OwnerKind) -> Self {
        EntryFilter {
            kind,
            owner_id: None,
            date_from: None,
            date_to: None,
        }
    }

    pub fn owner(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn between(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    /// Only the last `years` years up to `today`
    pub fn within_last_years(mut self, years: u32, today: NaiveDate) -> Self {
        self.date_from = Some(today - Duration::days(365 * i64::from(years)));
        self
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if entry.kind != self.kind {
            return false;
        }
        if self.owner_id.map(|id| id != entry.owner_id).unwrap_or(false) {
            return false;
        }

        let date = entry.reporting_date();
        if self.date_from.map(|from| date < from).unwrap_or(false) {
            return false;
        }
        if self.date_to.map(|to| date > to).unwrap_or(false) {
            return false;
        }
        true
    }
}

// ============================================================================
// VIEWS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearPoint {
    pub year: i32,
    pub total: Decimal,
    pub cumulative: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerTotal {
    pub owner_id: OwnerId,
    pub owner_name: String,
    pub total: Decimal,
    pub entries: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterFacets {
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,

    /// (owner name, entry count), by name
    pub owners: Vec<(String, usize)>,

    /// (year, entry count), ascending
    pub years: Vec<(i32, usize)>,
}

// Aggregates over many valid entries can leave the Decimal range
fn checked_sum(mut amounts: impl Iterator<Item = Decimal>, what: &str) -> LedgerResult<Decimal> {
    amounts.try_fold(Decimal::ZERO, |acc, amount| {
        acc.checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow(what.to_string()))
    })
}

pub fn total_amount(entries: &[LedgerEntry]) -> LedgerResult<Decimal> {
    checked_sum(entries.iter().map(|e| e.own_duty), "total duty")
}

pub fn yearly_series(entries: &[LedgerEntry]) -> LedgerResult<Vec<YearPoint>> {
    let mut per_year: BTreeMap<i32, Decimal> = BTreeMap::new();
    for entry in entries {
        let year = entry.reporting_date().year();
        let total = per_year.entry(year).or_default();
        *total = total
            .checked_add(entry.own_duty)
            .ok_or_else(|| LedgerError::Overflow(format!("duty for {}", year)))?;
    }

    let mut cumulative = Decimal::ZERO;
    let mut series = Vec::with_capacity(per_year.len());
    for (year, total) in per_year {
        cumulative = cumulative
            .checked_add(total)
            .ok_or_else(|| LedgerError::Overflow(format!("cumulative duty up to {}", year)))?;
        series.push(YearPoint {
            year,
            total,
            cumulative,
        });
    }
    Ok(series)
}

/// ((total × 0.2) + (previous-year total × 0.7)) / (retired × 12), to cents.
/// Zero when nobody is retired or nothing matches.
pub fn pension_estimate(entries: &[LedgerEntry], retired_count: u32, target_year: i32) -> LedgerResult<Decimal> {
    if retired_count == 0 || entries.is_empty() {
        return Ok(Decimal::ZERO);
    }

    let total = total_amount(entries)?;
    let previous_year = checked_sum(
        entries
            .iter()
            .filter(|e| e.reporting_date().year() == target_year - 1)
            .map(|e| e.own_duty),
        "previous-year duty",
    )?;

    let overflow = || LedgerError::Overflow("pension estimate".to_string());
    let numerator = total
        .checked_mul(PENSION_SHARE)
        .zip(previous_year.checked_mul(PREVIOUS_YEAR_SHARE))
        .and_then(|(a, b)| a.checked_add(b))
        .ok_or_else(overflow)?;
    let denominator = Decimal::from(retired_count) * Decimal::from(MONTHS_PER_YEAR);

    let monthly = numerator.checked_div(denominator).ok_or_else(overflow)?;
    Ok(monthly.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven))
}

pub fn owner_count(entries: &[LedgerEntry]) -> usize {
    let mut owners: Vec<OwnerId> = entries.iter().map(|e| e.owner_id).collect();
    owners.sort_unstable();
    owners.dedup();
    owners.len()
}

/// Totals per owner, largest first (ties by name)
pub fn grouped_by_owner(entries: &[LedgerEntry], names: &HashMap<OwnerId, String>) -> LedgerResult<Vec<OwnerTotal>> {
    let mut groups: BTreeMap<OwnerId, (Decimal, usize)> = BTreeMap::new();
    for entry in entries {
        let group = groups.entry(entry.owner_id).or_default();
        group.0 = group
            .0
            .checked_add(entry.own_duty)
            .ok_or_else(|| LedgerError::Overflow(format!("duty of owner {}", entry.owner_id)))?;
        group.1 += 1;
    }

    let mut totals: Vec<OwnerTotal> = groups
        .into_iter()
        .map(|(owner_id, (total, count))| OwnerTotal {
            owner_id,
            owner_name: names.get(&owner_id).cloned().unwrap_or_else(|| format!("#{}", owner_id)),
            total,
            entries: count,
        })
        .collect();

    totals.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.owner_name.cmp(&b.owner_name)));
    Ok(totals)
}

pub fn copies_for_owner(entries: &[LedgerEntry], owner_id: OwnerId) -> LedgerResult<i64> {
    entries
        .iter()
        .filter(|e| e.owner_id == owner_id)
        .try_fold(0i64, |acc, e| acc.checked_add(e.copies))
        .ok_or_else(|| LedgerError::Overflow(format!("copies of owner {}", owner_id)))
}

pub fn filter_facets(entries: &[LedgerEntry], names: &HashMap<OwnerId, String>) -> FilterFacets {
    let dates = entries.iter().map(|e| e.reporting_date());

    let mut owners: BTreeMap<String, usize> = BTreeMap::new();
    let mut years: BTreeMap<i32, usize> = BTreeMap::new();
    for entry in entries {
        let name = names
            .get(&entry.owner_id)
            .cloned()
            .unwrap_or_else(|| format!("#{}", entry.owner_id));
        *owners.entry(name).or_default() += 1;
        *years.entry(entry.reporting_date().year()).or_default() += 1;
    }

    FilterFacets {
        min_date: dates.clone().min(),
        max_date: dates.max(),
        owners: owners.into_iter().collect(),
        years: years.into_iter().collect(),
    }
}

// ============================================================================
// REPORTER
// ============================================================================

#[derive(Clone)]
pub struct Reporter {
    store: LedgerStore,
}

impl Reporter {
    pub fn new(store: LedgerStore) -> Self {
        Reporter { store }
    }

    /// Entries matching the filter, in ledger order
    pub fn entries(&self, filter: &EntryFilter) -> LedgerResult<Vec<LedgerEntry>> {
        let entries = self
            .store
            .with_conn(|conn| db::entries_for_stream(conn, filter.kind, filter.owner_id))?;
        Ok(entries.into_iter().filter(|e| filter.matches(e)).collect())
    }

    fn owner_names(&self, kind: OwnerKind) -> LedgerResult<HashMap<OwnerId, String>> {
        let owners = self.store.with_conn(|conn| db::list_owners(conn, kind))?;
        Ok(owners.into_iter().map(|o| (o.id, o.name)).collect())
    }

    pub fn total_amount(&self, filter: &EntryFilter) -> LedgerResult<Decimal> {
        total_amount(&self.entries(filter)?)
    }

    pub fn yearly_series(&self, filter: &EntryFilter) -> LedgerResult<Vec<YearPoint>> {
        yearly_series(&self.entries(filter)?)
    }

    pub fn pension_estimate(&self, filter: &EntryFilter, retired_count: u32, target_year: i32) -> LedgerResult<Decimal> {
        if retired_count == 0 {
            return Ok(Decimal::ZERO);
        }
        pension_estimate(&self.entries(filter)?, retired_count, target_year)
    }

    pub fn owner_count(&self, filter: &EntryFilter) -> LedgerResult<usize> {
        Ok(owner_count(&self.entries(filter)?))
    }

    pub fn grouped_by_owner(&self, filter: &EntryFilter) -> LedgerResult<Vec<OwnerTotal>> {
        let names = self.owner_names(filter.kind)?;
        grouped_by_owner(&self.entries(filter)?, &names)
    }

    pub fn copies_for_owner(&self, filter: &EntryFilter, owner_id: OwnerId) -> LedgerResult<i64> {
        let filter = filter.clone().owner(owner_id);
        copies_for_owner(&self.entries(&filter)?, owner_id)
    }

    pub fn filter_facets(&self, filter: &EntryFilter) -> LedgerResult<FilterFacets> {
        let names = self.owner_names(filter.kind)?;
        Ok(filter_facets(&self.entries(filter)?, &names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn entry(id: i64, owner_id: OwnerId, duty: &str, copies: i64, invoice: Option<(i32, u32, u32)>) -> LedgerEntry {
        let created_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        LedgerEntry {
            id,
            kind: OwnerKind::Company,
            owner_id,
            created_at,
            claim_value: Decimal::ONE,
            copies,
            rate: Decimal::ONE,
            exchange_rate: Decimal::ONE,
            invoice_date: invoice.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            note: None,
            recorded_by: "system".to_string(),
            own_duty: dec(duty),
            past_total: Decimal::ZERO,
            running_total: dec(duty),
            version: 1,
            sync_pending: false,
            updated_at: created_at,
        }
    }

    fn sample() -> Vec<LedgerEntry> {
        vec![
            entry(1, 1, "100", 2, Some((2022, 3, 1))),
            entry(2, 1, "50", 1, Some((2023, 7, 9))),
            entry(3, 2, "200", 4, Some((2023, 1, 15))),
            entry(4, 2, "10", 1, None), // reports in 2024 via created_at
        ]
    }

    fn names() -> HashMap<OwnerId, String> {
        HashMap::from([(1, "Acme".to_string()), (2, "Globex".to_string())])
    }

    #[test]
    fn test_total_amount() {
        assert_eq!(total_amount(&sample()).unwrap(), dec("360"));
        assert_eq!(total_amount(&[]).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_yearly_series_is_ascending_and_cumulative() {
        let series = yearly_series(&sample()).unwrap();

        let years: Vec<i32> = series.iter().map(|p| p.year).collect();
        assert_eq!(years, vec![2022, 2023, 2024]);
        assert_eq!(series[1].total, dec("250"));
        assert_eq!(series[1].cumulative, dec("350"));
        assert_eq!(series[2].cumulative, dec("360"));
    }

    #[test]
    fn test_pension_estimate() {
        // ((360 × 0.2) + (250 × 0.7)) / (3 × 12) = (72 + 175) / 36 = 6.861... → 6.86
        assert_eq!(pension_estimate(&sample(), 3, 2024).unwrap(), dec("6.86"));
    }

    #[test]
    fn test_pension_is_zero_without_retirees_or_entries() {
        assert_eq!(pension_estimate(&sample(), 0, 2024).unwrap(), Decimal::ZERO);
        assert_eq!(pension_estimate(&[], 10, 2024).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_filter_uses_reporting_date_inclusive() {
        let filter = EntryFilter::stream(OwnerKind::Company).between(
            NaiveDate::from_ymd_opt(2023, 1, 15),
            NaiveDate::from_ymd_opt(2023, 7, 9),
        );
        let matched: Vec<i64> = sample().iter().filter(|e| filter.matches(e)).map(|e| e.id).collect();
        assert_eq!(matched, vec![2, 3]);

        let other_stream = EntryFilter::stream(OwnerKind::Sector);
        assert!(!sample().iter().any(|e| other_stream.matches(e)));
    }

    #[test]
    fn test_within_last_years() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let filter = EntryFilter::stream(OwnerKind::Company).within_last_years(1, today);
        let matched: Vec<i64> = sample().iter().filter(|e| filter.matches(e)).map(|e| e.id).collect();
        assert_eq!(matched, vec![2, 4]);
    }

    #[test]
    fn test_grouped_by_owner_orders_by_total_desc() {
        let grouped = grouped_by_owner(&sample(), &names()).unwrap();
        assert_eq!(grouped[0].owner_name, "Globex");
        assert_eq!(grouped[0].total, dec("210"));
        assert_eq!(grouped[1].owner_name, "Acme");
        assert_eq!(grouped[1].entries, 2);
        assert_eq!(owner_count(&sample()), 2);
    }

    #[test]
    fn test_copies_and_facets() {
        assert_eq!(copies_for_owner(&sample(), 2).unwrap(), 5);
        assert_eq!(copies_for_owner(&sample(), 99).unwrap(), 0);

        let facets = filter_facets(&sample(), &names());
        assert_eq!(facets.min_date, NaiveDate::from_ymd_opt(2022, 3, 1));
        assert_eq!(facets.max_date, NaiveDate::from_ymd_opt(2024, 6, 1));
        assert_eq!(facets.owners, vec![("Acme".to_string(), 2), ("Globex".to_string(), 2)]);
        assert_eq!(facets.years, vec![(2022, 1), (2023, 2), (2024, 1)]);
    }

    #[test]
    fn test_aggregates_out_of_range_are_errors() {
        let huge = "50000000000000000000000000000";
        let entries = vec![
            entry(1, 1, huge, 1, Some((2023, 1, 1))),
            entry(2, 1, huge, i64::MAX, Some((2023, 2, 1))),
        ];

        assert!(matches!(total_amount(&entries), Err(LedgerError::Overflow(_))));
        assert!(matches!(yearly_series(&entries), Err(LedgerError::Overflow(_))));
        assert!(matches!(pension_estimate(&entries, 1, 2024), Err(LedgerError::Overflow(_))));
        assert!(matches!(grouped_by_owner(&entries, &names()), Err(LedgerError::Overflow(_))));
        assert!(matches!(copies_for_owner(&entries, 1), Err(LedgerError::Overflow(_))));

        // One of them alone is fine
        assert_eq!(total_amount(&entries[..1]).unwrap(), dec(huge));
    }

    #[test]
    fn test_reporter_returns_overflow_instead_of_panicking() {
        let store = LedgerStore::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let owner = db::insert_owner(conn, OwnerKind::Sector, "Energy")?;
                let claim = crate::entities::ClaimInput::new(Decimal::ONE, 1);
                for _ in 0..2 {
                    db::insert_entry(conn, &owner, &claim, dec("50000000000000000000000000000"))?;
                }
                Ok(())
            })
            .unwrap();

        let reporter = Reporter::new(store);
        let filter = EntryFilter::stream(OwnerKind::Sector);
        let err = reporter.total_amount(&filter).unwrap_err();
        assert!(matches!(err, LedgerError::Overflow(_)));
        assert!(err.is_permanent());
        assert_eq!(reporter.owner_count(&filter).unwrap(), 1);
    }

    #[test]
    fn test_reporter_reads_store() {
        let store = LedgerStore::open_in_memory().unwrap();
        let acme = store
            .with_conn(|conn| {
                let owner = db::insert_owner(conn, OwnerKind::Company, "Acme")?;
                let claim = crate::entities::ClaimInput::new(dec("1000"), 1)
                    .with_invoice_date(NaiveDate::from_ymd_opt(2023, 5, 5).unwrap());
                db::insert_entry(conn, &owner, &claim, dec("1.50"))?;
                Ok(owner)
            })
            .unwrap();

        let reporter = Reporter::new(store);
        let filter = EntryFilter::stream(OwnerKind::Company);
        assert_eq!(reporter.total_amount(&filter).unwrap(), dec("1.50"));
        assert_eq!(reporter.copies_for_owner(&filter, acme.id).unwrap(), 1);
        assert_eq!(reporter.grouped_by_owner(&filter).unwrap()[0].owner_name, "Acme");
        assert_eq!(reporter.pension_estimate(&filter, 0, 2024).unwrap(), Decimal::ZERO);
        assert_eq!(reporter.owner_count(&EntryFilter::stream(OwnerKind::Sector)).unwrap(), 0);
    }
}
