//! CSV decoding for bulk prediction uploads.
//!
//! The first column always holds the user id (any header name, blank cell =
//! allocate). Feature columns are located by header name among the rest;
//! unrecognised extra columns are ignored.

use chrono::NaiveDate;
use csv::StringRecord;
use tracing::debug;

use crate::error::ServiceError;
use crate::record::{UserId, UserRecord, INPUT_COLUMNS};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Position of each `INPUT_COLUMNS` entry within a row.
struct ColumnMap([usize; INPUT_COLUMNS.len()]);

impl ColumnMap {
    fn resolve(headers: &StringRecord) -> Result<Self, ServiceError> {
        let mut idx = [0usize; INPUT_COLUMNS.len()];
        let mut missing = Vec::new();
        for (slot, name) in idx.iter_mut().zip(INPUT_COLUMNS) {
            match headers.iter().skip(1).position(|h| h.eq_ignore_ascii_case(name)) {
                Some(p) => *slot = p + 1,
                None => missing.push(name),
            }
        }
        if !missing.is_empty() {
            return Err(invalid(format!("missing feature columns: {}", missing.join(", "))));
        }
        let extra = headers.len() - 1 - INPUT_COLUMNS.len();
        if extra > 0 {
            debug!(extra, "ignoring unrecognised CSV columns");
        }
        Ok(Self(idx))
    }

    fn field<'r>(&self, row: &'r StringRecord, col: usize) -> &'r str {
        row.get(self.0[col]).unwrap_or("")
    }

    fn record(&self, row: &StringRecord, line: u64) -> Result<UserRecord, ServiceError> {
        let int = |col: usize| -> Result<i64, ServiceError> {
            let raw = self.field(row, col);
            parse_integer(raw).ok_or_else(|| invalid(format!("line {line}: column {}: invalid integer '{raw}'", INPUT_COLUMNS[col])))
        };
        let date = |col: usize| -> Result<NaiveDate, ServiceError> {
            let raw = self.field(row, col);
            NaiveDate::parse_from_str(raw, DATE_FORMAT)
                .map_err(|e| invalid(format!("line {line}: column {}: invalid date '{raw}': {e}", INPUT_COLUMNS[col])))
        };
        let user_id = parse_user_id(row.get(0).unwrap_or(""))
            .map_err(|raw| invalid(format!("line {line}: invalid user id '{raw}'")))?;
        UserRecord {
            user_id,
            city: int(0)?,
            gender: self.field(row, 1).to_string(),
            registered_via: int(2)?,
            payment_method_id: int(3)?,
            payment_plan_days: int(4)?,
            actual_amount_paid: int(5)?,
            is_auto_renew: int(6)?,
            transaction_date: date(7)?,
            membership_expire_date: date(8)?,
        }
        .validate()
        .map_err(|e| match e {
            ServiceError::Validation(m) => invalid(format!("line {line}: {m}")),
            other => other,
        })
    }
}

fn invalid(msg: String) -> ServiceError { ServiceError::Validation(msg) }

/// Accepts `7` and the float spelling `7.0` that spreadsheet exports produce.
fn parse_integer(raw: &str) -> Option<i64> {
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }
    let f = raw.parse::<f64>().ok()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

fn parse_user_id(raw: &str) -> Result<Option<UserId>, &str> {
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    match parse_integer(raw) {
        Some(v) if v >= 0 => Ok(Some(v as UserId)),
        _ => Err(raw),
    }
}

/// Parses a whole upload. Nothing is returned unless every row is valid.
pub fn parse_csv(data: &[u8]) -> Result<Vec<UserRecord>, ServiceError> {
    let csv_err = |e: csv::Error| invalid(format!("CSV not loaded correctly: {e}"));
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(data);
    let headers = reader.headers().map_err(csv_err)?.clone();
    if headers.len() < 2 {
        return Err(invalid("CSV needs a user id column followed by feature columns".into()));
    }
    let columns = ColumnMap::resolve(&headers)?;
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_err)?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);
        records.push(columns.record(&row, line)?);
    }
    if records.is_empty() {
        return Err(invalid("CSV contains no data rows".into()));
    }
    Ok(records)
}
