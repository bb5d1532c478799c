//! Input records, the transformed feature frame and per-user prediction results.

use chrono::NaiveDate;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};

use crate::error::ServiceError;

pub type UserId = u64;

pub const FEATURE_COUNT: usize = 9;

/// Column order of the transformed frame, as consumed by the classifier.
pub const FEATURE_COLUMNS: [&str; FEATURE_COUNT] = [
    "duration_of_subscription",
    "female",
    "male",
    "city",
    "registered_via",
    "payment_method_id",
    "payment_plan_days",
    "actual_amount_paid",
    "is_auto_renew",
];

/// Raw input fields (query keys, JSON keys, CSV headers), user_id excluded.
pub const INPUT_COLUMNS: [&str; 9] = [
    "city",
    "gender",
    "registered_via",
    "payment_method_id",
    "payment_plan_days",
    "actual_amount_paid",
    "is_auto_renew",
    "transaction_date",
    "membership_expire_date",
];

/// One customer's raw attributes. Dates are `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub city: i64,
    pub gender: String,
    pub registered_via: i64,
    pub payment_method_id: i64,
    pub payment_plan_days: i64,
    pub actual_amount_paid: i64,
    pub is_auto_renew: i64,
    pub transaction_date: NaiveDate,
    pub membership_expire_date: NaiveDate,
}

impl UserRecord {
    /// Checks what the type system cannot. Consumes and returns the record so
    /// callers only ever hold validated values.
    pub fn validate(self) -> Result<Self, ServiceError> {
        if self.gender.trim().is_empty() {
            return Err(ServiceError::Validation("gender must not be empty".into()));
        }
        Ok(self)
    }
}

pub type FeatureRow = [f64; FEATURE_COUNT];

/// Output of the feature transform: one fixed-width row per input record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureFrame {
    rows: Vec<FeatureRow>,
}

impl FeatureFrame {
    pub fn new(rows: Vec<FeatureRow>) -> Self { Self { rows } }
    pub fn rows(&self) -> &[FeatureRow] { &self.rows }
    pub(crate) fn len(&self) -> usize { self.rows.len() }
}

/// The transformed features of one record plus the classifier's label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub duration_of_subscription: f64,
    pub female: f64,
    pub male: f64,
    pub city: f64,
    pub registered_via: f64,
    pub payment_method_id: f64,
    pub payment_plan_days: f64,
    pub actual_amount_paid: f64,
    pub is_auto_renew: f64,
    /// Older `userdata.json` files hold this as `1.0`/`0.0`; always written back as an integer.
    #[serde(deserialize_with = "integral_label")]
    pub predictions: i64,
}

fn integral_label<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Label {
        Int(i64),
        Float(f64),
    }
    match Label::deserialize(d)? {
        Label::Int(v) => Ok(v),
        Label::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
        Label::Float(f) => Err(D::Error::custom(format!("prediction label {f} is not an integer"))),
    }
}

impl PredictionResult {
    pub fn from_row(row: &FeatureRow, prediction: i64) -> Self {
        Self {
            duration_of_subscription: row[0],
            female: row[1],
            male: row[2],
            city: row[3],
            registered_via: row[4],
            payment_method_id: row[5],
            payment_plan_days: row[6],
            actual_amount_paid: row[7],
            is_auto_renew: row[8],
            predictions: prediction,
        }
    }
}
