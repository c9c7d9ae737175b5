//! Canonical value conversion
//!
//! Every captured property value is reduced to a canonical string before it is
//! compared or written to a document. Two values are "changed" exactly when
//! their canonical strings differ, so `5_i32` and `5.0_f64` compare equal and a
//! timestamp compares by instant regardless of the offset it was taken in.

use at_common::timestamp;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use uuid::Uuid;

/// A property value as seen by the change extractor
#[derive(Debug, Clone, PartialEq)]
pub enum AuditValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(Uuid),
    /// Enumeration member, rendered by name
    Enum(String),
}

impl AuditValue {
    /// Enumeration member rendered by its name
    pub fn enumeration(name: impl Into<String>) -> Self {
        AuditValue::Enum(name.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AuditValue::Null)
    }

    /// Canonical text of the value; `None` for null
    pub fn canonical(&self) -> Option<String> {
        to_canonical_string(self)
    }
}

/// Convert a value to its canonical, culture-independent string form
pub fn to_canonical_string(value: &AuditValue) -> Option<String> {
    match value {
        AuditValue::Null => None,
        AuditValue::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
        AuditValue::Int(i) => Some(i.to_string()),
        AuditValue::UInt(u) => Some(u.to_string()),
        AuditValue::Float(f) => Some(format_float(*f)),
        AuditValue::Text(s) => Some(s.clone()),
        AuditValue::Timestamp(ts) => Some(timestamp::format(ts)),
        AuditValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        AuditValue::Uuid(u) => Some(u.hyphenated().to_string()),
        AuditValue::Enum(name) => Some(name.clone()),
    }
}

/// Whether two values differ after canonicalization
pub fn has_changed(before: &AuditValue, after: &AuditValue) -> bool {
    to_canonical_string(before) != to_canonical_string(after)
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if f == 0.0 {
        // -0 and 0 are the same value
        "0".to_string()
    } else {
        // Display gives the shortest representation that round-trips
        f.to_string()
    }
}

/// Conversion of a property's runtime value into an [`AuditValue`]
pub trait ToAuditValue {
    fn to_audit_value(&self) -> AuditValue;
}

impl ToAuditValue for AuditValue {
    fn to_audit_value(&self) -> AuditValue {
        self.clone()
    }
}

impl<T: ToAuditValue + ?Sized> ToAuditValue for &T {
    fn to_audit_value(&self) -> AuditValue {
        (**self).to_audit_value()
    }
}

impl<T: ToAuditValue> ToAuditValue for Option<T> {
    fn to_audit_value(&self) -> AuditValue {
        match self {
            Some(v) => v.to_audit_value(),
            None => AuditValue::Null,
        }
    }
}

macro_rules! signed_to_audit_value {
    ($($t:ty),*) => {
        $(impl ToAuditValue for $t {
            fn to_audit_value(&self) -> AuditValue {
                AuditValue::Int(*self as i64)
            }
        })*
    };
}

macro_rules! unsigned_to_audit_value {
    ($($t:ty),*) => {
        $(impl ToAuditValue for $t {
            fn to_audit_value(&self) -> AuditValue {
                AuditValue::UInt(*self as u64)
            }
        })*
    };
}

signed_to_audit_value!(i8, i16, i32, i64, isize);
unsigned_to_audit_value!(u8, u16, u32, u64, usize);

impl ToAuditValue for bool {
    fn to_audit_value(&self) -> AuditValue {
        AuditValue::Bool(*self)
    }
}

impl ToAuditValue for f64 {
    fn to_audit_value(&self) -> AuditValue {
        AuditValue::Float(*self)
    }
}

impl ToAuditValue for f32 {
    fn to_audit_value(&self) -> AuditValue {
        // Widen through the shortest f32 text so 0.1f32 stays "0.1"
        let widened = self.to_string().parse::<f64>().unwrap_or(*self as f64);
        AuditValue::Float(widened)
    }
}

impl ToAuditValue for str {
    fn to_audit_value(&self) -> AuditValue {
        AuditValue::Text(self.to_string())
    }
}

impl ToAuditValue for String {
    fn to_audit_value(&self) -> AuditValue {
        AuditValue::Text(self.clone())
    }
}

impl ToAuditValue for char {
    fn to_audit_value(&self) -> AuditValue {
        AuditValue::Text(self.to_string())
    }
}

impl ToAuditValue for DateTime<Utc> {
    fn to_audit_value(&self) -> AuditValue {
        AuditValue::Timestamp(*self)
    }
}

impl ToAuditValue for DateTime<FixedOffset> {
    fn to_audit_value(&self) -> AuditValue {
        AuditValue::Timestamp(self.with_timezone(&Utc))
    }
}

/// Naive timestamps are taken to be UTC
impl ToAuditValue for NaiveDateTime {
    fn to_audit_value(&self) -> AuditValue {
        AuditValue::Timestamp(self.and_utc())
    }
}

impl ToAuditValue for NaiveDate {
    fn to_audit_value(&self) -> AuditValue {
        AuditValue::Date(*self)
    }
}

impl ToAuditValue for Uuid {
    fn to_audit_value(&self) -> AuditValue {
        AuditValue::Uuid(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_numbers_are_culture_independent() {
        assert_eq!(12.99_f64.to_audit_value().canonical().unwrap(), "12.99");
        assert_eq!(1234567.5_f64.to_audit_value().canonical().unwrap(), "1234567.5");
        assert_eq!(0.1_f32.to_audit_value().canonical().unwrap(), "0.1");
        assert_eq!((-0.0_f64).to_audit_value().canonical().unwrap(), "0");
        assert_eq!(f64::INFINITY.to_audit_value().canonical().unwrap(), "Infinity");
    }

    #[test]
    fn test_integer_and_float_compare_by_value() {
        assert!(!has_changed(&5_i32.to_audit_value(), &5.0_f64.to_audit_value()));
        assert!(has_changed(&100_u32.to_audit_value(), &95_u32.to_audit_value()));
    }

    #[test]
    fn test_null_handling() {
        let none: Option<String> = None;
        assert_eq!(none.to_audit_value(), AuditValue::Null);
        assert_eq!(to_canonical_string(&AuditValue::Null), None);
        assert!(has_changed(&AuditValue::Null, &"x".to_audit_value()));
        assert!(!has_changed(&AuditValue::Null, &Option::<i32>::None.to_audit_value()));
        // empty text is a value, not null
        assert!(has_changed(&AuditValue::Null, &"".to_audit_value()));
    }

    #[test]
    fn test_timestamps_compare_by_instant() {
        let utc = Utc.with_ymd_and_hms(2024, 12, 11, 10, 30, 0).unwrap();
        let offset = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 12, 11, 12, 30, 0)
            .unwrap();
        assert_eq!(utc.to_audit_value().canonical().unwrap(), "2024-12-11T10:30:00Z");
        assert!(!has_changed(&utc.to_audit_value(), &offset.to_audit_value()));
    }

    #[test]
    fn test_other_scalars() {
        let id = Uuid::parse_str("67E55044-10B1-426F-9247-BB680E5FE0C8").unwrap();
        assert_eq!(
            id.to_audit_value().canonical().unwrap(),
            "67e55044-10b1-426f-9247-bb680e5fe0c8"
        );
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(date.to_audit_value().canonical().unwrap(), "2024-02-29");
        assert_eq!(true.to_audit_value().canonical().unwrap(), "true");
        assert_eq!(
            AuditValue::enumeration("Active").canonical().unwrap(),
            "Active"
        );
    }
}
