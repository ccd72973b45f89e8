//! Context records rendered into outbound message bodies.

use chrono::{DateTime, Local, TimeZone};
use serde::Serialize;
use std::fmt;

pub const DEFAULT_UNIT: &str = "LABMR";

const PATIENT_LAST_PREFIX: &str = "L";
const PATIENT_FIRST_PREFIX: &str = "F";

/// Identity of one simulated bed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BedId {
    pub unit: String,
    pub bed: String,
}

impl BedId {
    pub fn new(unit: impl Into<String>, bed: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            bed: bed.into(),
        }
    }

    pub fn from_index(unit: impl Into<String>, index: usize) -> Self {
        Self::new(unit, index.to_string())
    }

    pub fn patient_id(&self) -> String {
        self.bed.clone()
    }

    pub fn patient_last(&self) -> String {
        format!("{PATIENT_LAST_PREFIX}{}", self.bed)
    }

    pub fn patient_first(&self) -> String {
        format!("{PATIENT_FIRST_PREFIX}{}", self.bed)
    }
}

impl fmt::Display for BedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.unit, self.bed)
    }
}

/// Format a timestamp as `YYYYMMDDHHMMSS.ffff±HHMM`.
///
/// The fractional part is truncated to four digits, not rounded.
pub fn format_timestamp<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    // Leap seconds report nanos >= 1e9
    let ten_thousandths = (at.timestamp_subsec_nanos() / 100_000).min(9_999);
    format!(
        "{}.{:04}{}",
        at.format("%Y%m%d%H%M%S"),
        ten_thousandths,
        at.format("%z")
    )
}

/// Fields available to the vitals and waveform templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageContext {
    pub unit: String,
    pub bed: String,
    #[serde(rename = "PatientID")]
    pub patient_id: String,
    pub patient_last: String,
    pub patient_first: String,
    pub datetime: String,
    pub datetime_sub1: String,
}

impl MessageContext {
    pub const FIELDS: &'static [&'static str] = &[
        "Unit",
        "Bed",
        "PatientID",
        "PatientLast",
        "PatientFirst",
        "Datetime",
        "DatetimeSub1",
    ];

    pub fn at<Tz>(bed: &BedId, now: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let one_second_earlier = now.clone() - chrono::Duration::seconds(1);
        Self {
            unit: bed.unit.clone(),
            bed: bed.bed.clone(),
            patient_id: bed.patient_id(),
            patient_last: bed.patient_last(),
            patient_first: bed.patient_first(),
            datetime: format_timestamp(now),
            datetime_sub1: format_timestamp(&one_second_earlier),
        }
    }

    pub fn now(bed: &BedId) -> Self {
        Self::at(bed, &Local::now())
    }
}

/// Fields available to the alarm template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AlarmContext {
    pub unit: String,
    pub bed: String,
    #[serde(rename = "PatientID")]
    pub patient_id: String,
    pub patient_last: String,
    pub patient_first: String,
    pub alarm_code: String,
    pub alarm_text: String,
    pub alarm_level: String,
    pub start: String,
    pub active: String,
}

impl AlarmContext {
    pub const FIELDS: &'static [&'static str] = &[
        "Unit",
        "Bed",
        "PatientID",
        "PatientLast",
        "PatientFirst",
        "AlarmCode",
        "AlarmText",
        "AlarmLevel",
        "Start",
        "Active",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn fixed_time() -> DateTime<FixedOffset> {
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        offset
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .unwrap()
            + chrono::Duration::microseconds(123_456)
    }

    #[test]
    fn test_bed_identity_derivations() {
        let bed = BedId::from_index("LABMR", 7);
        assert_eq!(bed.patient_id(), "7");
        assert_eq!(bed.patient_last(), "L7");
        assert_eq!(bed.patient_first(), "F7");
        assert_eq!(bed.to_string(), "LABMR_7");
    }

    #[test]
    fn test_timestamp_format_truncates_to_four_digits() {
        assert_eq!(format_timestamp(&fixed_time()), "20240309140507.1234-0500");
    }

    #[test]
    fn test_timestamp_positive_offset() {
        let offset = FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap();
        let at = offset.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(format_timestamp(&at), "19991231235959.0000+0530");
    }

    #[test]
    fn test_message_context_timestamps_one_second_apart() {
        let bed = BedId::from_index("LABMR", 3);
        let context = MessageContext::at(&bed, &fixed_time());
        assert_eq!(context.datetime, "20240309140507.1234-0500");
        assert_eq!(context.datetime_sub1, "20240309140506.1234-0500");
        assert_eq!(context.patient_last, "L3");
    }

    #[test]
    fn test_message_context_serializes_template_field_names() {
        let bed = BedId::from_index("LABMR", 1);
        let value = serde_json::to_value(MessageContext::at(&bed, &fixed_time())).unwrap();
        let object = value.as_object().unwrap();
        for field in MessageContext::FIELDS {
            assert!(object.contains_key(*field), "missing {field}");
        }
        assert_eq!(object.len(), MessageContext::FIELDS.len());
    }
}
