//! Lenient decoders for upstream JSON variability.
//!
//! Proxmox APIs return slightly different shapes between versions: numeric
//! fields arrive as strings, booleans as 0/1, and optional fields come and
//! go. These helpers tolerate both representations and only fail on a
//! structural mismatch, never on a missing optional field.

use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolLike {
    Bool(bool),
    Num(i64),
    Str(String),
}

/// Deserialize a `u64` that may arrive as a JSON number or string.
pub fn u64_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::U64(v) => Ok(v),
        NumOrStr::I64(v) => Ok(v.max(0) as u64),
        NumOrStr::F64(v) => Ok(v.max(0.0) as u64),
        NumOrStr::Str(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("not an integer: {s:?}"))),
    }
}

/// Deserialize an `Option<u64>` that may arrive as a number, string, or be absent.
pub fn opt_u64_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<NumOrStr>::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(NumOrStr::U64(v)) => Ok(Some(v)),
        Some(NumOrStr::I64(v)) => Ok(Some(v.max(0) as u64)),
        Some(NumOrStr::F64(v)) => Ok(Some(v.max(0.0) as u64)),
        Some(NumOrStr::Str(s)) => Ok(s.trim().parse::<u64>().ok()),
    }
}

/// Deserialize an `i64` that may arrive as a JSON number or string.
pub fn i64_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::U64(v) => Ok(v as i64),
        NumOrStr::I64(v) => Ok(v),
        NumOrStr::F64(v) => Ok(v as i64),
        NumOrStr::Str(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom(format!("not an integer: {s:?}"))),
    }
}

/// Deserialize an `f64` that may arrive as a JSON number or string.
/// Missing values are handled by `#[serde(default)]` at the field site.
pub fn f64_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::U64(v) => Ok(v as f64),
        NumOrStr::I64(v) => Ok(v as f64),
        NumOrStr::F64(v) => Ok(v),
        NumOrStr::Str(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("not a number: {s:?}"))),
    }
}

/// Deserialize a bool that may arrive as `true`, `1`, `"1"`, or `"true"`.
pub fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match BoolLike::deserialize(deserializer)? {
        BoolLike::Bool(b) => Ok(b),
        BoolLike::Num(n) => Ok(n != 0),
        BoolLike::Str(s) => Ok(matches!(s.trim(), "1" | "true" | "on" | "yes")),
    }
}

/// Deserialize an `Option<bool>` with the same tolerance as [`bool_or_int`].
pub fn opt_bool_or_int<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<BoolLike>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        BoolLike::Bool(b) => b,
        BoolLike::Num(n) => n != 0,
        BoolLike::Str(s) => matches!(s.trim(), "1" | "true" | "on" | "yes"),
    }))
}

/// Deserialize a string that may arrive as a JSON string or number
/// (PBS reports `backup-id` as a string where PVE uses an integer vmid).
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::U64(v) => Ok(v.to_string()),
        NumOrStr::I64(v) => Ok(v.to_string()),
        NumOrStr::F64(v) => Ok(v.to_string()),
        NumOrStr::Str(s) => Ok(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "u64_or_string")]
        mem: u64,
        #[serde(deserialize_with = "f64_or_string")]
        cpu: f64,
        #[serde(default, deserialize_with = "opt_bool_or_int")]
        shared: Option<bool>,
        #[serde(deserialize_with = "string_or_number")]
        vmid: String,
    }

    #[test]
    fn accepts_native_types() {
        let p: Probe =
            serde_json::from_str(r#"{"mem": 1024, "cpu": 0.25, "shared": true, "vmid": 100}"#)
                .unwrap();
        assert_eq!(p.mem, 1024);
        assert!((p.cpu - 0.25).abs() < f64::EPSILON);
        assert_eq!(p.shared, Some(true));
        assert_eq!(p.vmid, "100");
    }

    #[test]
    fn accepts_stringly_types() {
        let p: Probe =
            serde_json::from_str(r#"{"mem": "1024", "cpu": "0.25", "shared": 1, "vmid": "100"}"#)
                .unwrap();
        assert_eq!(p.mem, 1024);
        assert_eq!(p.shared, Some(true));
        assert_eq!(p.vmid, "100");
    }

    #[test]
    fn missing_optional_is_none_not_error() {
        let p: Probe = serde_json::from_str(r#"{"mem": 1, "cpu": 0, "vmid": "7"}"#).unwrap();
        assert_eq!(p.shared, None);
    }

    #[test]
    fn structural_mismatch_is_an_error() {
        let r = serde_json::from_str::<Probe>(r#"{"mem": "not-a-number", "cpu": 0, "vmid": 1}"#);
        assert!(r.is_err());
    }
}
