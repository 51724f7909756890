// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property columns requested from `zfs list` / `zpool get`, and the
//! setters which store each column into its record.
//!
//! Every property is an enum variant, and [DatasetProperty::apply] and
//! [ZpoolProperty::apply] match exhaustively: adding a column without
//! teaching the record how to store it does not compile.
//!
//! Value policy: the `-` sentinel ("no value") becomes the zero value of
//! the field's type. Anything else which fails to parse is an error rather
//! than being coerced to zero.

use crate::config::Platform;
use crate::zfs::Dataset;
use crate::zpool::{ZpoolHealth, ZpoolInfo};

use itertools::Itertools;

/// The value printed by the tools for a property which has no value.
pub const NONE_SENTINEL: &str = "-";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Failed to parse output: {0}")]
pub struct ParseError(pub(crate) String);

impl ParseError {
    pub fn message(&self) -> &str {
        &self.0
    }
}

/// A column of `zfs list` output.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
)]
#[strum(serialize_all = "lowercase")]
pub enum DatasetProperty {
    Name,
    Origin,
    Used,
    #[strum(to_string = "available", serialize = "avail")]
    Available,
    Mountpoint,
    Compression,
    Type,
    Volsize,
    Quota,
    Referenced,
    Written,
    Logicalused,
    Usedbydataset,
}

impl DatasetProperty {
    /// Stores `value` into the field of `dataset` backing this property.
    pub fn apply(
        self,
        dataset: &mut Dataset,
        value: &str,
    ) -> Result<(), ParseError> {
        use DatasetProperty::*;
        match self {
            Name => dataset.name = parse_string(value),
            Origin => dataset.origin = parse_string(value),
            Used => dataset.used = parse_u64(self, value)?,
            Available => dataset.available = parse_u64(self, value)?,
            Mountpoint => dataset.mountpoint = parse_string(value),
            Compression => dataset.compression = parse_string(value),
            Type => {
                dataset.dataset_type = value.parse().map_err(|_| {
                    ParseError(format!("Unrecognized dataset type: {value}"))
                })?
            }
            Volsize => dataset.volsize = parse_u64(self, value)?,
            Quota => dataset.quota = parse_u64(self, value)?,
            Referenced => dataset.referenced = parse_u64(self, value)?,
            Written => dataset.written = parse_u64(self, value)?,
            Logicalused => dataset.logicalused = parse_u64(self, value)?,
            Usedbydataset => dataset.usedbydataset = parse_u64(self, value)?,
        }
        Ok(())
    }
}

/// A property reported by `zpool get`.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
)]
#[strum(serialize_all = "lowercase")]
pub enum ZpoolProperty {
    Name,
    Health,
    Allocated,
    Size,
    Free,
    Readonly,
    Dedupratio,
    Fragmentation,
    Freeing,
    Leaked,
}

impl ZpoolProperty {
    /// Stores `value` into the field of `pool` backing this property.
    ///
    /// When `exact_sizes` is false, sizes are expected in human-readable
    /// form (e.g. `1.50G`).
    pub fn apply(
        self,
        pool: &mut ZpoolInfo,
        value: &str,
        exact_sizes: bool,
    ) -> Result<(), ParseError> {
        use ZpoolProperty::*;
        let size = |value: &str| {
            if exact_sizes {
                parse_u64(self, value)
            } else {
                parse_bytes(value)
            }
        };
        match self {
            Name => pool.name = parse_string(value),
            Health => {
                pool.health = if value == NONE_SENTINEL {
                    None
                } else {
                    Some(value.parse::<ZpoolHealth>()?)
                }
            }
            Allocated => pool.allocated = size(value)?,
            Size => pool.size = size(value)?,
            Free => pool.free = size(value)?,
            Readonly => pool.readonly = value == "on",
            Dedupratio => {
                pool.dedupratio = parse_f64(self, value.trim_end_matches('x'))?
            }
            Fragmentation => {
                pool.fragmentation =
                    parse_u64(self, value.trim_end_matches('%'))?
            }
            Freeing => pool.freeing = size(value)?,
            Leaked => pool.leaked = size(value)?,
        }
        Ok(())
    }
}

const OPENZFS_DATASET_PROPERTIES: &[DatasetProperty] = &[
    DatasetProperty::Name,
    DatasetProperty::Origin,
    DatasetProperty::Used,
    DatasetProperty::Available,
    DatasetProperty::Mountpoint,
    DatasetProperty::Compression,
    DatasetProperty::Type,
    DatasetProperty::Volsize,
    DatasetProperty::Quota,
    DatasetProperty::Referenced,
    DatasetProperty::Written,
    DatasetProperty::Logicalused,
    DatasetProperty::Usedbydataset,
];

// No written, logicalused or usedbydataset.
const SOLARIS_DATASET_PROPERTIES: &[DatasetProperty] = &[
    DatasetProperty::Name,
    DatasetProperty::Origin,
    DatasetProperty::Used,
    DatasetProperty::Available,
    DatasetProperty::Mountpoint,
    DatasetProperty::Compression,
    DatasetProperty::Type,
    DatasetProperty::Volsize,
    DatasetProperty::Quota,
    DatasetProperty::Referenced,
];

const OPENZFS_ZPOOL_PROPERTIES: &[ZpoolProperty] = &[
    ZpoolProperty::Name,
    ZpoolProperty::Health,
    ZpoolProperty::Allocated,
    ZpoolProperty::Size,
    ZpoolProperty::Free,
    ZpoolProperty::Readonly,
    ZpoolProperty::Dedupratio,
    ZpoolProperty::Fragmentation,
    ZpoolProperty::Freeing,
    ZpoolProperty::Leaked,
];

const SOLARIS_ZPOOL_PROPERTIES: &[ZpoolProperty] = &[
    ZpoolProperty::Name,
    ZpoolProperty::Health,
    ZpoolProperty::Allocated,
    ZpoolProperty::Size,
    ZpoolProperty::Free,
    ZpoolProperty::Readonly,
    ZpoolProperty::Dedupratio,
];

impl Platform {
    /// Columns requested from `zfs list`, in order.
    pub fn dataset_properties(&self) -> &'static [DatasetProperty] {
        match self {
            Platform::OpenZfs => OPENZFS_DATASET_PROPERTIES,
            Platform::Solaris => SOLARIS_DATASET_PROPERTIES,
        }
    }

    /// Properties requested from `zpool get`.
    pub fn zpool_properties(&self) -> &'static [ZpoolProperty] {
        match self {
            Platform::OpenZfs => OPENZFS_ZPOOL_PROPERTIES,
            Platform::Solaris => SOLARIS_ZPOOL_PROPERTIES,
        }
    }

    /// Whether `zpool get` accepts `-p` for exact, parseable sizes.
    pub fn exact_zpool_sizes(&self) -> bool {
        match self {
            Platform::OpenZfs => true,
            Platform::Solaris => false,
        }
    }
}

/// Joins properties into the comma-separated form accepted by `-o`.
pub fn property_list<P>(properties: &[P]) -> String
where
    P: Copy + Into<&'static str>,
{
    properties.iter().map(|p| -> &'static str { (*p).into() }).join(",")
}

fn parse_string(value: &str) -> String {
    if value == NONE_SENTINEL {
        String::new()
    } else {
        value.to_string()
    }
}

fn parse_u64<P: std::fmt::Display>(
    property: P,
    value: &str,
) -> Result<u64, ParseError> {
    if value == NONE_SENTINEL {
        return Ok(0);
    }
    value.parse::<u64>().map_err(|e| {
        ParseError(format!("Failed to parse field '{property}': {value}: {e}"))
    })
}

fn parse_f64<P: std::fmt::Display>(
    property: P,
    value: &str,
) -> Result<f64, ParseError> {
    if value == NONE_SENTINEL {
        return Ok(0.0);
    }
    value.parse::<f64>().map_err(|e| {
        ParseError(format!("Failed to parse field '{property}': {value}: {e}"))
    })
}

/// Parses a human-readable size such as `1.50G` or `512` into bytes.
pub fn parse_bytes(value: &str) -> Result<u64, ParseError> {
    if value == NONE_SENTINEL {
        return Ok(0);
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let number = number.parse::<f64>().map_err(|e| {
        ParseError(format!("Failed to parse size '{value}': {e}"))
    })?;

    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        "p" => 1 << 50,
        "e" => 1 << 60,
        other => {
            return Err(ParseError(format!(
                "Unhandled size suffix '{other}' in '{value}'"
            )))
        }
    };

    let bytes = number * multiplier as f64;
    if bytes >= u64::MAX as f64 {
        return Err(ParseError(format!("Size too large: {value}")));
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("512").unwrap(), 512);
        assert_eq!(parse_bytes("1K").unwrap(), 1024);
        assert_eq!(parse_bytes("1.5G").unwrap(), 3 << 29);
        assert_eq!(parse_bytes("2.00T").unwrap(), 2 << 40);
        assert_eq!(parse_bytes("-").unwrap(), 0);
    }

    #[test]
    fn test_parse_bytes_errors() {
        assert!(parse_bytes("12Q").is_err());
        assert!(parse_bytes("G").is_err());
        assert!(parse_bytes("16E").is_err());
    }

    #[test]
    fn test_property_lists() {
        assert_eq!(
            property_list(Platform::OpenZfs.dataset_properties()),
            "name,origin,used,available,mountpoint,compression,type,\
             volsize,quota,referenced,written,logicalused,usedbydataset"
        );
        assert_eq!(
            property_list(Platform::Solaris.dataset_properties()),
            "name,origin,used,available,mountpoint,compression,type,\
             volsize,quota,referenced"
        );
        assert_eq!(
            property_list(Platform::Solaris.zpool_properties()),
            "name,health,allocated,size,free,readonly,dedupratio"
        );
    }

    #[test]
    fn test_property_names_round_trip() {
        for property in Platform::OpenZfs.dataset_properties() {
            let name: &'static str = (*property).into();
            assert_eq!(name.parse::<DatasetProperty>().unwrap(), *property);
        }
        assert_eq!(
            "avail".parse::<DatasetProperty>().unwrap(),
            DatasetProperty::Available
        );
    }

    #[test]
    fn test_dataset_sentinel_is_zero() {
        let mut dataset = Dataset::default();
        DatasetProperty::Quota.apply(&mut dataset, "-").unwrap();
        DatasetProperty::Origin.apply(&mut dataset, "-").unwrap();
        assert_eq!(dataset.quota, 0);
        assert_eq!(dataset.origin, "");
    }

    #[test]
    fn test_dataset_bad_number_is_error() {
        let mut dataset = Dataset::default();
        let err =
            DatasetProperty::Used.apply(&mut dataset, "12K").unwrap_err();
        assert!(err.message().contains("'used'"), "{err}");
    }

    #[test]
    fn test_zpool_values() {
        let mut pool = ZpoolInfo::default();
        ZpoolProperty::Fragmentation.apply(&mut pool, "15%", true).unwrap();
        ZpoolProperty::Dedupratio.apply(&mut pool, "1.50x", true).unwrap();
        ZpoolProperty::Readonly.apply(&mut pool, "off", true).unwrap();
        ZpoolProperty::Health.apply(&mut pool, "DEGRADED", true).unwrap();
        ZpoolProperty::Size.apply(&mut pool, "1.5G", false).unwrap();
        assert_eq!(pool.fragmentation, 15);
        assert_eq!(pool.dedupratio, 1.5);
        assert!(!pool.readonly);
        assert_eq!(pool.health, Some(ZpoolHealth::Degraded));
        assert_eq!(pool.size, 3 << 29);
    }

    #[test]
    fn test_zpool_untracked_fragmentation() {
        let mut pool = ZpoolInfo::default();
        ZpoolProperty::Fragmentation.apply(&mut pool, "-", true).unwrap();
        assert_eq!(pool.fragmentation, 0);
    }
}
