//! USB device types shared between the capture library and the CLI

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A capture-capable device found during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Serial number string, used as the device locator
    pub serial: String,
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} serial={} bus={:03} addr={:03}",
            self.vendor_id, self.product_id, self.serial, self.bus, self.address
        )
    }
}

/// VID:PID device filter
///
/// Accepted forms: `0x1733:0xAABB`, `0x1733:*`, `*:0xAABB` and `*:*`.
/// `None` on either side matches any id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    /// Filter matching exactly one VID:PID pair
    pub fn exact(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
        }
    }

    /// Filter matching every device
    pub fn any() -> Self {
        Self {
            vendor_id: None,
            product_id: None,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }

    /// Check a VID/PID pair against a filter list
    ///
    /// An empty list allows every device.
    pub fn any_matches(filters: &[DeviceFilter], vendor_id: u16, product_id: u16) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
    }

    fn parse_id(filter: &str, part: &str, name: &str) -> crate::Result<Option<u16>> {
        if part == "*" {
            return Ok(None);
        }

        let invalid = |reason: String| crate::Error::Filter {
            filter: filter.to_string(),
            reason,
        };

        let hex_part = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .ok_or_else(|| invalid(format!("{} '{}' must start with '0x'", name, part)))?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(invalid(format!(
                "{} '{}' hex part must be 1-4 digits",
                name, part
            )));
        }

        u16::from_str_radix(hex_part, 16)
            .map(Some)
            .map_err(|_| invalid(format!("{} '{}' is not a valid hex number", name, part)))
    }
}

impl FromStr for DeviceFilter {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 2 {
            return Err(crate::Error::Filter {
                filter: s.to_string(),
                reason: "expected VID:PID (e.g. '0x1733:0xAABB' or '0x1733:*')".to_string(),
            });
        }

        Ok(Self {
            vendor_id: Self::parse_id(s, parts[0], "VID")?,
            product_id: Self::parse_id(s, parts[1], "PID")?,
        })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(v) => write!(f, "{:#06x}", v)?,
            None => write!(f, "*")?,
        }
        write!(f, ":")?;
        match self.product_id {
            Some(p) => write!(f, "{:#06x}", p),
            None => write!(f, "*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_filters() {
        assert_eq!(
            "0x1733:0xAABB".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::exact(0x1733, 0xAABB)
        );
        assert_eq!(
            "0x1733:*".parse::<DeviceFilter>().unwrap(),
            DeviceFilter {
                vendor_id: Some(0x1733),
                product_id: None
            }
        );
        assert_eq!("*:*".parse::<DeviceFilter>().unwrap(), DeviceFilter::any());
        assert!("0XABCD:0xEF01".parse::<DeviceFilter>().is_ok());
    }

    #[test]
    fn test_parse_invalid_filters() {
        assert!("1733:AABB".parse::<DeviceFilter>().is_err());
        assert!("0x1733".parse::<DeviceFilter>().is_err());
        assert!("0x1733:0xAABB:0x1".parse::<DeviceFilter>().is_err());
        assert!("0xGHIJ:0x5678".parse::<DeviceFilter>().is_err());
        assert!("0x12345:0x5678".parse::<DeviceFilter>().is_err());
        assert!("0x:0x5678".parse::<DeviceFilter>().is_err());
    }

    #[test]
    fn test_filter_matching() {
        let filters = vec![
            DeviceFilter::exact(0x1234, 0x5678),
            "0xABCD:*".parse().unwrap(),
        ];

        assert!(DeviceFilter::any_matches(&filters, 0x1234, 0x5678));
        assert!(DeviceFilter::any_matches(&filters, 0xABCD, 0x1111));
        assert!(!DeviceFilter::any_matches(&filters, 0x1234, 0x9999));
        assert!(!DeviceFilter::any_matches(&filters, 0x9999, 0x5678));

        // Empty filters = allow all
        assert!(DeviceFilter::any_matches(&[], 0x1234, 0x5678));
    }

    #[test]
    fn test_filter_display_round_trips() {
        let filter = DeviceFilter::exact(0x1733, 0xaabb);
        assert_eq!(filter.to_string(), "0x1733:0xaabb");
        assert_eq!(filter.to_string().parse::<DeviceFilter>().unwrap(), filter);
        assert_eq!(DeviceFilter::any().to_string(), "*:*");
    }

    #[test]
    fn test_device_summary_serializes() {
        let summary = DeviceSummary {
            vendor_id: 0x1733,
            product_id: 0xAABB,
            serial: "SN123".to_string(),
            bus: 1,
            address: 4,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"serial\":\"SN123\""));
        assert_eq!(summary.to_string(), "1733:aabb serial=SN123 bus=001 addr=004");
    }
}
