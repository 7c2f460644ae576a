//! Device filtering
//!
//! Restricts which devices the session manager exposes. The same filter is
//! applied to enumeration and to hotplug notifications, so a filtered device
//! never shows up in either.

use crate::usb::host::RawDevice;
use tracing::trace;

/// Linux Foundation vendor id, used by root hubs
const ROOT_HUB_VID: u16 = 0x1d6b;
/// Hub device class
const HUB_CLASS: u8 = 0x09;

/// One `VID:PID` pattern; `None` matches anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterPattern {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl FilterPattern {
    /// Parse `"0x1209:0x0001"`, `"0x1209:*"`, `"*:0x0001"` or `"*:*"`
    pub fn parse(filter: &str) -> Result<Self, String> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1209:0x0001' or '0x1209:*')",
                filter
            ));
        }

        Ok(Self {
            vendor_id: parse_component(parts[0], "VID")?,
            product_id: parse_component(parts[1], "PID")?,
        })
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }
}

fn parse_component(id: &str, name: &str) -> Result<Option<u16>, String> {
    if id == "*" {
        return Ok(None);
    }

    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| format!("Invalid {} '{}', must start with '0x' (e.g., '0x1209')", name, id))?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(format!("Invalid {} '{}', hex part must be 1-4 digits", name, id));
    }

    u16::from_str_radix(hex_part, 16)
        .map(Some)
        .map_err(|_| format!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Which devices the core exposes
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    /// Empty means every VID:PID is allowed
    patterns: Vec<FilterPattern>,
    cdc_acm_only: bool,
    skip_root_hubs: bool,
}

impl DeviceFilter {
    /// Filter that lets every device through
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new(filters: &[String], cdc_acm_only: bool, skip_root_hubs: bool) -> Result<Self, String> {
        let patterns = filters
            .iter()
            .map(|f| FilterPattern::parse(f))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            patterns,
            cdc_acm_only,
            skip_root_hubs,
        })
    }

    pub fn allows(&self, device: &RawDevice) -> bool {
        self.check(device, true)
    }

    /// Filter for a device that has just left the bus
    ///
    /// A removal snapshot may lack the configuration descriptor, so the
    /// CDC-ACM interface requirement is not applied. Vendor/product patterns
    /// and the root hub rule still are.
    pub fn allows_departed(&self, device: &RawDevice) -> bool {
        self.check(device, false)
    }

    fn check(&self, device: &RawDevice, interfaces_known: bool) -> bool {
        if self.skip_root_hubs
            && device.vendor_id == ROOT_HUB_VID
            && device.class_code == HUB_CLASS
        {
            trace!(%device, "Skipping root hub");
            return false;
        }

        if interfaces_known && self.cdc_acm_only && !device.cdc_acm {
            trace!(%device, "Skipping non CDC-ACM device");
            return false;
        }

        let allowed = self.patterns.is_empty()
            || self
                .patterns
                .iter()
                .any(|p| p.matches(device.vendor_id, device.product_id));
        if !allowed {
            trace!(%device, "Device ignored by filter");
        }
        allowed
    }
}
