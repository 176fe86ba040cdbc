use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// V4L2 integer control.
pub const CONTROL_TYPE_INTEGER: u32 = 1;
/// V4L2 boolean control.
pub const CONTROL_TYPE_BOOLEAN: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlValue {
    pub id: u32,
    pub value: i64,
}

/// One adjustable device control as reported by the remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlDescriptor {
    pub id: u32,
    pub min: i64,
    pub max: i64,
    #[serde(default = "default_step")]
    pub step: i64,
    #[serde(default)]
    pub default: i64,
    #[serde(rename = "type")]
    pub control_type: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    /// Shift applied by [`ControlDescriptor::normalized`]; zero when the
    /// range was already non-negative.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: i64,
}

fn default_step() -> i64 {
    1
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Control name to descriptor, as sent in a `ctrls` object.
pub type ControlCatalog = BTreeMap<String, ControlDescriptor>;

impl ControlDescriptor {
    pub fn is_toggle(&self) -> bool {
        self.control_type == CONTROL_TYPE_BOOLEAN
    }

    pub fn is_converted(&self) -> bool {
        self.offset != 0
    }

    /// Range slider widgets cannot start below zero, so negative ranges are
    /// shifted up by `|min|`.
    pub fn normalized(&self) -> Self {
        if self.min >= 0 || self.is_converted() {
            return self.clone();
        }
        let shift = self.min.saturating_neg();
        Self {
            min: 0,
            max: self.max.saturating_add(shift),
            default: self.default.saturating_add(shift),
            value: self.value.map(|value| value.saturating_add(shift)),
            offset: shift,
            ..self.clone()
        }
    }

    /// Converts a value in the presented range back into the device range.
    pub fn device_value(&self, presented: i64) -> i64 {
        presented.saturating_sub(self.offset)
    }

    pub fn toggle_value(checked: bool) -> i64 {
        if checked { 1 } else { 0 }
    }
}

pub fn normalize_catalog(catalog: &ControlCatalog) -> ControlCatalog {
    catalog
        .iter()
        .map(|(name, descriptor)| (name.clone(), descriptor.normalized()))
        .collect()
}
