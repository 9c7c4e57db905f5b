//! Telemetry layout and frame decoding.
//!
//! A [`Layout`] names each `f32` slot of the device state frame. Every
//! inbound frame on the telemetry subject is decoded against it into a
//! [`TelemetryRecord`].

use crate::codec;
use crate::error::{GatewayError, Result};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashSet;
use std::sync::Arc;

/// Field order of the aeropendulum state frame published by the ESP32.
pub const DEFAULT_LAYOUT: [&str; 11] = [
    "mode", "yk", "rk", "uk", "ek", "M1", "M2", "vel_man", "Kp", "Ki", "Kd",
];

/// Ordered field names of a telemetry frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    fields: Arc<[String]>,
}

impl Layout {
    /// Build a layout, rejecting empty, blank or duplicate field names.
    pub fn new<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(GatewayError::Config("telemetry layout is empty".to_string()));
        }

        let mut seen = HashSet::with_capacity(fields.len());
        for field in &fields {
            if field.trim().is_empty() {
                return Err(GatewayError::Config(
                    "telemetry layout contains an empty field name".to_string(),
                ));
            }
            if !seen.insert(field.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate telemetry field: {}",
                    field
                )));
            }
        }

        Ok(Self {
            fields: fields.into(),
        })
    }

    /// Number of float slots in a frame.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Always false for a constructed layout.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Expected frame size in bytes.
    pub fn frame_len(&self) -> usize {
        self.fields.len() * codec::FLOAT_WIDTH
    }

    /// Field names in wire order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            fields: DEFAULT_LAYOUT.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// One decoded frame: field name → value, in layout order.
///
/// Serializes as a JSON object whose keys follow the layout.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    layout: Layout,
    values: Box<[f32]>,
}

impl TelemetryRecord {
    /// Value of a field, if the layout has it.
    pub fn get(&self, field: &str) -> Option<f32> {
        self.layout
            .fields()
            .iter()
            .position(|f| f == field)
            .map(|i| self.values[i])
    }

    /// Iterate over `(field, value)` pairs in layout order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> + '_ {
        self.layout
            .fields()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for TelemetryRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (field, value) in self.iter() {
            map.serialize_entry(field, &value)?;
        }
        map.end()
    }
}

/// Decodes raw state frames against a fixed layout.
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    layout: Layout,
}

impl TelemetryDecoder {
    /// Create a decoder for a layout.
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// The layout frames are decoded against.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Decode one frame into a record.
    pub fn decode(&self, payload: &[u8]) -> Result<TelemetryRecord> {
        let values = codec::decode(payload, self.layout.len())?;
        Ok(TelemetryRecord {
            layout: self.layout.clone(),
            values: values.into_boxed_slice(),
        })
    }
}
