/// Size of one reading on the wire: id (u16) + value (f64) + timestamp (i64)
pub const WIRE_SIZE: usize = 2 + 8 + 8;

/// One (sensor id, value, timestamp) triplet.
/// Immutable once constructed; id 0 is reserved for the end-of-stream marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub sensor_id: u16,
    pub value: f64,
    /// Unix timestamp (seconds) reported by the sensor node
    pub timestamp: i64,
}

impl Reading {
    /// End-of-stream marker, inserted once after every connection handler has finished
    pub const SENTINEL: Reading = Reading {
        sensor_id: 0,
        value: 0.0,
        timestamp: 0,
    };

    #[inline]
    pub fn new(sensor_id: u16, value: f64, timestamp: i64) -> Self {
        Self {
            sensor_id,
            value,
            timestamp,
        }
    }

    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.sensor_id == 0
    }

    /// Encode to the little-endian wire layout used by sensor nodes
    pub fn to_wire(&self) -> [u8; WIRE_SIZE] {
        let mut out = [0u8; WIRE_SIZE];
        out[0..2].copy_from_slice(&self.sensor_id.to_le_bytes());
        out[2..10].copy_from_slice(&self.value.to_le_bytes());
        out[10..18].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }
}
