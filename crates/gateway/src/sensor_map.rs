//! Room/sensor mapping loader
//!
//! One `room_id sensor_id` pair per line, whitespace separated.

use std::path::Path;
use std::str::FromStr;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorMapping {
    pub room_id: u32,
    pub sensor_id: u16,
}

pub fn load(path: &Path) -> Result<Vec<SensorMapping>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Vec<SensorMapping>, ConfigError> {
    let mut mappings = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let mut fields = line.split_whitespace();
        let (room, sensor) = match (fields.next(), fields.next(), fields.next()) {
            (None, _, _) => continue,
            (Some(room), Some(sensor), None) => (room, sensor),
            _ => {
                return Err(ConfigError::SensorMap {
                    line: line_no,
                    reason: "expected two fields".to_string(),
                })
            }
        };
        let room_id: u32 = parse_id(room, line_no)?;
        let sensor_id: u16 = parse_id(sensor, line_no)?;
        if sensor_id == 0 {
            return Err(ConfigError::SensorMap {
                line: line_no,
                reason: "sensor id 0 is reserved".to_string(),
            });
        }
        mappings.push(SensorMapping { room_id, sensor_id });
    }
    Ok(mappings)
}

fn parse_id<T: FromStr>(field: &str, line: usize) -> Result<T, ConfigError> {
    field.parse().map_err(|_| ConfigError::SensorMap {
        line,
        reason: format!("invalid id {:?}", field),
    })
}
