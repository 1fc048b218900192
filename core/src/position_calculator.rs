//! Position Calculator (§4.9): a pure function from wafer index to
//! coordinates, reading base positions and offsets out of configuration.
//! Treated as a black box by the sequence executor; grounded on
//! `original_source/.../backend/services/meca/position_calculator.py`.

use std::collections::HashMap;

use crate::config::PositionsConfig;
use crate::error::{RoboticsError, Result};

pub type Pose = [f64; 6];

pub struct PositionCalculator<'a> {
    positions: &'a PositionsConfig,
}

impl<'a> PositionCalculator<'a> {
    pub fn new(positions: &'a PositionsConfig) -> Self {
        Self { positions }
    }

    /// `(wafer_index, tray_type) -> pose`.
    pub fn wafer_pose(&self, wafer_index: usize, tray_type: &str) -> Result<Pose> {
        let offsets = self
            .positions
            .offsets
            .get(tray_type)
            .ok_or_else(|| RoboticsError::Configuration {
                message: format!("no offsets configured for tray type '{tray_type}'"),
            })?;
        offsets
            .get(wafer_index)
            .copied()
            .ok_or_else(|| RoboticsError::Validation {
                field: "wafer_index".into(),
                message: format!("index {wafer_index} out of range for tray '{tray_type}' ({} slots)", offsets.len()),
            })
    }

    /// `(wafer_index, operation) -> {named pose -> coords}`, used by the
    /// sequence executor to build a wafer's command script (§4.7 step 3).
    pub fn operation_poses(&self, wafer_index: usize, operation: &str) -> Result<HashMap<String, Pose>> {
        let mut out = HashMap::new();
        for (name, pose) in &self.positions.named {
            if name.starts_with(operation) || !name.contains('_') {
                out.insert(name.clone(), *pose);
            }
        }
        // Per-wafer offset for this operation, if configured, overrides
        // the flat named position of the same name.
        if let Ok(pose) = self.wafer_pose(wafer_index, operation) {
            out.insert(operation.to_string(), pose);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions() -> PositionsConfig {
        let mut offsets = HashMap::new();
        offsets.insert(
            "inert_tray".to_string(),
            vec![
                [1.0, 2.0, 3.0, 0.0, 0.0, 0.0],
                [1.0, 2.0, 3.0 + 2.7, 0.0, 0.0, 0.0],
            ],
        );
        let mut named = HashMap::new();
        named.insert("safe_point".to_string(), [0.0; 6]);
        PositionsConfig { named, offsets }
    }

    #[test]
    fn wafer_pose_indexes_into_offset_table() {
        let positions = positions();
        let calc = PositionCalculator::new(&positions);
        let pose = calc.wafer_pose(1, "inert_tray").unwrap();
        assert_eq!(pose[2], 5.7);
    }

    #[test]
    fn out_of_range_index_is_a_validation_error() {
        let positions = positions();
        let calc = PositionCalculator::new(&positions);
        let err = calc.wafer_pose(5, "inert_tray").unwrap_err();
        assert!(matches!(err, RoboticsError::Validation { .. }));
    }

    #[test]
    fn unknown_tray_type_is_a_configuration_error() {
        let positions = positions();
        let calc = PositionCalculator::new(&positions);
        let err = calc.wafer_pose(0, "unknown_tray").unwrap_err();
        assert!(matches!(err, RoboticsError::Configuration { .. }));
    }
}
