//! The slice of the device database one scanner needs.

use genesys_config::{
    Database, FrontendDef, Layout, Model, Motor, MotorProfile, Sensor, SensorProfile,
};

use crate::error::{BuildError, Result};

/// Immutable tables for one model, shared by everything that drives it.
#[derive(Debug, Clone)]
pub struct DeviceTables {
    pub model: Model,
    pub sensor: Sensor,
    pub motor: Motor,
    pub frontend: FrontendDef,
    pub gpio: Option<Layout>,
    pub memory_layout: Option<Layout>,
    pub sensor_profiles: Vec<SensorProfile>,
    pub motor_profiles: Vec<MotorProfile>,
}

impl DeviceTables {
    pub fn from_database(db: &Database, model_id: &str) -> Result<Self> {
        let model = db
            .model(model_id)
            .ok_or_else(|| eyre::Report::new(BuildError::UnknownModel(model_id.to_string())))?
            .clone();
        let missing = |kind: &'static str, id: &str| {
            eyre::Report::new(BuildError::UnknownReference {
                kind,
                id: id.to_string(),
            })
        };
        let sensor = db
            .sensor(&model.sensor)
            .ok_or_else(|| missing("sensor", &model.sensor))?
            .clone();
        let motor = db
            .motor(&model.motor)
            .ok_or_else(|| missing("motor", &model.motor))?
            .clone();
        let frontend = db
            .frontend(&model.frontend)
            .ok_or_else(|| missing("frontend", &model.frontend))?
            .clone();
        let gpio = match &model.gpio {
            Some(id) => Some(db.gpio(id).ok_or_else(|| missing("gpio", id))?.clone()),
            None => None,
        };
        let memory_layout = match &model.memory_layout {
            Some(id) => Some(
                db.memory_layout(id)
                    .ok_or_else(|| missing("memory layout", id))?
                    .clone(),
            ),
            None => None,
        };
        let sensor_profiles = db
            .sensor_profiles
            .iter()
            .filter(|p| p.sensor == sensor.id)
            .cloned()
            .collect();
        let motor_profiles = db
            .motor_profiles
            .iter()
            .filter(|p| p.motor == motor.id)
            .cloned()
            .collect();
        Ok(Self {
            model,
            sensor,
            motor,
            frontend,
            gpio,
            memory_layout,
            sensor_profiles,
            motor_profiles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_models_resolve() {
        let db = genesys_config::builtin().unwrap();
        for m in &db.models {
            let t = DeviceTables::from_database(&db, &m.id).unwrap();
            assert_eq!(t.sensor.id, m.sensor);
            assert!(!t.sensor_profiles.is_empty());
        }
    }

    #[test]
    fn unknown_model_is_a_build_error() {
        let db = genesys_config::builtin().unwrap();
        let err = DeviceTables::from_database(&db, "nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::UnknownModel(id)) if id == "nope"
        ));
    }
}
