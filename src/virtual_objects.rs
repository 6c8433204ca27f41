//! Virtual objects attached to a topology: anchors, springs, motors and emitters.
//!
//! Each object arrives as one JSON document whose `is` key names its kind.
//! Documents are decoded into a closed set of typed variants; shapes are
//! accepted and ignored, unknown kinds are logged and skipped.

use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("virtual object is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("virtual object has no string `is` tag")]
    MissingTag,

    #[error("invalid {kind} virtual object: {source}")]
    InvalidFields {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("spring references unknown anchor {0}")]
    UnknownAnchor(i64),
}

/// Reads an integer field that may have been written as a float (`3.0`).
fn integral<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let value = f64::deserialize(deserializer)?;
    to_integral(value).ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {value}")))
}

fn integral_list<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<f64>::deserialize(deserializer)?;
    values
        .into_iter()
        .map(|value| to_integral(value).ok_or_else(|| serde::de::Error::custom(format!("expected an atom id, got {value}"))))
        .collect()
}

fn integral_groups<'de, D>(deserializer: D) -> Result<Vec<Vec<u32>>, D::Error>
where
    D: Deserializer<'de>,
{
    let groups = Vec::<Vec<f64>>::deserialize(deserializer)?;
    groups
        .into_iter()
        .map(|group| {
            group
                .into_iter()
                .map(|value| to_integral(value).ok_or_else(|| serde::de::Error::custom(format!("expected an atom id, got {value}"))))
                .collect()
        })
        .collect()
}

fn to_integral<T: TryFrom<i64>>(value: f64) -> Option<T> {
    if value.fract() != 0.0 || !value.is_finite() {
        return None;
    }
    T::try_from(value as i64).ok()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnchorDocument {
    #[serde(deserialize_with = "integral")]
    pub anchor_id: i64,
    pub position: [f64; 3],
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpringDocument {
    #[serde(deserialize_with = "integral")]
    pub anchor_id: i64,
    /// Wire id of the atom pulled toward the anchor.
    #[serde(deserialize_with = "integral")]
    pub particle_id: u32,
    /// kJ/mol/nm²
    pub k_constant: f64,
    /// nm
    pub equilibrium_length: f64,
}

/// Raw motor parameters. Field names and units are those of the host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MotorParameters {
    #[serde(deserialize_with = "integral")]
    pub motor_type: u8,
    #[serde(deserialize_with = "integral")]
    pub polarity: u8,
    pub ramp_in_time_in_nanoseconds: f64,
    pub ramp_out_time_in_nanoseconds: f64,
    pub top_revolutions_per_nanosecond: f64,
    pub top_speed_in_nanometers_by_nanoseconds: f64,
    #[serde(deserialize_with = "integral")]
    pub cycle_type: u8,
    pub cycle_time_limit_in_femtoseconds: f64,
    pub cycle_pause_time_in_femtoseconds: f64,
    /// Revolutions for rotary motors, nm for linear ones.
    pub cycle_distance_limit: f64,
    pub cycle_eventually_stops: bool,
    #[serde(deserialize_with = "integral")]
    pub cycle_stop_after_n_cycles: u32,
    pub cycle_swap_polarity: bool,
    pub is_jerk_limited: bool,
    pub jerk_limit: f64,
    #[serde(deserialize_with = "integral")]
    pub max_speed_type: u8,
    pub max_torque: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotorDocument {
    #[serde(deserialize_with = "integral_list")]
    pub connected_molecules: Vec<u32>,
    pub position: [f64; 3],
    pub axis_direction: [f64; 3],
    pub parameters: MotorParameters,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmitterParameters {
    #[serde(rename = "_initial_delay_in_nanoseconds")]
    pub initial_delay_in_nanoseconds: f64,
    #[serde(rename = "_instance_rate_time_in_nanoseconds")]
    pub instance_rate_time_in_nanoseconds: f64,
    #[serde(rename = "_instance_speed_nanometers_per_picosecond")]
    pub instance_speed_nanometers_per_picosecond: f64,
    #[serde(rename = "_molecules_per_instance", deserialize_with = "integral")]
    pub molecules_per_instance: u32,
    #[serde(deserialize_with = "integral")]
    pub total_instance_count: u32,
    /// Half-angle of the emission cone, radians.
    #[serde(rename = "_spread_angle", default)]
    pub spread_angle: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmitterDocument {
    #[serde(deserialize_with = "integral")]
    pub emitter_id: i64,
    #[serde(deserialize_with = "integral")]
    pub molecule_id: u32,
    pub position: [f64; 3],
    pub axis_direction: [f64; 3],
    /// Wire ids of each template instance.
    #[serde(deserialize_with = "integral_groups")]
    pub atoms_list: Vec<Vec<u32>>,
    pub parameters: EmitterParameters,
}

#[derive(Debug, Clone)]
pub enum VirtualObject {
    Anchor(AnchorDocument),
    Spring(SpringDocument),
    Motor(MotorDocument),
    Emitter(EmitterDocument),
    Shape,
}

#[derive(Debug, Clone)]
pub enum Parsed {
    Object(VirtualObject),
    /// Tag the worker does not know, kept for logging.
    Unknown(String),
}

fn fields<T: for<'de> Deserialize<'de>>(kind: &'static str, value: serde_json::Value) -> Result<T, Error> {
    serde_json::from_value(value).map_err(|source| Error::InvalidFields { kind, source })
}

/// Decodes one virtual-object document.
pub fn parse(document: &str) -> Result<Parsed, Error> {
    let value: serde_json::Value = serde_json::from_str(document)?;
    let tag = value.get("is").and_then(|tag| tag.as_str()).ok_or(Error::MissingTag)?.to_string();
    let object = match tag.as_str() {
        "anchor" => VirtualObject::Anchor(fields("anchor", value)?),
        "spring" => VirtualObject::Spring(fields("spring", value)?),
        "motor" => VirtualObject::Motor(fields("motor", value)?),
        "emitter" => VirtualObject::Emitter(fields("emitter", value)?),
        "shape" => VirtualObject::Shape,
        _ => return Ok(Parsed::Unknown(tag)),
    };
    Ok(Parsed::Object(object))
}

#[derive(Debug, Clone)]
pub struct Anchor {
    pub id: i64,
    pub position: [f64; 3],
    pub springs: Vec<SpringDocument>,
}

/// Virtual objects collected for one command, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct VirtualObjects {
    pub anchors: Vec<Anchor>,
    pub motors: Vec<MotorDocument>,
    pub emitters: Vec<EmitterDocument>,
}

impl VirtualObjects {
    /// Adds one document. A spring must follow the anchor it references.
    pub fn add_document(&mut self, document: &str) -> Result<(), Error> {
        match parse(document)? {
            Parsed::Object(VirtualObject::Anchor(anchor)) => {
                let entry = Anchor {
                    id: anchor.anchor_id,
                    position: anchor.position,
                    springs: Vec::new(),
                };
                match self.anchors.iter_mut().find(|existing| existing.id == entry.id) {
                    Some(existing) => *existing = entry,
                    None => self.anchors.push(entry),
                }
            }
            Parsed::Object(VirtualObject::Spring(spring)) => {
                let anchor = self
                    .anchors
                    .iter_mut()
                    .find(|anchor| anchor.id == spring.anchor_id)
                    .ok_or(Error::UnknownAnchor(spring.anchor_id))?;
                anchor.springs.push(spring);
            }
            Parsed::Object(VirtualObject::Motor(motor)) => self.motors.push(motor),
            Parsed::Object(VirtualObject::Emitter(emitter)) => self.emitters.push(emitter),
            Parsed::Object(VirtualObject::Shape) => {
                log::warn!("Ignoring shape virtual object: {document}");
            }
            Parsed::Unknown(tag) => {
                log::error!("Unknown virtual object: {tag}");
                log::warn!("{document}");
            }
        }
        Ok(())
    }

    /// Anchors that carry at least one spring and therefore become particles.
    pub fn active_anchors(&self) -> impl Iterator<Item = &Anchor> {
        self.anchors.iter().filter(|anchor| !anchor.springs.is_empty())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn linear_motor_json(connected_molecule: u32) -> String {
        format!(
            r#"{{
                "is": "motor",
                "connected_molecules": [{connected_molecule}],
                "position": [0.0, 0.0, 0.0],
                "axis_direction": [1.0, 0.0, 0.0],
                "parameters": {{
                    "motor_type": 2,
                    "polarity": 0,
                    "top_speed_in_nanometers_by_nanoseconds": 10.0,
                    "ramp_in_time_in_nanoseconds": 0.0,
                    "ramp_out_time_in_nanoseconds": 0.0,
                    "cycle_type": 0
                }}
            }}"#
        )
    }

    #[test]
    fn anchor_and_spring_are_linked() {
        let mut objects = VirtualObjects::default();
        objects.add_document(r#"{"is": "anchor", "anchor_id": 3, "position": [1.0, 2.0, 3.0]}"#).unwrap();
        objects
            .add_document(r#"{"is": "spring", "anchor_id": 3.0, "particle_id": 1, "k_constant": 100.0, "equilibrium_length": 0.2}"#)
            .unwrap();
        assert_eq!(objects.anchors.len(), 1);
        assert_eq!(objects.anchors[0].springs.len(), 1);
        assert_eq!(objects.anchors[0].springs[0].particle_id, 1);
        assert_eq!(objects.active_anchors().count(), 1);
    }

    #[test]
    fn spring_without_anchor_fails() {
        let mut objects = VirtualObjects::default();
        let err = objects
            .add_document(r#"{"is": "spring", "anchor_id": 8, "particle_id": 1, "k_constant": 1.0, "equilibrium_length": 0.0}"#)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAnchor(8)));
    }

    #[test]
    fn unknown_tags_and_shapes_are_skipped() {
        let mut objects = VirtualObjects::default();
        objects.add_document(r#"{"is": "teleporter"}"#).unwrap();
        objects.add_document(r#"{"is": "shape", "radius": 2}"#).unwrap();
        assert!(objects.anchors.is_empty());
        assert!(objects.motors.is_empty());
        assert!(matches!(parse(r#"{"is": "teleporter"}"#).unwrap(), Parsed::Unknown(tag) if tag == "teleporter"));
    }

    #[test]
    fn missing_tag_is_an_error() {
        assert!(matches!(parse(r#"{"kind": "motor"}"#), Err(Error::MissingTag)));
        assert!(matches!(parse("not json"), Err(Error::Json(_))));
    }

    #[test]
    fn motor_accepts_float_encoded_integers() {
        let mut objects = VirtualObjects::default();
        objects.add_document(&linear_motor_json(4).replace("\"motor_type\": 2", "\"motor_type\": 2.0")).unwrap();
        assert_eq!(objects.motors[0].parameters.motor_type, 2);
        assert_eq!(objects.motors[0].connected_molecules, vec![4]);
    }

    #[test]
    fn emitter_reads_underscored_parameters() {
        let document = r#"{
            "is": "emitter",
            "emitter_id": 1,
            "molecule_id": 5,
            "position": [0.0, 0.0, 0.0],
            "axis_direction": [0.0, 0.0, 1.0],
            "atoms_list": [[0, 1, 2], [3, 4, 5]],
            "parameters": {
                "_initial_delay_in_nanoseconds": 0.0,
                "_instance_rate_time_in_nanoseconds": 0.5,
                "_instance_speed_nanometers_per_picosecond": 0.2,
                "_molecules_per_instance": 1,
                "total_instance_count": 2,
                "_spread_angle": 0.1
            }
        }"#;
        let mut objects = VirtualObjects::default();
        objects.add_document(document).unwrap();
        let emitter = &objects.emitters[0];
        assert_eq!(emitter.atoms_list, vec![vec![0, 1, 2], vec![3, 4, 5]]);
        assert_eq!(emitter.parameters.molecules_per_instance, 1);
        assert_eq!(emitter.parameters.instance_rate_time_in_nanoseconds, 0.5);
    }

    #[test]
    fn non_integral_id_is_rejected() {
        let err = parse(r#"{"is": "anchor", "anchor_id": 1.5, "position": [0, 0, 0]}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidFields { kind: "anchor", .. }));
    }
}
