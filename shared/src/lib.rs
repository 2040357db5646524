use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::f32::consts::TAU;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Default limit on the absolute value of any position component
pub const DEFAULT_WORLD_BOUND: f32 = 10_000.0;
/// Where new players appear
pub const SPAWN_POSITION: [f32; 3] = [0.0, 0.0, 0.0];
/// Identity rotation as an `[x, y, z, w]` quaternion
pub const IDENTITY_ORIENTATION: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
/// Maximum number of attributes a single update may carry
pub const MAX_ATTRIBUTES: usize = 16;
/// Maximum attribute key length in bytes
pub const MAX_ATTRIBUTE_KEY_LEN: usize = 64;

const QUATERNION_EPSILON: f32 = 1e-6;

/// Free-form per-player attributes carried alongside the transform.
pub type Attributes = Map<String, Value>;

/// Reasons a client event is rejected before it reaches the store.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
    #[error("{field} is not a finite number")]
    NonFinite { field: &'static str },
    #[error("{field} value {value} exceeds limit {limit}")]
    OutOfRange {
        field: &'static str,
        value: f32,
        limit: f32,
    },
    #[error("orientation must have 3 or 4 components, got {0}")]
    OrientationLength(usize),
    #[error("quaternion has zero length")]
    DegenerateQuaternion,
    #[error("too many attributes: {count} (max {max})")]
    TooManyAttributes { count: usize, max: usize },
    #[error("attribute key of {len} bytes exceeds {max}")]
    AttributeKeyTooLong { len: usize, max: usize },
}

/// Opaque player identity, assigned by the server when a connection opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(Uuid);

impl PlayerId {
    /// Fresh random (v4) identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for PlayerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bounds applied to every transform a client submits.
#[derive(Debug, Clone, Copy)]
pub struct TransformLimits {
    /// Maximum absolute value of each position component
    pub world_bound: f32,
}

impl Default for TransformLimits {
    fn default() -> Self {
        Self {
            world_bound: DEFAULT_WORLD_BOUND,
        }
    }
}

/// Pose of a player: position plus either Euler angles (3) or a quaternion (4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// World position `[x, y, z]`
    pub position: [f32; 3],
    /// Euler angles in radians, or an `[x, y, z, w]` quaternion
    pub orientation: Vec<f32>,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: SPAWN_POSITION,
            orientation: IDENTITY_ORIENTATION.to_vec(),
        }
    }
}

impl Transform {
    /// Builds a transform as given, without validation.
    pub fn new(position: [f32; 3], orientation: Vec<f32>) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// Transform at the given position with identity rotation.
    pub fn at(x: f32, y: f32, z: f32) -> Self {
        Self::new([x, y, z], IDENTITY_ORIENTATION.to_vec())
    }

    /// Checks the transform against `limits` and returns the accepted form.
    ///
    /// Quaternions are normalised on the way in so the store only ever holds
    /// unit rotations.
    pub fn validate(&self, limits: &TransformLimits) -> Result<Transform, ProtocolError> {
        for &value in &self.position {
            if !value.is_finite() {
                return Err(ProtocolError::NonFinite { field: "position" });
            }
            if value.abs() > limits.world_bound {
                return Err(ProtocolError::OutOfRange {
                    field: "position",
                    value,
                    limit: limits.world_bound,
                });
            }
        }

        if self.orientation.iter().any(|v| !v.is_finite()) {
            return Err(ProtocolError::NonFinite {
                field: "orientation",
            });
        }

        let orientation = match self.orientation.len() {
            3 => {
                if let Some(&value) = self.orientation.iter().find(|v| v.abs() > TAU) {
                    return Err(ProtocolError::OutOfRange {
                        field: "orientation",
                        value,
                        limit: TAU,
                    });
                }
                self.orientation.clone()
            }
            4 => {
                if let Some(&value) = self.orientation.iter().find(|v| v.abs() > 1.0) {
                    return Err(ProtocolError::OutOfRange {
                        field: "orientation",
                        value,
                        limit: 1.0,
                    });
                }
                let norm = self.orientation.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm < QUATERNION_EPSILON {
                    return Err(ProtocolError::DegenerateQuaternion);
                }
                self.orientation.iter().map(|v| v / norm).collect()
            }
            len => return Err(ProtocolError::OrientationLength(len)),
        };

        Ok(Transform {
            position: self.position,
            orientation,
        })
    }
}

/// Checks attribute count and key lengths.
pub fn validate_attributes(attributes: &Attributes) -> Result<(), ProtocolError> {
    if attributes.len() > MAX_ATTRIBUTES {
        return Err(ProtocolError::TooManyAttributes {
            count: attributes.len(),
            max: MAX_ATTRIBUTES,
        });
    }
    if let Some(key) = attributes.keys().find(|k| k.len() > MAX_ATTRIBUTE_KEY_LEN) {
        return Err(ProtocolError::AttributeKeyTooLong {
            len: key.len(),
            max: MAX_ATTRIBUTE_KEY_LEN,
        });
    }
    Ok(())
}

/// Public view of one player, as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: PlayerId,
    pub transform: Transform,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Attributes,
}

impl PlayerState {
    pub fn new(id: PlayerId, transform: Transform) -> Self {
        Self {
            id,
            transform,
            attributes: Attributes::new(),
        }
    }
}

/// Body of a client `update` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub transform: Transform,
    /// Client clock in milliseconds; updates older than the last applied are dropped
    pub timestamp: u64,
    /// Replaces the stored attributes when present
    #[serde(default)]
    pub attributes: Option<Attributes>,
}

/// Events a client may send. Identity is never part of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    Update(UpdatePayload),
    RequestSnapshot,
}

impl ClientMessage {
    /// Parses one JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// First message on every connection: the assigned id and everyone else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub self_id: PlayerId,
    pub snapshot: Vec<PlayerState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLeft {
    pub id: PlayerId,
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    Welcome(Welcome),
    PlayerJoined(PlayerState),
    PlayerLeft(PlayerLeft),
    StateUpdate(Vec<PlayerState>),
    Snapshot(Vec<PlayerState>),
    Disconnected { reason: String },
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Milliseconds since the Unix epoch, saturating to zero on clock skew.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use serde_json::json;

    #[test]
    fn test_player_ids_are_unique() {
        let a = PlayerId::generate();
        let b = PlayerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }

    #[test]
    fn test_default_transform_is_spawn() {
        let transform = Transform::default();
        assert_eq!(transform.position, SPAWN_POSITION);
        assert_eq!(transform.orientation, IDENTITY_ORIENTATION.to_vec());
    }

    #[test]
    fn test_validate_accepts_euler() {
        let transform = Transform::new([1.0, 2.0, 3.0], vec![0.5, -1.0, 3.0]);
        let accepted = transform.validate(&TransformLimits::default()).unwrap();
        assert_eq!(accepted, transform);
    }

    #[test]
    fn test_validate_normalises_quaternion() {
        let transform = Transform::new([0.0, 0.0, 0.0], vec![0.0, 0.0, 0.5, 0.5]);
        let accepted = transform.validate(&TransformLimits::default()).unwrap();
        let norm = accepted
            .orientation
            .iter()
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt();
        assert_approx_eq!(norm, 1.0, 1e-5);
        assert_approx_eq!(accepted.orientation[2], std::f32::consts::FRAC_1_SQRT_2, 1e-5);
    }

    #[test]
    fn test_validate_rejects_out_of_bounds_position() {
        let limits = TransformLimits { world_bound: 100.0 };
        let transform = Transform::at(100.5, 0.0, 0.0);
        assert!(matches!(
            transform.validate(&limits),
            Err(ProtocolError::OutOfRange {
                field: "position",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        let limits = TransformLimits::default();
        assert!(matches!(
            Transform::at(f32::NAN, 0.0, 0.0).validate(&limits),
            Err(ProtocolError::NonFinite { field: "position" })
        ));
        let transform = Transform::new([0.0; 3], vec![0.0, f32::INFINITY, 0.0]);
        assert!(matches!(
            transform.validate(&limits),
            Err(ProtocolError::NonFinite {
                field: "orientation"
            })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_orientation() {
        let limits = TransformLimits::default();
        let short = Transform::new([0.0; 3], vec![0.0, 1.0]);
        assert!(matches!(
            short.validate(&limits),
            Err(ProtocolError::OrientationLength(2))
        ));

        let zero = Transform::new([0.0; 3], vec![0.0; 4]);
        assert!(matches!(
            zero.validate(&limits),
            Err(ProtocolError::DegenerateQuaternion)
        ));

        let wide = Transform::new([0.0; 3], vec![0.0, 7.0, 0.0]);
        assert!(wide.validate(&limits).is_err());
    }

    #[test]
    fn test_attribute_limits() {
        let mut attributes = Attributes::new();
        attributes.insert("color".into(), json!("red"));
        assert!(validate_attributes(&attributes).is_ok());

        attributes.insert("k".repeat(MAX_ATTRIBUTE_KEY_LEN + 1), json!(1));
        assert!(matches!(
            validate_attributes(&attributes),
            Err(ProtocolError::AttributeKeyTooLong { .. })
        ));

        let crowded: Attributes = (0..=MAX_ATTRIBUTES)
            .map(|i| (format!("a{}", i), json!(i)))
            .collect();
        assert!(matches!(
            validate_attributes(&crowded),
            Err(ProtocolError::TooManyAttributes { .. })
        ));
    }

    #[test]
    fn test_decode_update() {
        let text = r#"{"event":"update","data":{"transform":{"position":[1,0,0],"orientation":[0,0,0,1]},"timestamp":5}}"#;
        match ClientMessage::decode(text).unwrap() {
            ClientMessage::Update(update) => {
                assert_eq!(update.transform.position, [1.0, 0.0, 0.0]);
                assert_eq!(update.timestamp, 5);
                assert!(update.attributes.is_none());
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_request_snapshot_without_data() {
        let message = ClientMessage::decode(r#"{"event":"requestSnapshot"}"#).unwrap();
        assert_eq!(message, ClientMessage::RequestSnapshot);
    }

    #[test]
    fn test_decode_rejects_missing_transform() {
        let text = r#"{"event":"update","data":{"timestamp":5}}"#;
        assert!(matches!(
            ClientMessage::decode(text),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_event() {
        assert!(ClientMessage::decode(r#"{"event":"teleport","data":{}}"#).is_err());
        assert!(ClientMessage::decode("not json").is_err());
    }

    #[test]
    fn test_client_payload_cannot_carry_identity() {
        // An injected id is ignored: the payload type has nowhere to put it.
        let text = r#"{"event":"update","data":{"id":"00000000-0000-0000-0000-000000000000","transform":{"position":[0,0,0],"orientation":[0,0,0]},"timestamp":1}}"#;
        let message = ClientMessage::decode(text).unwrap();
        assert!(matches!(message, ClientMessage::Update(_)));
    }

    #[test]
    fn test_welcome_wire_shape() {
        let self_id = PlayerId::generate();
        let other = PlayerState::new(PlayerId::generate(), Transform::at(1.0, 2.0, 3.0));
        let message = ServerMessage::Welcome(Welcome {
            self_id,
            snapshot: vec![other.clone()],
        });

        let value: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "welcome");
        assert_eq!(value["data"]["selfId"], json!(self_id.to_string()));
        assert_eq!(value["data"]["snapshot"][0]["id"], json!(other.id.to_string()));
        assert!(value["data"]["snapshot"][0].get("attributes").is_none());
    }

    #[test]
    fn test_state_update_wire_shape() {
        let id = PlayerId::generate();
        let message = ServerMessage::StateUpdate(vec![PlayerState::new(id, Transform::at(1.0, 0.0, 0.0))]);
        let value: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "stateUpdate");
        assert!(value["data"].is_array());
        assert_eq!(value["data"][0]["transform"]["position"], json!([1.0, 0.0, 0.0]));

        let left = ServerMessage::PlayerLeft(PlayerLeft { id });
        let value: Value = serde_json::from_str(&left.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "playerLeft");
        assert_eq!(value["data"]["id"], json!(id.to_string()));
    }

    #[test]
    fn test_current_timestamp_advances() {
        let first = current_timestamp();
        std::thread::sleep(Duration::from_millis(2));
        assert!(current_timestamp() > first);
    }
}
