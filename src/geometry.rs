//! Goniostat settings as immutable value records.
//!
//! A [`GoniostatRotation`] names the rotation-stage setting of a sweep; a
//! [`GoniostatTranslation`] is the sample-centring offset found for it. The two are related
//! only by id: a translation remembers the id of its rotation, and the [`PositionBook`]
//! maps rotation ids to translations. Neither owns the other, so either may be discarded
//! without touching the other.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Axis-name to value mapping that keeps the declared axis order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisSettings(Vec<(String, f64)>);

impl AxisSettings {
    /// Build from `(name, value)` pairs in declared order. A repeated name keeps its first
    /// position and takes the last value.
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut settings: Vec<(String, f64)> = Vec::new();
        for (name, value) in pairs {
            let name = name.into();
            match settings.iter_mut().find(|(existing, _)| *existing == name) {
                Some(slot) => slot.1 = value,
                None => settings.push((name, value)),
            }
        }
        Self(settings)
    }

    /// Value for `axis`, if present.
    pub fn get(&self, axis: &str) -> Option<f64> {
        self.0
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| *value)
    }

    /// Axis names in declared order.
    pub fn axes(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    /// Values in declared order.
    pub fn values(&self) -> Vec<f64> {
        self.0.iter().map(|(_, value)| *value).collect()
    }

    /// `(name, value)` pairs in declared order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Values for `axes`, in that order; `None` if any axis is missing.
    pub fn values_for<'a>(&self, axes: impl IntoIterator<Item = &'a str>) -> Option<Vec<f64>> {
        axes.into_iter().map(|axis| self.get(axis)).collect()
    }

    /// Number of axes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no axis is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AxisSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(name, value)| format!("{name}={value:.4}"))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Identifier of a [`GoniostatRotation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RotationId(pub Uuid);

impl fmt::Display for RotationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rotation-stage setting (e.g. omega, kappa, phi).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoniostatRotation {
    id: RotationId,
    axis_settings: AxisSettings,
}

impl GoniostatRotation {
    /// New rotation with a fresh id.
    pub fn new(axis_settings: AxisSettings) -> Self {
        Self::with_id(RotationId(Uuid::new_v4()), axis_settings)
    }

    /// Rotation carrying an id chosen by the engine.
    pub fn with_id(id: RotationId, axis_settings: AxisSettings) -> Self {
        Self { id, axis_settings }
    }

    /// Rotation id.
    pub fn id(&self) -> RotationId {
        self.id
    }

    /// Axis settings.
    pub fn axis_settings(&self) -> &AxisSettings {
        &self.axis_settings
    }
}

/// Centring offset (sample x/y/z) for a rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoniostatTranslation {
    id: Uuid,
    rotation_id: Option<RotationId>,
    axis_settings: AxisSettings,
}

impl GoniostatTranslation {
    /// Translation found for `rotation`.
    pub fn for_rotation(rotation: &GoniostatRotation, axis_settings: AxisSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            rotation_id: Some(rotation.id()),
            axis_settings,
        }
    }

    /// Translation not tied to any rotation.
    pub fn detached(axis_settings: AxisSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            rotation_id: None,
            axis_settings,
        }
    }

    /// Translation id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Id of the rotation this translation was found for.
    pub fn rotation_id(&self) -> Option<RotationId> {
        self.rotation_id
    }

    /// Axis settings.
    pub fn axis_settings(&self) -> &AxisSettings {
        &self.axis_settings
    }
}

/// Rotation→translation lookup table for one run, plus the reference pair used for
/// recentring.
#[derive(Debug, Default)]
pub struct PositionBook {
    rotations: HashMap<RotationId, GoniostatRotation>,
    translations: HashMap<RotationId, GoniostatTranslation>,
    reference: Option<RotationId>,
}

impl PositionBook {
    /// Empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a rotation sent by the engine.
    pub fn add_rotation(&mut self, rotation: GoniostatRotation) {
        self.rotations.insert(rotation.id(), rotation);
    }

    /// Rotation by id.
    pub fn rotation(&self, id: RotationId) -> Option<&GoniostatRotation> {
        self.rotations.get(&id)
    }

    /// Associate a translation with its rotation. The first association becomes the
    /// recentring reference. Detached translations are ignored.
    pub fn record_translation(&mut self, translation: GoniostatTranslation) {
        let Some(rotation_id) = translation.rotation_id() else {
            return;
        };
        if self.reference.is_none() {
            self.reference = Some(rotation_id);
        }
        self.translations.insert(rotation_id, translation);
    }

    /// Translation for a rotation, if one was recorded.
    pub fn translation_for(&self, id: RotationId) -> Option<&GoniostatTranslation> {
        self.translations.get(&id)
    }

    /// The reference rotation/translation pair, if both are still known.
    pub fn reference_pair(&self) -> Option<(&GoniostatRotation, &GoniostatTranslation)> {
        let id = self.reference?;
        Some((self.rotations.get(&id)?, self.translations.get(&id)?))
    }

    /// Forget a rotation. Its translation, if any, stays available by id.
    pub fn discard_rotation(&mut self, id: RotationId) -> Option<GoniostatRotation> {
        self.rotations.remove(&id)
    }

    /// Forget everything (end of run).
    pub fn clear(&mut self) {
        self.rotations.clear();
        self.translations.clear();
        self.reference = None;
    }
}
