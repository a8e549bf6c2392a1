//! Eyebrow-raise liveness gate.
//!
//! Tracks the eyebrow-to-eye distance per identity and fires when it changes
//! by more than `movement_threshold` pixels between consecutive sightings.
//! A deliberate raise moves the eyebrow quickly; head drift changes the
//! distance slowly. This is a heuristic with a false-accept/false-reject
//! tradeoff set by the threshold, not a biometric liveness proof.
//!
//! The threshold is in absolute frame pixels and is not scaled by face size.

use crate::landmarks::LandmarkSet;
use crate::types::IdentityId;
use std::collections::HashMap;

pub const DEFAULT_MOVEMENT_THRESHOLD: f32 = 5.0;

/// Per-identity liveness memory.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LivenessState {
    pub previous_eyebrow_to_eye_distance: Option<f32>,
}

/// Outcome of one liveness observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LivenessVerdict {
    /// First observation for the identity; nothing to compare against.
    Baseline,
    NoGesture { delta: f32 },
    Gesture { delta: f32 },
}

impl LivenessVerdict {
    pub fn is_gesture(&self) -> bool {
        matches!(self, LivenessVerdict::Gesture { .. })
    }
}

/// Eyebrow gesture detector keyed by identity, never by detection slot.
#[derive(Debug, Clone)]
pub struct LivenessDetector {
    movement_threshold: f32,
    states: HashMap<IdentityId, LivenessState>,
}

impl LivenessDetector {
    pub fn new(movement_threshold: f32) -> Self {
        Self {
            movement_threshold,
            states: HashMap::new(),
        }
    }

    pub fn movement_threshold(&self) -> f32 {
        self.movement_threshold
    }

    /// Feed one eyebrow-to-eye distance for `identity`.
    ///
    /// The stored distance is replaced on every call, gesture or not.
    pub fn observe_distance(&mut self, identity: IdentityId, distance: f32) -> LivenessVerdict {
        let state = self.states.entry(identity).or_default();
        let previous = state.previous_eyebrow_to_eye_distance.replace(distance);

        match previous {
            None => LivenessVerdict::Baseline,
            Some(prev) => {
                let delta = (prev - distance).abs();
                if delta > self.movement_threshold {
                    LivenessVerdict::Gesture { delta }
                } else {
                    LivenessVerdict::NoGesture { delta }
                }
            }
        }
    }

    pub fn observe(&mut self, identity: IdentityId, landmarks: &LandmarkSet) -> LivenessVerdict {
        self.observe_distance(identity, landmarks.eyebrow_to_eye_distance())
    }

    pub fn state(&self, identity: IdentityId) -> Option<&LivenessState> {
        self.states.get(&identity)
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

impl Default for LivenessDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MOVEMENT_THRESHOLD)
    }
}
