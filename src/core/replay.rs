//! Layer replay: re-executing an earlier layer a fixed or gate-driven number of times.
//!
//! A layer with replay enabled names a source layer `s = index + offset`. Replaying
//! `s` re-evaluates it with an input override: its connections into layer `s - 1`
//! read the override grid instead of the stored values. The forward engine drives
//! the actual re-evaluation; this module owns the settings and repeat resolution.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::activation::softmax;
use crate::error::{NetError, Result};

/// When the source layer is replayed relative to the owning layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    /// Feed the source layer its own output before the owner runs.
    #[default]
    Before,
    /// Run the owner, feed its output back into the source, run the owner again.
    After,
}

pub type GateFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;
pub type RepeatFn = Arc<dyn Fn(f64) -> usize + Send + Sync>;

/// Scores the cached outputs of a layer.
#[derive(Clone)]
pub enum Gate {
    /// Normalised Shannon entropy of the softmax of the cached outputs, in `[0, 1]`.
    Entropy,
    Constant(f64),
    /// Not persisted.
    Custom(GateFn),
}

impl Gate {
    pub fn custom(f: impl Fn(&[f64]) -> f64 + Send + Sync + 'static) -> Self {
        Gate::Custom(Arc::new(f))
    }

    pub fn score(&self, cached: &[f64]) -> f64 {
        match self {
            Gate::Entropy => normalized_entropy(cached),
            Gate::Constant(s) => *s,
            Gate::Custom(f) => f(cached),
        }
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gate::Entropy => f.write_str("Entropy"),
            Gate::Constant(s) => f.debug_tuple("Constant").field(s).finish(),
            Gate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Maps a gate score to a repeat count.
#[derive(Clone)]
pub enum RepeatMap {
    /// `round(clamp(score, 0, 1) * budget)`.
    Linear,
    /// `(threshold, repeats)` pairs; the first threshold the score exceeds wins, else zero.
    Thresholds(Vec<(f64, usize)>),
    /// Not persisted.
    Custom(RepeatFn),
}

impl RepeatMap {
    pub fn custom(f: impl Fn(f64) -> usize + Send + Sync + 'static) -> Self {
        RepeatMap::Custom(Arc::new(f))
    }

    pub fn map(&self, score: f64, budget: usize) -> usize {
        match self {
            RepeatMap::Linear => {
                let s = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
                (s * budget as f64).round() as usize
            }
            RepeatMap::Thresholds(steps) => steps
                .iter()
                .find(|(threshold, _)| score > *threshold)
                .map(|&(_, reps)| reps)
                .unwrap_or(0),
            RepeatMap::Custom(f) => f(score),
        }
    }
}

impl fmt::Debug for RepeatMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepeatMap::Linear => f.write_str("Linear"),
            RepeatMap::Thresholds(steps) => f.debug_tuple("Thresholds").field(steps).finish(),
            RepeatMap::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Runtime replay settings of one layer.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub enabled: bool,
    pub phase: ReplayPhase,
    pub offset: i32,
    pub max_repeats: usize,
    /// Upper bound on gated repeats.
    pub budget: usize,
    pub gate: Option<Gate>,
    pub gate_to_repeats: Option<RepeatMap>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            phase: ReplayPhase::Before,
            offset: -1,
            max_repeats: 0,
            budget: 0,
            gate: None,
            gate_to_repeats: None,
        }
    }
}

impl ReplayConfig {
    /// Static replay: `repeats` passes every forward.
    pub fn fixed(phase: ReplayPhase, offset: i32, repeats: usize) -> Self {
        Self {
            enabled: true,
            phase,
            offset,
            max_repeats: repeats,
            ..Self::default()
        }
    }

    /// Gate-driven replay capped by `budget`.
    pub fn gated(phase: ReplayPhase, offset: i32, gate: Gate, budget: usize) -> Self {
        Self {
            enabled: true,
            phase,
            offset,
            budget,
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn with_repeat_map(mut self, map: RepeatMap) -> Self {
        self.gate_to_repeats = Some(map);
        self
    }

    /// Source layer for a layer at `index`, if the offset is legal.
    ///
    /// `Before` needs `s` in `[1, index - 1]`, `After` allows `[1, index]`.
    pub fn source_layer(&self, index: usize) -> Option<usize> {
        let s = index as i64 + self.offset as i64;
        let upper = match self.phase {
            ReplayPhase::Before => index as i64 - 1,
            ReplayPhase::After => index as i64,
        };
        if s >= 1 && s <= upper {
            Some(s as usize)
        } else {
            None
        }
    }

    pub(crate) fn validate(&self, index: usize, layer_count: usize) -> Result<()> {
        if index == 0 || index >= layer_count {
            return Err(NetError::config(format!(
                "replay on layer {index}: only layers 1..{layer_count} can replay"
            )));
        }
        if self.enabled && self.source_layer(index).is_none() {
            return Err(NetError::config(format!(
                "replay on layer {index}: offset {} with phase {:?} leaves the hidden layers",
                self.offset, self.phase
            )));
        }
        Ok(())
    }

    /// Number of replays for this pass, given the owner's cached outputs.
    pub fn repeats(&self, cached: &[f64]) -> usize {
        if !self.enabled {
            return 0;
        }
        match &self.gate {
            None => self.max_repeats,
            Some(gate) => {
                let score = gate.score(cached);
                let reps = match &self.gate_to_repeats {
                    Some(map) => map.map(score, self.budget),
                    None => RepeatMap::Linear.map(score, self.budget),
                };
                reps.min(self.budget)
            }
        }
    }

    pub fn to_spec(&self) -> ReplaySpec {
        ReplaySpec {
            enabled: self.enabled,
            phase: self.phase,
            offset: self.offset,
            max_repeats: self.max_repeats,
            budget: self.budget,
            gate: self.gate.as_ref().and_then(|g| match g {
                Gate::Entropy => Some(GateSpec::Entropy),
                Gate::Constant(score) => Some(GateSpec::Constant { score: *score }),
                Gate::Custom(_) => None,
            }),
            gate_to_repeats: self.gate_to_repeats.as_ref().and_then(|m| match m {
                RepeatMap::Linear => Some(RepeatMapSpec::Linear),
                RepeatMap::Thresholds(steps) => Some(RepeatMapSpec::Thresholds {
                    steps: steps.clone(),
                }),
                RepeatMap::Custom(_) => None,
            }),
        }
    }

    pub fn from_spec(spec: &ReplaySpec) -> Self {
        Self {
            enabled: spec.enabled,
            phase: spec.phase,
            offset: spec.offset,
            max_repeats: spec.max_repeats,
            budget: spec.budget,
            gate: spec.gate.as_ref().map(|g| match g {
                GateSpec::Entropy => Gate::Entropy,
                GateSpec::Constant { score } => Gate::Constant(*score),
            }),
            gate_to_repeats: spec.gate_to_repeats.as_ref().map(|m| match m {
                RepeatMapSpec::Linear => RepeatMap::Linear,
                RepeatMapSpec::Thresholds { steps } => RepeatMap::Thresholds(steps.clone()),
            }),
        }
    }
}

/// Persisted gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateSpec {
    Entropy,
    Constant { score: f64 },
}

/// Persisted repeat map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepeatMapSpec {
    Linear,
    Thresholds { steps: Vec<(f64, usize)> },
}

/// Serializable replay settings. Custom gates and maps are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySpec {
    pub enabled: bool,
    pub phase: ReplayPhase,
    pub offset: i32,
    pub max_repeats: usize,
    pub budget: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_to_repeats: Option<RepeatMapSpec>,
}

impl Default for ReplaySpec {
    fn default() -> Self {
        ReplayConfig::default().to_spec()
    }
}

/// Shannon entropy of `softmax(values)`, divided by `ln(n)`.
pub fn normalized_entropy(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let h: f64 = softmax(values)
        .into_iter()
        .filter(|&p| p > 0.0)
        .map(|p| -p * p.ln())
        .sum();
    (h / (values.len() as f64).ln()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_bounds() {
        assert!((normalized_entropy(&[0.0; 8]) - 1.0).abs() < 1e-12);
        assert!(normalized_entropy(&[100.0, 0.0, 0.0, 0.0]) < 1e-10);
        assert_eq!(normalized_entropy(&[3.0]), 0.0);
    }

    #[test]
    fn source_layer_respects_phase() {
        let before = ReplayConfig::fixed(ReplayPhase::Before, -1, 2);
        assert_eq!(before.source_layer(2), Some(1));
        assert_eq!(before.source_layer(1), None);

        let after_self = ReplayConfig::fixed(ReplayPhase::After, 0, 1);
        assert_eq!(after_self.source_layer(1), Some(1));
        let before_self = ReplayConfig::fixed(ReplayPhase::Before, 0, 1);
        assert_eq!(before_self.source_layer(3), None);
    }

    #[test]
    fn validate_rejects_input_layer_and_bad_offsets() {
        let cfg = ReplayConfig::fixed(ReplayPhase::Before, -1, 1);
        assert!(cfg.validate(0, 4).is_err());
        assert!(cfg.validate(1, 4).is_err());
        assert!(cfg.validate(2, 4).is_ok());
        assert!(ReplayConfig::default().validate(1, 4).is_ok());
    }

    #[test]
    fn gated_repeats_are_capped_by_budget() {
        let cfg = ReplayConfig::gated(ReplayPhase::Before, -1, Gate::Constant(0.5), 10);
        assert_eq!(cfg.repeats(&[]), 5);

        let cfg = cfg.with_repeat_map(RepeatMap::custom(|_| 99));
        assert_eq!(cfg.repeats(&[]), 10);

        let steps = vec![(0.9, 10), (0.7, 5), (0.5, 2)];
        let cfg = ReplayConfig::gated(ReplayPhase::After, 0, Gate::Constant(0.75), 20)
            .with_repeat_map(RepeatMap::Thresholds(steps));
        assert_eq!(cfg.repeats(&[]), 5);
    }

    #[test]
    fn disabled_never_repeats() {
        let mut cfg = ReplayConfig::fixed(ReplayPhase::Before, -1, 3);
        assert_eq!(cfg.repeats(&[]), 3);
        cfg.enabled = false;
        assert_eq!(cfg.repeats(&[]), 0);
    }

    #[test]
    fn spec_roundtrip_drops_custom() {
        let cfg = ReplayConfig::gated(ReplayPhase::After, 0, Gate::Entropy, 4)
            .with_repeat_map(RepeatMap::Thresholds(vec![(0.5, 2)]));
        let json = serde_json::to_string(&cfg.to_spec()).unwrap();
        let back: ReplaySpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg.to_spec());

        let custom = ReplayConfig::gated(ReplayPhase::Before, -1, Gate::custom(|_| 1.0), 2);
        assert_eq!(custom.to_spec().gate, None);
    }

    #[test]
    fn spec_defaults_fill_missing_fields() {
        let spec: ReplaySpec = serde_json::from_str(r#"{"enabled":true,"max_repeats":2}"#).unwrap();
        assert_eq!(spec.offset, -1);
        assert_eq!(spec.phase, ReplayPhase::Before);
        assert_eq!(spec.max_repeats, 2);
    }
}
