//! Risk scoring
//!
//! The scorer reduces a contract to two numbers, asks an anomaly oracle how
//! unusual they are, and squashes the answer into `[0, 1]`:
//!
//! ```text
//! raw   = -oracle.score_samples([write_ratio, risky_flags])
//! score = 1 / (1 + e^-raw)
//! ```
//!
//! Levels use fixed thresholds: `>= 0.70` high, `>= 0.55` medium, else low.

pub mod forest;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::error::{AuditError, Result};

pub use forest::{ForestConfig, IsolationForest};

pub const HIGH_RISK_THRESHOLD: f64 = 0.70;
pub const MEDIUM_RISK_THRESHOLD: f64 = 0.55;

/// Discrete risk bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= HIGH_RISK_THRESHOLD {
            RiskLevel::High
        } else if score >= MEDIUM_RISK_THRESHOLD {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(AuditError::Internal(format!("unknown risk level: {other}"))),
        }
    }
}

/// Scorer input: the two features the model was trained on
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreInput {
    pub write_ratio: f64,
    pub risky_flags: f64,
}

impl ScoreInput {
    /// Read `{"feature1": .., "feature2": ..}` prediction parameters.
    ///
    /// Missing keys default to 0; numeric strings are accepted.
    pub fn from_params(params: &Value) -> Result<Self> {
        Ok(Self {
            write_ratio: feature(params, "feature1")?,
            risky_flags: feature(params, "feature2")?,
        })
    }
}

fn feature(params: &Value, key: &str) -> Result<f64> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| AuditError::Scorer(format!("{key} is not a finite number"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| AuditError::Scorer(format!("{key} is not numeric: {s:?}"))),
        Some(Value::Bool(b)) => Ok(if *b { 1.0 } else { 0.0 }),
        Some(other) => Err(AuditError::Scorer(format!("{key} is not numeric: {other}"))),
    }
}

/// Opaque anomaly model
///
/// `score_samples` follows the isolation-forest convention: lower means
/// more anomalous.
pub trait AnomalyOracle: Send + Sync {
    fn score_samples(&self, sample: [f64; 2]) -> Result<f64>;

    fn model_name(&self) -> &str;

    /// "default" for a freshly trained model, "file" when loaded from disk
    fn source(&self) -> &str;
}

/// Features echoed back with the assessment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeaturesUsed {
    pub feature1: f64,
    pub feature2: f64,
}

/// Scorer output, stored under `details.ia_raw`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub risk_score: f64,
    pub raw: f64,
    pub level: RiskLevel,
    pub features_used: FeaturesUsed,
    pub model: String,
    pub source: String,
}

/// Maps feature summaries to risk assessments
#[derive(Clone)]
pub struct RiskScorer {
    oracle: Arc<dyn AnomalyOracle>,
}

impl RiskScorer {
    pub fn new(oracle: Arc<dyn AnomalyOracle>) -> Self {
        Self { oracle }
    }

    pub fn score(&self, input: ScoreInput) -> Result<RiskAssessment> {
        let magnitude = self
            .oracle
            .score_samples([input.write_ratio, input.risky_flags])?;
        if !magnitude.is_finite() {
            return Err(AuditError::Scorer(format!(
                "oracle returned non-finite score {magnitude}"
            )));
        }

        let raw = -magnitude;
        let risk_score = round4(sigmoid(raw));
        let level = RiskLevel::from_score(risk_score);

        debug!(
            write_ratio = input.write_ratio,
            risky_flags = input.risky_flags,
            risk_score,
            level = %level,
            "Scored"
        );

        Ok(RiskAssessment {
            risk_score,
            raw: round4(raw),
            level,
            features_used: FeaturesUsed {
                feature1: input.write_ratio,
                feature2: input.risky_flags,
            },
            model: self.oracle.model_name().to_string(),
            source: self.oracle.source().to_string(),
        })
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}
