//! Severity classification for overflow magnitudes.
//!
//! A record's tier is the highest tier whose volume OR duration threshold it
//! reaches. Thresholds are inclusive (`>=`).

use serde::{Deserialize, Serialize};

/// Ordered severity hint attached to every emitted change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeverityHint {
    Low,
    Moderate,
    High,
    Critical,
}

impl SeverityHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityHint::Low => "LOW",
            SeverityHint::Moderate => "MODERATE",
            SeverityHint::High => "HIGH",
            SeverityHint::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for SeverityHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the threshold table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Volume in source units (gallons for ECHO).
    pub volume: f64,
    pub duration_hours: f64,
}

impl Tier {
    fn reached_by(&self, duration_hours: f64, volume: f64) -> bool {
        volume >= self.volume || duration_hours >= self.duration_hours
    }
}

fn default_critical() -> Tier {
    Tier {
        volume: 1_000_000.0,
        duration_hours: 48.0,
    }
}
fn default_high() -> Tier {
    Tier {
        volume: 100_000.0,
        duration_hours: 24.0,
    }
}
fn default_moderate() -> Tier {
    Tier {
        volume: 10_000.0,
        duration_hours: 4.0,
    }
}

/// Per-deployment threshold table. Anything below `moderate` is LOW.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    #[serde(default = "default_critical")]
    pub critical: Tier,
    #[serde(default = "default_high")]
    pub high: Tier,
    #[serde(default = "default_moderate")]
    pub moderate: Tier,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            critical: default_critical(),
            high: default_high(),
            moderate: default_moderate(),
        }
    }
}

impl SeverityThresholds {
    /// Classify a pair of magnitudes. Negative, NaN or infinite inputs count as zero.
    pub fn classify(&self, duration_hours: f64, volume: f64) -> SeverityHint {
        let d = clamp_magnitude(duration_hours);
        let v = clamp_magnitude(volume);

        if self.critical.reached_by(d, v) {
            SeverityHint::Critical
        } else if self.high.reached_by(d, v) {
            SeverityHint::High
        } else if self.moderate.reached_by(d, v) {
            SeverityHint::Moderate
        } else {
            SeverityHint::Low
        }
    }

    /// Tiers must not decrease from moderate to critical on either axis.
    pub fn validate(&self) -> Result<(), String> {
        let tiers = [
            ("moderate", self.moderate),
            ("high", self.high),
            ("critical", self.critical),
        ];
        for (name, t) in tiers.iter() {
            if !t.volume.is_finite() || !t.duration_hours.is_finite() {
                return Err(format!("severity.{name} thresholds must be finite"));
            }
        }
        for pair in tiers.windows(2) {
            let (lo_name, lo) = pair[0];
            let (hi_name, hi) = pair[1];
            if hi.volume < lo.volume || hi.duration_hours < lo.duration_hours {
                return Err(format!(
                    "severity.{hi_name} must not be below severity.{lo_name}"
                ));
            }
        }
        Ok(())
    }
}

/// Classify with the default ECHO threshold table.
pub fn classify_severity(duration_hours: f64, volume: f64) -> SeverityHint {
    SeverityThresholds::default().classify(duration_hours, volume)
}

fn clamp_magnitude(x: f64) -> f64 {
    if x.is_finite() && x > 0.0 {
        x
    } else {
        0.0
    }
}
