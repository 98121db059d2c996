//! Near-JSON repair boundary
//!
//! Reasoning-service output often arrives as JSON wrapped in markdown code
//! fences or surrounded by prose. This module extracts and parses it into a
//! typed result; anything that cannot be repaired becomes an explicit
//! `Unparseable` outcome, never a crash. No other module touches raw
//! forecast payloads.

use serde::Deserialize;
use serde_json::Value;

/// Typed forecast parsed out of a raw reply
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedForecast {
    /// Probability the market resolves YES, in [0, 1]
    pub probability: f64,
    /// Model's confidence in its own estimate, in [0, 1]
    pub confidence: f64,
    pub rationale: String,
}

/// Outcome of the repair/parse boundary
#[derive(Debug, Clone, PartialEq)]
pub enum ForecastOutcome {
    Parsed(ParsedForecast),
    /// Payload could not be repaired; treated as abstention by callers
    Unparseable,
}

impl ForecastOutcome {
    pub fn as_parsed(&self) -> Option<&ParsedForecast> {
        match self {
            ForecastOutcome::Parsed(parsed) => Some(parsed),
            ForecastOutcome::Unparseable => None,
        }
    }
}

/// Extract the JSON fragment from a response that may contain markdown code
/// blocks or surrounding prose.
fn extract_json(text: &str) -> &str {
    // Fenced ```json block first
    if let Some(start) = text.find("```json") {
        if let Some(end) = text[start + 7..].find("```") {
            return text[start + 7..start + 7 + end].trim();
        }
    }

    // Generic code block
    if let Some(start) = text.find("```") {
        if let Some(end) = text[start + 3..].find("```") {
            let content = text[start + 3..start + 3 + end].trim();
            // Skip language identifier if present
            if let Some(newline) = content.find('\n') {
                return content[newline + 1..].trim();
            }
            return content;
        }
    }

    // Outermost raw object
    if let Some(start) = text.find('{') {
        if let Some(end) = text.rfind('}') {
            if end > start {
                return &text[start..=end];
            }
        }
    }

    text.trim()
}

/// Strict shape the service is prompted to produce
#[derive(Debug, Deserialize)]
struct StrictForecast {
    probability: f64,
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

/// Parse a raw forecast reply, repairing near-well-formed output
pub fn parse_forecast(raw: &str) -> ForecastOutcome {
    let json_str = extract_json(raw);

    // Direct parse of the expected shape
    if let Ok(strict) = serde_json::from_str::<StrictForecast>(json_str) {
        return finish(strict.probability, strict.confidence, strict.rationale);
    }

    // Flexible parse: tolerate alternate key names and stringified numbers
    let Ok(value) = serde_json::from_str::<Value>(json_str) else {
        return ForecastOutcome::Unparseable;
    };
    let Some(obj) = value.as_object() else {
        return ForecastOutcome::Unparseable;
    };

    let probability = ["probability", "prob", "p", "yes_probability"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(number));
    let confidence = ["confidence", "conf"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(number));
    let rationale = ["rationale", "reasoning", "explanation"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    match (probability, confidence) {
        (Some(p), Some(c)) => finish(p, c, rationale),
        // A probability without a stated confidence is still usable; treat
        // the probability's distance from a coin flip as the confidence.
        (Some(p), None) => {
            let implied = (2.0 * (p - 0.5)).abs().clamp(0.0, 1.0);
            finish(p, implied, rationale)
        }
        _ => ForecastOutcome::Unparseable,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim().trim_end_matches('%');
            let parsed = trimmed.parse::<f64>().ok()?;
            // "72%" means 0.72
            if s.contains('%') {
                Some(parsed / 100.0)
            } else {
                Some(parsed)
            }
        }
        _ => None,
    }
}

fn finish(probability: f64, confidence: f64, rationale: String) -> ForecastOutcome {
    if !probability.is_finite() || !confidence.is_finite() {
        return ForecastOutcome::Unparseable;
    }
    // Values given on a 0-100 scale are normalized down
    let probability = if probability > 1.0 {
        probability / 100.0
    } else {
        probability
    };
    let confidence = if confidence > 1.0 {
        confidence / 100.0
    } else {
        confidence
    };
    if !(0.0..=1.0).contains(&probability) || !(0.0..=1.0).contains(&confidence) {
        return ForecastOutcome::Unparseable;
    }
    ForecastOutcome::Parsed(ParsedForecast {
        probability,
        confidence,
        rationale,
    })
}
