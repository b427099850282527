//! # Runtime Transport Knobs
//!
//! Tuning parameters arrive as a JSON object mapping decimal parameter ids
//! to integers, booleans, or a few string-valued specials. A single invalid
//! entry rejects the whole batch. The parsed list is sorted by (id, value).

#![forbid(unsafe_code)]

use anyhow::{anyhow, bail, Context, Result};
use tracing::error;

use crate::recovery::congestion::CongestionControlType;
use crate::types::DEFAULT_MAX_PRIORITY;

/// Fractions in the RTT-factor knobs use numerator/denominator below this.
pub const KNOB_FRACTION_MAX: u64 = 100;

/// Multiplier packing the auto-background-mode priority threshold next to
/// the utilization percentage.
pub const PRIORITY_THRESHOLD_KNOB_MULTIPLIER: u64 = 1000;

/// Well-known knob parameter ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TransportKnobParamId {
    CcAlgorithm = 0x01,
    StartupRttFactor = 0x02,
    DefaultRttFactor = 0x03,
    AutoBackgroundMode = 0x04,
}

impl TransportKnobParamId {
    pub fn to_wire(self) -> u64 {
        self as u64
    }
}

/// One parsed knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransportKnobParam {
    pub id: u64,
    pub val: u64,
}

/// Parse a serialized knob object. Returns the sorted parameter list, or an
/// error rejecting the entire batch.
pub fn parse_transport_knobs(serialized: &str) -> Result<Vec<TransportKnobParam>> {
    let root: serde_json::Value =
        serde_json::from_str(serialized).context("fail to parse knobs")?;
    let serde_json::Value::Object(entries) = root else {
        bail!("knob payload must be a JSON object");
    };

    let mut params = Vec::with_capacity(entries.len());
    for (key, value) in &entries {
        let param_id: u64 = key
            .parse()
            .with_context(|| format!("knob key is not a decimal id: {key}"))?;
        match value {
            serde_json::Value::Bool(flag) => {
                params.push(TransportKnobParam { id: param_id, val: *flag as u64 });
            }
            serde_json::Value::Number(number) => {
                let val = number
                    .as_u64()
                    .ok_or_else(|| anyhow!("knob value is not an unsigned int: {number}"))?;
                params.push(TransportKnobParam { id: param_id, val });
            }
            serde_json::Value::String(text) => {
                params.push(parse_string_knob(param_id, text)?);
            }
            other => {
                // Array, null, and object values are never valid.
                error!(id = param_id, "invalid transport knob param value type");
                bail!("invalid transport knob param value type: {other}");
            }
        }
    }

    params.sort();
    Ok(params)
}

fn parse_string_knob(param_id: u64, text: &str) -> Result<TransportKnobParam> {
    if param_id == TransportKnobParamId::CcAlgorithm.to_wire() {
        // Expected format: lowercase congestion controller name.
        let Some(cc_type) = CongestionControlType::from_name(text) else {
            error!(name = text, "unknown cc type");
            bail!("unknown cc type {text}");
        };
        return Ok(TransportKnobParam { id: param_id, val: cc_type.to_wire() });
    }
    if param_id == TransportKnobParamId::StartupRttFactor.to_wire()
        || param_id == TransportKnobParamId::DefaultRttFactor.to_wire()
    {
        // Expected format: "{numerator}/{denominator}". Knob values must be
        // a single int, so the fraction is packed here and unpacked in the
        // handler.
        let Some((num_str, denom_str)) = text.split_once('/') else {
            bail!("rtt factor knob expected format {{numerator}}/{{denominator}}");
        };
        let numerator: u64 = num_str.parse().unwrap_or(KNOB_FRACTION_MAX);
        let denominator: u64 = denom_str.parse().unwrap_or(KNOB_FRACTION_MAX);
        if numerator == 0
            || denominator == 0
            || numerator >= KNOB_FRACTION_MAX
            || denominator >= KNOB_FRACTION_MAX
        {
            // The message quotes the inclusive upper bound although the
            // check itself stays strict.
            bail!(
                "rtt factor knob numerator and denominator must be ints in range (0,{KNOB_FRACTION_MAX}]"
            );
        }
        return Ok(TransportKnobParam {
            id: param_id,
            val: numerator * KNOB_FRACTION_MAX + denominator,
        });
    }
    if param_id == TransportKnobParamId::AutoBackgroundMode.to_wire() {
        // Expected format: "{priority_threshold},{percent_utilization}",
        // threshold in [0, 7], utilization in [25, 100].
        let Some((threshold_str, percent_str)) = text.split_once(',') else {
            bail!(
                "auto background mode knob value is not in expected format: {{priority_threshold}},{{percent_utilization}}"
            );
        };
        let threshold: u64 = threshold_str.parse().unwrap_or(u64::MAX);
        let percent: u64 = percent_str.parse().unwrap_or(u64::MAX);
        if threshold > DEFAULT_MAX_PRIORITY as u64 || !(25..=100).contains(&percent) {
            bail!(
                "invalid auto background mode parameters. priority_threshold must be int [0-7]. percent_utilization must be int [25-100]"
            );
        }
        return Ok(TransportKnobParam {
            id: param_id,
            val: threshold * PRIORITY_THRESHOLD_KNOB_MULTIPLIER + percent,
        });
    }
    error!(id = param_id, "string param type is not valid for this knob");
    bail!("string param type is not valid for this knob")
}
