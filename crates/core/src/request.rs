//! Simulation request payload and its structural validation.
//!
//! The validator only checks shape and ranges. Source availability,
//! spatial projection and area limits belong to the preparation stages.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// A polygon: a list of rings, each ring a list of `[lng, lat]` points.
pub type Polygon = Vec<Vec<Vec<f64>>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    pub zones: Option<Vec<Zone>>,
    pub custom_simulation_areas: Option<Vec<CustomSimulationArea>>,
    pub scaled_simulation_areas: Option<Vec<ScaledSimulationArea>>,
    pub sources: Option<Sources>,
    pub simulation_options: Option<SimulationOptions>,
    pub car_distribution: Option<CarDistribution>,
    pub mode_utilities: Option<ModeUtilities>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: Option<String>,
    pub coords: Option<Polygon>,
    pub trip: Option<Vec<String>>,
    pub policies: Option<Vec<Policy>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomSimulationArea {
    pub id: Option<String>,
    pub coords: Option<Polygon>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaledSimulationArea {
    pub id: Option<String>,
    pub zone_id: Option<String>,
    pub coords: Option<Polygon>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub vehicle_type: Option<String>,
    #[serde(default)]
    pub tier: i64,
    pub period: Option<Vec<String>>,
    pub penalty: Option<f64>,
    pub interval: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sources {
    pub population: Option<DataSource>,
    pub network: Option<DataSource>,
    pub public_transport: Option<DataSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(default)]
    pub year: i32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationOptions {
    #[serde(default)]
    pub iterations: i64,
    #[serde(default)]
    pub percentage: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarDistribution {
    #[serde(default)]
    pub zero_emission: f64,
    #[serde(default)]
    pub near_zero_emission: f64,
    #[serde(default)]
    pub low_emission: f64,
    #[serde(default)]
    pub mid_emission: f64,
    #[serde(default)]
    pub high_emission: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeUtilities {
    #[serde(default)]
    pub walk: f64,
    #[serde(default)]
    pub bike: f64,
    #[serde(default)]
    pub car: f64,
    #[serde(default)]
    pub ev: f64,
    #[serde(default)]
    pub subway: f64,
    #[serde(default)]
    pub bus: f64,
}

const VEHICLE_TYPES: &[&str] = &[
    "zeroEmission",
    "nearZeroEmission",
    "lowEmission",
    "midEmission",
    "highEmission",
];
const TRIP_TYPES: &[&str] = &["start", "end", "pass"];
const TIERS: &[i64] = &[1, 2, 3];

static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([01]\d|2[0-3]):[0-5]\d$").expect("valid time regex"));

/// Structural validator for [`SimulationRequest`] payloads.
///
/// All problems are collected and reported together, joined with ". ".
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulationRequestValidator;

impl SimulationRequestValidator {
    /// Parse and validate a raw JSON payload.
    ///
    /// Returns the typed request on success so callers can forward the
    /// normalised form.
    pub fn validate(&self, payload: &serde_json::Value) -> Result<SimulationRequest, CoreError> {
        let request: SimulationRequest = serde_json::from_value(payload.clone())
            .map_err(|e| CoreError::Validation(format!("Malformed request: {e}")))?;
        self.validate_request(&request)?;
        Ok(request)
    }

    pub fn validate_request(&self, request: &SimulationRequest) -> Result<(), CoreError> {
        let mut errors = Vec::new();

        validate_zones(request, &mut errors);
        validate_custom_areas(request, &mut errors);
        validate_scaled_areas(request, &mut errors);
        validate_sources(request, &mut errors);
        validate_options(request, &mut errors);
        validate_car_distribution(request, &mut errors);
        validate_mode_utilities(request, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Validation(errors.join(". ")))
        }
    }
}

fn required(field: &str) -> String {
    format!("{field} is required")
}

fn is_uuid_v4(value: &str) -> bool {
    Uuid::parse_str(value)
        .map(|u| u.get_version_num() == 4)
        .unwrap_or(false)
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

fn validate_zones(request: &SimulationRequest, errors: &mut Vec<String>) {
    let Some(zones) = &request.zones else {
        errors.push(required("zones"));
        return;
    };
    if zones.is_empty() {
        errors.push("zones must contain at least one zone".to_string());
        return;
    }
    for (index, zone) in zones.iter().enumerate() {
        validate_zone(zone, index, errors);
    }
}

fn validate_zone(zone: &Zone, index: usize, errors: &mut Vec<String>) {
    let context = match non_blank(&zone.id) {
        Some(id) => format!("zone {id}"),
        None => format!("zone at index {index}"),
    };

    match non_blank(&zone.id) {
        None => errors.push(format!("zone at index {index}: id is required")),
        Some(id) if !is_uuid_v4(id) => {
            errors.push(format!("zone at index {index}: id must be a UUID v4"))
        }
        Some(_) => {}
    }

    match &zone.coords {
        None => errors.push(format!("{context}: coords is required")),
        Some(rings) => validate_polygon(rings, &context, errors),
    }

    match zone.trip.as_deref() {
        None | Some([]) => errors.push(format!("{context}: trip is required")),
        Some(trips) => {
            for trip in trips {
                if !TRIP_TYPES.contains(&trip.as_str()) {
                    errors.push(format!(
                        "{context}: invalid trip type '{trip}', expected one of {TRIP_TYPES:?}"
                    ));
                }
            }
        }
    }

    match zone.policies.as_deref() {
        None | Some([]) => errors.push(format!("{context}: policies is required")),
        Some(policies) => {
            for (i, policy) in policies.iter().enumerate() {
                validate_policy(policy, &format!("{context}, policy {i}"), errors);
            }
        }
    }
}

fn validate_polygon(rings: &Polygon, context: &str, errors: &mut Vec<String>) {
    for (r, ring) in rings.iter().enumerate() {
        if ring.len() < 4 {
            errors.push(format!("{context}: ring {r} must have at least 4 points"));
            continue;
        }
        let mut well_formed = true;
        for (c, coord) in ring.iter().enumerate() {
            if coord.len() != 2 {
                errors.push(format!("{context}: ring {r} point {c} must be [lng, lat]"));
                well_formed = false;
            }
        }
        if well_formed && ring.first() != ring.last() {
            errors.push(format!("{context}: ring {r} is not closed"));
        }
    }
}

fn validate_policy(policy: &Policy, prefix: &str, errors: &mut Vec<String>) {
    let vehicle_ok = policy
        .vehicle_type
        .as_deref()
        .is_some_and(|v| VEHICLE_TYPES.contains(&v));
    if !vehicle_ok {
        errors.push(format!(
            "{prefix}: vehicleType must be one of {VEHICLE_TYPES:?}"
        ));
    }
    if !TIERS.contains(&policy.tier) {
        errors.push(format!("{prefix}: tier must be 1, 2 or 3"));
    }

    match policy.period.as_deref() {
        Some([start, end]) => {
            let mut formats_ok = true;
            for time in [start, end] {
                if !TIME_RE.is_match(time) {
                    errors.push(format!("{prefix}: period value '{time}' must be HH:MM"));
                    formats_ok = false;
                }
            }
            if formats_ok && start >= end {
                errors.push(format!("{prefix}: period start must be before end"));
            }
        }
        _ => errors.push(format!("{prefix}: period must contain exactly 2 values")),
    }

    if policy.tier == 2 {
        if !policy.penalty.is_some_and(|p| p > 0.0) {
            errors.push(format!("{prefix}: penalty must be positive for tier 2"));
        }
        if !policy.interval.is_some_and(|i| i > 0) {
            errors.push(format!("{prefix}: interval must be positive for tier 2"));
        }
    }
}

fn validate_custom_areas(request: &SimulationRequest, errors: &mut Vec<String>) {
    let Some(areas) = &request.custom_simulation_areas else {
        errors.push(required("customSimulationAreas"));
        return;
    };
    for (i, area) in areas.iter().enumerate() {
        let context = format!("custom simulation area {i}");
        validate_area_id(&area.id, &context, errors);
        match &area.coords {
            None => errors.push(format!("{context}: coords is required")),
            Some(rings) => validate_polygon(rings, &context, errors),
        }
    }
}

fn validate_scaled_areas(request: &SimulationRequest, errors: &mut Vec<String>) {
    let Some(areas) = &request.scaled_simulation_areas else {
        errors.push(required("scaledSimulationAreas"));
        return;
    };
    let zone_ids: HashSet<&str> = request
        .zones
        .iter()
        .flatten()
        .filter_map(|z| z.id.as_deref())
        .collect();

    for (i, area) in areas.iter().enumerate() {
        let context = format!("scaled simulation area {i}");
        validate_area_id(&area.id, &context, errors);
        match non_blank(&area.zone_id) {
            None => errors.push(format!("{context}: zoneId is required")),
            Some(zone_id) if !is_uuid_v4(zone_id) => {
                errors.push(format!("{context}: zoneId must be a UUID v4"))
            }
            Some(zone_id) if !zone_ids.contains(zone_id) => {
                errors.push(format!("{context}: zoneId {zone_id} does not match any zone"))
            }
            Some(_) => {}
        }
        match &area.coords {
            None => errors.push(format!("{context}: coords is required")),
            Some(rings) => validate_polygon(rings, &context, errors),
        }
    }
}

fn validate_area_id(id: &Option<String>, context: &str, errors: &mut Vec<String>) {
    match non_blank(id) {
        None => errors.push(format!("{context}: id is required")),
        Some(id) if !is_uuid_v4(id) => errors.push(format!("{context}: id must be a UUID v4")),
        Some(_) => {}
    }
}

fn validate_sources(request: &SimulationRequest, errors: &mut Vec<String>) {
    let Some(sources) = &request.sources else {
        errors.push(required("sources"));
        return;
    };
    for (label, source) in [
        ("sources.population", &sources.population),
        ("sources.network", &sources.network),
        ("sources.publicTransport", &sources.public_transport),
    ] {
        match source {
            None => errors.push(required(label)),
            Some(ds) if non_blank(&ds.name).is_none() => {
                errors.push(format!("{label}: name is required"))
            }
            Some(_) => {}
        }
    }
}

fn validate_options(request: &SimulationRequest, errors: &mut Vec<String>) {
    let Some(options) = &request.simulation_options else {
        errors.push(required("simulationOptions"));
        return;
    };
    if !(1..=10).contains(&options.iterations) {
        errors.push("simulationOptions.iterations must be between 1 and 10".to_string());
    }
    if !(1..=10).contains(&options.percentage) {
        errors.push("simulationOptions.percentage must be between 1 and 10".to_string());
    }
}

fn validate_car_distribution(request: &SimulationRequest, errors: &mut Vec<String>) {
    let Some(cd) = &request.car_distribution else {
        errors.push(required("carDistribution"));
        return;
    };
    let fields = [
        ("zeroEmission", cd.zero_emission),
        ("nearZeroEmission", cd.near_zero_emission),
        ("lowEmission", cd.low_emission),
        ("midEmission", cd.mid_emission),
        ("highEmission", cd.high_emission),
    ];
    for (name, value) in fields {
        if value < 0.0 {
            errors.push(format!("carDistribution.{name} must not be negative"));
        }
    }
    let sum: f64 = fields.iter().map(|(_, v)| v).sum();
    if !(99.99..=100.01).contains(&sum) {
        errors.push(format!("carDistribution must sum to 100 (got {sum:.1})"));
    }
}

fn validate_mode_utilities(request: &SimulationRequest, errors: &mut Vec<String>) {
    let Some(mu) = &request.mode_utilities else {
        errors.push(required("modeUtilities"));
        return;
    };
    for (name, value) in [
        ("walk", mu.walk),
        ("bike", mu.bike),
        ("car", mu.car),
        ("ev", mu.ev),
        ("subway", mu.subway),
        ("bus", mu.bus),
    ] {
        if value.fract() != 0.0 || !(-10.0..=10.0).contains(&value) {
            errors.push(format!(
                "modeUtilities.{name} must be an integer between -10 and 10"
            ));
        }
    }
}
