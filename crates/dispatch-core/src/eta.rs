//! ETA prediction: rule-based estimate by default, with an optional
//! injectable regressor for the ML path, plus a historical blend.
//!
//! Grounded in a rule-based ETA estimator this system's prediction feature
//! was distilled from: same penalty formula, same 20% safety buffer, same
//! historical-blend weighting. The `RandomForestRegressor` in that estimator
//! has no equivalent crate in this workspace's stack, so the ML path here is
//! an injectable `Regressor` trait rather than a fabricated dependency —
//! `model_used` only reports `Ml` when a regressor was actually supplied and
//! returned a value.

use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Inputs to a single ETA prediction.
#[derive(Debug, Clone, Copy)]
pub struct FeatureVector {
    pub distance_km: f64,
    pub altitude_avg_m: f64,
    pub altitude_variance: f64,
    pub route_complexity: f64,
    pub temperature_c: f64,
    pub wind_speed_kmh: f64,
    pub wind_direction_deg: f64,
    pub precipitation: f64,
    pub visibility_km: f64,
    pub air_pressure_hpa: f64,
    pub payload_weight_kg: f64,
    pub battery_level: u8,
    pub drone_age_days: u32,
    pub time_of_day: u8,
    pub day_of_week: u8,
    pub air_traffic_density: f64,
    pub drone_max_speed_kmh: f64,
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self {
            distance_km: 0.0,
            altitude_avg_m: 100.0,
            altitude_variance: 50.0,
            route_complexity: 0.3,
            temperature_c: 20.0,
            wind_speed_kmh: 10.0,
            wind_direction_deg: 0.0,
            precipitation: 0.0,
            visibility_km: 10.0,
            air_pressure_hpa: 1013.0,
            payload_weight_kg: 2.0,
            battery_level: 100,
            drone_age_days: 0,
            time_of_day: 12,
            day_of_week: 0,
            air_traffic_density: 0.3,
            drone_max_speed_kmh: 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelUsed {
    Ml,
    RuleBased,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtaPrediction {
    pub eta_minutes: f64,
    pub eta_datetime: DateTime<Utc>,
    pub confidence: f64,
    pub uncertainty_range: (f64, f64),
    pub base_speed_kmh: f64,
    pub effective_speed_kmh: f64,
    pub speed_reduction_percent: f64,
    pub payload_impact: f64,
    pub altitude_impact: f64,
    pub battery_impact: f64,
    pub weather_impact: f64,
    pub traffic_impact: f64,
    pub historical_adjustment: f64,
    pub model_used: ModelUsed,
    pub similar_routes_count: usize,
}

/// An injectable point + (p10, p90) regressor. No implementation ships in
/// this crate; callers that have a trained model wire it in here.
pub trait Regressor: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> (f64, (f64, f64));
}

fn route_hash(distance_km: f64, altitude_avg_m: f64, weather_factor: f64) -> String {
    let d = (distance_km * 10.0).round() / 10.0;
    let a = altitude_avg_m.round();
    let w = (weather_factor * 100.0).round() / 100.0;
    format!("{d}_{a}_{w}")
}

const MAX_SAMPLES_PER_ROUTE: usize = 200;
const MAX_PREDICTION_ERRORS: usize = 1000;
const AUTO_RETRAIN_SAMPLE_THRESHOLD: usize = 100;
const AUTO_RETRAIN_MIN_DAYS: i64 = 7;

/// Rule-based-by-default ETA predictor with a historical blend and an
/// optional injected ML-shaped regressor.
pub struct EtaPredictor {
    historical: DashMap<String, VecDeque<f64>>,
    prediction_errors: std::sync::Mutex<VecDeque<f64>>,
    sample_count: std::sync::atomic::AtomicU64,
    last_retrain: std::sync::Mutex<Option<DateTime<Utc>>>,
    regressor: Option<Box<dyn Regressor>>,
}

impl Default for EtaPredictor {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EtaPredictor {
    pub fn new(regressor: Option<Box<dyn Regressor>>) -> Self {
        Self {
            historical: DashMap::new(),
            prediction_errors: std::sync::Mutex::new(VecDeque::new()),
            sample_count: std::sync::atomic::AtomicU64::new(0),
            last_retrain: std::sync::Mutex::new(None),
            regressor,
        }
    }

    pub fn predict(&self, features: &FeatureVector, start_time: DateTime<Utc>) -> EtaPrediction {
        let mut prediction = match &self.regressor {
            Some(r) => self.predict_ml(r.as_ref(), features, start_time),
            None => self.predict_rule_based(features, start_time),
        };
        self.apply_historical_adjustment(&mut prediction, features);
        prediction
    }

    fn predict_rule_based(&self, f: &FeatureVector, start_time: DateTime<Utc>) -> EtaPrediction {
        let base_speed = f.drone_max_speed_kmh * 0.8;

        let payload_penalty = 1.0 - (f.payload_weight_kg / 10.0 * 0.1).min(0.3);
        let altitude_penalty = 1.0 - (f.altitude_avg_m / 1000.0 * 0.05).min(0.2);
        let battery_penalty = if f.battery_level > 50 {
            1.0
        } else {
            (f.battery_level as f64 / 50.0).max(0.7)
        };
        let wind_penalty = 1.0 - (f.wind_speed_kmh / 50.0 * 0.15).min(0.25);
        let precip_penalty = 1.0 - (f.precipitation * 0.2).min(0.3);
        let traffic_penalty = 1.0 - (f.air_traffic_density * 0.1).min(0.15);

        let effective_speed =
            base_speed * payload_penalty * altitude_penalty * battery_penalty * wind_penalty * precip_penalty * traffic_penalty;

        let eta_minutes = (f.distance_km / effective_speed) * 60.0 * 1.2;
        let uncertainty_range = (eta_minutes * 0.85, eta_minutes * 1.25);

        EtaPrediction {
            eta_minutes,
            eta_datetime: start_time + ChronoDuration::seconds((eta_minutes * 60.0) as i64),
            confidence: 75.0,
            uncertainty_range,
            base_speed_kmh: base_speed,
            effective_speed_kmh: effective_speed,
            speed_reduction_percent: (base_speed - effective_speed) / base_speed * 100.0,
            payload_impact: (1.0 - payload_penalty) * 100.0,
            altitude_impact: (1.0 - altitude_penalty) * 100.0,
            battery_impact: (1.0 - battery_penalty) * 100.0,
            weather_impact: (1.0 - wind_penalty - precip_penalty + 1.0) * 100.0,
            traffic_impact: (1.0 - traffic_penalty) * 100.0,
            historical_adjustment: 0.0,
            model_used: ModelUsed::RuleBased,
            similar_routes_count: 0,
        }
    }

    fn predict_ml(&self, regressor: &dyn Regressor, f: &FeatureVector, start_time: DateTime<Utc>) -> EtaPrediction {
        let (eta_minutes, uncertainty_range) = regressor.predict(f);
        let base_speed = f.drone_max_speed_kmh * 0.8;
        let effective_speed = if eta_minutes > 0.0 { f.distance_km / eta_minutes * 60.0 } else { base_speed };
        let speed_reduction = (base_speed - effective_speed) / base_speed * 100.0;

        EtaPrediction {
            eta_minutes,
            eta_datetime: start_time + ChronoDuration::seconds((eta_minutes * 60.0) as i64),
            confidence: self.calculate_confidence(uncertainty_range, eta_minutes),
            uncertainty_range,
            base_speed_kmh: base_speed,
            effective_speed_kmh: effective_speed,
            speed_reduction_percent: speed_reduction,
            payload_impact: f.payload_weight_kg / 10.0 * 10.0,
            altitude_impact: f.altitude_avg_m / 1000.0 * 5.0,
            battery_impact: ((50.0 - f.battery_level as f64) / 50.0 * 10.0).max(0.0),
            weather_impact: f.wind_speed_kmh / 50.0 * 15.0 + f.precipitation * 20.0,
            traffic_impact: f.air_traffic_density * 10.0,
            historical_adjustment: 0.0,
            model_used: ModelUsed::Ml,
            similar_routes_count: self.sample_count.load(std::sync::atomic::Ordering::Relaxed) as usize,
        }
    }

    fn calculate_confidence(&self, uncertainty_range: (f64, f64), eta_minutes: f64) -> f64 {
        if eta_minutes <= 0.0 {
            return 65.0;
        }
        let uncertainty_percent = (uncertainty_range.1 - uncertainty_range.0) / eta_minutes * 100.0;
        if uncertainty_percent < 10.0 {
            95.0
        } else if uncertainty_percent < 20.0 {
            85.0
        } else if uncertainty_percent < 30.0 {
            75.0
        } else {
            65.0
        }
    }

    fn apply_historical_adjustment(&self, prediction: &mut EtaPrediction, f: &FeatureVector) {
        let hash = route_hash(f.distance_km, f.altitude_avg_m, f.wind_speed_kmh / 50.0);
        let Some(samples) = self.historical.get(&hash) else {
            return;
        };
        if samples.len() < 3 {
            return;
        }

        let historical_avg = samples.iter().sum::<f64>() / samples.len() as f64;
        let blend_weight = (samples.len() as f64 / 20.0).min(0.3);
        let adjusted_eta = prediction.eta_minutes * (1.0 - blend_weight) + historical_avg * blend_weight;
        let adjustment = adjusted_eta - prediction.eta_minutes;

        prediction.eta_minutes = adjusted_eta;
        prediction.eta_datetime += ChronoDuration::seconds((adjustment * 60.0) as i64);
        prediction.historical_adjustment = adjustment;
        prediction.similar_routes_count = samples.len();

        if prediction.eta_minutes > 0.0 && (adjustment.abs() / prediction.eta_minutes) < 0.1 {
            prediction.confidence = (prediction.confidence + 10.0).min(98.0);
        }
    }

    /// Feed back an observed delivery. Bumps the retrain gate once enough
    /// fresh samples accumulate; actual retraining is the caller's
    /// responsibility (this crate carries no trainer).
    pub fn add_historical_delivery(&self, distance_km: f64, altitude_avg_m: f64, wind_speed_kmh: f64, actual_duration_minutes: f64) {
        let hash = route_hash(distance_km, altitude_avg_m, wind_speed_kmh / 50.0);
        let mut bucket = self.historical.entry(hash).or_default();
        bucket.push_back(actual_duration_minutes);
        if bucket.len() > MAX_SAMPLES_PER_ROUTE {
            bucket.pop_front();
        }
        drop(bucket);

        let total = self.sample_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        if total as usize >= AUTO_RETRAIN_SAMPLE_THRESHOLD {
            let mut last_retrain = self.last_retrain.lock().expect("lock poisoned");
            let days_since = last_retrain.map(|t| (Utc::now() - t).num_days()).unwrap_or(999);
            if days_since >= AUTO_RETRAIN_MIN_DAYS {
                tracing::info!(samples = total, "eta retrain window open");
                *last_retrain = Some(Utc::now());
            }
        }
    }

    pub fn record_actual_delivery(&self, prediction: &EtaPrediction, actual_duration_minutes: f64) {
        let error_percent = if actual_duration_minutes > 0.0 {
            (actual_duration_minutes - prediction.eta_minutes).abs() / actual_duration_minutes * 100.0
        } else {
            0.0
        };
        let mut errors = self.prediction_errors.lock().expect("lock poisoned");
        errors.push_back(error_percent);
        if errors.len() > MAX_PREDICTION_ERRORS {
            errors.pop_front();
        }
    }

    pub fn average_error_percent(&self) -> Option<f64> {
        let errors = self.prediction_errors.lock().expect("lock poisoned");
        if errors.is_empty() {
            None
        } else {
            Some(errors.iter().sum::<f64>() / errors.len() as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_based_eta_matches_formula() {
        let predictor = EtaPredictor::default();
        let mut features = FeatureVector {
            distance_km: 10.0,
            payload_weight_kg: 0.0,
            wind_speed_kmh: 0.0,
            precipitation: 0.0,
            air_traffic_density: 0.0,
            battery_level: 100,
            altitude_avg_m: 0.0,
            ..Default::default()
        };
        features.drone_max_speed_kmh = 60.0;
        let prediction = predictor.predict(&features, Utc::now());
        // base_speed=48, all penalties=1.0, eta = (10/48)*60*1.2 = 15.0
        assert!((prediction.eta_minutes - 15.0).abs() < 0.01);
        assert_eq!(prediction.model_used, ModelUsed::RuleBased);
    }

    #[test]
    fn low_battery_increases_eta() {
        let predictor = EtaPredictor::default();
        let healthy = FeatureVector { distance_km: 10.0, battery_level: 100, ..Default::default() };
        let low = FeatureVector { distance_km: 10.0, battery_level: 20, ..Default::default() };
        let p_healthy = predictor.predict(&healthy, Utc::now());
        let p_low = predictor.predict(&low, Utc::now());
        assert!(p_low.eta_minutes > p_healthy.eta_minutes);
    }

    #[test]
    fn historical_blend_requires_at_least_three_samples() {
        let predictor = EtaPredictor::default();
        let features = FeatureVector { distance_km: 5.0, altitude_avg_m: 100.0, wind_speed_kmh: 5.0, ..Default::default() };
        predictor.add_historical_delivery(5.0, 100.0, 5.0, 50.0);
        predictor.add_historical_delivery(5.0, 100.0, 5.0, 52.0);
        let before = predictor.predict(&features, Utc::now());
        assert_eq!(before.historical_adjustment, 0.0);

        predictor.add_historical_delivery(5.0, 100.0, 5.0, 48.0);
        let after = predictor.predict(&features, Utc::now());
        assert!(after.similar_routes_count >= 3);
    }
}
