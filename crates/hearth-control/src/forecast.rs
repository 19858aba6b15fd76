//! Alignment of hourly weather forecasts to control-cycle steps.
//!
//! Providers return up to four hourly values per series (outdoor temperature
//! and solar power). The trajectory simulation wants one value per cycle
//! step, so the aligner anchors the series at the current reading (offset 0)
//! and the hourly values (offsets 1..=n), interpolates linearly between
//! anchors and holds the last value beyond the end of the forecast.
//!
//! A missing series is filled in one of two ways:
//!
//! * the whole forecast is absent: persistence (current values held);
//! * one series is absent but the other exists: a day/night heuristic for
//!   the missing one (if the local hour is unknown, persistence again).

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ForecastConfig;

/// Hourly forecast as returned by the weather provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HourlyForecast {
    /// Outdoor temperature for hour 1, 2, ... (°C).
    pub outdoor_temps: Vec<f64>,
    /// Solar power for hour 1, 2, ... (W).
    pub solar_watts: Vec<f64>,
}

impl HourlyForecast {
    /// Forecast with both series.
    pub fn new(outdoor_temps: Vec<f64>, solar_watts: Vec<f64>) -> Self {
        Self {
            outdoor_temps,
            solar_watts,
        }
    }
}

/// Conditions expected at one cycle step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastWindow {
    /// Hours from now.
    pub offset_hours: f64,
    /// Expected outdoor temperature (°C).
    pub outdoor_temp: f64,
    /// Expected solar power (W).
    pub solar_watts: f64,
}

/// Where the values of an aligned series came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentSource {
    /// Interpolated from provider values.
    Forecast,
    /// Current value held constant.
    Persistence,
    /// Day/night rule of thumb.
    Heuristic,
}

/// Cycle-step windows plus provenance of each series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedForecast {
    /// One window per step, offsets `step, 2*step, ...`.
    pub windows: Vec<ForecastWindow>,
    /// Source of `outdoor_temp` values.
    pub outdoor_source: AlignmentSource,
    /// Source of `solar_watts` values.
    pub solar_source: AlignmentSource,
}

/// Converts hourly forecasts into per-cycle windows.
#[derive(Debug, Clone, Default)]
pub struct ForecastAligner {
    config: ForecastConfig,
}

impl ForecastAligner {
    /// Aligner with the given heuristic parameters.
    pub fn new(config: ForecastConfig) -> Self {
        Self { config }
    }

    /// Heuristic parameters.
    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    /// Produce `steps` windows spaced `step_hours` apart.
    ///
    /// `hour_of_day` drives the heuristic for a missing series and is
    /// evaluated once, at the current time.
    pub fn align(
        &self,
        current_outdoor: f64,
        current_solar: f64,
        forecast: Option<&HourlyForecast>,
        hour_of_day: Option<u32>,
        step_hours: f64,
        steps: usize,
    ) -> AlignedForecast {
        let current_solar = if current_solar.is_finite() {
            current_solar.max(0.0)
        } else {
            0.0
        };

        let (outdoor_source, solar_source) = match forecast {
            None => (AlignmentSource::Persistence, AlignmentSource::Persistence),
            Some(f) => {
                let has_outdoor = !usable_prefix(&f.outdoor_temps).is_empty();
                let has_solar = !usable_prefix(&f.solar_watts).is_empty();
                let fill = if hour_of_day.is_some() {
                    AlignmentSource::Heuristic
                } else {
                    AlignmentSource::Persistence
                };
                match (has_outdoor, has_solar) {
                    (true, true) => (AlignmentSource::Forecast, AlignmentSource::Forecast),
                    (true, false) => (AlignmentSource::Forecast, fill),
                    (false, true) => (fill, AlignmentSource::Forecast),
                    (false, false) => (AlignmentSource::Persistence, AlignmentSource::Persistence),
                }
            }
        };

        let daytime = hour_of_day.map(|h| self.is_daytime(h)).unwrap_or(false);

        let windows = (1..=steps)
            .map(|k| {
                let offset = k as f64 * step_hours;
                let outdoor_temp = match outdoor_source {
                    AlignmentSource::Forecast => interpolate(
                        current_outdoor,
                        usable_prefix(forecast.map(|f| f.outdoor_temps.as_slice()).unwrap_or(&[])),
                        offset,
                    ),
                    AlignmentSource::Heuristic => {
                        let rate = if daytime {
                            self.config.daytime_warming_per_hour
                        } else {
                            -self.config.nighttime_cooling_per_hour
                        };
                        current_outdoor + rate * offset
                    }
                    AlignmentSource::Persistence => current_outdoor,
                };
                let solar_watts = match solar_source {
                    AlignmentSource::Forecast => interpolate(
                        current_solar,
                        usable_prefix(forecast.map(|f| f.solar_watts.as_slice()).unwrap_or(&[])),
                        offset,
                    )
                    .max(0.0),
                    AlignmentSource::Heuristic => {
                        if daytime {
                            current_solar * self.config.daytime_solar_persistence
                        } else {
                            0.0
                        }
                    }
                    AlignmentSource::Persistence => current_solar,
                };
                ForecastWindow {
                    offset_hours: offset,
                    outdoor_temp,
                    solar_watts,
                }
            })
            .collect();

        debug!(
            steps,
            step_hours,
            ?outdoor_source,
            ?solar_source,
            "forecast aligned"
        );

        AlignedForecast {
            windows,
            outdoor_source,
            solar_source,
        }
    }

    fn is_daytime(&self, hour: u32) -> bool {
        let hour = hour % 24;
        hour >= self.config.day_start_hour && hour < self.config.day_end_hour
    }
}

/// Leading run of finite values; anything after the first NaN is dropped.
fn usable_prefix(values: &[f64]) -> &[f64] {
    let end = values
        .iter()
        .position(|v| !v.is_finite())
        .unwrap_or(values.len());
    &values[..end]
}

/// Piecewise-linear value at `offset` hours with anchors `(0, current)` and
/// `(h, hourly[h - 1])`. Holds the last anchor past the end.
fn interpolate(current: f64, hourly: &[f64], offset: f64) -> f64 {
    if hourly.is_empty() || offset <= 0.0 {
        return current;
    }
    let last = hourly.len() as f64;
    if offset >= last {
        return hourly[hourly.len() - 1];
    }
    let lower = offset.floor();
    let frac = offset - lower;
    let idx = lower as usize;
    let a = if idx == 0 { current } else { hourly[idx - 1] };
    let b = hourly[idx];
    a + (b - a) * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn aligner() -> ForecastAligner {
        ForecastAligner::new(ForecastConfig::default())
    }

    #[test]
    fn half_hour_steps_interpolate_between_hours() {
        let f = HourlyForecast::new(vec![6.0, 8.0, 10.0, 12.0], vec![100.0, 200.0, 300.0, 400.0]);
        let aligned = aligner().align(4.0, 0.0, Some(&f), Some(12), 0.5, 8);
        let outdoor: Vec<f64> = aligned.windows.iter().map(|w| w.outdoor_temp).collect();
        let expected = [5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        for (got, want) in outdoor.iter().zip(expected) {
            assert_relative_eq!(*got, want, epsilon = 1e-12);
        }
        assert_relative_eq!(aligned.windows[0].solar_watts, 50.0, epsilon = 1e-12);
        assert_eq!(aligned.outdoor_source, AlignmentSource::Forecast);
        assert_eq!(aligned.solar_source, AlignmentSource::Forecast);
    }

    #[test]
    fn last_value_held_beyond_forecast() {
        let f = HourlyForecast::new(vec![3.0, 1.0], vec![0.0, 0.0]);
        let aligned = aligner().align(5.0, 0.0, Some(&f), None, 1.0, 4);
        let outdoor: Vec<f64> = aligned.windows.iter().map(|w| w.outdoor_temp).collect();
        assert_eq!(outdoor, vec![3.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn absent_forecast_uses_persistence() {
        let aligned = aligner().align(2.5, 700.0, None, Some(10), 0.5, 4);
        assert!(aligned
            .windows
            .iter()
            .all(|w| w.outdoor_temp == 2.5 && w.solar_watts == 700.0));
        assert_eq!(aligned.outdoor_source, AlignmentSource::Persistence);
    }

    #[test]
    fn missing_solar_in_daytime_uses_heuristic() {
        let f = HourlyForecast::new(vec![5.0, 5.0], vec![]);
        let aligned = aligner().align(5.0, 1000.0, Some(&f), Some(11), 1.0, 2);
        assert_eq!(aligned.solar_source, AlignmentSource::Heuristic);
        assert!(aligned.windows.iter().all(|w| (w.solar_watts - 800.0).abs() < 1e-9));
    }

    #[test]
    fn missing_outdoor_at_night_cools() {
        let f = HourlyForecast::new(vec![], vec![0.0, 0.0]);
        let aligned = aligner().align(3.0, 50.0, Some(&f), Some(22), 0.5, 4);
        assert_eq!(aligned.outdoor_source, AlignmentSource::Heuristic);
        assert_relative_eq!(aligned.windows[3].outdoor_temp, 3.0 - 0.2 * 2.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_series_without_hour_uses_persistence() {
        let f = HourlyForecast::new(vec![7.0], vec![]);
        let aligned = aligner().align(3.0, 400.0, Some(&f), None, 1.0, 2);
        assert_eq!(aligned.solar_source, AlignmentSource::Persistence);
        assert!(aligned.windows.iter().all(|w| w.solar_watts == 400.0));
    }

    #[test]
    fn night_heuristic_zeroes_solar() {
        let f = HourlyForecast::new(vec![1.0], vec![]);
        let aligned = aligner().align(1.0, 300.0, Some(&f), Some(3), 1.0, 2);
        assert!(aligned.windows.iter().all(|w| w.solar_watts == 0.0));
    }

    #[test]
    fn non_finite_values_truncate_series() {
        assert_eq!(usable_prefix(&[1.0, 2.0, f64::NAN, 4.0]), &[1.0, 2.0]);
        let f = HourlyForecast::new(vec![f64::NAN], vec![10.0]);
        let aligned = aligner().align(6.0, 0.0, Some(&f), None, 1.0, 1);
        assert_eq!(aligned.outdoor_source, AlignmentSource::Persistence);
        assert_eq!(aligned.windows[0].outdoor_temp, 6.0);
    }
}
