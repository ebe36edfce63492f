use chrono_tz::Tz;
use ned_client::domain::{round_to, CentsPerKwh, EurPerKwh, ForecastPoint, Gigawatts, OverviewPoint, RSquared, Series};
use serde::Serialize;

use crate::{
    config::{ConfigError, ModelConfig},
    model::{features, FittedModel},
};

const PRICE_DECIMALS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastMethod {
    Fallback,
    Model,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceForecast {
    pub method: ForecastMethod,
    pub points: Series<EurPerKwh>,
    /// Fit quality of the model that produced the points, if any.
    pub r_squared: Option<RSquared>,
}

/// Linear rule of thumb: price in ct/kWh from residual load in GW.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FallbackFormula {
    pub slope_ct_per_gw: f64,
    pub intercept_ct: f64,
}

impl FallbackFormula {
    pub fn price(&self, residual_load: Gigawatts) -> EurPerKwh {
        CentsPerKwh(self.slope_ct_per_gw * residual_load.0 + self.intercept_ct).into()
    }
}

pub struct PriceForecaster {
    fallback: FallbackFormula,
    min_r_squared: f64,
    tz: Tz,
}

impl PriceForecaster {
    pub fn new(cfg: &ModelConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            fallback: FallbackFormula {
                slope_ct_per_gw: cfg.fallback_slope,
                intercept_ct: cfg.fallback_intercept_ct,
            },
            min_r_squared: cfg.min_r_squared,
            tz: cfg.tz()?,
        })
    }

    /// Prices for every overview hour. A fitted model is used when its R² is
    /// good enough; otherwise the fallback formula.
    pub fn forecast(&self, overview: &[OverviewPoint], model: Option<&FittedModel>) -> PriceForecast {
        if let Some(m) = model.filter(|m| m.r_squared.0 >= self.min_r_squared) {
            match self.predict_with(overview, m) {
                Ok(points) => {
                    return PriceForecast {
                        method: ForecastMethod::Model,
                        points,
                        r_squared: Some(m.r_squared),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "model prediction failed, using fallback formula");
                }
            }
        }

        PriceForecast {
            method: ForecastMethod::Fallback,
            points: Series::from_points(overview.iter().map(|p| {
                let price = self.fallback.price(p.residual_load);
                ForecastPoint::new(p.ts, EurPerKwh(round_to(price.0, PRICE_DECIMALS)))
            })),
            r_squared: None,
        }
    }

    fn predict_with(
        &self,
        overview: &[OverviewPoint],
        model: &FittedModel,
    ) -> Result<Series<EurPerKwh>, crate::model::ModelError> {
        let points = overview
            .iter()
            .map(|p| {
                let value = model.regression.predict_one(&features::from_overview(p, self.tz))?;
                Ok(ForecastPoint::new(p.ts, EurPerKwh(round_to(value, PRICE_DECIMALS))))
            })
            .collect::<Result<Vec<_>, crate::model::ModelError>>()?;
        Ok(Series::from_points(points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinearRegression;
    use time::macros::datetime;

    fn overview(consumption: f64, renewable: f64) -> Vec<OverviewPoint> {
        vec![OverviewPoint::new(
            datetime!(2024-02-01 12:00 UTC),
            Gigawatts(renewable),
            Gigawatts(0.0),
            Gigawatts(0.0),
            Gigawatts(consumption),
        )]
    }

    fn fitted(intercept: f64, coefficients: Vec<f64>, r2: f64) -> FittedModel {
        FittedModel {
            regression: LinearRegression::from_parameters(intercept, coefficients),
            r_squared: RSquared(r2),
            samples: 100,
            fitted_at: datetime!(2024-02-01 02:07 UTC),
        }
    }

    #[test]
    fn fallback_formula_converts_cents_to_euros() {
        let f = FallbackFormula {
            slope_ct_per_gw: 1.27,
            intercept_ct: 1.5,
        };
        assert!((f.price(Gigawatts(10.0)).0 - 0.142).abs() < 1e-12);
        assert!((f.price(Gigawatts(0.0)).0 - 0.015).abs() < 1e-12);
    }

    #[test]
    fn without_model_fallback_is_used() {
        let forecaster = PriceForecaster::new(&ModelConfig::default()).unwrap();
        let fc = forecaster.forecast(&overview(14.0, 4.0), None);

        assert_eq!(fc.method, ForecastMethod::Fallback);
        assert_eq!(fc.r_squared, None);
        assert_eq!(fc.points.first().unwrap().value, EurPerKwh(0.142));
    }

    #[test]
    fn negative_residual_can_give_negative_price() {
        let forecaster = PriceForecaster::new(&ModelConfig::default()).unwrap();
        let fc = forecaster.forecast(&overview(10.0, 16.0), None);
        // 1.27 * -6 + 1.5 = -6.12 ct
        assert_eq!(fc.points.first().unwrap().value, EurPerKwh(-0.061));
    }

    #[test]
    fn fitted_model_is_used_and_rounded() {
        let forecaster = PriceForecaster::new(&ModelConfig::default()).unwrap();
        let model = fitted(0.02, vec![0.01, 0.0, 0.0, 0.0], 0.8);
        let fc = forecaster.forecast(&overview(14.0, 4.0), Some(&model));

        assert_eq!(fc.method, ForecastMethod::Model);
        assert_eq!(fc.r_squared, Some(RSquared(0.8)));
        assert_eq!(fc.points.first().unwrap().value, EurPerKwh(0.12));
    }

    #[test]
    fn weak_model_falls_back() {
        let cfg = ModelConfig {
            min_r_squared: 0.5,
            ..ModelConfig::default()
        };
        let forecaster = PriceForecaster::new(&cfg).unwrap();
        let model = fitted(0.02, vec![0.01, 0.0, 0.0, 0.0], 0.3);

        let fc = forecaster.forecast(&overview(14.0, 4.0), Some(&model));
        assert_eq!(fc.method, ForecastMethod::Fallback);
    }

    #[test]
    fn model_with_wrong_width_falls_back() {
        let forecaster = PriceForecaster::new(&ModelConfig::default()).unwrap();
        let model = fitted(0.02, vec![0.01], 0.9);

        let fc = forecaster.forecast(&overview(14.0, 4.0), Some(&model));
        assert_eq!(fc.method, ForecastMethod::Fallback);
    }
}
