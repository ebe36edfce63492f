use std::{collections::HashMap, sync::Arc};

use futures::StreamExt;
use ned_client::domain::{EnergyKind, EnergySnapshot, Measurement, Quantity, Series, Unit};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::{
    forecast::{ForecastMethod, PriceForecast, PriceForecaster},
    model::{FittedModel, ModelFitter},
    pipeline::{Envelope, PipelineError, Sink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    WindOnshore,
    WindOffshore,
    Solar,
    Consumption,
    TotalRenewable,
    CoveragePercentage,
    PriceForecast,
    ModelAccuracy,
}

impl SensorKind {
    pub const ALL: [SensorKind; 8] = [
        SensorKind::WindOnshore,
        SensorKind::WindOffshore,
        SensorKind::Solar,
        SensorKind::Consumption,
        SensorKind::TotalRenewable,
        SensorKind::CoveragePercentage,
        SensorKind::PriceForecast,
        SensorKind::ModelAccuracy,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::WindOnshore => "wind_onshore",
            Self::WindOffshore => "wind_offshore",
            Self::Solar => "solar",
            Self::Consumption => "consumption",
            Self::TotalRenewable => "total_renewable",
            Self::CoveragePercentage => "coverage_percentage",
            Self::PriceForecast => "price_forecast",
            Self::ModelAccuracy => "model_accuracy",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::WindOnshore => "NED Forecast Wind Onshore",
            Self::WindOffshore => "NED Forecast Wind Offshore",
            Self::Solar => "NED Forecast Solar",
            Self::Consumption => "NED Forecast Consumption",
            Self::TotalRenewable => "NED Forecast Total Renewable",
            Self::CoveragePercentage => "NED Forecast Coverage Percentage",
            Self::PriceForecast => "NED Forecast Electricity Price",
            Self::ModelAccuracy => "NED Forecast Model Accuracy",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Self::WindOnshore => "mdi:wind-turbine",
            Self::WindOffshore => "mdi:turbine",
            Self::Solar => "mdi:solar-power",
            Self::Consumption => "mdi:transmission-tower",
            Self::TotalRenewable => "mdi:leaf",
            Self::CoveragePercentage => "mdi:percent",
            Self::PriceForecast => "mdi:currency-eur",
            Self::ModelAccuracy => "mdi:chart-line",
        }
    }

    pub fn unit(self) -> Unit {
        match self {
            Self::CoveragePercentage => Unit::Percent,
            Self::PriceForecast => Unit::EurPerKwh,
            Self::ModelAccuracy => Unit::Dimensionless,
            _ => Unit::Gigawatt,
        }
    }

    fn decimals(self) -> u32 {
        match self {
            Self::PriceForecast | Self::ModelAccuracy => 3,
            _ => 1,
        }
    }

    pub fn energy_kind(self) -> Option<EnergyKind> {
        match self {
            Self::WindOnshore => Some(EnergyKind::WindOnshore),
            Self::WindOffshore => Some(EnergyKind::WindOffshore),
            Self::Solar => Some(EnergyKind::Solar),
            Self::Consumption => Some(EnergyKind::Consumption),
            _ => None,
        }
    }

    /// Sensors whose value depends on a successful NED fetch.
    pub fn depends_on_ned(self) -> bool {
        !matches!(self, Self::ModelAccuracy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub datetime: OffsetDateTime,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    pub id: &'static str,
    pub name: &'static str,
    pub icon: &'static str,
    pub unit: Unit,
    pub available: bool,
    pub value: Option<Measurement>,
    pub forecast: Vec<ForecastEntry>,
    pub forecast_hours: usize,
    /// Timestamp of the hour the value describes.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub api_last_update: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<ForecastMethod>,
}

impl SensorState {
    pub fn unavailable(kind: SensorKind) -> Self {
        Self {
            id: kind.id(),
            name: kind.name(),
            icon: kind.icon(),
            unit: kind.unit(),
            available: false,
            value: None,
            forecast: Vec::new(),
            forecast_hours: 0,
            last_update: None,
            api_last_update: None,
            method: None,
        }
    }

    /// Current value plus the full series as forecast. Empty series leave the
    /// sensor unavailable.
    pub fn from_series<Q: Quantity>(kind: SensorKind, series: &Series<Q>, now: OffsetDateTime) -> Self {
        let mut state = Self::unavailable(kind);
        let Some(current) = series.current_at(now) else {
            return state;
        };

        let decimals = kind.decimals();
        state.available = true;
        state.value = Some(current.value.measurement().rounded(decimals));
        state.last_update = Some(current.ts);
        state.forecast = series
            .iter()
            .map(|p| ForecastEntry {
                datetime: p.ts,
                value: p.value.measurement().rounded(decimals).value,
            })
            .collect();
        state.forecast_hours = state.forecast.len();
        state
    }

    fn for_prices(prices: &PriceForecast, now: OffsetDateTime) -> Self {
        let mut state = Self::from_series(SensorKind::PriceForecast, &prices.points, now);
        state.method = Some(prices.method);
        state
    }

    fn for_model(model: Option<&FittedModel>) -> Self {
        let kind = SensorKind::ModelAccuracy;
        let mut state = Self::unavailable(kind);
        if let Some(m) = model {
            state.available = true;
            state.value = Some(m.r_squared.measurement().rounded(kind.decimals()));
            state.last_update = Some(m.fitted_at);
        }
        state
    }
}

/// Latest state of every sensor, plus the snapshot they were built from.
pub struct SensorRegistry {
    states: RwLock<HashMap<SensorKind, SensorState>>,
    snapshot: RwLock<Option<EnergySnapshot>>,
}

impl Default for SensorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorRegistry {
    pub fn new() -> Self {
        let states = SensorKind::ALL
            .into_iter()
            .map(|k| (k, SensorState::unavailable(k)))
            .collect();
        Self {
            states: RwLock::new(states),
            snapshot: RwLock::new(None),
        }
    }

    pub async fn get(&self, kind: SensorKind) -> Option<SensorState> {
        self.states.read().await.get(&kind).cloned()
    }

    pub async fn all(&self) -> Vec<SensorState> {
        let states = self.states.read().await;
        SensorKind::ALL
            .iter()
            .filter_map(|k| states.get(k).cloned())
            .collect()
    }

    pub async fn apply_snapshot(&self, snapshot: &EnergySnapshot, prices: &PriceForecast, now: OffsetDateTime) {
        let mut updated: Vec<SensorState> = EnergyKind::ALL
            .iter()
            .filter_map(|ek| {
                let kind = SensorKind::ALL.into_iter().find(|k| k.energy_kind() == Some(*ek))?;
                Some(SensorState::from_series(kind, snapshot.series(*ek), now))
            })
            .collect();

        updated.push(SensorState::from_series(
            SensorKind::TotalRenewable,
            &snapshot.total_renewable(),
            now,
        ));
        updated.push(SensorState::from_series(
            SensorKind::CoveragePercentage,
            &snapshot.coverage(),
            now,
        ));

        updated.push(SensorState::for_prices(prices, now));

        *self.snapshot.write().await = Some(snapshot.clone());
        let mut states = self.states.write().await;
        for mut state in updated {
            state.api_last_update = snapshot.source_updated_at;
            if let Some(kind) = SensorKind::from_id(state.id) {
                states.insert(kind, state);
            }
        }
    }

    /// Re-prices the last snapshot with `model` and updates `model_accuracy`.
    ///
    /// The price sensor keeps its availability flag, so a failed NED cycle
    /// is not hidden by a fit. Returns the method used, if a snapshot exists.
    pub async fn apply_model(
        &self,
        forecaster: &PriceForecaster,
        model: Option<&FittedModel>,
        now: OffsetDateTime,
    ) -> Option<ForecastMethod> {
        let repriced = self.snapshot.read().await.as_ref().map(|snapshot| {
            let prices = forecaster.forecast(&snapshot.overview(), model);
            let mut state = SensorState::for_prices(&prices, now);
            state.api_last_update = snapshot.source_updated_at;
            state
        });

        let mut states = self.states.write().await;
        states.insert(SensorKind::ModelAccuracy, SensorState::for_model(model));

        let mut price = repriced?;
        let method = price.method;
        price.available &= states
            .get(&SensorKind::PriceForecast)
            .is_some_and(|s| s.available);
        states.insert(SensorKind::PriceForecast, price);
        method
    }

    pub async fn set_model(&self, model: Option<&FittedModel>) {
        self.states
            .write()
            .await
            .insert(SensorKind::ModelAccuracy, SensorState::for_model(model));
    }

    /// Flags every NED-backed sensor unavailable. Values and forecasts stay
    /// in place for inspection.
    pub async fn mark_unavailable(&self) {
        let mut states = self.states.write().await;
        for (kind, state) in states.iter_mut() {
            if kind.depends_on_ned() {
                state.available = false;
            }
        }
    }
}

/// Terminal sink of the NED pipeline: turns snapshots into sensor states.
pub struct SensorSink {
    registry: Arc<SensorRegistry>,
    forecaster: Arc<PriceForecaster>,
    fitter: ModelFitter,
}

impl SensorSink {
    pub fn new(registry: Arc<SensorRegistry>, forecaster: Arc<PriceForecaster>, fitter: ModelFitter) -> Self {
        Self {
            registry,
            forecaster,
            fitter,
        }
    }
}

/// Also follows the fitter: a newly fitted model re-prices the last snapshot
/// right away instead of waiting for the next NED poll.
#[async_trait::async_trait]
impl Sink<EnergySnapshot> for SensorSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<EnergySnapshot>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut models = self.fitter.subscribe();
        // Pick up a model fitted before this sink started.
        models.mark_changed();
        let mut following = true;

        loop {
            tokio::select! {
                item = input.next() => match item {
                    Some(Ok(env)) => {
                        let now = OffsetDateTime::now_utc();
                        let model = self.fitter.current();
                        let overview = env.payload.overview();
                        let prices = self.forecaster.forecast(&overview, model.as_ref());

                        self.registry.apply_snapshot(&env.payload, &prices, now).await;
                        self.registry.set_model(model.as_ref()).await;
                        tracing::info!(
                            hours = overview.len(),
                            method = ?prices.method,
                            complete = env.payload.is_complete(),
                            "sensors updated"
                        );
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "NED update failed, marking sensors unavailable");
                        self.registry.mark_unavailable().await;
                    }
                    None => break,
                },
                changed = models.changed(), if following => {
                    if changed.is_err() {
                        following = false;
                        continue;
                    }
                    let model = models.borrow_and_update().clone();
                    let method = self
                        .registry
                        .apply_model(&self.forecaster, model.as_ref(), OffsetDateTime::now_utc())
                        .await;
                    tracing::info!(?method, "sensors updated for new model");
                }
            }
        }
        Ok(())
    }
}
