//! Background fitting of the price model.
//!
//! One fit runs shortly after start-up, then once a day at a fixed local
//! wall-clock time. Manual fits share the same guard, so at most one fit is
//! ever in flight. Every new model is published on a watch channel.

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use ned_client::domain::{RSquared, TrainingRow};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{
    features::training_matrix,
    regression::{LinearRegression, ModelError},
};
use crate::config::{ConfigError, ModelConfig};

/// Supplies joined (energy, price) rows for a time window.
#[async_trait::async_trait]
pub trait TrainingData: Send + Sync {
    async fn training_rows(&self, start: OffsetDateTime, end: OffsetDateTime) -> anyhow::Result<Vec<TrainingRow>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct FittedModel {
    pub regression: LinearRegression,
    pub r_squared: RSquared,
    pub samples: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub fitted_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FitOutcome {
    Fitted { r_squared: RSquared, samples: usize },
    AlreadyRunning,
    InsufficientData { samples: usize, required: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum FitError {
    #[error("failed to load training data: {0}")]
    Data(String),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("fit task failed: {0}")]
    Join(String),
}

struct FitterInner {
    data: Arc<dyn TrainingData>,
    tz: Tz,
    autofit_at: (u32, u32),
    startup_delay: std::time::Duration,
    training_window: time::Duration,
    min_samples: usize,
    model: watch::Sender<Option<FittedModel>>,
    fit_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct ModelFitter {
    inner: Arc<FitterInner>,
}

impl ModelFitter {
    pub fn new(data: Arc<dyn TrainingData>, cfg: &ModelConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            inner: Arc::new(FitterInner {
                data,
                tz: cfg.tz()?,
                autofit_at: cfg.autofit_at()?,
                startup_delay: cfg.startup_delay(),
                training_window: cfg.training_window(),
                min_samples: cfg.min_samples,
                model: watch::Sender::new(None),
                fit_lock: Mutex::new(()),
            }),
        })
    }

    pub fn tz(&self) -> Tz {
        self.inner.tz
    }

    pub fn current(&self) -> Option<FittedModel> {
        self.inner.model.borrow().clone()
    }

    /// Receiver that is notified whenever a fit installs a new model.
    pub fn subscribe(&self) -> watch::Receiver<Option<FittedModel>> {
        self.inner.model.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.fit_lock.try_lock().is_err()
    }

    /// Fits on the configured training window, unless a fit is already running.
    pub async fn fit_now(&self) -> Result<FitOutcome, FitError> {
        let Ok(_guard) = self.inner.fit_lock.try_lock() else {
            tracing::info!("model fit already in progress, skipping");
            metrics::counter!("model_fit_total", "outcome" => "already_running").increment(1);
            return Ok(FitOutcome::AlreadyRunning);
        };

        let started = Instant::now();
        let end = OffsetDateTime::now_utc();
        let start = end - self.inner.training_window;

        let rows = self
            .inner
            .data
            .training_rows(start, end)
            .await
            .map_err(|e| FitError::Data(e.to_string()))?;

        let samples = rows.len();
        if samples < self.inner.min_samples {
            tracing::info!(samples, required = self.inner.min_samples, "not enough training data to fit model");
            metrics::counter!("model_fit_total", "outcome" => "insufficient_data").increment(1);
            return Ok(FitOutcome::InsufficientData {
                samples,
                required: self.inner.min_samples,
            });
        }

        let tz = self.inner.tz;
        let (regression, r_squared) = tokio::task::spawn_blocking(move || {
            let (x, y) = training_matrix(&rows, tz);
            let mut regression = LinearRegression::new();
            regression.fit(&x, &y)?;
            let r2 = regression.score(&x, &y)?;
            Ok::<_, ModelError>((regression, RSquared(r2)))
        })
        .await
        .map_err(|e| FitError::Join(e.to_string()))?
        .inspect_err(|e| {
            metrics::counter!("model_fit_total", "outcome" => "failed").increment(1);
            tracing::warn!(error = %e, samples, "model fit failed");
        })?;

        self.inner.model.send_replace(Some(FittedModel {
            regression,
            r_squared,
            samples,
            fitted_at: OffsetDateTime::now_utc(),
        }));

        metrics::counter!("model_fit_total", "outcome" => "fitted").increment(1);
        metrics::histogram!("model_fit_duration_seconds").record(started.elapsed().as_secs_f64());
        metrics::gauge!("model_r_squared").set(r_squared.0);
        tracing::info!(r_squared = r_squared.0, samples, "price model fitted");

        Ok(FitOutcome::Fitted { r_squared, samples })
    }

    async fn fit_logged(&self) {
        match self.fit_now().await {
            Ok(outcome) => tracing::debug!(?outcome, "scheduled fit done"),
            Err(e) => tracing::error!(error = %e, "scheduled fit failed"),
        }
    }

    /// Starts the schedule: one fit after the start-up delay, then daily.
    pub fn spawn(&self, cancel: CancellationToken) -> FitterHandle {
        let fitter = self.clone();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(fitter.inner.startup_delay) => {}
            }
            fitter.fit_logged().await;

            loop {
                let now = Utc::now();
                let next = next_run_after(now, fitter.inner.autofit_at, fitter.inner.tz);
                tracing::info!(next_fit = %next, "next model fit scheduled");

                let wait = (next - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                fitter.fit_logged().await;
            }
        });

        FitterHandle { cancel, task }
    }
}

pub struct FitterHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FitterHandle {
    /// Stops the schedule and waits for the task to end.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "model fitter task ended abnormally");
        }
    }
}

/// `hh:mm` on `date` in `tz`; a time skipped by a DST jump resolves to the
/// first valid minute after it, a repeated one to its first occurrence.
fn resolve_local(date: NaiveDate, (hour, minute): (u32, u32), tz: Tz) -> Option<DateTime<Tz>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    (0..=180).find_map(|step| {
        tz.from_local_datetime(&(naive + chrono::Duration::minutes(step)))
            .earliest()
    })
}

/// First instant strictly after `now` at local time `at`.
pub fn next_run_after(now: DateTime<Utc>, at: (u32, u32), tz: Tz) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();

    (0..=2)
        .filter_map(|offset| today.checked_add_days(Days::new(offset)))
        .filter_map(|date| resolve_local(date, at, tz))
        .map(|t| t.with_timezone(&Utc))
        .find(|t| *t > now)
        .unwrap_or(now + chrono::Duration::days(1))
}
