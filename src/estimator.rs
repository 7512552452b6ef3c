//! Reading-progress estimation.
//!
//! A [`ReadingSession`] tracks one attempt to read a book: a start date, the
//! total readable page count, and a sparse series of dated cumulative-page
//! observations. Whenever a new observation lands, the projected finish date
//! is recomputed from the full observation set by fitting an ordinary
//! least-squares line of pages over elapsed days and extrapolating to the
//! day the line reaches the total page count.
//!
//! "No estimate available" (a `None` projection) is a valid result, not an
//! error: a single observation cannot determine a trend, and a flat or
//! declining trend has no meaningful finish date.

use crate::db::{self, Pool};
use crate::model::{Observation, ReadingSession, SeriesPoint};
use chrono::{Days, Local, NaiveDate};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("observation already recorded for {0}")]
    Conflict(NaiveDate),
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

/// Outcome of recording an observation: the stored sample plus the session's
/// refreshed projection (None while no trend can be fitted).
#[derive(Debug, Clone)]
pub struct RecordedObservation {
    pub observation: Observation,
    pub projected_finish: Option<NaiveDate>,
}

/// Slope/intercept of a fitted page-over-days line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendLine {
    pub slope: f64,
    pub intercept: f64,
}

/// Ordinary least-squares fit of `y` over `x` for `(elapsed_days, page)`
/// pairs. Returns `None` with fewer than two distinct x values, since a
/// single point (or repeated samples of one day) cannot determine a trend.
pub fn fit_trend(points: &[(f64, f64)]) -> Option<TrendLine> {
    let n = points.len() as f64;
    let first_x = points.first()?.0;
    if !points.iter().any(|(x, _)| (*x - first_x).abs() > f64::EPSILON) {
        return None;
    }

    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, y) in points {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
    }
    let slope = sxy / sxx;
    Some(TrendLine {
        slope,
        intercept: mean_y - slope * mean_x,
    })
}

/// Extrapolate the fitted line to the day offset where it reaches
/// `total_pages` and convert that to a calendar date. A slope of zero or
/// less yields `None` rather than a past or nonsensical date. The offset is
/// rounded to the nearest whole day, ties toward the future.
pub fn project_finish(
    start_date: NaiveDate,
    total_pages: i64,
    observations: &[Observation],
) -> Option<NaiveDate> {
    let points: Vec<(f64, f64)> = observations
        .iter()
        .map(|obs| {
            let elapsed = (obs.date - start_date).num_days() as f64;
            (elapsed, obs.page as f64)
        })
        .collect();

    let trend = fit_trend(&points)?;
    if trend.slope <= 0.0 {
        debug!(slope = trend.slope, "non-positive trend, no projection");
        return None;
    }

    let day_offset = (total_pages as f64 - trend.intercept) / trend.slope;
    // Half-day ties land on the later (future) date.
    let rounded = day_offset.round();
    if rounded < 0.0 {
        return None;
    }
    start_date.checked_add_days(Days::new(rounded as u64))
}

/// Estimator service over the storage pool. Every operation is one
/// short-lived unit of work; `record_observation` is the only one that
/// mutates the session row and does so inside a single transaction.
#[derive(Debug, Clone)]
pub struct Estimator {
    pool: Pool,
}

impl Estimator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Begin tracking a book. The projection starts unset.
    #[instrument(skip_all)]
    pub async fn start_session(
        &self,
        book_id: i64,
        total_pages: i64,
        start_date: Option<NaiveDate>,
    ) -> Result<ReadingSession, EstimatorError> {
        if total_pages <= 0 {
            return Err(EstimatorError::InvalidArgument(
                "total_pages must be positive",
            ));
        }
        if !db::book_exists(&self.pool, book_id)
            .await
            .map_err(anyhow_to_unavailable)?
        {
            return Err(EstimatorError::NotFound("book"));
        }

        let start_date = start_date.unwrap_or_else(|| Local::now().date_naive());
        let id = db::insert_session(&self.pool, book_id, start_date, total_pages)
            .await
            .map_err(anyhow_to_unavailable)?;
        Ok(ReadingSession {
            id,
            book_id,
            start_date,
            total_pages,
            estimated_at: None,
            projected_finish: None,
        })
    }

    /// Store one dated cumulative-page sample and refresh the session's
    /// projection from the full observation set. Duplicate dates are a
    /// conflict; an explicit update path must be used instead of silent
    /// overwrites. Regressive page values are stored as given — the
    /// projection degrades rather than user data being dropped.
    #[instrument(skip_all, fields(session_id))]
    pub async fn record_observation(
        &self,
        session_id: i64,
        date: NaiveDate,
        page: i64,
    ) -> Result<RecordedObservation, EstimatorError> {
        let mut tx = self.pool.begin().await?;

        let session = db::get_session_tx(&mut tx, session_id)
            .await
            .map_err(anyhow_to_unavailable)?
            .ok_or(EstimatorError::NotFound("session"))?;

        let observation = Observation {
            session_id,
            date,
            page,
        };
        db::insert_observation_tx(&mut tx, &observation)
            .await
            .map_err(|err| {
                if matches!(&err, sqlx::Error::Database(db_err) if db_err.is_unique_violation()) {
                    EstimatorError::Conflict(date)
                } else {
                    EstimatorError::Unavailable(err)
                }
            })?;

        let observations = db::observations_tx(&mut tx, session_id)
            .await
            .map_err(anyhow_to_unavailable)?;
        let projected_finish =
            project_finish(session.start_date, session.total_pages, &observations);
        db::update_projection_tx(
            &mut tx,
            session_id,
            Local::now().naive_local(),
            projected_finish,
        )
        .await
        .map_err(anyhow_to_unavailable)?;

        tx.commit().await?;
        debug!(session_id, ?projected_finish, "observation recorded");
        Ok(RecordedObservation {
            observation,
            projected_finish,
        })
    }

    /// Ascending (date, page, 1-based index) series for display. Empty if the
    /// session has no observations yet; a pure read with no side effects.
    pub async fn progress_series(
        &self,
        session_id: i64,
    ) -> Result<Vec<SeriesPoint>, EstimatorError> {
        let observations = db::observations_for_session(&self.pool, session_id)
            .await
            .map_err(anyhow_to_unavailable)?;
        Ok(observations
            .iter()
            .enumerate()
            .map(|(i, obs)| SeriesPoint {
                date: obs.date,
                page: obs.page,
                index: i as i64 + 1,
            })
            .collect())
    }

    pub async fn session(&self, session_id: i64) -> Result<ReadingSession, EstimatorError> {
        db::get_session(&self.pool, session_id)
            .await
            .map_err(anyhow_to_unavailable)?
            .ok_or(EstimatorError::NotFound("session"))
    }

    pub async fn sessions_for_book(
        &self,
        book_id: i64,
    ) -> Result<Vec<ReadingSession>, EstimatorError> {
        db::sessions_for_book(&self.pool, book_id)
            .await
            .map_err(anyhow_to_unavailable)
    }
}

fn anyhow_to_unavailable(err: anyhow::Error) -> EstimatorError {
    match err.downcast::<sqlx::Error>() {
        Ok(e) => EstimatorError::Unavailable(e),
        Err(other) => EstimatorError::Unavailable(sqlx::Error::Protocol(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(session_id: i64, date: &str, page: i64) -> Observation {
        Observation {
            session_id,
            date: date.parse().unwrap(),
            page,
        }
    }

    #[test]
    fn fit_requires_two_distinct_days() {
        assert!(fit_trend(&[]).is_none());
        assert!(fit_trend(&[(0.0, 50.0)]).is_none());
        assert!(fit_trend(&[(0.0, 50.0), (0.0, 80.0)]).is_none());
        assert!(fit_trend(&[(0.0, 50.0), (1.0, 95.0)]).is_some());
    }

    #[test]
    fn fit_recovers_exact_line() {
        let trend = fit_trend(&[(0.0, 50.0), (1.0, 95.0), (2.0, 140.0)]).unwrap();
        assert!((trend.slope - 45.0).abs() < 1e-9);
        assert!((trend.intercept - 50.0).abs() < 1e-9);
    }

    #[test]
    fn projection_steady_reader() {
        // 45 pages/day from page 50: 300 pages is reached at day offset
        // (300 - 50) / 45 ≈ 5.56, which rounds to 6 days after Jan 15.
        let start: NaiveDate = "2024-01-15".parse().unwrap();
        let series = [
            obs(1, "2024-01-15", 50),
            obs(1, "2024-01-16", 95),
            obs(1, "2024-01-17", 140),
        ];
        let finish = project_finish(start, 300, &series).unwrap();
        assert_eq!(finish.to_string(), "2024-01-21");
    }

    #[test]
    fn projection_tie_rounds_to_future() {
        // 50 pages/day from page 0: 125 pages lands exactly at day 2.5.
        let start: NaiveDate = "2024-01-01".parse().unwrap();
        let series = [obs(1, "2024-01-01", 0), obs(1, "2024-01-02", 50)];
        let finish = project_finish(start, 125, &series).unwrap();
        assert_eq!(finish.to_string(), "2024-01-04");
    }

    #[test]
    fn projection_none_for_single_point() {
        let start: NaiveDate = "2024-01-15".parse().unwrap();
        assert!(project_finish(start, 300, &[obs(1, "2024-01-15", 50)]).is_none());
    }

    #[test]
    fn projection_none_for_flat_progress() {
        let start: NaiveDate = "2024-01-15".parse().unwrap();
        let series = [obs(1, "2024-01-15", 80), obs(1, "2024-01-18", 80)];
        assert!(project_finish(start, 300, &series).is_none());
    }

    #[test]
    fn projection_none_for_declining_progress() {
        let start: NaiveDate = "2024-01-15".parse().unwrap();
        let series = [obs(1, "2024-01-15", 120), obs(1, "2024-01-16", 90)];
        assert!(project_finish(start, 300, &series).is_none());
    }

    #[test]
    fn regressive_values_degrade_but_do_not_panic() {
        // Out-of-order entry kept as-is; the fit still has positive slope.
        let start: NaiveDate = "2024-01-15".parse().unwrap();
        let series = [
            obs(1, "2024-01-15", 50),
            obs(1, "2024-01-16", 40),
            obs(1, "2024-01-17", 140),
        ];
        let finish = project_finish(start, 300, &series);
        assert!(finish.is_some());
        assert!(finish.unwrap() > start);
    }
}
