//! Collector orchestrator.
//!
//! Fans work across providers × cities: providers run concurrently, and
//! inside each provider task cities are dispatched concurrently in chunks.
//! Every (provider, city) pair acquires a DB-session permit, plans its
//! effective window against the already-journaled dates, fetches under the
//! retry policy and commits a deduplicated batch.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use sqlx::PgPool;
use tokio::sync::Semaphore;

use crate::db::models::City;
use crate::db::queries;
use crate::errors::AppError;
use crate::providers::{Coordinate, Provider, Weather};

/// Cap on simultaneously open DB sessions across the whole fan-out.
pub(crate) const CONCURRENT_SESSIONS_ALLOWED: usize = 50;

/// Backoff after an upstream 429 (seconds).
pub(crate) const DEFAULT_WAIT_TIME_SECS: u64 = 10;

/// Cities are dispatched in chunks of this many permit-widths to bound
/// task-creation overhead on large catalogs.
const CITY_CHUNK_FACTOR: usize = 4;

/// Retry policy applied around each provider fetch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait: Duration::from_secs(DEFAULT_WAIT_TIME_SECS),
        }
    }
}

/// End-of-run accounting, reported as the process summary line.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub succeeded: usize,
    pub skipped: usize,
}

pub struct Collector {
    pool: PgPool,
    providers: Vec<Arc<dyn Provider>>,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    retry: RetryPolicy,
    cities: Option<Arc<Vec<City>>>,
}

impl Collector {
    pub fn new(
        pool: PgPool,
        providers: Vec<Arc<dyn Provider>>,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            pool,
            providers,
            start_date,
            end_date,
            retry: RetryPolicy::default(),
            cities: None,
        }
    }

    /// Set up every provider concurrently and load the city fan-out list,
    /// most populous first. Must complete before `run`.
    pub async fn setup(&mut self) -> Result<(), AppError> {
        let (_, cities) = tokio::try_join!(
            async {
                try_join_all(self.providers.iter().map(|p| p.setup())).await?;
                Ok::<_, AppError>(())
            },
            async {
                queries::list_cities_by_population(&self.pool)
                    .await
                    .map_err(AppError::Database)
            },
        )?;

        tracing::info!(
            "Collector ready: {} providers, {} cities",
            self.providers.len(),
            cities.len()
        );
        self.cities = Some(Arc::new(cities));
        Ok(())
    }

    /// Tear down every provider. Errors are logged, not propagated, so a
    /// failing provider cannot block the others' cleanup.
    pub async fn teardown(&self) {
        let results = join_all(self.providers.iter().map(|p| p.teardown())).await;
        for (provider, result) in self.providers.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!("Teardown of {} failed: {}", provider.name(), e);
            }
        }
    }

    /// Run the full fan-out. Futures are awaited in-place (no detached
    /// tasks), so dropping the returned future cancels all in-flight work;
    /// batches committed before that point are kept.
    pub async fn run(&self) -> Result<RunSummary, AppError> {
        let cities = self
            .cities
            .clone()
            .ok_or_else(|| AppError::Config("collector run() called before setup()".to_string()))?;

        let ctx = Arc::new(RunContext {
            pool: self.pool.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            retry: self.retry.clone(),
            session_permits: Semaphore::new(CONCURRENT_SESSIONS_ALLOWED),
            succeeded: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        });

        join_all(
            self.providers
                .iter()
                .map(|provider| collect_provider(ctx.clone(), provider.clone(), cities.clone())),
        )
        .await;

        let summary = RunSummary {
            succeeded: ctx.succeeded.load(Ordering::Relaxed),
            skipped: ctx.skipped.load(Ordering::Relaxed),
        };
        tracing::info!(
            "Collection finished: {} (provider, city) pairs succeeded, {} skipped",
            summary.succeeded,
            summary.skipped
        );
        Ok(summary)
    }
}

struct RunContext {
    pool: PgPool,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    retry: RetryPolicy,
    session_permits: Semaphore,
    succeeded: AtomicUsize,
    skipped: AtomicUsize,
}

async fn collect_provider(ctx: Arc<RunContext>, provider: Arc<dyn Provider>, cities: Arc<Vec<City>>) {
    for chunk in cities.chunks(CITY_CHUNK_FACTOR * CONCURRENT_SESSIONS_ALLOWED) {
        join_all(
            chunk
                .iter()
                .map(|city| collect_city(ctx.clone(), provider.clone(), city)),
        )
        .await;
    }
}

async fn collect_city(ctx: Arc<RunContext>, provider: Arc<dyn Provider>, city: &City) {
    match collect_city_inner(&ctx, provider.as_ref(), city).await {
        Ok(Outcome::Collected(written)) => {
            tracing::debug!(
                "{} / {}: wrote {} new journal rows",
                provider.name(),
                city.name,
                written
            );
            ctx.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Outcome::NoData) => {
            tracing::info!(
                "{} / {}: no data for window {}..{}, skipped",
                provider.name(),
                city.name,
                ctx.start_date,
                ctx.end_date
            );
            ctx.skipped.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            tracing::error!(
                "{} / {}: giving up on window {}..{}: {}",
                provider.name(),
                city.name,
                ctx.start_date,
                ctx.end_date,
                err
            );
            ctx.skipped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

enum Outcome {
    Collected(usize),
    NoData,
}

async fn collect_city_inner(
    ctx: &RunContext,
    provider: &dyn Provider,
    city: &City,
) -> Result<Outcome, AppError> {
    let _permit = ctx
        .session_permits
        .acquire()
        .await
        .map_err(|_| AppError::Interrupted)?;

    let present = queries::present_dates(
        &ctx.pool,
        city.id,
        provider.name(),
        ctx.start_date,
        ctx.end_date,
    )
    .await?;
    let (fetch_start, fetch_end) = plan_window(&present, ctx.start_date, ctx.end_date);

    let coordinate = city.coordinate()?;
    let records =
        match fetch_with_retry(provider, coordinate, fetch_start, fetch_end, &ctx.retry).await? {
            Some(records) => records,
            None => return Ok(Outcome::NoData),
        };

    let written = queries::append_new_records(&ctx.pool, city.id, &records, &present).await?;
    Ok(Outcome::Collected(written))
}

/// Effective fetch window: when some dates are already journaled, span from
/// the earliest known point to the latest so the provider can bridge gaps.
/// The journal writer still filters duplicates.
pub(crate) fn plan_window(
    present: &HashSet<DateTime<Utc>>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    if present.is_empty() {
        return (start, end);
    }
    let min_present = present.iter().min().copied().unwrap_or(start);
    let max_present = present.iter().max().copied().unwrap_or(end);
    (min_present.min(start), max_present.max(end))
}

/// Fetch under the retry policy.
///
/// - 404: this slice has no data. `Ok(None)`, never retried.
/// - 429: log, sleep the configured backoff, then re-attempt.
/// - other retryable errors re-attempt immediately.
/// - at most `max_attempts` provider calls; the last error propagates.
pub(crate) async fn fetch_with_retry(
    provider: &dyn Provider,
    coordinate: Coordinate,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    policy: &RetryPolicy,
) -> Result<Option<Vec<Weather>>, AppError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match provider.get_historical_weather(coordinate, start, end).await {
            Ok(records) => return Ok(Some(records)),
            Err(AppError::HttpStatus { status: 404, url }) => {
                tracing::info!(
                    "{}: 404 from {}, no data for this slice",
                    provider.name(),
                    url
                );
                return Ok(None);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                if let AppError::HttpStatus { status: 429, .. } = &err {
                    tracing::info!(
                        "{} got 429, waiting {} second(s) before attempt {}",
                        provider.name(),
                        policy.wait.as_secs(),
                        attempt + 1
                    );
                    tokio::time::sleep(policy.wait).await;
                } else {
                    tracing::info!(
                        "{} attempt {} failed ({}), retrying",
                        provider.name(),
                        attempt,
                        err
                    );
                }
            }
            Err(err) => return Err(err),
        }
    }
}
