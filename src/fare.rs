//! Fare calculation on top of an external route oracle.
//!
//! The oracle is consumed as an opaque distance/duration source. It is treated as
//! unreliable: transport failures and timeouts are retried a bounded number of times,
//! and a route the oracle cannot produce is surfaced as
//! [`FareError::RouteUnavailable`], never defaulted.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

use crate::Amount;
use crate::config::Pricing;
use crate::model::Location;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FareError {
    #[error("route unavailable: {0}")]
    RouteUnavailable(String),
}

/// Transport-level failure talking to the oracle.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("route oracle error: {0}")]
pub struct OracleError(pub String);

#[derive(Debug, Clone, PartialEq)]
pub enum RouteStatus {
    Ok,
    NotFound,
    ZeroResults,
    Other(String),
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteStatus::Ok => f.write_str("OK"),
            RouteStatus::NotFound => f.write_str("NOT_FOUND"),
            RouteStatus::ZeroResults => f.write_str("ZERO_RESULTS"),
            RouteStatus::Other(s) => f.write_str(s),
        }
    }
}

/// Longest route priced, in metres. Anything beyond is an oracle fault.
const MAX_ROUTE_M: f64 = 100_000_000.0;

/// One leg between consecutive route points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteLeg {
    pub distance_m: f64,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteReply {
    pub status: RouteStatus,
    pub legs: Vec<RouteLeg>,
}

impl RouteReply {
    pub fn ok(legs: Vec<RouteLeg>) -> Self {
        Self {
            status: RouteStatus::Ok,
            legs,
        }
    }

    /// Total distance (metres) and duration (seconds) over all legs.
    fn totals(&self) -> Result<(f64, f64), FareError> {
        if self.status != RouteStatus::Ok || self.legs.is_empty() {
            return Err(FareError::RouteUnavailable(self.status.to_string()));
        }
        let (distance_m, duration_secs) = self.legs.iter().fold((0.0, 0.0), |(d, t), leg| {
            (d + leg.distance_m, t + leg.duration_secs)
        });

        let plausible = |v: f64| v.is_finite() && v >= 0.0;
        if !plausible(distance_m) || !plausible(duration_secs) || distance_m > MAX_ROUTE_M {
            return Err(FareError::RouteUnavailable(format!(
                "implausible route of {distance_m} m over {duration_secs} s"
            )));
        }
        Ok((distance_m, duration_secs))
    }
}

/// External routing service.
pub trait RouteOracle: Send + Sync + 'static {
    /// Route through `points` in order.
    fn route(
        &self,
        points: &[Location],
    ) -> impl Future<Output = Result<RouteReply, OracleError>> + Send;
}

/// Priced route. Money fields are rounded to cents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FareQuote {
    pub distance_km: f64,
    pub eta_minutes: u32,
    pub base_fare: Amount,
    pub commission: Amount,
    pub driver_earning: Amount,
    pub customer_fare: Amount,
}

impl FareQuote {
    /// The commission is deducted from the driver and also added on top for the
    /// customer, so `customer_fare - driver_earning == 2 * commission`.
    pub fn compute(distance_m: f64, duration_secs: f64, pricing: &Pricing) -> Self {
        let distance_km = distance_m / 1000.0;
        let base = pricing.price_per_km * distance_km;
        let commission = base * pricing.commission_percent / 100.0;

        let base_fare = Amount::from_float(base);
        let commission = Amount::from_float(commission);

        Self {
            distance_km,
            eta_minutes: (duration_secs / 60.0).round() as u32,
            base_fare,
            commission,
            driver_earning: base_fare - commission,
            customer_fare: base_fare + commission,
        }
    }
}

/// Prices routes using the current, reloadable pricing.
pub struct FareCalculator<O> {
    oracle: O,
    pricing: watch::Receiver<Pricing>,
    timeout: Duration,
    attempts: u32,
}

impl<O: RouteOracle> FareCalculator<O> {
    pub fn new(
        oracle: O,
        pricing: watch::Receiver<Pricing>,
        timeout: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            oracle,
            pricing,
            timeout,
            attempts: attempts.max(1),
        }
    }

    pub fn pricing(&self) -> Pricing {
        *self.pricing.borrow()
    }

    /// Price a route without side effects.
    pub async fn quote(&self, points: &[Location]) -> Result<FareQuote, FareError> {
        let (distance_m, duration_secs) = self.fetch_route(points).await?;
        Ok(FareQuote::compute(distance_m, duration_secs, &self.pricing()))
    }

    async fn fetch_route(&self, points: &[Location]) -> Result<(f64, f64), FareError> {
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.timeout, self.oracle.route(points)).await {
                // a definite answer from the oracle is not retried
                Ok(Ok(reply)) => return reply.totals(),
                Ok(Err(e)) => {
                    warn!(attempt, reason = %e, "route oracle call failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(attempt, timeout = ?self.timeout, "route oracle call timed out");
                    last_error = format!("timed out after {:?}", self.timeout);
                }
            }
        }

        Err(FareError::RouteUnavailable(last_error))
    }
}

/// Great-circle oracle driving at a constant city speed.
#[derive(Debug, Clone, Copy)]
pub struct StraightLineOracle {
    pub speed_kmh: f64,
}

impl Default for StraightLineOracle {
    fn default() -> Self {
        Self { speed_kmh: 40.0 }
    }
}

impl RouteOracle for StraightLineOracle {
    async fn route(&self, points: &[Location]) -> Result<RouteReply, OracleError> {
        if points.len() < 2 {
            return Ok(RouteReply {
                status: RouteStatus::ZeroResults,
                legs: Vec::new(),
            });
        }

        let legs = points
            .windows(2)
            .map(|pair| {
                let distance_m = haversine_m(&pair[0], &pair[1]);
                RouteLeg {
                    distance_m,
                    duration_secs: distance_m / 1000.0 / self.speed_kmh * 3600.0,
                }
            })
            .collect();
        Ok(RouteReply::ok(legs))
    }
}

fn haversine_m(a: &Location, b: &Location) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}
