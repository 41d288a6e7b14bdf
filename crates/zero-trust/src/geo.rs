//! IP geolocation behind the circuit breaker

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::error::{AccessGuardError, AccessGuardResult};
use crate::policy::{Location, ZeroTrustContext};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Resolves a network origin to a location
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Resolve `ip` to a location.
    async fn resolve(&self, ip: &str) -> AccessGuardResult<Location>;
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    #[serde(alias = "country_code", alias = "countryCode")]
    country: String,
    #[serde(default, alias = "region_name", alias = "regionName")]
    region: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

/// Resolver for JSON lookup services answering `GET {base_url}/{ip}`
pub struct HttpGeoResolver {
    client: Client,
    base_url: String,
}

impl HttpGeoResolver {
    /// Client for `GET {base_url}/{ip}` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AccessGuardResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoResolver for HttpGeoResolver {
    async fn resolve(&self, ip: &str) -> AccessGuardResult<Location> {
        let url = format!("{}/{}", self.base_url, ip);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body: GeoResponse = response.json().await?;

        let country = body.country.trim().to_ascii_uppercase();
        if country.is_empty() {
            return Err(AccessGuardError::DependencyFailed {
                dependency: GeoLookup::DEPENDENCY.to_string(),
                reason: format!("no country for {ip}"),
            });
        }
        Ok(Location {
            country,
            region: body.region,
            city: body.city,
        })
    }
}

/// Geo resolution routed through the `geo` circuit
pub struct GeoLookup {
    resolver: Arc<dyn GeoResolver>,
    breaker: Arc<CircuitBreaker>,
}

impl GeoLookup {
    /// Circuit name for geo calls
    pub const DEPENDENCY: &'static str = "geo";

    /// Wrap `resolver` in the `geo` circuit of `breaker`.
    pub fn new(resolver: Arc<dyn GeoResolver>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { resolver, breaker }
    }

    /// Resolve `ip` through the circuit.
    pub async fn locate(&self, ip: &str) -> Result<Location, CircuitBreakerError<AccessGuardError>> {
        self.breaker
            .execute(Self::DEPENDENCY, || self.resolver.resolve(ip))
            .await
    }

    /// Fill in the context's location when it is missing.
    ///
    /// A failed lookup is returned rather than swallowed: a context without a location
    /// would skip the location check.
    pub async fn enrich(
        &self,
        mut context: ZeroTrustContext,
    ) -> Result<ZeroTrustContext, CircuitBreakerError<AccessGuardError>> {
        if context.location.is_none() {
            match self.locate(&context.ip_address).await {
                Ok(location) => context.location = Some(location),
                Err(e) => {
                    tracing::warn!(
                        user_id = %context.user_id,
                        ip = %context.ip_address,
                        error = %e,
                        "geo lookup failed"
                    );
                    return Err(e);
                }
            }
        }
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::clock::ManualClock;
    use crate::error::DenialCode;
    use chrono::Utc;

    struct FixedResolver(Option<&'static str>);

    #[async_trait]
    impl GeoResolver for FixedResolver {
        async fn resolve(&self, ip: &str) -> AccessGuardResult<Location> {
            self.0
                .map(Location::country)
                .ok_or_else(|| AccessGuardError::DependencyFailed {
                    dependency: "geo".to_string(),
                    reason: format!("no answer for {ip}"),
                })
        }
    }

    fn lookup(answer: Option<&'static str>) -> (GeoLookup, Arc<CircuitBreaker>) {
        let breaker = Arc::new(
            CircuitBreaker::new(
                CircuitBreakerConfig::default(),
                Arc::new(MemoryAuditSink::default()),
                Arc::new(ManualClock::default()),
            )
            .unwrap(),
        );
        (
            GeoLookup::new(Arc::new(FixedResolver(answer)), breaker.clone()),
            breaker,
        )
    }

    fn context() -> ZeroTrustContext {
        ZeroTrustContext {
            user_id: "alice".to_string(),
            device_id: None,
            ip_address: "203.0.113.7".to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            location: None,
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_enrich_fills_missing_location() {
        let (lookup, _) = lookup(Some("ID"));
        let context = lookup.enrich(context()).await.unwrap();
        assert_eq!(context.location.unwrap().country, "ID");
    }

    #[tokio::test]
    async fn test_enrich_keeps_resolved_location() {
        let (lookup, breaker) = lookup(Some("ID"));
        let mut ctx = context();
        ctx.location = Some(Location::country("SG"));
        let ctx = lookup.enrich(ctx).await.unwrap();
        assert_eq!(ctx.location.unwrap().country, "SG");
        assert!(breaker.get_stats(GeoLookup::DEPENDENCY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failures_open_geo_circuit() {
        let (lookup, breaker) = lookup(None);
        for _ in 0..5 {
            assert!(lookup.enrich(context()).await.is_err());
        }
        assert_eq!(
            breaker.state(GeoLookup::DEPENDENCY).unwrap(),
            CircuitState::Open
        );
        let err = lookup.enrich(context()).await.unwrap_err();
        assert_eq!(err.denial(), DenialCode::CircuitOpen);
    }

    #[tokio::test]
    async fn test_http_resolver_surfaces_connection_errors() {
        let resolver =
            HttpGeoResolver::new("http://127.0.0.1:9/", Duration::from_millis(200)).unwrap();
        assert!(resolver.resolve("203.0.113.7").await.is_err());
    }
}
