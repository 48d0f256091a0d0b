//! Weather/terrain external interfaces (spec §6: "external read-only
//! services consulted through a narrow interface"). `dispatch_core`'s
//! `TerrainProvider` trait is re-exported here alongside a matching
//! `WeatherSource` trait; this module supplies the concrete adapters the
//! server wires up, while `dispatch-core` stays free of any networking
//! dependency.
//!
//! Both traits are synchronous from the optimizer's point of view — it runs
//! on a worker thread and cannot await mid-search. `HttpWeatherProvider`
//! reconciles this with a real external call by refreshing a cached snapshot
//! on a background tick (2 s external-lookup timeout per spec §5) rather
//! than blocking the search loop.

use std::sync::RwLock;
use std::time::Duration;

use dispatch_core::geo::GeoPoint;
pub use dispatch_core::optimizer::{SeaLevelTerrain, TerrainProvider, WeatherSnapshot};

pub const EXTERNAL_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

pub trait WeatherSource: Send + Sync {
    /// Best-known weather near `point`, or `None` if unavailable (the
    /// optimizer then skips weather adjustment entirely).
    fn snapshot(&self, point: GeoPoint) -> Option<WeatherSnapshot>;
}

/// Default weather source: no wind, used whenever no real provider is
/// configured. Matches the terrain side's `SeaLevelTerrain` default.
pub struct CalmWeather;

impl WeatherSource for CalmWeather {
    fn snapshot(&self, _point: GeoPoint) -> Option<WeatherSnapshot> {
        None
    }
}

/// Polls an external weather endpoint on a background interval and serves
/// the last good reading synchronously. A request that exceeds
/// [`EXTERNAL_LOOKUP_TIMEOUT`] or fails is treated the same as "no
/// provider" for that tick — the previous cached value (if any) keeps
/// serving until the next successful poll.
pub struct HttpWeatherProvider {
    client: reqwest::Client,
    base_url: String,
    cached: RwLock<Option<WeatherSnapshot>>,
}

impl HttpWeatherProvider {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            cached: RwLock::new(None),
        }
    }

    pub async fn refresh(&self, point: GeoPoint) {
        let url = format!("{}/weather?lat={}&lng={}", self.base_url, point.lat, point.lng);
        let fetch = self.client.get(&url).send();
        match tokio::time::timeout(EXTERNAL_LOOKUP_TIMEOUT, fetch).await {
            Ok(Ok(resp)) => match resp.json::<WeatherSnapshot>().await {
                Ok(snapshot) => {
                    *self.cached.write().expect("weather cache lock poisoned") = Some(snapshot);
                }
                Err(err) => tracing::warn!("weather provider returned unparseable body: {}", err),
            },
            Ok(Err(err)) => tracing::warn!("weather provider request failed: {}", err),
            Err(_) => tracing::warn!("weather provider request timed out after {:?}", EXTERNAL_LOOKUP_TIMEOUT),
        }
    }
}

impl WeatherSource for HttpWeatherProvider {
    fn snapshot(&self, _point: GeoPoint) -> Option<WeatherSnapshot> {
        *self.cached.read().expect("weather cache lock poisoned")
    }
}
