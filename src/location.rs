//! Sensor location: static coordinates or a one-shot public-IP lookup.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::config::LocationSettings;

const LOOKUP_URL: &str = "https://ipinfo.io/json";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Error, Debug)]
pub enum LocationError {
    #[error("lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("lookup response has no usable coordinates")]
    NoCoordinates,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub address_notes: String,
}

#[derive(Debug, Deserialize)]
struct IpInfo {
    loc: Option<String>,
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
}

/// Parse a `"lat,lon"` pair.
fn parse_loc(loc: &str) -> Option<(f64, f64)> {
    let (lat, lon) = loc.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    let valid = (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon);
    valid.then_some((lat, lon))
}

fn from_ipinfo(info: IpInfo) -> Result<Location, LocationError> {
    let (latitude, longitude) = info
        .loc
        .as_deref()
        .and_then(parse_loc)
        .ok_or(LocationError::NoCoordinates)?;
    let address_notes = [info.city, info.region, info.country]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    Ok(Location {
        latitude,
        longitude,
        address_notes,
    })
}

async fn lookup(client: &reqwest::Client) -> Result<Location, LocationError> {
    let info: IpInfo = client
        .get(LOOKUP_URL)
        .timeout(LOOKUP_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    from_ipinfo(info)
}

/// Resolve the location to export, if any. Lookup failures are logged.
pub async fn resolve(settings: &LocationSettings) -> Option<Location> {
    if !settings.enabled {
        return None;
    }

    if let (Some(latitude), Some(longitude)) = (settings.latitude, settings.longitude) {
        return Some(Location {
            latitude,
            longitude,
            address_notes: settings.address_notes.clone(),
        });
    }

    if !settings.lookup {
        tracing::info!("Location enabled without coordinates and lookup is off");
        return None;
    }

    let client = reqwest::Client::builder()
        .user_agent(concat!("netsensor/", env!("CARGO_PKG_VERSION")))
        .build()
        .ok()?;
    match lookup(&client).await {
        Ok(mut location) => {
            if !settings.address_notes.is_empty() {
                location.address_notes = settings.address_notes.clone();
            }
            tracing::info!(
                "Location from lookup: {},{} ({})",
                location.latitude,
                location.longitude,
                location.address_notes
            );
            Some(location)
        }
        Err(e) => {
            tracing::warn!("Location lookup failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loc() {
        assert_eq!(parse_loc("52.52,13.40"), Some((52.52, 13.40)));
        assert_eq!(parse_loc(" -33.9 , 151.2 "), Some((-33.9, 151.2)));
        assert_eq!(parse_loc("52.52"), None);
        assert_eq!(parse_loc("north,east"), None);
        assert_eq!(parse_loc("95.0,10.0"), None);
    }

    #[test]
    fn test_from_ipinfo() {
        let info: IpInfo = serde_json::from_str(
            r#"{"ip":"1.2.3.4","city":"Berlin","region":"Berlin","country":"DE","loc":"52.5244,13.4105"}"#,
        )
        .unwrap();
        let location = from_ipinfo(info).unwrap();
        assert_eq!(location.latitude, 52.5244);
        assert_eq!(location.address_notes, "Berlin, Berlin, DE");

        let empty: IpInfo = serde_json::from_str(r#"{"ip":"1.2.3.4"}"#).unwrap();
        assert!(matches!(from_ipinfo(empty), Err(LocationError::NoCoordinates)));
    }

    #[tokio::test]
    async fn test_static_coordinates_skip_lookup() {
        let settings = LocationSettings {
            enabled: true,
            latitude: Some(48.1),
            longitude: Some(11.6),
            address_notes: "Lab 2".into(),
            lookup: true,
        };
        let location = resolve(&settings).await.unwrap();
        assert_eq!(location.latitude, 48.1);
        assert_eq!(location.address_notes, "Lab 2");

        let disabled = LocationSettings {
            enabled: false,
            ..settings
        };
        assert!(resolve(&disabled).await.is_none());
    }
}
