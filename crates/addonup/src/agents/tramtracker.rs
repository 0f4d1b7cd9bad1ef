//! TramTracker API client.
//!
//! Queries the Yarra Trams "Controllers" endpoints for stop and route
//! information, for use as a command_line sensor: results are printed as
//! pretty JSON on stdout.
//!
//! The API is only ReST-like. Every endpoint takes a form-encoded POST and
//! wraps its result in an envelope, but the envelope fields are
//! inconsistent: most endpoints use `hasError`/`errorMessage`/
//! `hasResponse`/`responseObject`, while `GetPassingRoutes` and
//! `GetStopInformation` use `HasError`/`ResponseString`/`ResponseObject`.
//! Timestamps arrive as Microsoft JSON dates (`/Date(ms±zone)/`) and are
//! decoded to ISO-8601 before output.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::FixedOffset;
use chrono::SecondsFormat;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_BASE_URL: &str = "http://tramtracker.com/Controllers/";

#[derive(Debug, Error)]
pub enum TramTrackerError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bad endpoint URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("TramTracker error: {message}")]
    Api { message: String },

    #[error("TramTracker response has no error marker")]
    MissingMarker,

    #[error("TramTracker had no error or response data")]
    NoResponse,
}

/// Decode a Microsoft JSON date string into ISO-8601.
///
/// `/Date(1698028200000+1100)/` carries epoch milliseconds plus a `±HHMM`
/// offset. Returns None for strings that aren't in this shape.
pub fn parse_ms_json_date(input: &str) -> Option<String> {
    let inner = input.strip_prefix("/Date(")?.strip_suffix(")/")?;
    if inner.len() <= 5 {
        return None;
    }

    let (ms_part, zone) = inner.split_at(inner.len() - 5);
    let sign = zone.chars().next()?;
    if sign != '+' && sign != '-' {
        return None;
    }

    // "+1030" splits into hours "+10" and minutes "+30"
    let hours: i32 = zone[..3].parse().ok()?;
    let minutes: i32 = format!("{}{}", sign, &zone[3..]).parse().ok()?;
    let offset = FixedOffset::east_opt(hours * 3600 + minutes * 60)?;

    let millis: i64 = ms_part.parse().ok()?;
    let timestamp = DateTime::from_timestamp_millis(millis)?.with_timezone(&offset);
    Some(timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, false))
}

/// Walk a response payload and decode every Microsoft JSON date in place.
pub fn convert_timestamps(value: Value) -> Value {
    match value {
        Value::String(s) => match parse_ms_json_date(&s) {
            Some(decoded) => Value::String(decoded),
            None => Value::String(s),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(convert_timestamps).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, convert_timestamps(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Unwrap the response envelope into its payload, normalising both envelope
/// dialects.
pub fn envelope_payload(envelope: Value) -> Result<Value, TramTrackerError> {
    let has_error = match (envelope.get("hasError"), envelope.get("HasError")) {
        (None, None) => return Err(TramTrackerError::MissingMarker),
        (lower, upper) => {
            lower.and_then(Value::as_bool).unwrap_or(false)
                || upper.and_then(Value::as_bool).unwrap_or(false)
        }
    };

    if has_error {
        let message = envelope
            .get("errorMessage")
            .or_else(|| envelope.get("ResponseString"))
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(TramTrackerError::Api { message });
    }

    if envelope
        .get("hasResponse")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        if let Some(payload) = envelope.get("responseObject") {
            return Ok(convert_timestamps(payload.clone()));
        }
    }
    if let Some(payload) = envelope.get("ResponseObject") {
        return Ok(convert_timestamps(payload.clone()));
    }

    Err(TramTrackerError::NoResponse)
}

pub struct TramTracker {
    base_url: String,
    client: reqwest::Client,
}

impl TramTracker {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        // The joins make a mess unless the base ends with a slash
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    async fn query(
        &self,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<Value, TramTrackerError> {
        let url = url::Url::parse(&self.base_url)?.join(&format!("{}.ashx", endpoint))?;

        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await?
            .error_for_status()?;
        let envelope: Value = response.json().await?;
        envelope_payload(envelope)
    }

    /// Misc info for the given stop.
    pub async fn stop_information(&self, stop_id: i64) -> Result<Value, TramTrackerError> {
        self.query("GetStopInformation", &[("s", stop_id.to_string())])
            .await
    }

    /// The routes that pass through the given stop.
    pub async fn passing_routes(&self, stop_id: i64) -> Result<Value, TramTrackerError> {
        self.query("GetPassingRoutes", &[("s", stop_id.to_string())])
            .await
    }

    /// Background colour for the given route, as `#RRGGBB`.
    pub async fn route_colour(&self, route_no: &str) -> Result<String, TramTrackerError> {
        let payload = self
            .query("GetRouteColour", &[("routeNo", route_no.to_string())])
            .await?;
        Ok(extract_colour(&payload))
    }

    /// Foreground colour for the given route, as `#RRGGBB`.
    pub async fn route_text_colour(&self, route_no: &str) -> Result<String, TramTrackerError> {
        let payload = self
            .query("GetRouteTextColour", &[("routeNo", route_no.to_string())])
            .await?;
        Ok(extract_colour(&payload))
    }

    /// ETA of the next few trams stopping at the given stop.
    pub async fn next_predictions(
        &self,
        stop_id: i64,
        route_id: i64,
        low_floor: bool,
    ) -> Result<Value, TramTrackerError> {
        self.query(
            "GetNextPredictionsForStop",
            &[
                ("stopNo", stop_id.to_string()),
                ("routeNo", route_id.to_string()),
                ("isLowFloor", low_floor.to_string()),
            ],
        )
        .await
    }

    pub async fn all_routes(&self) -> Result<Value, TramTrackerError> {
        self.query("GetAllRoutes", &[]).await
    }

    /// All stops for a route in the given direction; "up" means city-bound.
    pub async fn stops_by_route_and_direction(
        &self,
        route_id: i64,
        up: bool,
    ) -> Result<Value, TramTrackerError> {
        self.query(
            "GetStopsByRouteAndDirection",
            &[("r", route_id.to_string()), ("u", up.to_string())],
        )
        .await
    }

    /// Predictions for a stop with each tram annotated with its route
    /// colours.
    pub async fn annotated_predictions(
        &self,
        stop_id: i64,
        route_id: i64,
    ) -> Result<Value, TramTrackerError> {
        // The official site re-requests the colours on every timing update,
        // one request per line; fetching them once per run is already nicer.
        let mut backgrounds = HashMap::new();
        let mut foregrounds = HashMap::new();
        if let Value::Array(routes) = self.passing_routes(stop_id).await? {
            for route in routes {
                let Some(route_no) = route_no_key(&route) else {
                    continue;
                };
                backgrounds.insert(route_no.clone(), self.route_colour(&route_no).await?);
                foregrounds.insert(route_no.clone(), self.route_text_colour(&route_no).await?);
            }
        }

        let mut predictions = self.next_predictions(stop_id, route_id, false).await?;
        if let Value::Array(trams) = &mut predictions {
            for tram in trams {
                let Some(route_no) = route_no_key(tram) else {
                    continue;
                };
                let Some(tram) = tram.as_object_mut() else {
                    continue;
                };
                match (backgrounds.get(&route_no), foregrounds.get(&route_no)) {
                    (Some(background), Some(foreground)) => {
                        tram.insert("RouteColour".to_string(), Value::from(background.clone()));
                        tram.insert(
                            "RouteTextColour".to_string(),
                            Value::from(foreground.clone()),
                        );
                    }
                    _ => warn!("No colours found for route {}", route_no),
                }
            }
        }

        Ok(predictions)
    }

    /// All information for a stop, including annotated predictions.
    pub async fn stop_info(&self, stop_id: i64) -> Result<Value, TramTrackerError> {
        let predictions = self.annotated_predictions(stop_id, 0).await?;

        let mut info = self.stop_information(stop_id).await?;
        if let Some(info) = info.as_object_mut() {
            info.insert("NextPredictions".to_string(), predictions);
        }

        Ok(info)
    }
}

fn extract_colour(payload: &Value) -> String {
    let colour = payload
        .get("Colour")
        .and_then(Value::as_str)
        .unwrap_or_default();
    format!("#{}", colour)
}

/// RouteNo as a map key; the API serves it as either number or string.
fn route_no_key(value: &Value) -> Option<String> {
    match value.get("RouteNo")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// CLI arguments for the tramtracker subcommand
#[derive(Debug, clap::Args)]
pub struct TramTrackerArgs {
    /// TramTracker stop ID
    #[arg(long)]
    pub stop_id: Option<i64>,

    /// TramTracker route ID, only useful with some commands
    #[arg(long, default_value_t = 0)]
    pub route_id: i64,

    /// TramTracker route direction (up = towards city), only useful with
    /// some commands
    #[arg(long, value_enum)]
    pub route_direction: Option<Direction>,

    /// The TramTracker API command to query
    pub command: Option<String>,

    #[arg(long, hide = true, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Direction {
    Up,
    Down,
}

pub async fn run(args: &TramTrackerArgs) -> anyhow::Result<()> {
    let api = TramTracker::new(args.base_url.clone());

    let output = match args.command.as_deref() {
        None => {
            let stop_id = args
                .stop_id
                .ok_or_else(|| anyhow::anyhow!("Stop ID required for default command"))?;
            if args.route_id == 0 {
                api.stop_info(stop_id).await?
            } else {
                api.annotated_predictions(stop_id, args.route_id).await?
            }
        }
        Some("GetAllRoutes") => api.all_routes().await?,
        Some("GetNextPredictionsForStop") => {
            let stop_id = args
                .stop_id
                .ok_or_else(|| anyhow::anyhow!("Stop ID required for this command"))?;
            api.next_predictions(stop_id, args.route_id, false).await?
        }
        Some("GetStopsByRouteAndDirection") => {
            let direction = args
                .route_direction
                .ok_or_else(|| anyhow::anyhow!("Route ID and direction required for this command"))?;
            if args.route_id == 0 {
                anyhow::bail!("Route ID and direction required for this command");
            }
            api.stops_by_route_and_direction(args.route_id, direction == Direction::Up)
                .await?
        }
        Some(other) => anyhow::bail!("unsupported command {}", other),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ms_json_date() {
        assert_eq!(
            parse_ms_json_date("/Date(1698028200000+1100)/").unwrap(),
            "2023-10-23T14:10:00+11:00"
        );
        // Half-hour offsets keep their minutes
        assert_eq!(
            parse_ms_json_date("/Date(1698028200000+1030)/").unwrap(),
            "2023-10-23T13:40:00+10:30"
        );
        // Negative offsets apply the sign to the minutes too
        assert_eq!(
            parse_ms_json_date("/Date(0-0500)/").unwrap(),
            "1969-12-31T19:00:00-05:00"
        );
    }

    #[test]
    fn test_parse_ms_json_date_rejects_other_strings() {
        assert_eq!(parse_ms_json_date("Stop 1234"), None);
        assert_eq!(parse_ms_json_date("/Date()/"), None);
        assert_eq!(parse_ms_json_date("/Date(123)/"), None);
    }

    #[test]
    fn test_convert_timestamps_recurses() {
        let input = serde_json::json!({
            "PredictedArrivalDateTime": "/Date(1698028200000+1100)/",
            "Trams": [{"ArrivalTime": "/Date(1698028200000+1100)/"}],
            "StopName": "Collins St",
            "StopNo": 1234
        });

        let converted = convert_timestamps(input);
        assert_eq!(
            converted["PredictedArrivalDateTime"],
            "2023-10-23T14:10:00+11:00"
        );
        assert_eq!(converted["Trams"][0]["ArrivalTime"], "2023-10-23T14:10:00+11:00");
        assert_eq!(converted["StopName"], "Collins St");
        assert_eq!(converted["StopNo"], 1234);
    }

    #[test]
    fn test_envelope_payload_lowercase_dialect() {
        let envelope = serde_json::json!({
            "hasError": false,
            "hasResponse": true,
            "responseObject": [{"RouteNo": 11}]
        });
        let payload = envelope_payload(envelope).unwrap();
        assert_eq!(payload[0]["RouteNo"], 11);
    }

    #[test]
    fn test_envelope_payload_uppercase_dialect() {
        let envelope = serde_json::json!({
            "HasError": false,
            "ResponseObject": {"StopNo": 1234}
        });
        let payload = envelope_payload(envelope).unwrap();
        assert_eq!(payload["StopNo"], 1234);
    }

    #[test]
    fn test_envelope_payload_errors() {
        let err = envelope_payload(serde_json::json!({
            "hasError": true,
            "errorMessage": "No such stop"
        }))
        .unwrap_err();
        assert!(matches!(err, TramTrackerError::Api { message } if message == "No such stop"));

        let err = envelope_payload(serde_json::json!({
            "HasError": true,
            "ResponseString": "Invalid route"
        }))
        .unwrap_err();
        assert!(matches!(err, TramTrackerError::Api { message } if message == "Invalid route"));
    }

    #[test]
    fn test_envelope_payload_missing_marker() {
        let err = envelope_payload(serde_json::json!({"whatever": 1})).unwrap_err();
        assert!(matches!(err, TramTrackerError::MissingMarker));
    }

    #[test]
    fn test_envelope_payload_no_response() {
        let err =
            envelope_payload(serde_json::json!({"hasError": false, "hasResponse": false}))
                .unwrap_err();
        assert!(matches!(err, TramTrackerError::NoResponse));
    }

    #[tokio::test]
    async fn test_query_posts_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/GetStopInformation.ashx")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body("s=1234")
            .with_body(
                r#"{"HasError": false, "ResponseObject": {"StopNo": 1234, "CurrentTime": "/Date(1698028200000+1100)/"}}"#,
            )
            .create_async()
            .await;

        let api = TramTracker::new(server.url());
        let payload = api.stop_information(1234).await.unwrap();

        mock.assert_async().await;
        assert_eq!(payload["StopNo"], 1234);
        assert_eq!(payload["CurrentTime"], "2023-10-23T14:10:00+11:00");
    }

    #[tokio::test]
    async fn test_api_error_surfaces() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/GetNextPredictionsForStop.ashx")
            .with_body(r#"{"hasError": true, "errorMessage": "Stop does not exist"}"#)
            .create_async()
            .await;

        let api = TramTracker::new(server.url());
        let err = api.next_predictions(9999, 0, false).await.unwrap_err();
        assert!(matches!(err, TramTrackerError::Api { .. }));
    }
}
