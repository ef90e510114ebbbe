//! Wire frames of the quote stream
//!
//! Every frame is one JSON object carrying an `event` discriminator. Outbound
//! requests are serialized from [`Request`]; inbound frames are parsed into
//! [`InboundEvent`] by [`parse_frame`].

use super::error::StreamError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Provider error code attached to failed responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NONE: Self = Self(0);
    pub const AUTHENTICATION_FAILURE: Self = Self(3000);
    pub const AUTHORIZATION_NOT_IN_THE_HEADERS: Self = Self(3001);
    pub const ENDPOINT_DOES_NOT_EXIST: Self = Self(3002);
    pub const INSTRUMENT_IS_NOT_ALLOWED: Self = Self(3003);
    pub const SUBSCRIPTION_IS_INVALID: Self = Self(3004);
    pub const UNABLE_TO_JSONISE_YOUR_MESSAGE: Self = Self(3005);
    pub const ALREADY_CONNECTED: Self = Self(3006);
    pub const ALREADY_SUBSCRIBED: Self = Self(3007);
    pub const NOT_SUBSCRIBED_YET: Self = Self(3008);
    pub const INVALID_FORMAT: Self = Self(3009);
    pub const INVALID_MESSAGE: Self = Self(3011);
    pub const NOT_ABLE_TO_QUOTE_AT_THE_MOMENT: Self = Self(3013);
    pub const UNEXPECTED_ERROR: Self = Self(3014);
    pub const USERNAME_CHANGED: Self = Self(3015);
    pub const CONNECTIVITY_ISSUES: Self = Self(3016);
    pub const AUTHORIZATION_HEADER_IS_MALFORMED: Self = Self(3017);
    pub const SUBSCRIPTION_FOR_A_LEVEL_IS_NOT_VALID_ANYMORE: Self = Self(3018);
    pub const INSTRUMENT_DOES_NOT_END_WITH_SPOT_OR_CFD: Self = Self(3019);
    pub const GENERIC_ERROR: Self = Self(4000);

    /// Provider documentation for the code, if it is a known one
    #[must_use]
    pub const fn description(self) -> Option<&'static str> {
        Some(match self.0 {
            3000 => "Authentication failure",
            3001 => "Authorization not in the headers",
            3002 => "Endpoint does not exist",
            3003 => "Instrument is not allowed",
            3004 => "Subscription is invalid",
            3005 => "Unable to JSONise your message",
            3006 => "Already connected",
            3007 => "Already subscribed",
            3008 => "Not subscribed yet",
            3009 => "Invalid format, message is not a string",
            3011 => "Invalid message",
            3013 => "Not able to quote at the moment",
            3014 => "Unexpected error",
            3015 => "Username changed, the connection will be closed",
            3016 => "Connectivity issues with the pricer",
            3017 => "Authorization header is malformed",
            3018 => "Subscription for a level is not valid anymore, the connection will be closed",
            3019 => "Instrument does not end with .SPOT or .CFD",
            4000 => "Generic error",
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description() {
            Some(description) => write!(f, "{} {}", self.0, description),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Error details carried by a `success: false` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
}

/// Outbound request frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Request {
    Subscribe {
        instrument: String,
        levels: Vec<f64>,
        tag: String,
    },
    Unsubscribe {
        instrument: String,
        tag: String,
    },
}

impl Request {
    /// Serialize into a text frame
    pub fn to_frame(&self) -> Result<String, StreamError> {
        serde_json::to_string(self).map_err(|e| StreamError::InvalidRequest(e.to_string()))
    }
}

/// One aggregated price level of a price frame
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct QuantityPrice {
    #[serde(deserialize_with = "number_or_string")]
    pub quantity: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub price: f64,
}

/// Both sides of a price frame
///
/// `buy` holds the prices at which the provider sells to us, `sell` the prices
/// at which it buys from us.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Levels {
    #[serde(default)]
    pub buy: Vec<QuantityPrice>,
    #[serde(default)]
    pub sell: Vec<QuantityPrice>,
}

/// Price update for one subscribed instrument
#[derive(Debug, Clone, PartialEq)]
pub struct PriceMessage {
    /// Provider instrument, e.g. `BTCUSD.SPOT`
    pub instrument: String,
    /// Provider timestamp
    pub timestamp: DateTime<Utc>,
    pub levels: Levels,
}

/// Response to a subscribe or unsubscribe request
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub tag: Option<String>,
    pub instrument: Option<String>,
    pub outcome: Result<(), ProviderError>,
}

/// Parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Instruments the account may subscribe to, sent right after connecting
    TradableInstruments(Vec<String>),
    SubscribeAck(Ack),
    UnsubscribeAck(Ack),
    Price(PriceMessage),
    /// `success: false` price frame, e.g. the provider cannot quote right now
    PriceRejected {
        instrument: Option<String>,
        error: ProviderError,
    },
    /// Event the client does not know about
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct AckFrame {
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    instrument: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error_code: Option<u32>,
    #[serde(default)]
    error_message: Option<String>,
}

impl AckFrame {
    fn into_ack(self) -> Ack {
        let outcome = if self.success {
            Ok(())
        } else {
            Err(provider_error(self.error_code, self.error_message))
        };
        Ack {
            tag: self.tag,
            instrument: self.instrument,
            outcome,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PriceFrame {
    #[serde(default)]
    instrument: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    levels: Option<Levels>,
    #[serde(default)]
    error_code: Option<u32>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TradableInstrumentsFrame {
    #[serde(default)]
    tradable_instruments: Vec<String>,
}

fn provider_error(code: Option<u32>, message: Option<String>) -> ProviderError {
    let code = ErrorCode(code.unwrap_or_default());
    let message = message
        .or_else(|| code.description().map(str::to_owned))
        .unwrap_or_default();
    ProviderError { code, message }
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, StreamError> {
    serde_json::from_value(value).map_err(|e| StreamError::MalformedFrame(e.to_string()))
}

/// Parse one inbound text frame
pub fn parse_frame(text: &str) -> Result<InboundEvent, StreamError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| StreamError::MalformedFrame(e.to_string()))?;
    if !value.is_object() {
        return Err(StreamError::MalformedFrame(format!("expected an object, got {value}")));
    }

    let event = value
        .get("event")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| StreamError::MalformedFrame("missing event field".to_owned()))?;

    match event.as_str() {
        "tradable_instruments" => {
            let frame: TradableInstrumentsFrame = decode(value)?;
            Ok(InboundEvent::TradableInstruments(frame.tradable_instruments))
        }
        "subscribe" => Ok(InboundEvent::SubscribeAck(decode::<AckFrame>(value)?.into_ack())),
        "unsubscribe" => Ok(InboundEvent::UnsubscribeAck(decode::<AckFrame>(value)?.into_ack())),
        "price" => parse_price(decode(value)?),
        _ => Ok(InboundEvent::Unknown(event)),
    }
}

fn parse_price(frame: PriceFrame) -> Result<InboundEvent, StreamError> {
    if !frame.success {
        return Ok(InboundEvent::PriceRejected {
            instrument: frame.instrument,
            error: provider_error(frame.error_code, frame.error_message),
        });
    }

    let instrument = frame
        .instrument
        .ok_or_else(|| StreamError::MalformedFrame("price without instrument".to_owned()))?;
    let millis = frame
        .timestamp
        .ok_or_else(|| StreamError::MalformedFrame("price without timestamp".to_owned()))?;
    let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StreamError::MalformedFrame(format!("timestamp out of range: {millis}")))?;

    Ok(InboundEvent::Price(PriceMessage {
        instrument,
        timestamp,
        levels: frame.levels.unwrap_or_default(),
    }))
}
