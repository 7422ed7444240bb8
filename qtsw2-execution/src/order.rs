use crate::intent::IntentId;
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::{Constructor, Display};
use qtsw2_instrument::{InstrumentName, StreamId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};
use thiserror::Error;

/// Tag prefix identifying every order this robot owns at the broker.
pub const ROBOT_TAG_PREFIX: &str = "QTSW2";

/// Role of an order within a bracketed intent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum OrderRole {
    Entry,
    Stop,
    Target,
}

impl OrderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Stop => "STOP",
            Self::Target => "TARGET",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "ENTRY" => Some(Self::Entry),
            "STOP" => Some(Self::Stop),
            "TARGET" => Some(Self::Target),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum OrderTagError {
    #[error("order tag is not robot-owned: {0}")]
    NotRobotTag(String),

    #[error("malformed robot order tag: {0}")]
    Malformed(String),
}

/// Opaque broker echo tag in the format `QTSW2:{intent_id}:{ENTRY|STOP|TARGET}`.
///
/// The broker echoes tags back on order and execution events; this is the only
/// correlation key between broker state and engine intents.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct OrderTag {
    pub intent: IntentId,
    pub role: OrderRole,
}

impl OrderTag {
    pub fn new(intent: IntentId, role: OrderRole) -> Self {
        Self { intent, role }
    }

    pub fn encode(&self) -> SmolStr {
        format_smolstr!("{ROBOT_TAG_PREFIX}:{}:{}", self.intent, self.role)
    }

    /// Parse a broker echo tag. `NotRobotTag` distinguishes foreign orders from
    /// malformed robot tags so recovery can leave the former untouched.
    pub fn decode(raw: &str) -> Result<Self, OrderTagError> {
        let mut parts = raw.splitn(3, ':');

        match parts.next() {
            Some(ROBOT_TAG_PREFIX) => {}
            _ => return Err(OrderTagError::NotRobotTag(raw.to_string())),
        }

        let malformed = || OrderTagError::Malformed(raw.to_string());
        let intent = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let role = parts
            .next()
            .and_then(OrderRole::parse)
            .ok_or_else(malformed)?;

        Ok(Self {
            intent: IntentId::from(intent),
            role,
        })
    }
}

impl std::fmt::Display for OrderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// OCO group identifier bracketing the protective stop and target:
/// `QTSW2:OCO_ENTRY:{date}:{stream}:{slot_time}`.
///
/// Carried on the [`Intent`](crate::intent::Intent) so adapters group the protective
/// pair under the same broker-side OCO linkage.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct OcoGroupId(pub SmolStr);

impl OcoGroupId {
    pub fn new(
        trading_date: NaiveDate,
        stream: &StreamId,
        slot_time: impl std::fmt::Display,
    ) -> Self {
        Self(format_smolstr!(
            "{ROBOT_TAG_PREFIX}:OCO_ENTRY:{trading_date}:{stream}:{slot_time}"
        ))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Broker-assigned order identifier.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct OrderId(pub SmolStr);

impl OrderId {
    pub fn new<S>(id: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(id.into())
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Broker order lifecycle status carried on an [`OrderUpdate`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum OrderStatus {
    Working,
    Cancelled,
    Filled,
    Rejected,
}

/// Broker push event describing an order state change.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct OrderUpdate {
    pub order_id: OrderId,
    /// Raw echo tag; robot orders decode via [`OrderTag::decode`].
    pub tag: Option<SmolStr>,
    pub instrument: InstrumentName,
    pub status: OrderStatus,
    pub time_exchange: DateTime<Utc>,
}

/// Broker push event describing a fill fragment.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct ExecutionUpdate {
    pub order_id: OrderId,
    pub tag: Option<SmolStr>,
    pub instrument: InstrumentName,
    pub fill_price: Decimal,
    pub quantity: Decimal,
    pub time_exchange: DateTime<Utc>,
}

impl OrderUpdate {
    pub fn robot_tag(&self) -> Option<OrderTag> {
        self.tag.as_deref().and_then(|raw| OrderTag::decode(raw).ok())
    }
}

impl ExecutionUpdate {
    pub fn robot_tag(&self) -> Option<OrderTag> {
        self.tag.as_deref().and_then(|raw| OrderTag::decode(raw).ok())
    }
}
