//! Notification and batch types.

/// Target push platform.
///
/// Serialized as the integer used on the wire: `1` for iOS, `2` for Android.
/// Any other value is kept as [`Platform::Other`] so that it can fail per item
/// instead of failing the whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Platform {
    /// Apple Push Notification service.
    Ios,
    /// Firebase Cloud Messaging.
    Android,
    /// A platform value with no built-in meaning.
    Other(i64),
}

impl Platform {
    /// Platforms the gateway ships adapters for.
    pub const KNOWN: [Platform; 2] = [Platform::Ios, Platform::Android];

    /// Short lowercase name, used as a stats key.
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Other(_) => "other",
        }
    }
}

impl From<i64> for Platform {
    fn from(value: i64) -> Self {
        match value {
            1 => Platform::Ios,
            2 => Platform::Android,
            other => Platform::Other(other),
        }
    }
}

impl From<Platform> for i64 {
    fn from(platform: Platform) -> Self {
        match platform {
            Platform::Ios => 1,
            Platform::Android => 2,
            Platform::Other(value) => value,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Other(value) => write!(f, "platform({})", value),
            known => f.write_str(known.name()),
        }
    }
}

/// Delivery priority hint passed on to providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Platform-agnostic message fields.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Payload {
    /// Message body.
    #[serde(default, alias = "body")]
    pub message: String,
    /// Optional title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Sound name to play on arrival.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    /// Badge count (iOS).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
    /// APNs topic override (bundle identifier).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Delivery priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Custom key/value data delivered alongside the message.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// One logical push message, fanned out to every token it lists.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Notification {
    /// Target platform.
    pub platform: Platform,
    /// Device tokens, delivered independently.
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Message content.
    #[serde(flatten)]
    pub payload: Payload,
    /// Retry ceiling for this notification. Never exceeds the configured maximum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
}

impl Notification {
    /// Create a notification for the given platform and tokens.
    pub fn new(platform: Platform, tokens: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            platform,
            tokens,
            payload: Payload {
                message: message.into(),
                ..Default::default()
            },
            retry: None,
        }
    }
}

/// A caller-submitted group of notifications, admitted as a unit.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Identifier used to correlate log lines.
    pub id: uuid::Uuid,
    /// Notifications in submission order.
    pub notifications: Vec<Notification>,
}

impl Batch {
    pub fn new(notifications: Vec<Notification>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            notifications,
        }
    }

    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    /// Total number of (notification, token) deliveries in the batch.
    pub fn token_count(&self) -> usize {
        self.notifications.iter().map(|n| n.tokens.len()).sum()
    }
}
