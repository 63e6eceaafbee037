//! Session fingerprint profiles
//!
//! A profile is created once at session creation and never mutated; recovery
//! relaunches the replacement worker with the exact same profile so the
//! session keeps a consistent fingerprint across its whole life.

use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

/// Immutable fingerprint used when (re)creating a worker.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProfile {
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// IANA timezone name, e.g. "America/New_York"
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Stable identifier, also used for the worker's data directory
    pub device_id: String,
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
];

const VIEWPORTS: &[(u32, u32)] = &[(1920, 1080), (1680, 1050), (1536, 864), (1440, 900)];

/// Timezone with a plausible coordinate inside it.
const LOCALES: &[(&str, f64, f64)] = &[
    ("America/New_York", 40.7128, -74.0060),
    ("America/Chicago", 41.8781, -87.6298),
    ("America/Denver", 39.7392, -104.9903),
    ("America/Los_Angeles", 34.0522, -118.2437),
];

impl SessionProfile {
    /// Generate a fresh fingerprint with small random jitter on the
    /// coordinates so no two sessions report the exact same location.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();

        let user_agent = USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0]);
        let (width, height) = VIEWPORTS.choose(&mut rng).copied().unwrap_or(VIEWPORTS[0]);
        let (timezone, lat, lon) = LOCALES.choose(&mut rng).copied().unwrap_or(LOCALES[0]);

        Self {
            user_agent: user_agent.to_string(),
            viewport_width: width,
            viewport_height: height,
            timezone: timezone.to_string(),
            latitude: lat + rng.gen_range(-0.05..0.05),
            longitude: lon + rng.gen_range(-0.05..0.05),
            device_id: Uuid::new_v4().to_string(),
        }
    }
}
