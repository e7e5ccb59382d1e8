use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::typed::StateField;

/// Named buckets of ticker symbols, e.g. `"tech" -> ["AAPL", "MSFT"]`
pub struct TickerBuckets;

impl StateField for TickerBuckets {
    const KEY: &'static str = "tickerBuckets";
    type Value = BTreeMap<String, Vec<String>>;
}

/// User settings shared between devices
pub struct Settings;

impl StateField for Settings {
    const KEY: &'static str = "settings";
    type Value = AppSettings;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    /// Room this device synchronizes through when none is given explicitly
    pub sync_room: Option<String>,
    /// Bucket selected when the UI opens
    pub default_bucket: Option<String>,
    /// Quote currency used to display prices
    pub quote_currency: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settings_tolerate_missing_fields() {
        let settings: AppSettings = serde_json::from_value(json!({"syncRoom": "desk"})).unwrap();
        assert_eq!(settings.sync_room.as_deref(), Some("desk"));
        assert_eq!(settings.default_bucket, None);
    }
}
