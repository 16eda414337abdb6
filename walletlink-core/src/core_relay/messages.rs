//! Relay JSON-RPC params

use serde::{Deserialize, Serialize};

/// Method names for one relay protocol (`irn` -> `irn_publish`, ...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMethods {
    pub publish: String,
    pub subscribe: String,
    pub unsubscribe: String,
    pub subscription: String,
}

impl RelayMethods {
    pub fn new(protocol: &str) -> Self {
        Self {
            publish: format!("{}_publish", protocol),
            subscribe: format!("{}_subscribe", protocol),
            unsubscribe: format!("{}_unsubscribe", protocol),
            subscription: format!("{}_subscription", protocol),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishParams {
    pub topic: String,
    pub message: String,
    pub ttl: u64,
    pub tag: u32,
    #[serde(default)]
    pub prompt: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    pub topic: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionData {
    pub topic: String,
    pub message: String,
    pub published_at: u64,
    #[serde(default)]
    pub tag: u32,
}

/// Params of an inbound `<protocol>_subscription` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub id: String,
    pub data: SubscriptionData,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_names() {
        let m = RelayMethods::new("irn");
        assert_eq!(m.publish, "irn_publish");
        assert_eq!(m.subscription, "irn_subscription");
    }

    #[test]
    fn test_subscription_shape() {
        let params: SubscriptionParams = serde_json::from_value(json!({
            "id": "sub1",
            "data": {"topic": "t", "message": "AAA=", "publishedAt": 1700000000000u64, "tag": 1108}
        }))
        .unwrap();
        assert_eq!(params.data.tag, 1108);
        assert_eq!(params.data.published_at, 1_700_000_000_000);
    }
}
