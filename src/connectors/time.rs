//! Time connector: periodic `tick` events driven by the subscription
//! refresher. A subscription's update delay is its tick period.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::DatabaseTransaction;
use serde_json::json;

use crate::connectors::trait_::{Connector, ConnectorDef, ConnectorError};
use crate::models::subscription;
use crate::repositories::EventRepository;

pub struct TimeConnector {
    def: ConnectorDef,
}

impl TimeConnector {
    pub fn new() -> Self {
        Self {
            def: ConnectorDef::new("time"),
        }
    }
}

impl Default for TimeConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TimeConnector {
    fn name(&self) -> &'static str {
        "time"
    }

    fn definition(&self) -> &ConnectorDef {
        &self.def
    }

    async fn refresh_subscription(
        &self,
        txn: &DatabaseTransaction,
        subscription: &subscription::Model,
    ) -> Result<(), ConnectorError> {
        let now = Utc::now().fixed_offset();

        EventRepository::insert_bound(
            txn,
            subscription,
            "tick",
            json!({"time": now.to_rfc3339()}),
            Some(now),
        )
        .await?;

        Ok(())
    }
}
