use std::sync::Arc;
use std::time::Duration;
use serde_json::Value;
use shared::types::{CharacteristicWrite, CharacteristicsWriteRequest};
use crate::client::AccessoryClient;
use crate::error::{HapError, Result};
use crate::model::{Characteristic, Service};

/// Reads and writes characteristic values through the polling client.
#[derive(Clone)]
pub struct ServiceControl {
    client: Arc<dyn AccessoryClient>,
    pin: Arc<str>,
    timeout: Duration,
}

impl ServiceControl {
    pub fn new(client: Arc<dyn AccessoryClient>, pin: &str, timeout: Duration) -> Self {
        Self {
            client,
            pin: Arc::from(pin),
            timeout,
        }
    }

    /// Bind a handle to one characteristic of `service`.
    pub fn characteristic(&self, service: &Arc<Service>, iid: u64) -> Result<CharacteristicHandle> {
        if service.characteristic(iid).is_none() {
            return Err(HapError::UnknownCharacteristic { aid: service.aid, iid });
        }
        Ok(CharacteristicHandle {
            service: service.clone(),
            iid,
            control: self.clone(),
        })
    }

    /// Re-read every characteristic of `service` in one request.
    pub async fn refresh_characteristics(&self, service: &Service) -> Result<()> {
        let ids: Vec<(u64, u64)> = service.characteristics.iter().map(|c| (service.aid, c.iid)).collect();
        if ids.is_empty() {
            return Ok(());
        }

        let response = self.client.get_characteristics(&service.instance, &ids).await?;
        for entry in response.characteristics {
            if entry.aid != service.aid as i64 {
                continue;
            }
            if let Some(characteristic) = service.characteristics.iter().find(|c| c.iid as i64 == entry.iid) {
                characteristic.set_value(entry.value);
            }
        }
        Ok(())
    }

    pub async fn get_characteristic(&self, service: &Service, iid: u64) -> Result<Value> {
        let characteristic = find(service, iid)?;
        let response = self.client.get_characteristics(&service.instance, &[(service.aid, iid)]).await?;

        let entry = response
            .characteristics
            .into_iter()
            .find(|c| c.aid == service.aid as i64 && c.iid == iid as i64)
            .ok_or(HapError::UnknownCharacteristic { aid: service.aid, iid })?;

        characteristic.set_value(entry.value.clone());
        Ok(entry.value)
    }

    /// Write `value`, then read it back from the accessory.
    pub async fn set_characteristic(&self, service: &Service, iid: u64, value: Value) -> Result<Value> {
        find(service, iid)?;
        let request = CharacteristicsWriteRequest {
            characteristics: vec![CharacteristicWrite::value(service.aid as i64, iid as i64, value)],
        };

        if let Err(e) = self
            .client
            .put_characteristics(&service.instance, &request, &self.pin, self.timeout)
            .await
        {
            tracing::error!(
                "[{}] Failed to set value for {}.",
                service.instance.label(),
                service.service_name
            );
            match &e {
                HapError::Unauthorized { .. } => tracing::warn!("{}", e),
                _ => tracing::error!("{}", e),
            }
            return Err(e);
        }

        self.get_characteristic(service, iid).await
    }
}

fn find(service: &Service, iid: u64) -> Result<&Characteristic> {
    service
        .characteristic(iid)
        .ok_or(HapError::UnknownCharacteristic { aid: service.aid, iid })
}

/// A characteristic bound to its service and the client that can reach it.
#[derive(Clone)]
pub struct CharacteristicHandle {
    service: Arc<Service>,
    iid: u64,
    control: ServiceControl,
}

impl CharacteristicHandle {
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn characteristic(&self) -> Option<&Characteristic> {
        self.service.characteristic(self.iid)
    }

    /// Cached value, without a network round trip.
    pub fn value(&self) -> Option<Value> {
        self.characteristic().map(Characteristic::value)
    }

    pub async fn get_value(&self) -> Result<Value> {
        self.control.get_characteristic(&self.service, self.iid).await
    }

    pub async fn set_value(&self, value: Value) -> Result<Value> {
        self.control.set_characteristic(&self.service, self.iid, value).await
    }
}
