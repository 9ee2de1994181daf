//! Characteristic Resolver
//!
//! Looks up a service/characteristic pair in the discovered attribute table.

use crate::domain::error::{GattError, Result};
use crate::infrastructure::bluetooth::native::ServiceInfo;
use crate::infrastructure::bluetooth::protocol::CCCD_UUID;
use uuid::Uuid;

/// A characteristic located in the attribute table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub supports_notify: bool,
    pub supports_indicate: bool,
    pub has_cccd: bool,
}

impl CharacteristicRef {
    pub fn can_subscribe(&self) -> bool {
        self.supports_notify || self.supports_indicate
    }
}

/// Attribute table of the live connection.
///
/// `None` means discovery has not succeeded yet (degraded session); every
/// lookup then fails with `CharacteristicNotFound`.
#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    services: Option<Vec<ServiceInfo>>,
}

impl AttributeTable {
    pub fn discovered(services: Vec<ServiceInfo>) -> Self {
        Self {
            services: Some(services),
        }
    }

    pub fn resolve(&self, service: Uuid, characteristic: Uuid) -> Result<CharacteristicRef> {
        let services = self
            .services
            .as_ref()
            .ok_or(GattError::CharacteristicNotFound(characteristic))?;

        let svc = services
            .iter()
            .find(|s| s.uuid == service)
            .ok_or(GattError::ServiceNotFound(service))?;

        let chr = svc
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .ok_or(GattError::CharacteristicNotFound(characteristic))?;

        Ok(CharacteristicRef {
            service,
            characteristic,
            supports_notify: chr.supports_notify(),
            supports_indicate: chr.supports_indicate(),
            has_cccd: chr.has_descriptor(CCCD_UUID),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::native::CharacteristicInfo;
    use crate::infrastructure::bluetooth::protocol::properties;

    fn table() -> AttributeTable {
        AttributeTable::discovered(vec![ServiceInfo {
            uuid: Uuid::from_u128(1),
            characteristics: vec![CharacteristicInfo {
                uuid: Uuid::from_u128(2),
                properties: properties::NOTIFY | properties::WRITE,
                descriptors: vec![CCCD_UUID],
            }],
        }])
    }

    #[test]
    fn test_resolve_found() {
        let reference = table()
            .resolve(Uuid::from_u128(1), Uuid::from_u128(2))
            .unwrap();
        assert!(reference.supports_notify);
        assert!(!reference.supports_indicate);
        assert!(reference.has_cccd);
    }

    #[test]
    fn test_resolve_missing_service_and_characteristic() {
        let table = table();
        assert_eq!(
            table.resolve(Uuid::from_u128(9), Uuid::from_u128(2)),
            Err(GattError::ServiceNotFound(Uuid::from_u128(9)))
        );
        assert_eq!(
            table.resolve(Uuid::from_u128(1), Uuid::from_u128(9)),
            Err(GattError::CharacteristicNotFound(Uuid::from_u128(9)))
        );
    }

    #[test]
    fn test_undiscovered_table_reports_characteristic_not_found() {
        let table = AttributeTable::default();
        assert_eq!(
            table.resolve(Uuid::from_u128(1), Uuid::from_u128(2)),
            Err(GattError::CharacteristicNotFound(Uuid::from_u128(2)))
        );
    }
}
