// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors
//
// Endpoint description: the metadata identifying one remote service
// instance, parsed out of a generic property map at the boundary with the
// surrounding framework.

use std::collections::HashMap;

use crate::error::{Result, RsaError};

/// The generic property-map container, specified only at this boundary.
pub type Properties = HashMap<String, String>;

/// Unique id of the endpoint.
pub const RSA_ENDPOINT_ID: &str = "endpoint.id";
/// Service id of the exported service in its home framework.
pub const RSA_ENDPOINT_SERVICE_ID: &str = "endpoint.service.id";
/// UUID of the framework exporting the service.
pub const RSA_ENDPOINT_FRAMEWORK_UUID: &str = "endpoint.framework.uuid";
/// Comma list of configuration types the exporter supports.
pub const RSA_SERVICE_IMPORTED_CONFIGS: &str = "service.imported.configs";
/// Interface name(s) of the service.
pub const RSA_OBJECTCLASS: &str = "objectClass";

/// Metadata identifying a remote service instance.
///
/// Bindings and endpoints hold an owned clone so they survive independent
/// mutation (or disposal) of the caller's copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescription {
    properties: Properties,
    service_name: String,
    service_id: i64,
    framework_uuid: String,
    endpoint_id: String,
}

impl EndpointDescription {
    /// Parse and validate an endpoint description from a property map.
    ///
    /// Requires a non-empty `objectClass`, `endpoint.id`,
    /// `endpoint.framework.uuid`, and a parsable `endpoint.service.id`.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let service_name = required(properties, RSA_OBJECTCLASS)?;
        let endpoint_id = required(properties, RSA_ENDPOINT_ID)?;
        let framework_uuid = required(properties, RSA_ENDPOINT_FRAMEWORK_UUID)?;
        let service_id = required(properties, RSA_ENDPOINT_SERVICE_ID)?
            .parse::<i64>()
            .map_err(|_| {
                RsaError::InvalidArgument(format!(
                    "endpoint property {RSA_ENDPOINT_SERVICE_ID} is not a valid id"
                ))
            })?;
        if service_id < 0 {
            return Err(RsaError::InvalidArgument(format!(
                "endpoint property {RSA_ENDPOINT_SERVICE_ID} is negative"
            )));
        }
        Ok(Self {
            properties: properties.clone(),
            service_name,
            service_id,
            framework_uuid,
            endpoint_id,
        })
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_id(&self) -> i64 {
        self.service_id
    }

    pub fn framework_uuid(&self) -> &str {
        &self.framework_uuid
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Convenience accessor for an arbitrary endpoint property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

fn required(props: &Properties, key: &str) -> Result<String> {
    match props.get(key) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(RsaError::InvalidArgument(format!(
            "endpoint property {key} is missing"
        ))),
    }
}
