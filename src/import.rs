// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors
//
// Import binding: ties one imported endpoint to the RPC proxy factory that
// materialises a local proxy for it. Factory availability arrives
// asynchronously through the tracker loop; proxy creation and destruction
// are serialised on that loop so the binding never races itself.

use std::sync::{Arc, Mutex};

use crate::config::RSA_RPC_TYPE_DEFAULT;
use crate::endpoint::{EndpointDescription, RSA_SERVICE_IMPORTED_CONFIGS};
use crate::error::{Result, RsaError};
use crate::tracker::{Tracker, TrackerHandle, TrackingEvent};

/// Creates and destroys local proxy registrations for imported endpoints.
pub trait RpcFactory: Send + Sync {
    /// Create a local proxy for `endpoint`, wired to send requests through
    /// the channel identified by `request_sender_id`. Returns the proxy's
    /// local registration id.
    fn create_proxy(
        &self,
        endpoint: &EndpointDescription,
        request_sender_id: i64,
    ) -> Result<i64>;

    /// Tear down a proxy previously returned by `create_proxy`.
    fn destroy_proxy(&self, proxy_id: i64);
}

struct BindingState {
    factory: Option<Arc<dyn RpcFactory>>,
    proxy_id: Option<i64>,
}

struct BindingCore {
    endpoint: EndpointDescription,
    request_sender_id: i64,
    /// LDAP-style filter selecting the matching factory, derived from the
    /// endpoint's imported configs. `None` when no config matched; the
    /// binding then tracks but never binds.
    filter: Option<String>,
    // proxy_id is Some exactly when factory is Some
    state: Mutex<BindingState>,
}

impl BindingCore {
    fn on_factory_available(&self, factory: &Arc<dyn RpcFactory>) {
        let mut st = match self.state.lock() {
            Ok(st) => st,
            Err(poisoned) => poisoned.into_inner(),
        };
        if st.factory.is_some() {
            log::info!(
                "Import binding for {} already bound, ignoring extra factory.",
                self.endpoint.endpoint_id()
            );
            return;
        }
        match factory.create_proxy(&self.endpoint, self.request_sender_id) {
            Ok(proxy_id) => {
                st.factory = Some(Arc::clone(factory));
                st.proxy_id = Some(proxy_id);
                log::info!(
                    "Created proxy {} for imported endpoint {}.",
                    proxy_id,
                    self.endpoint.endpoint_id()
                );
            }
            Err(e) => {
                log::error!(
                    "Error creating proxy for endpoint {}: {}",
                    self.endpoint.endpoint_id(),
                    e
                );
            }
        }
    }

    fn on_factory_unavailable(&self, factory: &Arc<dyn RpcFactory>) {
        let mut st = match self.state.lock() {
            Ok(st) => st,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bound = match &st.factory {
            Some(f) => Arc::ptr_eq(f, factory),
            None => false,
        };
        if !bound {
            return;
        }
        if let Some(proxy_id) = st.proxy_id.take() {
            factory.destroy_proxy(proxy_id);
            log::info!(
                "Destroyed proxy {} for imported endpoint {}.",
                proxy_id,
                self.endpoint.endpoint_id()
            );
        }
        st.factory = None;
    }
}

/// An active import of one remote endpoint.
///
/// The binding creates its proxy when a matching [`RpcFactory`] becomes
/// available and destroys it when the factory goes away or the binding is
/// torn down. Factory events must be posted through [`ImportBinding::handle`].
pub struct ImportBinding {
    core: Arc<BindingCore>,
    tracker: Tracker<Arc<dyn RpcFactory>>,
}

impl ImportBinding {
    /// Create a binding for `endpoint`.
    ///
    /// `request_sender_id` identifies the requesting channel proxies send
    /// through; `rpc_type_prefix` selects which of the endpoint's imported
    /// configuration types this binding handles (usually
    /// [`RSA_RPC_TYPE_DEFAULT`]).
    pub fn create(
        endpoint: EndpointDescription,
        request_sender_id: i64,
        rpc_type_prefix: &str,
    ) -> Result<Self> {
        if request_sender_id < 0 {
            return Err(RsaError::InvalidArgument(
                "request sender id is negative".into(),
            ));
        }
        if rpc_type_prefix.is_empty() {
            return Err(RsaError::InvalidArgument("rpc type prefix is empty".into()));
        }

        let filter = rpc_type_filter(&endpoint, rpc_type_prefix);
        if filter.is_none() {
            log::error!(
                "Error getting rpc type for imported endpoint {}.",
                endpoint.endpoint_id()
            );
        }

        let core = Arc::new(BindingCore {
            endpoint,
            request_sender_id,
            filter,
            state: Mutex::new(BindingState {
                factory: None,
                proxy_id: None,
            }),
        });
        let loop_core = Arc::clone(&core);
        let tracker = Tracker::start(move |ev| match ev {
            TrackingEvent::Added(factory) => loop_core.on_factory_available(&factory),
            TrackingEvent::Removed(factory) => loop_core.on_factory_unavailable(&factory),
        })?;
        Ok(Self { core, tracker })
    }

    /// Create a binding for the default rpc type.
    pub fn create_default(
        endpoint: EndpointDescription,
        request_sender_id: i64,
    ) -> Result<Self> {
        Self::create(endpoint, request_sender_id, RSA_RPC_TYPE_DEFAULT)
    }

    /// The endpoint this binding imports.
    pub fn imported_endpoint(&self) -> &EndpointDescription {
        &self.core.endpoint
    }

    /// Factory-selection filter, when one of the endpoint's imported
    /// configuration types matched the binding's rpc type.
    pub fn filter(&self) -> Option<&str> {
        self.core.filter.as_deref()
    }

    /// Handle for posting factory availability events.
    pub fn handle(&self) -> TrackerHandle<Arc<dyn RpcFactory>> {
        self.tracker.handle()
    }

    /// Tear the binding down asynchronously.
    ///
    /// `done` runs once the last availability event has been processed and
    /// any bound proxy destroyed; after it the binding makes no further
    /// factory calls.
    pub fn destroy(self, done: impl FnOnce() + Send + 'static) {
        let core = Arc::clone(&self.core);
        self.tracker.stop(move || {
            let mut st = match core.state.lock() {
                Ok(st) => st,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let (Some(factory), Some(proxy_id)) = (st.factory.take(), st.proxy_id.take()) {
                factory.destroy_proxy(proxy_id);
            }
            drop(st);
            done();
        });
    }
}

/// Pick the endpoint's imported configuration type starting with `prefix`
/// and turn it into an LDAP-style service filter.
fn rpc_type_filter(endpoint: &EndpointDescription, prefix: &str) -> Option<String> {
    let configs = endpoint.property(RSA_SERVICE_IMPORTED_CONFIGS)?;
    configs
        .split(',')
        .map(str::trim)
        .find(|token| token.starts_with(prefix))
        .map(|token| format!("({token})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{
        Properties, RSA_ENDPOINT_FRAMEWORK_UUID, RSA_ENDPOINT_ID, RSA_ENDPOINT_SERVICE_ID,
        RSA_OBJECTCLASS,
    };

    fn endpoint(configs: Option<&str>) -> EndpointDescription {
        let mut p = Properties::new();
        p.insert(RSA_OBJECTCLASS.into(), "org.example.Calculator".into());
        p.insert(RSA_ENDPOINT_ID.into(), "ep-1".into());
        p.insert(RSA_ENDPOINT_FRAMEWORK_UUID.into(), "fw".into());
        p.insert(RSA_ENDPOINT_SERVICE_ID.into(), "7".into());
        if let Some(c) = configs {
            p.insert(RSA_SERVICE_IMPORTED_CONFIGS.into(), c.into());
        }
        EndpointDescription::from_properties(&p).unwrap()
    }

    #[test]
    fn filter_picks_matching_config() {
        let ep = endpoint(Some("celix.remote.admin.shm, rsa_json_rpc.version=1"));
        assert_eq!(
            rpc_type_filter(&ep, "rsa_json_rpc").as_deref(),
            Some("(rsa_json_rpc.version=1)")
        );
    }

    #[test]
    fn filter_none_without_match() {
        let ep = endpoint(Some("celix.remote.admin.shm"));
        assert_eq!(rpc_type_filter(&ep, "rsa_json_rpc"), None);
        let ep = endpoint(None);
        assert_eq!(rpc_type_filter(&ep, "rsa_json_rpc"), None);
    }

    #[test]
    fn create_rejects_bad_arguments() {
        let ep = endpoint(Some("rsa_json_rpc"));
        assert!(ImportBinding::create(ep.clone(), -1, "rsa_json_rpc").is_err());
        assert!(ImportBinding::create(ep, 1, "").is_err());
    }
}
