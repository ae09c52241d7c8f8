// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors
//
// Service invoker: the export-side dispatcher turning a raw request payload
// into a call on the local service instance. Method resolution and argument
// marshalling are delegated to a pluggable dynamic-interface implementation;
// interceptors get a veto before the call and see the result after it.

use std::any::Any;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::endpoint::{EndpointDescription, Properties};
use crate::error::{Result, RsaError};

/// The local service instance, type-erased; the dynamic interface knows how
/// to call into it.
pub type SharedService = Arc<dyn Any + Send + Sync>;

/// Parsed interface metadata produced by [`DynamicInterface::parse`] and fed
/// back into [`DynamicInterface::invoke`].
pub type InterfaceMeta = Box<dyn Any + Send + Sync>;

/// Hook running around every remote invocation.
pub trait Interceptor: Send + Sync {
    /// Runs before dispatch. Returning `false` vetoes the call: it is
    /// reported as handled with an empty response and never reaches the
    /// service.
    fn pre_call(
        &self,
        endpoint: &Properties,
        method: &str,
        metadata: &mut Properties,
    ) -> bool;

    /// Runs after a dispatched call returned, with the response metadata,
    /// whether the invocation succeeded or failed. Skipped for vetoed calls.
    fn post_call(&self, endpoint: &Properties, method: &str, metadata: &Properties);
}

/// Resolves an exported service's callable surface and performs calls on it.
pub trait DynamicInterface: Send + Sync {
    /// Inspect `owner` and produce the metadata needed to dispatch calls on
    /// services named `service_name`.
    fn parse(
        &self,
        owner: &(dyn Any + Send + Sync),
        service_name: &str,
    ) -> Result<InterfaceMeta>;

    /// Dispatch one textual request against `service` and return the
    /// serialised response.
    fn invoke(
        &self,
        meta: &InterfaceMeta,
        service: &SharedService,
        request: &str,
    ) -> Result<String>;
}

struct InvokerState {
    service: Option<SharedService>,
    iface: Option<InterfaceMeta>,
}

/// Dispatches incoming request payloads for one exported endpoint.
///
/// The invoker is unbound until [`on_service_available`] succeeds; requests
/// arriving while unbound fail with `InvalidState`.
///
/// [`on_service_available`]: ServiceInvoker::on_service_available
pub struct ServiceInvoker {
    endpoint: EndpointDescription,
    interceptor: Arc<dyn Interceptor>,
    dyn_iface: Arc<dyn DynamicInterface>,
    call_log: Option<Mutex<Box<dyn Write + Send>>>,
    // iface is Some exactly when service is Some
    inner: Mutex<InvokerState>,
}

impl ServiceInvoker {
    pub fn new(
        endpoint: EndpointDescription,
        interceptor: Arc<dyn Interceptor>,
        dyn_iface: Arc<dyn DynamicInterface>,
        call_log: Option<Box<dyn Write + Send>>,
    ) -> Self {
        Self {
            endpoint,
            interceptor,
            dyn_iface,
            call_log: call_log.map(Mutex::new),
            inner: Mutex::new(InvokerState {
                service: None,
                iface: None,
            }),
        }
    }

    /// The endpoint this invoker serves.
    pub fn endpoint(&self) -> &EndpointDescription {
        &self.endpoint
    }

    fn lock_inner(&self) -> MutexGuard<'_, InvokerState> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Bind the local service instance.
    ///
    /// `owner` is whatever carries the interface description the dynamic
    /// interface parses (often the service itself). A parse failure is
    /// logged and leaves the invoker unbound; a second bind while already
    /// bound is ignored.
    pub fn on_service_available(&self, service: SharedService, owner: &(dyn Any + Send + Sync)) {
        let mut st = self.lock_inner();
        if st.service.is_some() {
            log::info!(
                "Invoker for {} already bound, ignoring extra service.",
                self.endpoint.endpoint_id()
            );
            return;
        }
        match self.dyn_iface.parse(owner, self.endpoint.service_name()) {
            Ok(meta) => {
                st.service = Some(service);
                st.iface = Some(meta);
            }
            Err(e) => {
                log::error!(
                    "Error parsing interface of service {} for endpoint {}: {}",
                    self.endpoint.service_name(),
                    self.endpoint.endpoint_id(),
                    e
                );
            }
        }
    }

    /// Unbind the service instance. A no-op unless `service` is the bound
    /// instance.
    pub fn on_service_unavailable(&self, service: &SharedService) {
        let mut st = self.lock_inner();
        let bound = match &st.service {
            Some(s) => Arc::ptr_eq(s, service),
            None => false,
        };
        if bound {
            st.service = None;
            st.iface = None;
        }
    }

    /// Serve one incoming request.
    ///
    /// `request` is the raw payload as read from the channel; trailing NUL
    /// bytes left by C-string writers are tolerated. The method name is
    /// taken from the payload's `"m"` field. Every request, including
    /// failing ones, is appended to the call log when one is configured.
    pub fn handle_request(&self, metadata: &mut Properties, request: &[u8]) -> Result<Vec<u8>> {
        let result = self.dispatch(metadata, request);
        self.log_call(request, &result);
        result
    }

    fn dispatch(&self, metadata: &mut Properties, request: &[u8]) -> Result<Vec<u8>> {
        let trimmed = trim_trailing_nuls(request);
        if trimmed.is_empty() {
            return Err(RsaError::InvalidArgument("request payload is empty".into()));
        }
        let text = std::str::from_utf8(trimmed)
            .map_err(|_| RsaError::InvalidArgument("request payload is not utf-8".into()))?;
        let parsed: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| RsaError::InvalidArgument(format!("request payload is not json: {e}")))?;
        let method = parsed
            .get("m")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                RsaError::InvalidArgument("request payload carries no method name".into())
            })?
            .to_string();

        if !self
            .interceptor
            .pre_call(self.endpoint.properties(), &method, metadata)
        {
            // Vetoed: handled successfully with an empty response, and
            // post_call does not run.
            return Ok(Vec::new());
        }

        let outcome = {
            let st = self.lock_inner();
            match (&st.service, &st.iface) {
                (Some(service), Some(iface)) => self
                    .dyn_iface
                    .invoke(iface, service, text)
                    .map(String::into_bytes)
                    .map_err(|e| RsaError::ServiceException(e.to_string())),
                _ => Err(RsaError::InvalidState(format!(
                    "no service bound for endpoint {}",
                    self.endpoint.endpoint_id()
                ))),
            }
        };

        // post_call runs on every proceed path, whether or not the
        // invocation succeeded; only a vetoed call skips it.
        self.interceptor
            .post_call(self.endpoint.properties(), &method, metadata);
        outcome
    }

    fn log_call(&self, request: &[u8], result: &Result<Vec<u8>>) {
        let Some(sink) = &self.call_log else {
            return;
        };
        let payload = String::from_utf8_lossy(trim_trailing_nuls(request));
        let (response, status) = match result {
            Ok(bytes) => (String::from_utf8_lossy(bytes).into_owned(), 0),
            Err(e) => (String::new(), e.code()),
        };
        let mut sink = match sink.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = writeln!(
            sink,
            "ENDPOINT REMOTE CALL:\n\tservice={}\n\tservice_id={}\n\trequest_payload={}\n\trequest_response={}\n\tstatus={}",
            self.endpoint.service_name(),
            self.endpoint.service_id(),
            payload,
            response,
            status
        );
    }
}

fn trim_trailing_nuls(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1] == 0 {
        end -= 1;
    }
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_nuls_only() {
        assert_eq!(trim_trailing_nuls(b"abc\0\0"), b"abc");
        assert_eq!(trim_trailing_nuls(b"a\0b"), b"a\0b");
        assert_eq!(trim_trailing_nuls(b"\0\0"), b"");
    }
}
