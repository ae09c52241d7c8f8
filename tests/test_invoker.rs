// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors

use std::any::Any;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rsa_shm::endpoint::{
    EndpointDescription, Properties, RSA_ENDPOINT_FRAMEWORK_UUID, RSA_ENDPOINT_ID,
    RSA_ENDPOINT_SERVICE_ID, RSA_OBJECTCLASS,
};
use rsa_shm::error::{Result, RsaError};
use rsa_shm::invoker::{
    DynamicInterface, Interceptor, InterfaceMeta, ServiceInvoker, SharedService,
};

fn endpoint() -> EndpointDescription {
    let mut p = Properties::new();
    p.insert(RSA_OBJECTCLASS.into(), "org.example.Calculator".into());
    p.insert(RSA_ENDPOINT_ID.into(), "ep-export".into());
    p.insert(RSA_ENDPOINT_FRAMEWORK_UUID.into(), "fw-local".into());
    p.insert(RSA_ENDPOINT_SERVICE_ID.into(), "21".into());
    EndpointDescription::from_properties(&p).unwrap()
}

struct Calculator;

impl Calculator {
    fn add(&self, a: f64, b: f64) -> f64 {
        a + b
    }
}

/// Json-rpc style dispatcher for the Calculator test service: resolves the
/// method from the "m" field and the arguments from the "a" array.
struct CalculatorInterface {
    invoked: AtomicUsize,
    parse_fails: bool,
}

impl CalculatorInterface {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            invoked: AtomicUsize::new(0),
            parse_fails: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            invoked: AtomicUsize::new(0),
            parse_fails: true,
        })
    }
}

impl DynamicInterface for CalculatorInterface {
    fn parse(&self, _owner: &(dyn Any + Send + Sync), service_name: &str) -> Result<InterfaceMeta> {
        if self.parse_fails {
            return Err(RsaError::InvalidArgument(
                "interface descriptor is unreadable".into(),
            ));
        }
        Ok(Box::new(service_name.to_string()))
    }

    fn invoke(
        &self,
        meta: &InterfaceMeta,
        service: &SharedService,
        request: &str,
    ) -> Result<String> {
        self.invoked.fetch_add(1, Ordering::SeqCst);
        assert_eq!(
            meta.downcast_ref::<String>().map(String::as_str),
            Some("org.example.Calculator")
        );
        let calc = service
            .downcast_ref::<Calculator>()
            .ok_or_else(|| RsaError::InvalidArgument("not a Calculator".into()))?;
        let parsed: serde_json::Value = serde_json::from_str(request)
            .map_err(|e| RsaError::InvalidArgument(e.to_string()))?;
        match parsed.get("m").and_then(serde_json::Value::as_str) {
            Some(m) if m.starts_with("add") => {
                let args = parsed
                    .get("a")
                    .and_then(serde_json::Value::as_array)
                    .ok_or_else(|| RsaError::InvalidArgument("missing arguments".into()))?;
                let a = args.first().and_then(serde_json::Value::as_f64).unwrap_or(0.0);
                let b = args.get(1).and_then(serde_json::Value::as_f64).unwrap_or(0.0);
                Ok(format!("{{\"r\":{}}}", calc.add(a, b)))
            }
            _ => Err(RsaError::ServiceException("no such method".into())),
        }
    }
}

struct CountingInterceptor {
    veto: AtomicBool,
    pre_calls: AtomicUsize,
    post_calls: AtomicUsize,
}

impl CountingInterceptor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            veto: AtomicBool::new(false),
            pre_calls: AtomicUsize::new(0),
            post_calls: AtomicUsize::new(0),
        })
    }
}

impl Interceptor for CountingInterceptor {
    fn pre_call(&self, _endpoint: &Properties, _method: &str, metadata: &mut Properties) -> bool {
        self.pre_calls.fetch_add(1, Ordering::SeqCst);
        metadata.insert("intercepted".into(), "true".into());
        !self.veto.load(Ordering::SeqCst)
    }

    fn post_call(&self, _endpoint: &Properties, _method: &str, _metadata: &Properties) {
        self.post_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn bound_invoker(
    interceptor: Arc<CountingInterceptor>,
    iface: Arc<CalculatorInterface>,
    log: Option<SharedBuf>,
) -> (ServiceInvoker, SharedService) {
    let invoker = ServiceInvoker::new(
        endpoint(),
        interceptor,
        iface,
        log.map(|l| Box::new(l) as Box<dyn Write + Send>),
    );
    let calc = Arc::new(Calculator);
    let service: SharedService = calc.clone();
    invoker.on_service_available(service.clone(), calc.as_ref());
    (invoker, service)
}

#[test]
fn dispatches_a_call_end_to_end() {
    let interceptor = CountingInterceptor::new();
    let iface = CalculatorInterface::new();
    let (invoker, _service) = bound_invoker(interceptor.clone(), iface.clone(), None);

    let mut metadata = Properties::new();
    let response = invoker
        .handle_request(&mut metadata, b"{\"m\":\"add(DD)D\",\"a\":[42.0,1.0]}")
        .unwrap();
    assert_eq!(response, b"{\"r\":43}");
    assert_eq!(metadata.get("intercepted").map(String::as_str), Some("true"));
    assert_eq!(interceptor.pre_calls.load(Ordering::SeqCst), 1);
    assert_eq!(interceptor.post_calls.load(Ordering::SeqCst), 1);
    assert_eq!(iface.invoked.load(Ordering::SeqCst), 1);
}

#[test]
fn tolerates_trailing_nul_bytes() {
    let (invoker, _service) =
        bound_invoker(CountingInterceptor::new(), CalculatorInterface::new(), None);
    let mut metadata = Properties::new();
    let response = invoker
        .handle_request(&mut metadata, b"{\"m\":\"add(DD)D\",\"a\":[1.0,2.0]}\0\0")
        .unwrap();
    assert_eq!(response, b"{\"r\":3}");
}

#[test]
fn unbound_invoker_rejects_requests() {
    let iface = CalculatorInterface::new();
    let invoker = ServiceInvoker::new(endpoint(), CountingInterceptor::new(), iface.clone(), None);
    let mut metadata = Properties::new();
    let err = invoker
        .handle_request(&mut metadata, b"{\"m\":\"add(DD)D\",\"a\":[1.0,2.0]}")
        .unwrap_err();
    assert!(matches!(err, RsaError::InvalidState(_)));
    assert_eq!(iface.invoked.load(Ordering::SeqCst), 0);
}

#[test]
fn veto_skips_the_service_and_post_call() {
    let interceptor = CountingInterceptor::new();
    interceptor.veto.store(true, Ordering::SeqCst);
    let iface = CalculatorInterface::new();
    let (invoker, _service) = bound_invoker(interceptor.clone(), iface.clone(), None);

    let mut metadata = Properties::new();
    let response = invoker
        .handle_request(&mut metadata, b"{\"m\":\"add(DD)D\",\"a\":[1.0,2.0]}")
        .unwrap();
    assert!(response.is_empty());
    assert_eq!(iface.invoked.load(Ordering::SeqCst), 0);
    assert_eq!(interceptor.pre_calls.load(Ordering::SeqCst), 1);
    assert_eq!(interceptor.post_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn missing_method_name_is_rejected_and_logged() {
    let log = SharedBuf::new();
    let (invoker, _service) = bound_invoker(
        CountingInterceptor::new(),
        CalculatorInterface::new(),
        Some(log.clone()),
    );

    let mut metadata = Properties::new();
    let err = invoker
        .handle_request(&mut metadata, b"{\"a\":[1.0]}")
        .unwrap_err();
    assert!(matches!(err, RsaError::InvalidArgument(_)));

    let logged = log.contents();
    assert!(logged.contains("ENDPOINT REMOTE CALL:"));
    assert!(logged.contains("service=org.example.Calculator"));
    assert!(logged.contains("service_id=21"));
    assert!(logged.contains(&format!("status={}", err.code())));
    assert_ne!(err.code(), 0);
}

#[test]
fn successful_calls_are_logged_with_zero_status() {
    let log = SharedBuf::new();
    let (invoker, _service) = bound_invoker(
        CountingInterceptor::new(),
        CalculatorInterface::new(),
        Some(log.clone()),
    );

    let mut metadata = Properties::new();
    invoker
        .handle_request(&mut metadata, b"{\"m\":\"add(DD)D\",\"a\":[1.0,2.0]}")
        .unwrap();

    let logged = log.contents();
    assert!(logged.contains("request_payload={\"m\":\"add(DD)D\",\"a\":[1.0,2.0]}"));
    assert!(logged.contains("request_response={\"r\":3}"));
    assert!(logged.contains("status=0"));
}

#[test]
fn post_call_runs_when_no_service_is_bound() {
    let interceptor = CountingInterceptor::new();
    let invoker = ServiceInvoker::new(
        endpoint(),
        interceptor.clone(),
        CalculatorInterface::new(),
        None,
    );

    let mut metadata = Properties::new();
    let err = invoker
        .handle_request(&mut metadata, b"{\"m\":\"add(DD)D\",\"a\":[1.0,2.0]}")
        .unwrap_err();
    assert!(matches!(err, RsaError::InvalidState(_)));
    // Every allowed pre_call is matched by a post_call, even for a failed
    // dispatch; interceptors doing tracing bookkeeping rely on the pairing.
    assert_eq!(interceptor.pre_calls.load(Ordering::SeqCst), 1);
    assert_eq!(interceptor.post_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn post_call_runs_when_the_invocation_fails() {
    let interceptor = CountingInterceptor::new();
    let (invoker, _service) =
        bound_invoker(interceptor.clone(), CalculatorInterface::new(), None);

    let mut metadata = Properties::new();
    let err = invoker
        .handle_request(&mut metadata, b"{\"m\":\"divide(DD)D\",\"a\":[1.0,2.0]}")
        .unwrap_err();
    assert!(matches!(err, RsaError::ServiceException(_)));
    assert_eq!(interceptor.pre_calls.load(Ordering::SeqCst), 1);
    assert_eq!(interceptor.post_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn service_failure_surfaces_as_service_exception() {
    let (invoker, _service) =
        bound_invoker(CountingInterceptor::new(), CalculatorInterface::new(), None);
    let mut metadata = Properties::new();
    let err = invoker
        .handle_request(&mut metadata, b"{\"m\":\"divide(DD)D\",\"a\":[1.0,2.0]}")
        .unwrap_err();
    assert!(matches!(err, RsaError::ServiceException(_)));
}

#[test]
fn parse_failure_leaves_invoker_unbound() {
    let iface = CalculatorInterface::failing();
    let invoker = ServiceInvoker::new(endpoint(), CountingInterceptor::new(), iface, None);
    let calc = Arc::new(Calculator);
    let service: SharedService = calc.clone();
    invoker.on_service_available(service, calc.as_ref());

    let mut metadata = Properties::new();
    let err = invoker
        .handle_request(&mut metadata, b"{\"m\":\"add(DD)D\",\"a\":[1.0]}")
        .unwrap_err();
    assert!(matches!(err, RsaError::InvalidState(_)));
}

#[test]
fn stale_unbind_is_ignored() {
    let (invoker, service) =
        bound_invoker(CountingInterceptor::new(), CalculatorInterface::new(), None);

    // Unbinding a service that never bound must not disturb the live one.
    let other: SharedService = Arc::new(Calculator);
    invoker.on_service_unavailable(&other);

    let mut metadata = Properties::new();
    assert!(invoker
        .handle_request(&mut metadata, b"{\"m\":\"add(DD)D\",\"a\":[1.0,2.0]}")
        .is_ok());

    // The real unbind takes effect.
    invoker.on_service_unavailable(&service);
    let err = invoker
        .handle_request(&mut metadata, b"{\"m\":\"add(DD)D\",\"a\":[1.0,2.0]}")
        .unwrap_err();
    assert!(matches!(err, RsaError::InvalidState(_)));
}
