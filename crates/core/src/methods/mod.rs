//! The method registry: dotted paths to invokable handler records.
//!
//! The original framework resolved methods by walking module attributes and
//! adorned them with decorators; here both collapse into a registry entry.
//! A [`Method`] carries its invoke function plus capability tags and
//! pre-invocation options that the pipeline enforces before calling it.

pub mod builtin;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use toto_lib::envelope::Response;
use toto_lib::error::TotoError;

use crate::context::ServiceContext;
use crate::events::EventHandle;
use crate::session::SessionRecord;

bitflags::bitflags! {
    /// Capability tags attached to a method, checked by the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodTags: u32 {
        /// The pipeline will not auto-respond; the method calls
        /// [`MethodContext::respond`] when it is ready.
        const ASYNC_RESPONSE = 1 << 0;
        /// Reject with 1004 unless a session was presented.
        const AUTHENTICATED = 1 << 1;
        /// Create an anonymous session when none was presented.
        const ANONYMOUS_SESSION = 1 << 2;
        /// Load a session if presented, proceed without one otherwise.
        const OPTIONALLY_AUTHENTICATED = 1 << 3;
        /// Take the session id from the `session_id` parameter.
        const AUTHENTICATED_WITH_PARAMETER = 1 << 4;
        /// The method returns response bytes; skip serialization.
        const RAW_RESPONSE = 1 << 5;
    }
}

/// What a method produced.
pub enum MethodResult {
    /// A value for the `result` field of the response envelope.
    Value(Value),
    /// Pre-serialized response bytes with their content type.
    Raw { body: Vec<u8>, content_type: String },
    /// Nothing; an async method responds later through its context.
    Deferred,
}

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<MethodResult, TotoError>> + Send>>;
type MethodFn = Arc<dyn Fn(MethodContext, Map<String, Value>) -> MethodFuture + Send + Sync>;

/// A registered method: the invoke function plus everything the pipeline
/// needs to know before calling it.
#[derive(Clone)]
pub struct Method {
    invoke: MethodFn,
    pub tags: MethodTags,
    pub required_params: Vec<String>,
    pub default_params: Map<String, Value>,
    pub jsonp_param: Option<String>,
    pub error_redirects: HashMap<String, String>,
    pub default_redirect: Option<String>,
}

impl Method {
    /// A method returning a plain result value.
    pub fn new<F, Fut>(invoke: F) -> Self
    where
        F: Fn(MethodContext, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TotoError>> + Send + 'static,
    {
        Self::with_result(move |ctx, params| {
            let fut = invoke(ctx, params);
            async move { fut.await.map(MethodResult::Value) }
        })
    }

    /// A method with full control over its result shape.
    pub fn with_result<F, Fut>(invoke: F) -> Self
    where
        F: Fn(MethodContext, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MethodResult, TotoError>> + Send + 'static,
    {
        Method {
            invoke: Arc::new(move |ctx, params| Box::pin(invoke(ctx, params))),
            tags: MethodTags::empty(),
            required_params: Vec::new(),
            default_params: Map::new(),
            jsonp_param: None,
            error_redirects: HashMap::new(),
            default_redirect: None,
        }
    }

    pub fn tags(mut self, tags: MethodTags) -> Self {
        self.tags |= tags;
        self
    }

    /// Reject with 1003 unless every listed parameter is present.
    pub fn requires(mut self, params: &[&str]) -> Self {
        self.required_params
            .extend(params.iter().map(|p| (*p).to_owned()));
        self
    }

    /// Merge defaults for absent parameters before invocation.
    pub fn default_params(mut self, defaults: Map<String, Value>) -> Self {
        self.default_params.extend(defaults);
        self
    }

    /// Wrap the JSON result as `cb(json)` when the named parameter is
    /// present; the parameter is stripped before invocation.
    pub fn jsonp(mut self, param: &str) -> Self {
        self.jsonp_param = Some(param.to_owned());
        self
    }

    /// Redirect instead of responding when the method fails with a mapped
    /// error code.
    pub fn error_redirect(
        mut self,
        redirects: HashMap<String, String>,
        default: Option<String>,
    ) -> Self {
        self.error_redirects = redirects;
        self.default_redirect = default;
        self
    }

    pub fn invoke(&self, ctx: MethodContext, params: Map<String, Value>) -> MethodFuture {
        (self.invoke)(ctx, params)
    }
}

/// Dotted method paths to handler records, populated at startup.
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Arc<Method>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &str, method: Method) {
        debug_assert!(
            !path.is_empty() && path.split('.').all(|seg| !seg.is_empty()),
            "method paths are non-empty dotted segments"
        );
        self.methods
            .write()
            .insert(path.to_owned(), Arc::new(method));
    }

    pub fn resolve(&self, path: &str) -> Option<Arc<Method>> {
        self.methods.read().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.methods.read().keys().cloned().collect()
    }
}

/// Per-invocation state handed to every method: the shared service context,
/// the session slot, and the response channel for async methods.
#[derive(Clone)]
pub struct MethodContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    service: Arc<ServiceContext>,
    session: Mutex<Option<SessionRecord>>,
    responder: Mutex<Option<oneshot::Sender<Response>>>,
    finished: Arc<AtomicBool>,
    event_handles: Mutex<Vec<EventHandle>>,
}

/// A dropped context means the request ended, normally or because the
/// connection closed under an active method; either way its event handlers
/// must not fire again.
impl Drop for ContextInner {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Release);
        let events = self.service.events();
        for handle in self.event_handles.lock().drain(..) {
            events.remove_handler(&handle);
        }
    }
}

impl MethodContext {
    pub fn new(service: Arc<ServiceContext>) -> Self {
        MethodContext {
            inner: Arc::new(ContextInner {
                service,
                session: Mutex::new(None),
                responder: Mutex::new(None),
                finished: Arc::new(AtomicBool::new(false)),
                event_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn service(&self) -> &Arc<ServiceContext> {
        &self.inner.service
    }

    pub fn session(&self) -> Option<SessionRecord> {
        self.inner.session.lock().clone()
    }

    pub fn set_session(&self, session: SessionRecord) {
        *self.inner.session.lock() = Some(session);
    }

    /// Create a session for the given credentials and adopt it for the rest
    /// of the request.
    pub fn create_session(
        &self,
        user_id: Option<&str>,
        password: Option<&str>,
    ) -> Result<SessionRecord, TotoError> {
        let session = self
            .inner
            .service
            .store()
            .create_session(user_id, password, true, None)?;
        self.set_session(session.clone());
        Ok(session)
    }

    /// Load the session with `session_id` and adopt it if found.
    pub fn retrieve_session(&self, session_id: &str) -> Result<Option<SessionRecord>, TotoError> {
        let session = self.inner.service.store().retrieve_session(session_id)?;
        if let Some(session) = &session {
            self.set_session(session.clone());
        }
        Ok(session)
    }

    /// Persist state mutations on the adopted session.
    pub fn save_session(&self) -> Result<(), TotoError> {
        let mut slot = self.inner.session.lock();
        if let Some(session) = slot.as_mut() {
            self.inner.service.store().save_session(session)?;
        }
        Ok(())
    }

    /// Mutate the adopted session's state map.
    pub fn update_session_state(
        &self,
        update: impl FnOnce(&mut Map<String, Value>),
    ) -> Result<(), TotoError> {
        let mut slot = self.inner.session.lock();
        if let Some(session) = slot.as_mut() {
            update(&mut session.state);
            self.inner.service.store().save_session(session)?;
        }
        Ok(())
    }

    /// Install the response channel; the pipeline does this before invoking
    /// an `ASYNC_RESPONSE` method.
    pub fn set_responder(&self, responder: oneshot::Sender<Response>) {
        *self.inner.responder.lock() = Some(responder);
    }

    /// Complete the request from an async method. Returns false if the
    /// response was already sent or nobody is waiting.
    pub fn respond(&self, response: Response) -> bool {
        match self.inner.responder.lock().take() {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn respond_result(&self, value: Value) -> bool {
        self.respond(Response::result(value))
    }

    pub fn respond_error(&self, error: TotoError) -> bool {
        self.respond(Response::error(error))
    }

    /// Register an event handler tied to this request. Handlers registered
    /// with `deregister_on_finish` are removed when the request finishes;
    /// all are skipped once the finished flag is set.
    pub fn register_event_handler(
        &self,
        name: &str,
        callback: impl Fn(Value) + Send + Sync + 'static,
        on_main_loop: bool,
        deregister_on_finish: bool,
        persist: bool,
    ) -> Option<EventHandle> {
        let handle = self.inner.service.events().register_handler(
            name,
            callback,
            on_main_loop,
            Some(Arc::clone(&self.inner.finished)),
            persist,
        );
        if deregister_on_finish {
            self.inner.event_handles.lock().push(handle);
            None
        } else {
            Some(handle)
        }
    }

    /// Mark the request finished: skip and deregister its event handlers.
    /// Called by the pipeline on completion and on connection close.
    pub fn finish(&self) {
        self.inner.finished.store(true, Ordering::Release);
        let events = self.inner.service.events();
        for handle in self.inner.event_handles.lock().drain(..) {
            events.remove_handler(&handle);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }
}

/// Invoke a method, converting panics into the server-error variant so a
/// buggy method can never take down its transport.
pub async fn invoke_guarded(
    method: &Method,
    ctx: MethodContext,
    params: Map<String, Value>,
) -> Result<MethodResult, TotoError> {
    let invocation = method.invoke(ctx, params);
    futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(invocation))
        .await
        .unwrap_or_else(|cause| {
            let reason = cause
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "method panicked".to_owned());
            log::error!("method panicked: {reason}");
            Err(TotoError::server(reason))
        })
}

/// Enforce a method's pre-invocation options: merge defaults, verify
/// required parameters, and apply the session policy tags.
pub fn prepare_invocation(
    method: &Method,
    ctx: &MethodContext,
    params: &mut Map<String, Value>,
) -> Result<(), TotoError> {
    for (key, value) in &method.default_params {
        if !params.contains_key(key) {
            params.insert(key.clone(), value.clone());
        }
    }
    let missing: Vec<String> = method
        .required_params
        .iter()
        .filter(|key| !params.contains_key(*key))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(TotoError::missing_params(&missing));
    }

    if method.tags.contains(MethodTags::AUTHENTICATED_WITH_PARAMETER) {
        if let Some(session_id) = params.remove("session_id") {
            if let Some(session_id) = session_id.as_str() {
                ctx.retrieve_session(session_id)?;
            }
        }
        if ctx.session().is_none() {
            return Err(TotoError::not_authorized());
        }
    } else if method.tags.contains(MethodTags::AUTHENTICATED) {
        if ctx.session().is_none() {
            return Err(TotoError::not_authorized());
        }
    } else if method.tags.contains(MethodTags::ANONYMOUS_SESSION) && ctx.session().is_none() {
        let session = ctx.service().store().create_session(None, None, true, None)?;
        ctx.set_session(session);
    }
    Ok(())
}
