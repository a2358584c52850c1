//! # Service Registry
//!
//! Maps service names to operation tables and turns an incoming
//! `(service, method, params)` triple into something runnable.
//!
//! ## Philosophy
//!
//! - **Explicit Tables**: A [`Service`] is a table from method name to
//!   [`Operation`], built once at startup. There is no runtime method discovery.
//! - **Shape Is Part Of The Name**: A method resolves only when the name matches
//!   exactly *and* the parameters convert to the declared types. A wrong arity or
//!   a wrong parameter type is reported the same way as an unknown name.
//! - **Frozen**: [`RegistryBuilder::build`] produces an immutable registry behind
//!   an `Arc`. Lookups take no locks, and registries are injected, never global.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use wirepack::FromValue;
use wirepack::FromValueError;
use wirepack::Value;
use wirerpc::ErrorSpot;

/// What an operation produces: an answer, or a description of what went wrong.
pub type Outcome = std::result::Result<Value, String>;

/// Why a call could not be resolved to an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("{method} takes {expected} parameters, got {found}")]
    Arity { method: String, expected: usize, found: usize },
    #[error("parameter {index} of {method}: {source}")]
    Parameter { method: String, index: usize, source: FromValueError },
}

impl ResolveError {
    /// The resolution stage this failure is reported against.
    pub fn error_spot(&self) -> ErrorSpot {
        match self {
            ResolveError::ServiceNotFound(_) => ErrorSpot::Service,
            _ => ErrorSpot::Method,
        }
    }
}

/// Failures while freezing a registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("service {0:?} is registered twice")]
    DuplicateService(String),
    #[error("alias {alias:?} points to unknown service {target:?}")]
    UnknownAliasTarget { alias: String, target: String },
}

// ============================================================================
//  PARAMETERS
// ============================================================================

/// Parameters that do not fit a declared shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    Arity { expected: usize, found: usize },
    Type { index: usize, source: FromValueError },
}

impl ParamError {
    fn for_method(self, method: &str) -> ResolveError {
        match self {
            ParamError::Arity { expected, found } => {
                ResolveError::Arity { method: method.to_string(), expected, found }
            }
            ParamError::Type { index, source } => {
                ResolveError::Parameter { method: method.to_string(), index, source }
            }
        }
    }
}

/// A tuple of positional parameters, each converted with [`FromValue`].
pub trait Params: Sized + Send + 'static {
    const ARITY: usize;

    fn from_params(params: Vec<Value>) -> std::result::Result<Self, ParamError>;
}

macro_rules! impl_params {
    ($arity:expr; $($arg:ident),*) => {
        impl<$($arg: FromValue + Send + 'static),*> Params for ($($arg,)*) {
            const ARITY: usize = $arity;

            #[allow(unused_mut, unused_variables)]
            fn from_params(params: Vec<Value>) -> std::result::Result<Self, ParamError> {
                let found = params.len();
                if found != Self::ARITY {
                    return Err(ParamError::Arity { expected: Self::ARITY, found });
                }
                let mut params = params.into_iter().enumerate();
                Ok(($(
                    {
                        let (index, value) = params
                            .next()
                            .ok_or(ParamError::Arity { expected: Self::ARITY, found })?;
                        <$arg as FromValue>::from_value(value)
                            .map_err(|source| ParamError::Type { index, source })?
                    },
                )*))
            }
        }
    };
}

impl_params!(0;);
impl_params!(1; A);
impl_params!(2; A, B);
impl_params!(3; A, B, C);
impl_params!(4; A, B, C, D);

// ============================================================================
//  HANDLERS
// ============================================================================

/// A synchronous operation body. Runs on the blocking pool, so it may block.
pub trait SyncHandler<Args>: Send + Sync + 'static {
    fn invoke(&self, args: Args) -> Outcome;
}

/// An asynchronous operation body.
pub trait AsyncHandler<Args>: Send + Sync + 'static {
    fn invoke(&self, args: Args) -> BoxFuture<'static, Outcome>;
}

macro_rules! impl_handlers {
    ($($arg:ident),*) => {
        impl<F, R, E, $($arg,)*> SyncHandler<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> Result<R, E> + Send + Sync + 'static,
            R: Into<Value>,
            E: fmt::Display,
        {
            #[allow(non_snake_case)]
            fn invoke(&self, ($($arg,)*): ($($arg,)*)) -> Outcome {
                (self)($($arg),*).map(Into::into).map_err(|e| e.to_string())
            }
        }

        impl<F, Fut, R, E, $($arg,)*> AsyncHandler<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R, E>> + Send + 'static,
            R: Into<Value>,
            E: fmt::Display,
        {
            #[allow(non_snake_case)]
            fn invoke(&self, ($($arg,)*): ($($arg,)*)) -> BoxFuture<'static, Outcome> {
                let fut = (self)($($arg),*);
                Box::pin(async move { fut.await.map(Into::into).map_err(|e| e.to_string()) })
            }
        }
    };
}

impl_handlers!();
impl_handlers!(A);
impl_handlers!(A, B);
impl_handlers!(A, B, C);
impl_handlers!(A, B, C, D);

// ============================================================================
//  OPERATIONS
// ============================================================================

/// A resolved call, ready to run.
pub enum Invocation {
    Blocking(Box<dyn FnOnce() -> Outcome + Send>),
    Async(BoxFuture<'static, Outcome>),
}

impl Invocation {
    /// Runs the operation to completion.
    ///
    /// A panic inside the operation is caught and reported as a failed outcome.
    pub async fn run(self) -> Outcome {
        match self {
            Invocation::Blocking(body) => match tokio::task::spawn_blocking(body).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(panic_message(e.into_panic())),
                Err(e) => Err(format!("operation was cancelled: {}", e)),
            },
            Invocation::Async(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => Err(panic_message(payload)),
            },
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("operation panicked: {}", detail)
}

type Prepare = dyn Fn(Vec<Value>) -> std::result::Result<Invocation, ParamError> + Send + Sync;

/// One callable method: its parameter shape plus its body.
pub struct Operation {
    arity: usize,
    prepare: Box<Prepare>,
}

impl Operation {
    pub fn arity(&self) -> usize {
        self.arity
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").field("arity", &self.arity).finish_non_exhaustive()
    }
}

/// A named table of operations.
///
/// Registering a method name twice keeps the later registration.
#[derive(Debug, Default)]
pub struct Service {
    operations: HashMap<String, Operation>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a synchronous method.
    ///
    /// ```ignore
    /// let svc = Service::new()
    ///     .method("getMail", || Ok::<_, String>("vip.alexd@gmail.com"));
    /// ```
    pub fn method<Args, H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        Args: Params,
        H: SyncHandler<Args>,
    {
        let handler = Arc::new(handler);
        let prepare = move |params: Vec<Value>| -> std::result::Result<Invocation, ParamError> {
            let args = Args::from_params(params)?;
            let handler = handler.clone();
            Ok(Invocation::Blocking(Box::new(move || SyncHandler::invoke(&*handler, args))))
        };
        self.operations.insert(name.into(), Operation { arity: Args::ARITY, prepare: Box::new(prepare) });
        self
    }

    /// Registers an asynchronous method.
    pub fn method_async<Args, H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        Args: Params,
        H: AsyncHandler<Args>,
    {
        let prepare = move |params: Vec<Value>| -> std::result::Result<Invocation, ParamError> {
            let args = Args::from_params(params)?;
            Ok(Invocation::Async(AsyncHandler::invoke(&handler, args)))
        };
        self.operations.insert(name.into(), Operation { arity: Args::ARITY, prepare: Box::new(prepare) });
        self
    }

    pub fn operation(&self, method: &str) -> Option<&Operation> {
        self.operations.get(method)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    /// Resolves a method by exact name and converts the parameters.
    pub fn resolve(&self, method: &str, params: Vec<Value>) -> std::result::Result<Invocation, ResolveError> {
        let op = self
            .operations
            .get(method)
            .ok_or_else(|| ResolveError::MethodNotFound(method.to_string()))?;
        (op.prepare)(params).map_err(|e| e.for_method(method))
    }
}

// ============================================================================
//  REGISTRY
// ============================================================================

/// The frozen set of services exposed by a server.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn resolve(&self, name: &str) -> std::result::Result<&Service, ResolveError> {
        self.services
            .get(name)
            .map(Arc::as_ref)
            .ok_or_else(|| ResolveError::ServiceNotFound(name.to_string()))
    }

    /// Every exposed name, aliases included.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    services: Vec<(String, Service)>,
    aliases: Vec<(String, String)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, name: impl Into<String>, service: Service) -> Self {
        self.services.push((name.into(), service));
        self
    }

    /// Exposes the registered service `registered` under the name `exposed` as well.
    pub fn alias(mut self, exposed: impl Into<String>, registered: impl Into<String>) -> Self {
        self.aliases.push((exposed.into(), registered.into()));
        self
    }

    pub fn aliases<I, K, V>(self, aliases: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        aliases.into_iter().fold(self, |builder, (k, v)| builder.alias(k, v))
    }

    pub fn build(self) -> std::result::Result<Arc<ServiceRegistry>, BuildError> {
        let mut services: HashMap<String, Arc<Service>> = HashMap::new();

        for (name, service) in self.services {
            if services.contains_key(&name) {
                return Err(BuildError::DuplicateService(name));
            }
            services.insert(name, Arc::new(service));
        }

        let mut exposed = HashMap::new();
        for (alias, target) in self.aliases {
            let Some(service) = services.get(&target) else {
                return Err(BuildError::UnknownAliasTarget { alias, target });
            };
            if services.contains_key(&alias) || exposed.contains_key(&alias) {
                return Err(BuildError::DuplicateService(alias));
            }
            exposed.insert(alias, service.clone());
        }
        services.extend(exposed);

        Ok(Arc::new(ServiceRegistry { services }))
    }
}
