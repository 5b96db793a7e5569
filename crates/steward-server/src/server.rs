//! Server assembly and lifecycle.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use steward_protocol::{PublishStream, RouterStream};
use tracing::info;

use crate::config::ServerConfig;
use crate::context::{Context, Shared};
use crate::dispatch::Dispatcher;
use crate::error::{CapabilityResult, DispatchError, RegistryError, ServerError, ServerResult};
use crate::events::{EventBus, EventHandler};
use crate::extensions::Extension;
use crate::locks::KeyedLocks;
use crate::pool::{WorkerPool, guarded};
use crate::registry::{AllowAll, Authorizer, Call, Registry, RegistryBuilder, Visibility};
use crate::signals::ShutdownHandle;
use crate::tasks::{Task, TaskList};

type StartFn = Box<dyn FnOnce(Context) -> BoxFuture<'static, Result<(), DispatchError>> + Send>;

struct StartHook {
    name: String,
    run: StartFn,
}

/// Collects capabilities, handlers, tasks and hooks before binding.
pub struct ServerBuilder {
    config: ServerConfig,
    registry: RegistryBuilder,
    handlers: Vec<EventHandler>,
    tasks: Vec<Task>,
    start_hooks: Vec<StartHook>,
    authorizer: Arc<dyn Authorizer>,
    extensions: HashSet<String>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Registry::builder(),
            handlers: Vec::new(),
            tasks: Vec::new(),
            start_hooks: Vec::new(),
            authorizer: Arc::new(AllowAll),
            extensions: HashSet::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Replaces the default allow-all policy.
    pub fn authorizer(&mut self, authorizer: impl Authorizer + 'static) -> &mut Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Lets `extension` register its parts. Each name may load once.
    pub fn extension(&mut self, extension: impl Extension) -> Result<&mut Self, RegistryError> {
        let name = extension.name().to_string();
        if !self.extensions.insert(name.clone()) {
            return Err(RegistryError::DuplicateExtension(name));
        }
        info!(extension = %name, "Loading extension");
        extension.register(self)?;
        Ok(self)
    }

    /// Registers a capability under a dotted name.
    pub fn capability<F, Fut>(
        &mut self,
        name: &str,
        visibility: Visibility,
        doc: &str,
        f: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(Context, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CapabilityResult> + Send + 'static,
    {
        self.registry.add(name, visibility, doc, f)?;
        Ok(self)
    }

    pub fn event_handler(&mut self, handler: EventHandler) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    pub fn task(&mut self, task: Task) -> &mut Self {
        self.tasks.push(task);
        self
    }

    /// Runs `f` once after the sockets are bound, before the first request.
    pub fn on_start<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        self.start_hooks.push(StartHook {
            name: name.into(),
            run: Box::new(move |ctx| -> BoxFuture<'static, Result<(), DispatchError>> {
                Box::pin(f(ctx))
            }),
        });
        self
    }

    /// Binds both sockets and freezes the registry.
    pub async fn bind(self) -> ServerResult<Server> {
        let config = self.config;
        let serializer = config.serializer();
        let router =
            RouterStream::bind(&config.socket_path, serializer, config.cleanup_stale_socket).await?;
        let publisher =
            PublishStream::bind(&config.publish_path, serializer, config.cleanup_stale_socket).await?;

        let events = EventBus::new(Arc::new(publisher));
        for handler in self.handlers {
            events.add(handler);
        }
        let tasks = TaskList::new(config.schedule_retry);
        for task in self.tasks {
            tasks.add(task);
        }

        let registry = self.registry.build();
        info!(
            capabilities = registry.len(),
            workers = config.workers,
            "Server bound"
        );
        let shared = Arc::new(Shared {
            registry,
            authorizer: self.authorizer,
            events,
            tasks,
            pool: WorkerPool::new(config.workers),
            locks: KeyedLocks::default(),
            started: Utc::now(),
        });

        Ok(Server {
            shared,
            router,
            config,
            start_hooks: self.start_hooks,
            shutdown: ShutdownHandle::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn into_parts(self) -> (RegistryBuilder, Vec<EventHandler>, Vec<Task>) {
        (self.registry, self.handlers, self.tasks)
    }
}

/// A bound server, ready to [`run`](Server::run).
pub struct Server {
    shared: Arc<Shared>,
    router: RouterStream,
    config: ServerConfig,
    start_hooks: Vec<StartHook>,
    shutdown: ShutdownHandle,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// A server-side context, for calls made outside any request.
    pub fn context(&self) -> Context {
        Context::server(self.shared.clone())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs start hooks, then serves until shutdown is triggered.
    ///
    /// On shutdown the scheduler stops and running jobs get up to the drain
    /// timeout to finish; their responses are still delivered.
    pub async fn run(self) -> ServerResult<()> {
        let Server {
            shared,
            router,
            config,
            start_hooks,
            shutdown,
        } = self;
        let ctx = Context::server(shared.clone());

        for hook in start_hooks {
            info!(hook = %hook.name, "Running start hook");
            guarded((hook.run)(ctx.clone()))
                .await
                .map_err(|source| ServerError::StartHook {
                    name: hook.name,
                    source,
                })?;
        }

        let scheduler_ctx = ctx.clone();
        let (idle, max_sleep) = (config.scheduler_idle, config.scheduler_max_sleep);
        let scheduler = tokio::spawn(async move {
            scheduler_ctx
                .tasks()
                .run(&scheduler_ctx, idle, max_sleep)
                .await;
        });

        let mut dispatcher = Dispatcher::new(shared.clone(), router);
        info!(
            socket = %config.socket_path.display(),
            publish = %config.publish_path.display(),
            "Server started"
        );
        dispatcher.run(config.poll_interval, shutdown.wait()).await;

        info!("Shutting down");
        ctx.tasks().stop();
        if let Err(e) = scheduler.await {
            tracing::warn!(error = %e, "Scheduler ended abnormally");
        }
        dispatcher
            .drain(config.drain_timeout, config.poll_interval)
            .await;
        info!("Server stopped");
        Ok(())
    }
}
