//! Runnable tasks and the registry that builds them
//!
//! Each configuration section maps to one [`TaskConfig`] variant, and
//! [`TaskConfig::build`] matches on the variant to construct its task.
//! `run` starts background work and returns; `close` releases it and may
//! be called more than once.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tunproxy_config::{
    Config, EndpointConfig, InboundConfig, InboundProtocol, OutboundConfig, RoutingConfig,
};
use tunproxy_control::{ControlServer, OutboundInitiator, RandomPortAllocator};
use tunproxy_forward::{HttpInbound, SocksInbound};
use tunproxy_router::{MmdbGeoIp, Rule};

use crate::context::{server_config, RuntimeContext};
use crate::TaskError;

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<(), TaskError>;

    async fn close(&self) -> Result<(), TaskError>;
}

/// One configuration section with its typed payload
#[derive(Debug, Clone)]
pub enum TaskConfig {
    Endpoint(EndpointConfig),
    Outbounds(Vec<OutboundConfig>),
    Routing(RoutingConfig),
    Inbounds(Vec<InboundConfig>),
}

impl TaskConfig {
    /// Sections present in `config`, in start order
    ///
    /// Outbounds are negotiated before the routing table loads so the
    /// default route sees every resolved peer, and inbounds come last so
    /// no client is routed before the directory is filled.
    pub fn from_config(config: &Config) -> Vec<TaskConfig> {
        let mut tasks = Vec::new();
        if let Some(endpoint) = &config.endpoint {
            tasks.push(TaskConfig::Endpoint(endpoint.clone()));
        }
        if !config.outbounds.is_empty() {
            tasks.push(TaskConfig::Outbounds(config.outbounds.clone()));
        }
        if let Some(routing) = &config.routing {
            tasks.push(TaskConfig::Routing(routing.clone()));
        }
        if !config.inbounds.is_empty() {
            tasks.push(TaskConfig::Inbounds(config.inbounds.clone()));
        }
        tasks
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskConfig::Endpoint(_) => "endpoint",
            TaskConfig::Outbounds(_) => "outbounds",
            TaskConfig::Routing(_) => "routing",
            TaskConfig::Inbounds(_) => "inbounds",
        }
    }

    pub fn build(self, ctx: Arc<RuntimeContext>) -> Box<dyn Task> {
        match self {
            TaskConfig::Endpoint(config) => Box::new(EndpointTask::new(config, ctx)),
            TaskConfig::Outbounds(outbounds) => Box::new(OutboundsTask { outbounds, ctx }),
            TaskConfig::Routing(config) => Box::new(RoutingTask { config, ctx }),
            TaskConfig::Inbounds(inbounds) => Box::new(InboundsTask::new(inbounds, ctx)),
        }
    }
}

fn bind_ip(address: &str) -> Result<IpAddr, TaskError> {
    address
        .parse()
        .map_err(|_| TaskError::InvalidAddress(address.to_string()))
}

/// Control endpoint plus the forwarding endpoints it creates
struct EndpointTask {
    config: EndpointConfig,
    ctx: Arc<RuntimeContext>,
    cancel: CancellationToken,
    server: Mutex<Option<Arc<ControlServer>>>,
}

impl EndpointTask {
    fn new(config: EndpointConfig, ctx: Arc<RuntimeContext>) -> Self {
        let cancel = ctx.cancel_token().child_token();
        Self {
            config,
            ctx,
            cancel,
            server: Mutex::new(None),
        }
    }

    fn server_slot(&self) -> MutexGuard<'_, Option<Arc<ControlServer>>> {
        self.server.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Task for EndpointTask {
    fn name(&self) -> &'static str {
        "endpoint"
    }

    async fn run(&self) -> Result<(), TaskError> {
        let ip = bind_ip(&self.config.address)?;
        let range = self.config.port_range()?;

        let server = ControlServer::bind(
            SocketAddr::new(ip, self.config.port),
            Arc::new(server_config(self.ctx.transfer())?),
            Arc::new(RandomPortAllocator::new(range)),
            self.ctx.forwarding_spawner(),
        )?
        .with_forward_bind_ip(ip);

        let addr = server.local_addr()?;
        self.ctx.set_endpoint_addr(addr);
        info!("Control endpoint listening on {} (forwarding ports {})", addr, range);

        let server = Arc::new(server);
        tokio::spawn(server.clone().run(self.cancel.clone()));
        *self.server_slot() = Some(server);
        Ok(())
    }

    async fn close(&self) -> Result<(), TaskError> {
        self.cancel.cancel();

        let server = self.server_slot().take();
        if let Some(server) = server {
            server.close().await;
            debug!("Control endpoint closed");
        }
        Ok(())
    }
}

/// Negotiates every outbound; `run` returns once all have finished
struct OutboundsTask {
    outbounds: Vec<OutboundConfig>,
    ctx: Arc<RuntimeContext>,
}

#[async_trait]
impl Task for OutboundsTask {
    fn name(&self) -> &'static str {
        "outbounds"
    }

    async fn run(&self) -> Result<(), TaskError> {
        let initiator =
            OutboundInitiator::new(self.ctx.connector().clone(), self.ctx.directory().clone());
        initiator.negotiate_all(&self.outbounds).await?;

        info!(
            "Negotiated {} outbound(s): {}",
            self.ctx.directory().len(),
            self.ctx.directory().tags().join(", ")
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), TaskError> {
        self.ctx.forward().pool().close().await;
        Ok(())
    }
}

/// Loads the GeoIP database and rule table into the router
struct RoutingTask {
    config: RoutingConfig,
    ctx: Arc<RuntimeContext>,
}

#[async_trait]
impl Task for RoutingTask {
    fn name(&self) -> &'static str {
        "routing"
    }

    async fn run(&self) -> Result<(), TaskError> {
        if let Some(path) = &self.config.geoip {
            let geoip = MmdbGeoIp::open(path)?;
            self.ctx.router().set_geoip(Arc::new(geoip));
            info!("Loaded GeoIP database {}", path.display());
        }

        let rules = self
            .config
            .rules
            .iter()
            .map(|rule| Rule::new(&rule.in_tag, &rule.out_tag, &rule.ip))
            .collect();
        self.ctx.router().load_rules(rules);
        Ok(())
    }

    async fn close(&self) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Client-facing HTTP and SOCKS5 listeners
struct InboundsTask {
    inbounds: Vec<InboundConfig>,
    ctx: Arc<RuntimeContext>,
    cancel: CancellationToken,
}

impl InboundsTask {
    fn new(inbounds: Vec<InboundConfig>, ctx: Arc<RuntimeContext>) -> Self {
        let cancel = ctx.cancel_token().child_token();
        Self {
            inbounds,
            ctx,
            cancel,
        }
    }
}

#[async_trait]
impl Task for InboundsTask {
    fn name(&self) -> &'static str {
        "inbounds"
    }

    async fn run(&self) -> Result<(), TaskError> {
        let forward = self.ctx.forward();

        for config in &self.inbounds {
            let addr = match config.protocol {
                InboundProtocol::Http => {
                    let inbound = Arc::new(HttpInbound::bind(config, forward.clone()).await?);
                    let addr = inbound.local_addr()?;
                    tokio::spawn(inbound.run(self.cancel.child_token()));
                    addr
                }
                InboundProtocol::Socks => {
                    let inbound = Arc::new(SocksInbound::bind(config, forward.clone()).await?);
                    let addr = inbound.local_addr()?;
                    tokio::spawn(inbound.run(self.cancel.child_token()));
                    addr
                }
            };
            self.ctx.set_inbound_addr(&config.tag, addr);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TaskError> {
        self.cancel.cancel();
        Ok(())
    }
}
