// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The core context: the process-wide root owning every other subsystem.
//!
//! Created once at initialization and destroyed once at shutdown; nothing
//! in this crate outlives it. The typed fields are the primary way to
//! reach services; the string-keyed [`ServiceRegistry`] remains as a
//! discovery surface for dynamically registered ones.

mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use babel_shared::component::{ComponentState, IsolationLevel, PropagationMode};
use babel_shared::error::Severity;
use babel_shared::ident::{Identifier, IdentifierFormat};
use babel_shared::topology::TransitionMatrix;
use serde::Deserialize;

pub use registry::{ServiceHandle, ServiceRegistry};

use crate::errors::Result;
use crate::errsys::{ErrorEntry, ErrorSystem, ROOT_COMPONENT};
use crate::externs::Externs;
use crate::gateway::{DefaultGateway, Gateway, GatewayConfig};
use crate::policy::PolicyEngine;
use crate::resource::{Quotas, ResourceManager};
use crate::topology::{Adapter, TopologyManager};

/// The configuration tree the core consumes. Parsing the tree from files
/// is an external collaborator's job; unknown options are that parser's
/// to warn about, and they never fail initialization here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub bridges: BridgesConfig,
    pub topology: TopologyConfig,
    pub security: SecurityConfig,
    /// Per-component quotas (`resource.<component>.*_quota`).
    pub resource: HashMap<String, QuotaConfig>,
    pub error: ErrorConfig,
    pub identifier: IdentifierConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgesConfig {
    /// `bridges.capacity`
    pub capacity: usize,
    /// `bridges.<language>.enabled`
    pub languages: HashMap<String, LanguageConfig>,
}

impl Default for BridgesConfig {
    fn default() -> Self {
        BridgesConfig {
            capacity: 8,
            languages: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguageConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// `topology.transitions`: the legal (from, to) pairs. The default
    /// matrix denies everything.
    pub transitions: TransitionMatrix,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// `security.require_auth`
    pub require_auth: bool,
    /// `security.enforce_encryption`
    pub enforce_encryption: bool,
    /// `security.isolation_level`
    pub isolation_level: IsolationLevel,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub memory_quota: Option<u64>,
    pub cpu_quota: Option<u64>,
    pub io_quota: Option<u64>,
}

impl QuotaConfig {
    fn quotas(&self) -> Quotas {
        Quotas {
            memory: self.memory_quota.unwrap_or(u64::MAX),
            cpu: self.cpu_quota.unwrap_or(u64::MAX),
            io: self.io_quota.unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ErrorConfig {
    /// `error.propagation.<component>`
    pub propagation: HashMap<String, PropagationMode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentifierConfig {
    /// `identifier.default_format`
    pub default_format: IdentifierFormat,
}

impl From<&CoreConfig> for GatewayConfig {
    fn from(config: &CoreConfig) -> Self {
        GatewayConfig {
            bridge_capacity: config.bridges.capacity,
            disabled_languages: config
                .bridges
                .languages
                .iter()
                .filter(|(_, l)| !l.enabled)
                .map(|(name, _)| name.clone())
                .collect(),
            require_auth: config.security.require_auth,
            enforce_encryption: config.security.enforce_encryption,
            default_isolation: config.security.isolation_level,
        }
    }
}

/// Status snapshot answered to the `status` command. The context
/// identifier is rendered in the configured default format.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub context: String,
    pub bridges: Vec<String>,
    pub components: Vec<ComponentStatus>,
    pub core_fatal: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ComponentStatus {
    pub name: String,
    pub state: Option<ComponentState>,
    pub memory_current: u64,
    pub memory_peak: u64,
    pub violations: u64,
}

/// The root object. Construction wires every subsystem together in
/// dependency order; [`CoreContext::shutdown`] tears them down in
/// reverse.
pub struct CoreContext {
    config: CoreConfig,
    ident: Identifier,
    services: ServiceRegistry,
    errsys: Arc<ErrorSystem>,
    policy: Arc<PolicyEngine>,
    resources: Arc<ResourceManager>,
    topology: Arc<TopologyManager>,
    gateway: Arc<DefaultGateway>,
    externs: Arc<dyn Externs>,
}

impl CoreContext {
    pub fn new(config: CoreConfig, externs: impl Externs) -> Result<Self> {
        let externs: Arc<dyn Externs> = Arc::new(externs);

        // Leaves first: errors, policy and resources have no dependencies
        // on each other; topology and the gateway stack on top.
        let errsys = Arc::new(ErrorSystem::new(externs.clone()));
        let policy = Arc::new(PolicyEngine::new(externs.clone()));
        let resources = Arc::new(ResourceManager::new(Quotas::default()));
        resources.set_trace_sink(externs.clone());
        for (component, quota) in &config.resource {
            resources.configure(component.clone(), quota.quotas());
        }
        {
            let errsys = errsys.clone();
            resources.set_error_forward(move |component, message| {
                errsys.raise(ErrorEntry::new(
                    component,
                    "resource",
                    babel_shared::error::ErrorCode::InternalInvariantViolated,
                    Severity::Warning,
                    message,
                ));
            });
        }

        let topology = Arc::new(TopologyManager::new(
            config.topology.transitions.clone(),
            externs.clone(),
        ));
        let gateway = Arc::new(DefaultGateway::new(
            (&config).into(),
            topology.clone(),
            policy.clone(),
            resources.clone(),
            errsys.clone(),
            externs.clone(),
        ));

        for (component, mode) in &config.error.propagation {
            errsys.set_default_propagation(component, *mode);
        }
        errsys.set_state(ROOT_COMPONENT, ComponentState::Ready);

        let services = ServiceRegistry::new();
        services.register("policy", policy.clone());
        services.register("resources", resources.clone());
        services.register("topology", topology.clone());
        services.register("errors", errsys.clone());
        services.register("gateway", gateway.clone());

        Ok(CoreContext {
            config,
            ident: Identifier::random(),
            services,
            errsys,
            policy,
            resources,
            topology,
            gateway,
            externs,
        })
    }

    /// Attribution identifier of this context instance.
    pub fn ident(&self) -> Identifier {
        self.ident
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<DefaultGateway> {
        &self.gateway
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    pub fn errors(&self) -> &ErrorSystem {
        &self.errsys
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn externs(&self) -> &Arc<dyn Externs> {
        &self.externs
    }

    /// Register an adapter with the topology manager.
    pub fn register_adapter(&self, adapter: Box<dyn Adapter>) -> Result<()> {
        self.topology.register_adapter(adapter).map(|_| ())
    }

    pub fn status(&self) -> StatusReport {
        let components = self
            .resources
            .components()
            .into_iter()
            .map(|name| {
                let limiter = self.resources.limiter(&name);
                let memory = limiter.usage(babel_shared::event::UsageKind::Memory);
                ComponentStatus {
                    state: self.errsys.state(&name),
                    memory_current: memory.current,
                    memory_peak: memory.peak,
                    violations: limiter.violations(),
                    name,
                }
            })
            .collect();
        StatusReport {
            context: self.ident.render(self.config.identifier.default_format),
            bridges: self.gateway.languages(),
            components,
            core_fatal: self.errsys.core_fatal(),
        }
    }

    /// Render an identifier in the configured default format
    /// (`identifier.default_format`).
    pub fn render_ident(&self, ident: Identifier) -> String {
        ident.render(self.config.identifier.default_format)
    }

    /// Tear everything down in reverse construction order: bridges (via
    /// the gateway), then adapters, then the component tree. Returns the
    /// aggregated error journal; nothing recorded is dropped.
    pub fn shutdown(self) -> Vec<ErrorEntry> {
        if let Err(e) = self.gateway.cleanup() {
            log::warn!("gateway cleanup reported failures: {}", e);
        }
        self.topology.cleanup();
        self.errsys.set_state(ROOT_COMPONENT, ComponentState::Stopped);
        self.errsys.drain_journal()
    }
}
