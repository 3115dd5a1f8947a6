use indexmap::IndexMap;

use kiln_graph::network::Network;
use kiln_graph::shape::ConcreteShape;

use crate::error::BuildError;
use crate::planner::compile;
use crate::runtime::Engine;

/// Default ceiling for per-layer scratch memory.
pub const DEFAULT_WORKSPACE_LIMIT: usize = 1 << 30;

/// Entry point for network construction and compilation.
///
/// The builder carries no state of its own, it exists so that everything that happens during a build goes through
/// an explicit object instead of process-wide globals.
#[derive(Debug, Default)]
pub struct Builder {
    _private: (),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryPoolType {
    /// Scratch memory shared by all layers of a single run.
    Workspace,
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    workspace_limit: usize,
    profiles: Vec<OptimizationProfile>,
}

/// The `[min, opt, max]` range of concrete shapes each dynamic input may take.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct OptimizationProfile {
    shapes: IndexMap<String, [ConcreteShape; 3]>,
}

impl Builder {
    pub fn new() -> Self {
        Builder { _private: () }
    }

    pub fn create_network(&self) -> Network {
        Network::new()
    }

    pub fn create_optimization_profile(&self) -> OptimizationProfile {
        OptimizationProfile::default()
    }

    pub fn create_config(&self) -> BuilderConfig {
        BuilderConfig::default()
    }

    /// Compile `network` into an engine. The network is frozen afterwards, even if compilation fails.
    pub fn build_engine(&self, network: &mut Network, config: &BuilderConfig) -> Result<Engine, BuildError> {
        let plan = compile(network, config)?;
        Ok(Engine::new(plan))
    }

    /// Compile `network` and immediately serialize the resulting plan.
    pub fn build_serialized_network(&self, network: &mut Network, config: &BuilderConfig) -> Result<Vec<u8>, BuildError> {
        Ok(self.build_engine(network, config)?.serialize())
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            workspace_limit: DEFAULT_WORKSPACE_LIMIT,
            profiles: vec![],
        }
    }
}

impl BuilderConfig {
    pub fn set_memory_pool_limit(&mut self, pool: MemoryPoolType, bytes: usize) {
        match pool {
            MemoryPoolType::Workspace => self.workspace_limit = bytes,
        }
    }

    pub fn memory_pool_limit(&self, pool: MemoryPoolType) -> usize {
        match pool {
            MemoryPoolType::Workspace => self.workspace_limit,
        }
    }

    /// Add a profile and return its index. Profiles are only validated during compilation.
    pub fn add_optimization_profile(&mut self, profile: OptimizationProfile) -> usize {
        self.profiles.push(profile);
        self.profiles.len() - 1
    }

    pub fn profiles(&self) -> &[OptimizationProfile] {
        &self.profiles
    }
}

impl OptimizationProfile {
    /// Set the shape range for input `name`, replacing any earlier range.
    pub fn set_shape(
        &mut self,
        name: &str,
        min: impl Into<ConcreteShape>,
        opt: impl Into<ConcreteShape>,
        max: impl Into<ConcreteShape>,
    ) {
        self.shapes
            .insert(name.to_owned(), [min.into(), opt.into(), max.into()]);
    }

    pub fn get_shape(&self, name: &str) -> Option<&[ConcreteShape; 3]> {
        self.shapes.get(name)
    }

    pub fn shapes(&self) -> impl Iterator<Item = (&str, &[ConcreteShape; 3])> {
        self.shapes.iter().map(|(k, v)| (k.as_str(), v))
    }
}
