use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorDescriptor};
use crate::limits::RuntimeLimits;
use crate::modules::AllowedModuleTable;
use crate::net::{NetworkClientFactory, Resolve};
use crate::output::CapturedOutput;
use crate::request::ExecutionRequest;
use crate::result::ExecutionResult;
use crate::runtime::RestrictedRuntime;
use crate::validator::{SafetyValidator, ValidationFinding};

/// Validates and runs scripts for many concurrent callers.
///
/// The engine holds only read-only state; every call gets its own scope,
/// output buffer and network client. Cloning is cheap and clones share the
/// concurrency limit.
#[derive(Debug, Clone)]
pub struct SandboxEngine {
    modules: Arc<AllowedModuleTable>,
    validator: SafetyValidator,
    runtime: RestrictedRuntime,
    permits: Arc<Semaphore>,
}

impl SandboxEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let modules = Arc::new(AllowedModuleTable::from_config(&config.modules)?);
        let network = NetworkClientFactory::new(config.network)?;
        let validator = SafetyValidator::new(modules.clone(), &config.limits);
        let permits = Arc::new(Semaphore::new(config.limits.max_concurrent_calls.max(1)));
        let runtime = RestrictedRuntime::new(modules.clone(), network, config.limits);

        info!(
            table_version = modules.version(),
            modules = modules.module_names().count(),
            "sandbox engine ready"
        );
        Ok(Self {
            modules,
            validator,
            runtime,
            permits,
        })
    }

    /// Resolve outbound names through `resolver` instead of the system.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.runtime = self.runtime.with_resolver(resolver);
        self
    }

    pub fn module_table(&self) -> &AllowedModuleTable {
        &self.modules
    }

    pub fn limits(&self) -> &RuntimeLimits {
        self.runtime.limits()
    }

    /// Run only the static checks. An empty result means the script would be
    /// accepted with these modules.
    pub fn validate_only(
        &self,
        source: &str,
        allowed_modules: &BTreeSet<String>,
    ) -> Vec<ValidationFinding> {
        self.validator.validate_for(source, allowed_modules)
    }

    /// Validate, then run one call.
    ///
    /// Returns:
    /// - `Err` if the request was refused and nothing ran
    /// - `Ok` with a successful or failed [`ExecutionResult`] otherwise
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        if let Err(missing) = self.modules.check_subset(&request.allowed_modules) {
            warn!(modules = ?missing, "request names modules outside the table");
            return Err(EngineError::ModulesNotPermitted(missing));
        }

        let program = match self
            .validator
            .check(&request.source, Some(&request.allowed_modules))
        {
            Ok(program) => program,
            Err(findings) => {
                warn!(
                    findings = findings.len(),
                    first = %findings.first().map(ToString::to_string).unwrap_or_default(),
                    "script rejected by validation"
                );
                return Err(EngineError::ValidationRejected(findings));
            }
        };

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            warn!("engine at capacity, refusing call");
            return Ok(ExecutionResult::err(
                ErrorDescriptor::resource_exhausted("engine is at capacity"),
                CapturedOutput::default(),
                Duration::ZERO,
            ));
        };

        let timeout = self.limits().effective_timeout(request.timeout_ms);
        info!(
            timeout_ms = timeout.as_millis() as u64,
            modules = ?request.allowed_modules,
            network = request.allowed_hosts.is_some(),
            "call started"
        );
        let scope = self.runtime.build_scope(program, request)?;
        Ok(self.runtime.run(scope, timeout, Some(permit)).await)
    }
}
