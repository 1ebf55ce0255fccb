//! Shared daemon state, passed by `Arc` into every component.

use std::sync::Arc;

use cardkeeper_network::Transport;
use cardkeeper_sysfs::NodeAttributes;

use crate::config::DaemonConfig;
use crate::image::{BootImageValidator, BzImageValidator};
use crate::jobs::JobTable;
use crate::registry::NodeRegistry;
use crate::shutdown::ShutdownController;
use crate::workers::Countdown;
use crate::HostError;

pub struct DaemonContext {
    pub config: DaemonConfig,
    pub registry: NodeRegistry,
    pub attrs: Arc<dyn NodeAttributes>,
    pub transport: Arc<dyn Transport>,
    pub validator: Arc<dyn BootImageValidator>,
    pub jobs: JobTable,
    /// Boot workers that have not yet finished their attempt.
    pub starting: Countdown,
    pub shutdown: ShutdownController,
}

impl DaemonContext {
    pub fn new(
        config: DaemonConfig,
        registry: NodeRegistry,
        attrs: Arc<dyn NodeAttributes>,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn BootImageValidator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            attrs,
            transport,
            validator,
            jobs: JobTable::new(),
            starting: Countdown::new(),
            shutdown: ShutdownController::new(),
        })
    }

    /// Enumerate cards and build a context with the default image validator.
    pub async fn discover(
        config: DaemonConfig,
        attrs: Arc<dyn NodeAttributes>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, HostError> {
        let registry = NodeRegistry::discover(&config, attrs.as_ref()).await?;
        let validator = Arc::new(BzImageValidator::new(
            config.tools.gzip.clone(),
            config.state_dir.clone(),
        ));
        Ok(Self::new(config, registry, attrs, transport, validator))
    }
}
