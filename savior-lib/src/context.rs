use crate::{JobConfig, JobError};
use savior_common::Platform;
use savior_engine::{build_http_client, ImageTool, OvirtClient, PollConfig, QemuImg, Topology};
use std::sync::Arc;
use tracing::info;

/// Everything a job talks to: the platform, the HTTP client used for image
/// transfers, and the local image tool.
pub struct JobContext<P: Platform + ?Sized = OvirtClient> {
    pub config: JobConfig,
    pub platform: Arc<P>,
    pub http: reqwest::Client,
    pub images: Arc<dyn ImageTool>,
}

impl JobContext<OvirtClient> {
    /// Build the oVirt client and `qemu-img` wrapper described by `config`.
    pub fn connect(config: JobConfig) -> Result<Self, JobError> {
        let ovirt = config.ovirt_config();
        info!(url = %ovirt.url, username = %ovirt.username, "Initializing oVirt client");

        let http = build_http_client(ovirt.ca_file.as_deref())?;
        let client =
            OvirtClient::with_http(&ovirt.url, &ovirt.username, &ovirt.password, http.clone())?;

        Ok(Self {
            config,
            platform: Arc::new(client),
            http,
            images: Arc::new(QemuImg::default()),
        })
    }
}

impl<P: Platform + ?Sized> JobContext<P> {
    pub fn new(
        config: JobConfig,
        platform: Arc<P>,
        http: reqwest::Client,
        images: Arc<dyn ImageTool>,
    ) -> Self {
        Self {
            config,
            platform,
            http,
            images,
        }
    }

    pub fn poll(&self) -> PollConfig {
        self.config.poll_config()
    }

    pub fn topology(&self) -> Topology<P> {
        Topology::new(Arc::clone(&self.platform), self.poll())
    }
}
