//! oVirt v4 REST implementation of [`Platform`].
//!
//! The engine speaks JSON, authenticates with HTTP basic auth and encodes
//! most numbers and booleans as strings. Dates are epoch milliseconds.

use crate::transfer::http_error;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use savior_common::chrono::{DateTime, TimeZone, Utc};
use savior_common::{
    Disk, DiskAttachment, DiskFormat, DiskInfo, DiskSource, DiskSpec, DiskStatus, Platform,
    Result, SaviorError, Snapshot, SnapshotRequest, SnapshotStatus, SnapshotType,
    TransferDirection, TransferHandle, TransferPhase, TransferTarget, Vm, VmSpec,
};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};
use url::Url;

/// Connection settings for one oVirt engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvirtConfig {
    /// API root, e.g. `https://engine.example.com/ovirt-engine/api`.
    pub url: String,
    pub username: String,
    pub password: String,
    /// PEM bundle used to verify the engine and the image transfer daemons.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

/// HTTP client trusting `ca_file` in addition to the system roots.
pub fn build_http_client(ca_file: Option<&Path>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(path) = ca_file {
        let pem = std::fs::read(path)?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
            SaviorError::Config(format!("invalid CA bundle {}: {e}", path.display()))
        })?;
        builder = builder.add_root_certificate(cert);
    }
    builder.build().map_err(http_error)
}

pub struct OvirtClient {
    base: Url,
    http: reqwest::Client,
    username: String,
    password: String,
}

impl OvirtClient {
    pub fn new(config: &OvirtConfig) -> Result<Self> {
        let http = build_http_client(config.ca_file.as_deref())?;
        Self::with_http(&config.url, &config.username, &config.password, http)
    }

    pub fn with_http(
        url: &str,
        username: &str,
        password: &str,
        http: reqwest::Client,
    ) -> Result<Self> {
        let base = Url::parse(url.trim_end_matches('/'))
            .map_err(|e| SaviorError::Config(format!("invalid API url {url}: {e}")))?;
        Ok(Self {
            base,
            http,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = Url::parse(&format!("{}/{}", self.base.as_str().trim_end_matches('/'), path))
            .map_err(|e| SaviorError::Config(format!("invalid API path {path}: {e}")))?;
        debug!(%method, %url, "oVirt request");
        Ok(self
            .http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .header("Version", "4"))
    }

    async fn checked(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<Fault>(&body) {
            Ok(fault) => fault.to_string(),
            Err(_) if body.is_empty() => status.to_string(),
            Err(_) => body,
        };
        Err(SaviorError::Platform(format!("{status}: {message}")))
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await.map_err(http_error)?;
        let body = Self::checked(response).await?.bytes().await.map_err(http_error)?;
        serde_json::from_slice(&body).map_err(|e| SaviorError::Serialization(e.to_string()))
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<()> {
        let response = builder.send().await.map_err(http_error)?;
        Self::checked(response).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path)?).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        self.send(self.request(Method::POST, path)?.json(body)).await
    }

    async fn get_disk(&self, disk_id: &str) -> Result<Disk> {
        let wire: DiskWire = self.get(&format!("disks/{disk_id}")).await?;
        wire.into_disk(DiskSource::Plain)
    }
}

#[async_trait]
impl Platform for OvirtClient {
    async fn list_vms(&self, search: Option<&str>) -> Result<Vec<Vm>> {
        let mut builder = self
            .request(Method::GET, "vms")?
            .query(&[("all_content", "true")]);
        if let Some(search) = search {
            builder = builder.query(&[("search", search)]);
        }
        let list: VmList = self.send(builder).await?;
        Ok(list.vm.into_iter().map(Vm::from).collect())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create_vm(&self, spec: &VmSpec) -> Result<Vm> {
        let mut body = json!({
            "name": spec.name,
            "cluster": { "name": spec.cluster },
            "template": { "name": spec.template },
        });
        if let Some(memory) = spec.memory {
            body["memory"] = json!(memory);
        }
        let wire: VmWire = self.post("vms", &body).await?;
        Ok(wire.into())
    }

    async fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>> {
        let list: SnapshotList = self.get(&format!("vms/{vm_id}/snapshots")).await?;
        Ok(list.snapshot.into_iter().map(Snapshot::from).collect())
    }

    #[instrument(skip(self, request), fields(description = %request.description))]
    async fn create_snapshot(&self, vm_id: &str, request: &SnapshotRequest) -> Result<Snapshot> {
        let mut body = json!({
            "description": request.description,
            "persist_memorystate": request.persist_memory,
        });
        if !request.attachments.is_empty() {
            let attachments: Vec<Value> =
                request.attachments.iter().map(attachment_body).collect();
            body["disk_attachments"] = json!({ "disk_attachment": attachments });
        }
        let wire: SnapshotWire = self.post(&format!("vms/{vm_id}/snapshots"), &body).await?;
        Ok(wire.into())
    }

    async fn remove_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<()> {
        let path = format!("vms/{vm_id}/snapshots/{snapshot_id}");
        let builder = self.request(Method::DELETE, &path)?;
        self.send_empty(builder).await
    }

    async fn list_snapshot_disks(&self, vm_id: &str, snapshot_id: &str) -> Result<Vec<Disk>> {
        let list: DiskList = self
            .get(&format!("vms/{vm_id}/snapshots/{snapshot_id}/disks"))
            .await?;
        list.disk
            .into_iter()
            .map(|wire| {
                wire.into_disk(DiskSource::Snapshot {
                    vm_id: vm_id.to_string(),
                    snapshot_id: snapshot_id.to_string(),
                })
            })
            .collect()
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create_disk(&self, vm_id: &str, spec: &DiskSpec) -> Result<Disk> {
        let body = json!({
            "disk": {
                "name": spec.name,
                "description": spec.description,
                "format": spec.format,
                "sparse": spec.sparse,
                "provisioned_size": spec.provisioned_size,
                "initial_size": spec.initial_size,
                "storage_domains": { "storage_domain": [{ "name": spec.storage_domain }] },
            },
            "interface": spec.interface,
            "bootable": spec.bootable,
            "active": true,
        });
        let attachment: AttachmentWire =
            self.post(&format!("vms/{vm_id}/diskattachments"), &body).await?;
        let disk_id = attachment
            .disk
            .map(|disk| disk.id)
            .or(attachment.id)
            .ok_or_else(|| SaviorError::Platform("disk attachment without disk id".to_string()))?;
        self.get_disk(&disk_id).await
    }

    async fn disk_status(&self, disk: &Disk) -> Result<DiskStatus> {
        let refreshed = match &disk.source {
            DiskSource::Plain => self.get_disk(disk.id()).await?,
            DiskSource::Snapshot { vm_id, snapshot_id } => {
                let wire: DiskWire = self
                    .get(&format!(
                        "vms/{vm_id}/snapshots/{snapshot_id}/disks/{}",
                        disk.id()
                    ))
                    .await?;
                wire.into_disk(disk.source.clone())?
            }
        };
        Ok(refreshed.status())
    }

    #[instrument(skip(self))]
    async fn open_transfer(
        &self,
        target: &TransferTarget,
        direction: TransferDirection,
    ) -> Result<TransferHandle> {
        let body = match target {
            TransferTarget::Disk { disk_id } => {
                json!({ "disk": { "id": disk_id }, "direction": direction })
            }
            TransferTarget::SnapshotDisk { image_id } => {
                json!({ "snapshot": { "id": image_id }, "direction": direction })
            }
        };
        let wire: TransferWire = self.post("imagetransfers", &body).await?;
        Ok(wire.into())
    }

    async fn get_transfer(&self, transfer_id: &str) -> Result<TransferHandle> {
        let wire: TransferWire = self.get(&format!("imagetransfers/{transfer_id}")).await?;
        Ok(wire.into())
    }

    async fn finalize_transfer(&self, transfer_id: &str) -> Result<()> {
        let builder = self
            .request(Method::POST, &format!("imagetransfers/{transfer_id}/finalize"))?
            .json(&json!({}));
        self.send_empty(builder).await
    }

    async fn list_transfers(&self) -> Result<Vec<TransferHandle>> {
        let list: TransferList = self.get("imagetransfers").await?;
        Ok(list.image_transfer.into_iter().map(TransferHandle::from).collect())
    }
}

fn attachment_body(attachment: &DiskAttachment) -> Value {
    match attachment {
        DiskAttachment::Existing { disk_id } => json!({ "disk": { "id": disk_id } }),
        DiskAttachment::Delta {
            disk_id,
            name,
            provisioned_size,
            actual_size,
            format,
            sparse,
        } => json!({
            "disk": {
                "id": disk_id,
                "name": name,
                "provisioned_size": provisioned_size,
                "actual_size": actual_size,
                "format": format,
                "sparse": sparse,
            }
        }),
    }
}

#[derive(Debug, Deserialize)]
struct Fault {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.reason, &self.detail) {
            (Some(reason), Some(detail)) => write!(f, "{reason} {detail}"),
            (Some(text), None) | (None, Some(text)) => f.write_str(text),
            (None, None) => f.write_str("unknown fault"),
        }
    }
}

/// A JSON scalar the engine may send either natively or as a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Bool(bool),
    Text(String),
}

fn de_opt_u64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error> {
    use serde::de::Error;
    match Option::<Scalar>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Scalar::Int(n)) => u64::try_from(n).map(Some).map_err(D::Error::custom),
        Some(Scalar::Text(s)) => s.parse().map(Some).map_err(D::Error::custom),
        Some(Scalar::Bool(b)) => Err(D::Error::custom(format!("expected number, got {b}"))),
    }
}

fn de_opt_bool<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<bool>, D::Error> {
    use serde::de::Error;
    match Option::<Scalar>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Scalar::Bool(b)) => Ok(Some(b)),
        Some(Scalar::Text(s)) => s.parse().map(Some).map_err(D::Error::custom),
        Some(Scalar::Int(n)) => Ok(Some(n != 0)),
    }
}

fn de_opt_date<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
    use serde::de::Error;
    let millis = match Option::<Scalar>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Scalar::Int(n)) => n,
        Some(Scalar::Text(s)) => match s.parse::<i64>() {
            Ok(n) => n,
            Err(_) => {
                return DateTime::parse_from_rfc3339(&s)
                    .map(|date| Some(date.with_timezone(&Utc)))
                    .map_err(D::Error::custom)
            }
        },
        Some(Scalar::Bool(b)) => return Err(D::Error::custom(format!("expected date, got {b}"))),
    };
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(Some)
        .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {millis}")))
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct VmList {
    #[serde(default)]
    vm: Vec<VmWire>,
}

#[derive(Debug, Deserialize)]
struct VmWire {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default, deserialize_with = "de_opt_u64")]
    memory: Option<u64>,
    #[serde(default)]
    cpu: Option<CpuWire>,
}

#[derive(Debug, Deserialize)]
struct CpuWire {
    #[serde(default)]
    architecture: Option<String>,
}

impl From<VmWire> for Vm {
    fn from(wire: VmWire) -> Self {
        Vm {
            id: wire.id,
            name: wire.name,
            cpu_architecture: wire.cpu.and_then(|cpu| cpu.architecture),
            memory: wire.memory.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotList {
    #[serde(default)]
    snapshot: Vec<SnapshotWire>,
}

#[derive(Debug, Deserialize)]
struct SnapshotWire {
    id: String,
    #[serde(default)]
    description: String,
    #[serde(default, deserialize_with = "de_opt_date")]
    date: Option<DateTime<Utc>>,
    #[serde(default)]
    snapshot_type: Option<SnapshotType>,
    #[serde(default)]
    snapshot_status: Option<SnapshotStatus>,
}

impl From<SnapshotWire> for Snapshot {
    /// A snapshot without a date sorts before every dated one.
    fn from(wire: SnapshotWire) -> Self {
        let snapshot_type = wire.snapshot_type.unwrap_or(SnapshotType::Regular);
        let date = wire.date.unwrap_or_else(|| {
            if snapshot_type != SnapshotType::Active {
                warn!(snapshot_id = %wire.id, "Snapshot has no date, ordering it first");
            }
            DateTime::<Utc>::MIN_UTC
        });
        Snapshot {
            id: wire.id,
            description: wire.description,
            date,
            snapshot_type,
            status: wire.snapshot_status.unwrap_or(SnapshotStatus::Locked),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DiskList {
    #[serde(default)]
    disk: Vec<DiskWire>,
}

#[derive(Debug, Deserialize)]
struct DiskWire {
    id: String,
    #[serde(default)]
    image_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    format: Option<DiskFormat>,
    #[serde(default, deserialize_with = "de_opt_bool")]
    sparse: Option<bool>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    provisioned_size: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    actual_size: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    initial_size: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    total_size: Option<u64>,
    #[serde(default)]
    interface: Option<String>,
    #[serde(default)]
    status: Option<DiskStatus>,
}

impl DiskWire {
    fn into_disk(self, source: DiskSource) -> Result<Disk> {
        let image_id = self.image_id.ok_or_else(|| {
            SaviorError::Platform(format!("disk {} reported without image id", self.id))
        })?;
        Ok(Disk {
            info: DiskInfo {
                name: self.name.unwrap_or_else(|| self.id.clone()),
                id: self.id,
                image_id,
                description: self.description,
                format: self.format.unwrap_or(DiskFormat::Cow),
                sparse: self.sparse.unwrap_or(true),
                provisioned_size: self.provisioned_size.unwrap_or_default(),
                actual_size: self.actual_size.unwrap_or_default(),
                initial_size: self.initial_size,
                interface: self.interface,
                total_size: self.total_size,
                status: self.status.unwrap_or(DiskStatus::Locked),
            },
            source,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AttachmentWire {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    disk: Option<IdRef>,
}

#[derive(Debug, Default, Deserialize)]
struct TransferList {
    #[serde(default)]
    image_transfer: Vec<TransferWire>,
}

#[derive(Debug, Deserialize)]
struct TransferWire {
    id: String,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    transfer_url: Option<String>,
    #[serde(default)]
    proxy_url: Option<String>,
}

impl From<TransferWire> for TransferHandle {
    fn from(wire: TransferWire) -> Self {
        TransferHandle {
            id: wire.id,
            url: wire.transfer_url.or(wire.proxy_url),
            phase: wire
                .phase
                .as_deref()
                .map(TransferPhase::from_platform)
                .unwrap_or(TransferPhase::Initializing),
        }
    }
}
