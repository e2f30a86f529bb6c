use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use md5::{Digest, Md5};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConfigContext;
use crate::domain::RunDescriptor;
use crate::error::UploadError;

pub const DEFAULT_BARCODE_KIT: &str = "SQK-NBD112-96";
pub const FALLBACK_FLOWCELL: &str = "FLO-MIN114";
pub const FALLBACK_KIT: &str = "SQK-RBK114-96";
const LIGATION_KIT_PREFIX: &str = "SQK-LSK";
const SEQUENCING_PROTOCOL_PREFIX: &str = "sequencing/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionInfo {
    pub device_id: String,
    // sequencing/<script>:<flowcell>:<kit>
    pub protocol_id: String,
    pub output_path: PathBuf,
    pub run_id: String,
    pub protocol_group_id: String,
}

pub trait InstrumentSource: Send + Sync {
    fn positions(&self) -> Result<Vec<Result<PositionInfo, UploadError>>, UploadError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoInstrument;

impl InstrumentSource for NoInstrument {
    fn positions(&self) -> Result<Vec<Result<PositionInfo, UploadError>>, UploadError> {
        Err(UploadError::Instrument(
            "no instrument API configured".to_string(),
        ))
    }
}

pub struct RunResolver<S: InstrumentSource> {
    source: S,
    context: Arc<ConfigContext>,
    cache: HashMap<PathBuf, RunDescriptor>,
}

impl<S: InstrumentSource> RunResolver<S> {
    pub fn new(source: S, context: Arc<ConfigContext>) -> Self {
        Self {
            source,
            context,
            cache: HashMap::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn cached_runs(&self) -> usize {
        self.cache.len()
    }

    pub fn resolve(&mut self, path: &Path) -> Option<RunDescriptor> {
        let run_dir = normalize(path.parent()?.parent()?);
        self.lookup(run_dir, path)
    }

    pub fn resolve_directory(&mut self, dir: &Path) -> Option<RunDescriptor> {
        // Give the fallback the same view as a file two levels down.
        let nested = dir.join("_").join("_");
        self.lookup(normalize(dir), &nested)
    }

    pub fn refresh(&mut self) -> Result<(), UploadError> {
        let config = self.context.current();
        let allow_list = config.local.sequencer_allow_list();
        let default_kit = config.local.default_kit.as_deref();
        let owner = config.cloud.user.as_str();

        let mut cache = HashMap::new();
        for position in self.source.positions()? {
            let info = match position {
                Ok(info) => info,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable sequencer position");
                    continue;
                }
            };
            let allowed = allow_list
                .as_ref()
                .map(|list| list.iter().any(|device| *device == info.device_id))
                .unwrap_or(true);
            if !allowed || !info.protocol_id.starts_with(SEQUENCING_PROTOCOL_PREFIX) {
                continue;
            }
            match descriptor_from_position(&info, owner, default_kit) {
                Ok(descriptor) => {
                    cache.insert(normalize(&info.output_path), descriptor);
                }
                Err(err) => {
                    warn!(device = %info.device_id, error = %err, "error parsing run info");
                }
            }
        }
        debug!(runs = cache.len(), "sequencer positions refreshed");
        self.cache = cache;
        Ok(())
    }

    fn lookup(&mut self, run_dir: PathBuf, path: &Path) -> Option<RunDescriptor> {
        if let Some(descriptor) = self.cache.get(&run_dir) {
            return Some(descriptor.clone());
        }
        if let Err(err) = self.refresh() {
            warn!(error = %err, "updating sequencer position info failed, using path-derived run");
            let owner = self.context.current().cloud.user.clone();
            return Some(fallback_descriptor(path, &owner));
        }
        self.cache.get(&run_dir).cloned()
    }
}

pub fn descriptor_from_position(
    info: &PositionInfo,
    owner: &str,
    default_kit: Option<&str>,
) -> Result<RunDescriptor, UploadError> {
    let mut fields = info.protocol_id.split(':').skip(1);
    let flowcell = fields.next().filter(|value| !value.is_empty());
    let kit = fields.next().filter(|value| !value.is_empty());
    let (Some(flowcell), Some(kit)) = (flowcell, kit) else {
        return Err(UploadError::Instrument(format!(
            "protocol id without flowcell and kit: {}",
            info.protocol_id
        )));
    };
    Ok(RunDescriptor {
        owner: owner.to_string(),
        id: info.run_id.parse()?,
        name: info.protocol_group_id.clone(),
        flowcell: flowcell.to_string(),
        kit: kit.to_string(),
        barcode_kit: guess_barcode_kit(kit, default_kit),
    })
}

pub fn guess_barcode_kit(kit: &str, default_kit: Option<&str>) -> String {
    if kit.starts_with(LIGATION_KIT_PREFIX) {
        return default_kit.unwrap_or(DEFAULT_BARCODE_KIT).to_string();
    }
    kit.to_string()
}

pub fn fallback_descriptor(path: &Path, owner: &str) -> RunDescriptor {
    let run_name = path
        .ancestors()
        .nth(4)
        .and_then(|dir| dir.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let digest = Md5::digest(run_name.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);
    RunDescriptor {
        owner: owner.to_string(),
        id: Uuid::from_bytes(bytes).into(),
        name: run_name,
        flowcell: FALLBACK_FLOWCELL.to_string(),
        kit: FALLBACK_KIT.to_string(),
        barcode_kit: FALLBACK_KIT.to_string(),
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}
