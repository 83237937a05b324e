//! Provider selection
//!
//! Maps the request's source and destination kinds to implementations once,
//! before any side effect. Kinds the request model accepts but this build
//! has no provider for are reported as [`ProviderError::Unsupported`].

use crate::capabilities::{DiskExposer, Platforms};
use crate::converter::CommandConverter;
use crate::error::{ProviderError, ProviderResult};
use crate::exposer::{FileExposer, NbdkitExposer};
use crate::local::{LocalDestination, LocalInspector, LocalSource};

use convhost_common::{DestinationKind, MigrationRequest, RunnerConfig, SideRequest, SourceKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

fn root_of<K>(side: &SideRequest<K>, label: &str) -> ProviderResult<PathBuf> {
    side.option_str("root")
        .map(PathBuf::from)
        .ok_or_else(|| ProviderError::Platform(format!("request['{label}'] has no 'root'")))
}

/// Pick one implementation of every capability for `request`
pub fn resolve(
    request: &MigrationRequest,
    config: &RunnerConfig,
    work_dir: &Path,
) -> ProviderResult<Platforms> {
    let (source, inspector, exposer) = match request.source.kind {
        SourceKind::Local => {
            let root = root_of(&request.source, "source")?;
            let exposer: Arc<dyn DiskExposer> = match request.source.transport_method.as_str() {
                "file" => Arc::new(FileExposer),
                "nbdkit" => Arc::new(NbdkitExposer::new(config.polling.socket)),
                other => {
                    return Err(ProviderError::Unsupported(format!(
                        "transport method '{other}' for local source"
                    )));
                }
            };
            (
                Arc::new(LocalSource::new(root)),
                Arc::new(LocalInspector::new()),
                exposer,
            )
        }
        SourceKind::Vmware => {
            return Err(ProviderError::Unsupported(format!(
                "source platform '{}'",
                request.source.kind
            )));
        }
    };

    let destination = match request.destination.kind {
        DestinationKind::Local => {
            Arc::new(LocalDestination::open(root_of(&request.destination, "destination")?)?)
        }
        DestinationKind::Ovirt | DestinationKind::Openstack => {
            return Err(ProviderError::Unsupported(format!(
                "destination platform '{}'",
                request.destination.kind
            )));
        }
    };

    info!(
        "Providers: {} ({}) -> {} ({})",
        request.source.kind,
        request.source.transport_method,
        request.destination.kind,
        request.destination.transport_method
    );
    Ok(Platforms {
        source,
        exposer,
        inspector,
        destination,
        converter: Arc::new(CommandConverter::new(config.conversion.clone(), work_dir)),
    })
}
