//! Migration state machine
//!
//! ```text
//! Preparing → Inspecting → Provisioning → Syncing ⟲ → CuttingOver → Converting → Finalizing
//!                                                                                    ↓
//!                                                              Succeeded | Failed (any error)
//! ```
//!
//! Syncing repeats rounds (one pass per disk) until the cutover sentinel
//! appears, then runs exactly one more round. Snapshots taken for
//! inspection or for a round are always released, whatever the outcome.
//! Every terminal path ends with one final checkpoint write.

use crate::context::{RunContext, TIMESTAMP_FORMAT};
use crate::error::{MigrationError, MigrationResult};
use crate::poll::{wait_for, wait_until};
use crate::signals::{CutoverSignal, LimitsFile};

use convhost_common::{
    DestinationDisk, DiskMapping, HardwareDescriptor, MigrationRequest, NicSpec,
    OperatingSystemDescriptor, RunnerConfig, VmSpec,
};
use convhost_provider::{Platforms, ProviderResult, SessionOptions, SnapshotRef, FROM_CREATION};
use convhost_sync::{
    CheckpointStore, DiskSyncEngine, MigrationState, Phase, SyncPass, Throttling, TokenBucket,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Snapshot taken while the guest is inspected
pub const INSPECTION_SNAPSHOT: &str = "inspection";

pub struct MigrationController {
    request: MigrationRequest,
    config: RunnerConfig,
    ctx: RunContext,
    platforms: Platforms,
    state: MigrationState,
    checkpoint: CheckpointStore,
    mappings: Vec<DiskMapping>,
    throttle: Option<Arc<TokenBucket>>,
}

impl MigrationController {
    /// Preparing: initialize the state and persist it at the run's state path
    pub fn prepare(
        request: MigrationRequest,
        config: RunnerConfig,
        ctx: RunContext,
        platforms: Platforms,
    ) -> MigrationResult<Self> {
        Self::resolve_and_prepare(request, config, ctx, move |_, _, _| Ok(platforms))
    }

    /// Preparing with provider resolution. The initial state is persisted
    /// before `resolve` runs, so a resolution failure is recorded in it like
    /// any later failure.
    pub fn resolve_and_prepare<F>(
        request: MigrationRequest,
        config: RunnerConfig,
        ctx: RunContext,
        resolve: F,
    ) -> MigrationResult<Self>
    where
        F: FnOnce(&MigrationRequest, &RunnerConfig, &Path) -> ProviderResult<Platforms>,
    {
        let checkpoint = CheckpointStore::new(ctx.state_path());
        let mut state = MigrationState::new();
        checkpoint.write(&state)?;
        info!("State file: {}", checkpoint.path().display());
        info!("Cutover file: {}", ctx.cutover_path().display());
        info!("Limits file: {}", ctx.limits_path().display());

        let platforms = match resolve(&request, &config, ctx.work_dir()) {
            Ok(platforms) => platforms,
            Err(e) => {
                let e = MigrationError::from(e);
                record_failure(&mut state, &request.vm_name, &e);
                if let Err(write) = checkpoint.write(&state) {
                    warn!("Final checkpoint write failed: {write}");
                }
                return Err(e);
            }
        };

        Ok(Self {
            request,
            config,
            ctx,
            platforms,
            state,
            checkpoint,
            mappings: Vec::new(),
            throttle: None,
        })
    }

    pub fn state(&self) -> &MigrationState {
        &self.state
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn mappings(&self) -> &[DiskMapping] {
        &self.mappings
    }

    /// Drive the migration to a terminal state; returns the destination VM id
    pub async fn run(&mut self) -> MigrationResult<String> {
        let result = self.execute().await;

        if let Err(e) = &result {
            record_failure(&mut self.state, &self.request.vm_name, e);
            let orphans: Vec<&str> = self
                .mappings
                .iter()
                .filter_map(|m| m.destination.id.as_deref())
                .collect();
            if !orphans.is_empty() {
                warn!("Destination disks left behind: {}", orphans.join(", "));
            }
        }

        match (result, self.checkpoint.persist(&self.state).await) {
            (Ok(vm_id), Ok(())) => Ok(vm_id),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(write)) => {
                warn!("Final checkpoint write failed: {write}");
                Err(e)
            }
        }
    }

    async fn execute(&mut self) -> MigrationResult<String> {
        self.enter(Phase::Inspecting).await?;
        let hardware = self.inspect_source().await?;
        let os = self.inspect_guest(&hardware).await?;

        self.enter(Phase::Provisioning).await?;
        let nics = self.map_resources(&hardware)?;
        self.provision(&hardware).await?;

        self.enter(Phase::Syncing).await?;
        self.sync_until_cutover().await?;

        self.enter(Phase::CuttingOver).await?;
        self.detach_all().await?;

        self.enter(Phase::Converting).await?;
        let spec = self.vm_spec(&hardware, nics, os)?;
        self.convert(&spec).await?;

        self.enter(Phase::Finalizing).await?;
        self.finalize(&spec).await
    }

    async fn enter(&mut self, phase: Phase) -> MigrationResult<()> {
        self.state.set_phase(phase)?;
        self.checkpoint.persist(&self.state).await?;
        info!("Phase: {phase:?}");
        Ok(())
    }

    // ── Inspecting ────────────────────────────────────────────────────────────

    async fn inspect_source(&self) -> MigrationResult<HardwareDescriptor> {
        let vm = self.request.vm_uuid.as_str();
        let source = &self.platforms.source;

        source.enable_change_tracking(vm).await?;
        let hardware = source.inspect_hardware(vm).await?;
        debug!("Source VM hardware: {hardware:?}");

        if hardware.metadata.has_snapshots {
            if self.config.policy.remove_existing_snapshots {
                info!("Removing existing snapshots of {vm}");
                source.remove_all_snapshots(vm).await?;
            } else {
                warn!("Source VM {vm} already has snapshots");
            }
        }
        Ok(hardware)
    }

    async fn inspect_guest(&self, hardware: &HardwareDescriptor) -> MigrationResult<OperatingSystemDescriptor> {
        let vm = self.request.vm_uuid.as_str();
        let source = &self.platforms.source;

        let snapshot = source.create_snapshot(vm, INSPECTION_SNAPSHOT).await?;
        let inspected = self
            .platforms
            .inspector
            .inspect_operating_system(hardware, &snapshot)
            .await;
        let released = source.remove_snapshot(vm, INSPECTION_SNAPSHOT).await;

        match (inspected, released) {
            (Ok(os), Ok(())) => Ok(os),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), released) => {
                if let Err(r) = released {
                    warn!("Removing snapshot '{INSPECTION_SNAPSHOT}' failed: {r}");
                }
                Err(e.into())
            }
        }
    }

    // ── Provisioning ──────────────────────────────────────────────────────────

    /// Check every storage and network has a mapping; returns the NICs to
    /// create on the destination
    fn map_resources(&self, hardware: &HardwareDescriptor) -> MigrationResult<Vec<NicSpec>> {
        let mappings = &self.request.mappings;
        let mut missing = BTreeSet::new();

        for disk in &hardware.disks {
            if !mappings.storage.contains_key(&disk.storage_name) {
                missing.insert(format!("No storage mapping for '{}'", disk.storage_name));
            }
        }
        let mut nics = Vec::with_capacity(hardware.nics.len());
        for (index, nic) in hardware.nics.iter().enumerate() {
            match mappings.network.get(&nic.network) {
                Some(network) => nics.push(NicSpec {
                    name: format!("nic{index}"),
                    mac_address: nic.mac_address.clone(),
                    network: network.clone(),
                }),
                None => {
                    missing.insert(format!("No network mapping for '{}'", nic.network));
                }
            }
        }

        if missing.is_empty() {
            Ok(nics)
        } else {
            Err(MigrationError::Configuration(
                missing.into_iter().collect::<Vec<_>>().join("; "),
            ))
        }
    }

    async fn provision(&mut self, hardware: &HardwareDescriptor) -> MigrationResult<()> {
        let destination = Arc::clone(&self.platforms.destination);
        let host = self.request.conversion_host_uuid.clone();
        let budget = self.config.polling.provision;

        for (index, disk) in hardware.disks.iter().enumerate() {
            let (format, sparse) = destination.best_fit_disk_format(disk);
            let mut spec = DestinationDisk {
                id: None,
                name: format!("{}_Disk{}", self.request.vm_name, index + 1),
                storage_name: self.request.mappings.storage[&disk.storage_name].clone(),
                size: disk.size,
                format,
                sparse,
                local_path: None,
            };
            let id = destination.create_disk(&spec).await?;
            spec.id = Some(id.clone());
            self.mappings.push(DiskMapping {
                source: disk.clone(),
                destination: spec,
            });

            let dest = &destination;
            let disk_id = id.as_str();
            wait_until(&format!("disk {id} to become ready"), budget, move || {
                dest.disk_ready(disk_id)
            })
            .await?;
            info!("Disk {} ({id}) created for source disk {}", self.mappings[index].destination.name, disk.id);
        }

        for mapping in &self.mappings {
            if let Some(id) = &mapping.destination.id {
                destination.attach_disk(&host, id).await?;
            }
        }
        info!("Attached {} disk(s) to conversion host {host}", self.mappings.len());

        for index in 0..self.mappings.len() {
            let Some(id) = self.mappings[index].destination.id.clone() else {
                continue;
            };
            let dest = &destination;
            let (host, disk_id) = (host.as_str(), id.as_str());
            let path = wait_for(&format!("local path of disk {id}"), budget, move || {
                dest.local_device_path(host, disk_id)
            })
            .await?;
            debug!("Disk {id} is visible at {}", path.display());

            let mapping = &mut self.mappings[index];
            mapping.destination.local_path = Some(path);
            self.state.track_disk(&mapping.source.id, &mapping.source.path)?;
        }

        self.state.set_disk_count(self.mappings.len())?;
        self.checkpoint.persist(&self.state).await?;
        Ok(())
    }

    // ── Syncing ───────────────────────────────────────────────────────────────

    async fn sync_until_cutover(&mut self) -> MigrationResult<()> {
        let cutover = CutoverSignal::new(self.ctx.cutover_path());
        let limits = LimitsFile::new(self.ctx.limits_path());
        let mut round = 0usize;
        let mut last = false;

        loop {
            self.apply_limits(&limits).await?;
            info!("Sync round {round}{}", if last { " (final)" } else { "" });
            self.sync_round().await?;
            if last {
                return Ok(());
            }

            if cutover.is_requested() {
                info!("Cutover is requested, performing last sync");
                last = true;
            } else {
                tokio::time::sleep(self.config.sync.interval()).await;
            }
            round += 1;
        }
    }

    async fn apply_limits(&mut self, limits: &LimitsFile) -> MigrationResult<()> {
        let throttling: Throttling = match limits.read() {
            Ok(Some(throttling)) => throttling,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Ignoring limits file: {e}");
                return Ok(());
            }
        };
        if throttling == self.state.throttling() {
            return Ok(());
        }

        info!(
            "Applying limits: cpu={:?} network={:?} B/s",
            throttling.cpu, throttling.network
        );
        self.throttle = throttling
            .network
            .map(|rate| Arc::new(TokenBucket::per_second(rate)));
        self.state.set_throttling(throttling)?;
        self.checkpoint.persist(&self.state).await?;
        Ok(())
    }

    async fn sync_round(&mut self) -> MigrationResult<()> {
        let vm = self.request.vm_uuid.clone();
        let source = Arc::clone(&self.platforms.source);
        let name = format!("conversion-{}", chrono::Utc::now().format(TIMESTAMP_FORMAT));

        let snapshot = source.create_snapshot(&vm, &name).await?;
        let synced = self.sync_disks(&snapshot).await;
        let released = source.remove_snapshot(&vm, &name).await;

        match (synced, released) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => Err(e.into()),
            (Err(e), released) => {
                if let Err(r) = released {
                    warn!("Removing snapshot '{name}' failed: {r}");
                }
                Err(e)
            }
        }
    }

    async fn sync_disks(&mut self, snapshot: &SnapshotRef) -> MigrationResult<()> {
        let vm = self.request.vm_uuid.as_str();
        let engine = DiskSyncEngine::new(&self.config.sync).with_throttle(self.throttle.clone());
        let options = SessionOptions {
            socket_dir: self.ctx.nbd_dir(),
            read_only: true,
        };

        for mapping in &self.mappings {
            let disk = &mapping.source;
            let local_path = mapping.destination.local_path.as_deref().ok_or_else(|| {
                MigrationError::Configuration(format!("disk {} has no local path", disk.id))
            })?;
            let since = self
                .state
                .disk(&disk.id)
                .and_then(|d| d.last_change_id())
                .unwrap_or(FROM_CREATION)
                .to_string();

            let extents = self
                .platforms
                .source
                .query_changed_extents(vm, snapshot, disk, &since)
                .await?;
            let transport = self.platforms.exposer.expose_disk(disk, snapshot, &options).await?;
            let change_id = snapshot.change_id(&disk.id);

            let pass = SyncPass {
                disk_id: &disk.id,
                destination: local_path,
                extents: &extents,
                change_id,
            };
            let summary = engine
                .run_pass(&mut self.state, &self.checkpoint, pass, transport)
                .await?;
            info!(
                "Disk {}: pass {} copied {} of {} B since '{since}'",
                disk.id, summary.attempt, summary.copied, summary.to_copy
            );
        }
        Ok(())
    }

    // ── Cutover, conversion, finalization ─────────────────────────────────────

    async fn detach_all(&self) -> MigrationResult<()> {
        let destination = &self.platforms.destination;
        let host = self.request.conversion_host_uuid.as_str();
        let ids: Vec<&str> = self
            .mappings
            .iter()
            .filter_map(|m| m.destination.id.as_deref())
            .collect();

        for id in &ids {
            destination.detach_disk(host, id).await?;
        }
        for id in ids {
            wait_until(
                &format!("detach of disk {id}"),
                self.config.polling.detach,
                move || async move { destination.attachment_active(host, id).await.map(|active| !active) },
            )
            .await?;
        }
        info!("Detached {} disk(s) from conversion host {host}", self.mappings.len());
        Ok(())
    }

    fn vm_spec(
        &self,
        hardware: &HardwareDescriptor,
        nics: Vec<NicSpec>,
        os: OperatingSystemDescriptor,
    ) -> MigrationResult<VmSpec> {
        let mut disks = Vec::with_capacity(self.mappings.len());
        let mut disk_paths = Vec::with_capacity(self.mappings.len());
        for mapping in &self.mappings {
            let missing = || {
                MigrationError::Configuration(format!(
                    "destination disk for {} was not provisioned",
                    mapping.source.id
                ))
            };
            disks.push(mapping.destination.id.clone().ok_or_else(missing)?);
            disk_paths.push(mapping.destination.local_path.clone().ok_or_else(missing)?);
        }

        Ok(VmSpec {
            name: self.request.vm_name.clone(),
            cpu: hardware.cpu,
            memory: hardware.memory,
            disks,
            disk_paths,
            nics,
            operating_system: Some(os),
        })
    }

    async fn convert(&mut self, spec: &VmSpec) -> MigrationResult<()> {
        info!("Starting conversion of {}", spec.name);
        let mut job = self.platforms.converter.start(spec).await?;
        self.state.set_pid(job.pid())?;
        self.checkpoint.persist(&self.state).await?;

        let status = job.wait().await?;
        if status != 0 {
            return Err(MigrationError::Conversion { status });
        }
        info!("Conversion of {} completed", spec.name);
        Ok(())
    }

    async fn finalize(&mut self, spec: &VmSpec) -> MigrationResult<String> {
        let destination = &self.platforms.destination;
        let vm_id = destination.create_vm(spec).await?;
        for nic in &spec.nics {
            destination.add_nic(&vm_id, nic).await?;
        }
        self.state.set_vm_id(vm_id.clone())?;
        self.state.mark_succeeded()?;
        info!("Migration of {} succeeded: VM {vm_id}", spec.name);
        Ok(vm_id)
    }
}

fn record_failure(state: &mut MigrationState, vm_name: &str, e: &MigrationError) {
    error!("Migration of {vm_name} failed: {e}");
    if let Err(mark) = state.mark_failed(e.to_string()) {
        warn!("Could not record failure: {mark}");
    }
}
