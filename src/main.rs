//! sylved - control plane for a single-node FreeBSD hypervisor appliance
//!
//! Wires the node's TOML config into an `Orchestrator`, a guest store,
//! and the replication transport/scheduler, and dispatches the CLI
//! verbs onto them. The HTTP/REST facade, auth, and the embedded SQL
//! store are a separate, out-of-scope process; this binary is the
//! administrative surface an operator drives directly on the box.

mod cli;
mod config;
mod console;
mod error;
mod guest;
mod hooks;
mod jail;
mod netobj;
mod network;
mod orchestrator;
mod replication;
mod snapshot;
mod store;
mod vm;
mod zfs;

use cli::{BackupAction, Cli, Commands, GuestAction, ReplicateAction, SnapshotAction};
use config::NodeConfig;
use error::{Error, Result};
use guest::{Guest, GuestVariant};
use orchestrator::Orchestrator;
use replication::lease::{GuestKind, Lease, LeaseLookup};
use replication::protocol::{Action, Request, PROTOCOL_VERSION};
use replication::scheduler::{BackupJob, ClusterInfo, JobKind, JobStore, Replicator, Scheduler};
use replication::transport::{
    build_client_config, build_server_config, connect, pull_dataset_from_node,
    replicate_dataset_to_node, resolve_peer, serve_connection, simple_request, PeerDirectory,
    TlsPaths, TokenVerifier,
};
use snapshot::{GuestKindTag, SnapshotStore};
use store::{FileBackedSnapshotStore, FileBackedStore, GuestResolver, NaiveResolver, SqlStore};
use zfs::ZfsGateway;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    let config = config::load(&cli.config)?;
    let data_dir = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let ctx = Context::build(config, data_dir)?;

    match cli.command {
        Commands::Completion { .. } => unreachable!("handled above"),
        Commands::Guest { action } => run_guest_action(&ctx, action),
        Commands::Snapshot { action } => run_snapshot_action(&ctx, action),
        Commands::Backup { action } => run_backup_action(&ctx, action),
        Commands::Console { rid, user } => run_console(&ctx, rid, &user),
        Commands::Replicate { action } => run_replicate_action(&ctx, action),
        Commands::Serve => run_serve(ctx),
    }
}

/// Everything a command needs, built once from the loaded config. The
/// standalone `SqlStore`/`GuestResolver`/`ClusterInfo`/`LeaseLookup`
/// implementations stand in for the out-of-scope SQL store and
/// consensus layer when this node isn't joined to a cluster.
struct Context {
    config: NodeConfig,
    jails_root: PathBuf,
    zfs: Arc<ZfsGateway>,
    store: Arc<dyn SqlStore>,
    orchestrator: Arc<Orchestrator>,
    snapshots_path: PathBuf,
    backup_jobs_path: PathBuf,
    cluster: Arc<StandaloneCluster>,
}

impl Context {
    fn build(config: NodeConfig, data_dir: PathBuf) -> Result<Self> {
        let zfs = Arc::new(ZfsGateway::new(config.storage.pool.clone()));
        let store: Arc<dyn SqlStore> =
            Arc::new(FileBackedStore::open(data_dir.join("guests.json"))?);
        let resolver: Arc<dyn GuestResolver> = Arc::new(NaiveResolver::new(
            crate::netobj::NetworkObjectStore::new(),
        ));
        let cluster = Arc::new(StandaloneCluster {
            node_id: config.node.node_id.clone(),
        });
        let lease_lookup: Arc<dyn LeaseLookup> = Arc::new(NoReplicationPolicy);

        let orchestrator = Arc::new(Orchestrator::new(
            config.storage.jails_root.clone(),
            zfs.clone(),
            resolver,
            lease_lookup,
            store.clone(),
            config.node.node_id.clone(),
            config.rate_limit.host_command_capacity,
            config.rate_limit.host_command_refill_rate,
        ));

        Ok(Self {
            jails_root: config.storage.jails_root.clone(),
            snapshots_path: data_dir.join("snapshots.json"),
            backup_jobs_path: data_dir.join("backup-jobs.json"),
            zfs,
            store,
            orchestrator,
            cluster,
            config,
        })
    }

    fn guest_kind_tag(&self, guest: &Guest) -> GuestKindTag {
        if guest.is_vm() {
            GuestKindTag::Vm
        } else {
            GuestKindTag::Jail
        }
    }

    fn snapshot_store(&self) -> Result<FileBackedSnapshotStore> {
        FileBackedSnapshotStore::open(&self.snapshots_path)
    }
}

/// Single-node standalone `ClusterInfo`: this node is always the
/// leader of its own cluster of one.
struct StandaloneCluster {
    node_id: String,
}

impl ClusterInfo for StandaloneCluster {
    fn is_leader(&self) -> bool {
        true
    }

    fn local_node_id(&self) -> String {
        self.node_id.clone()
    }
}

/// No replication policies are configured without a cluster SQL store
/// wired up, so every guest is free to start locally.
struct NoReplicationPolicy;

impl LeaseLookup for NoReplicationPolicy {
    fn policy_enabled(&self, _kind: GuestKind, _guest_id: u64) -> bool {
        false
    }

    fn current_lease(&self, _kind: GuestKind, _guest_id: u64) -> Option<Lease> {
        None
    }
}

/// Accepts a bearer token equal to the node's configured cluster token.
struct StaticTokenVerifier {
    token: String,
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> bool {
        !token.is_empty() && token == self.token
    }
}

/// Peers are always addressed as literal `<host>:<port>` on a
/// standalone node; there is no cluster directory to consult.
struct NoPeerDirectory;

impl PeerDirectory for NoPeerDirectory {
    fn resolve(&self, _node_identifier: &str) -> Option<SocketAddr> {
        None
    }
}

fn run_guest_action(ctx: &Context, action: GuestAction) -> Result<()> {
    match action {
        GuestAction::Up { rid, all } => {
            if all {
                let guests = ctx.store.list_guests()?;
                for guest in orchestrator::boot_order(&guests) {
                    ctx.orchestrator.start(guest)?;
                }
            } else {
                let rid = rid
                    .ok_or_else(|| Error::Validation("guest up requires a rid or --all".into()))?;
                let guest = ctx.store.load_guest(rid)?;
                ctx.orchestrator.start(&guest)?;
            }
            Ok(())
        }
        GuestAction::Down { rid, all } => {
            if all {
                let guests = ctx.store.list_guests()?;
                for guest in orchestrator::stop_order(&guests) {
                    ctx.orchestrator.stop(guest)?;
                }
            } else {
                let rid = rid.ok_or_else(|| {
                    Error::Validation("guest down requires a rid or --all".into())
                })?;
                let guest = ctx.store.load_guest(rid)?;
                ctx.orchestrator.stop(&guest)?;
            }
            Ok(())
        }
        GuestAction::Restart { rid } => {
            let guest = ctx.store.load_guest(rid)?;
            ctx.orchestrator.restart(&guest)
        }
        GuestAction::Ps { json } => {
            let guests = ctx.store.list_guests()?;
            let rows = ctx.orchestrator.ps(&guests)?;
            if json {
                let printable: Vec<_> = rows
                    .iter()
                    .map(|(g, running)| {
                        serde_json::json!({
                            "ctid": g.ctid,
                            "name": g.name,
                            "kind": if g.is_vm() { "vm" } else { "jail" },
                            "running": running,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&printable)?);
            } else {
                println!("{:<8} {:<20} {:<6} {}", "CTID", "NAME", "KIND", "STATE");
                for (g, running) in rows {
                    let kind = if g.is_vm() { "vm" } else { "jail" };
                    let state = if running { "running" } else { "stopped" };
                    println!("{:<8} {:<20} {:<6} {}", g.ctid, g.name, kind, state);
                }
            }
            Ok(())
        }
    }
}

fn run_snapshot_action(ctx: &Context, action: SnapshotAction) -> Result<()> {
    let mut store = ctx.snapshot_store()?;
    match action {
        SnapshotAction::Create {
            rid,
            name,
            description,
        } => {
            let guest = ctx.store.load_guest(rid)?;
            let kind = ctx.guest_kind_tag(&guest);
            let record = snapshot::create_snapshot(
                &ctx.zfs,
                kind,
                &guest,
                &ctx.jails_root,
                &name,
                &description,
                &mut store,
            )?;
            println!("created snapshot {} (id {})", record.snapshot_name, record.id);
            Ok(())
        }
        SnapshotAction::Rollback {
            rid,
            snapshot,
            force,
        } => {
            let mut guest = ctx.store.load_guest(rid)?;
            let kind = ctx.guest_kind_tag(&guest);
            let snapshot_id = snapshot
                .parse::<u64>()
                .map_err(|_| Error::Validation("snapshot must be a numeric id".into()))?;
            let outcome = snapshot::rollback(
                &ctx.zfs,
                kind,
                &mut guest,
                snapshot_id,
                force,
                &ctx.jails_root,
                &mut store,
                ctx.orchestrator.as_ref(),
                &|_switch_id| true,
            )?;
            ctx.store.save_guest(&guest)?;
            println!(
                "rolled back guest {} (restarted: {})",
                guest.ctid, outcome.restarted
            );
            if let Some(err) = outcome.restart_error {
                eprintln!("warning: restart after rollback failed: {err}");
            }
            Ok(())
        }
        SnapshotAction::Delete { rid, snapshot } => {
            let guest = ctx.store.load_guest(rid)?;
            let kind = ctx.guest_kind_tag(&guest);
            let snapshot_id = snapshot
                .parse::<u64>()
                .map_err(|_| Error::Validation("snapshot must be a numeric id".into()))?;
            snapshot::delete_snapshot(&ctx.zfs, kind, &guest, snapshot_id, &mut store)?;
            println!("deleted snapshot {snapshot_id}");
            Ok(())
        }
        SnapshotAction::List { rid, json } => {
            let guest = ctx.store.load_guest(rid)?;
            let latest = store.latest_for_guest(guest.ctid);
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&latest.as_ref().map(|r| r.id))?
                );
            } else if let Some(record) = latest {
                println!("latest snapshot: {} (id {})", record.snapshot_name, record.id);
            } else {
                println!("no snapshots for guest {rid}");
            }
            Ok(())
        }
    }
}

/// Default `cu`/nmdm baud rate. The guest model carries no per-VM baud
/// setting (only `VmDetail::serial_console`'s on/off flag), so every VM
/// console attaches at the conventional bhyve nmdm rate.
const DEFAULT_SERIAL_BAUD: u32 = 115200;

/// Ctrl-] — detaches the local console and kills the remote session
/// (process, PTY, and every other observer), same as an ssh `~.` escape
/// but mapped onto the single-byte `ObserverInput::Kill` frame.
const CONSOLE_KILL_ESCAPE: u8 = 0x1d;

fn run_console(ctx: &Context, rid: u64, user: &str) -> Result<()> {
    let guest = ctx.store.load_guest(rid)?;
    if guest.is_vm() {
        return run_vm_console(&guest);
    }
    let status = console::console(&guest.name, user)?;
    std::process::exit(status.code().unwrap_or(1));
}

fn run_vm_console(guest: &Guest) -> Result<()> {
    let GuestVariant::Vm(detail) = &guest.variant else {
        unreachable!("run_vm_console called on a non-VM guest");
    };
    if !detail.serial_console {
        return Err(Error::Validation(format!(
            "guest {} does not have a serial console enabled",
            guest.ctid
        )));
    }

    let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    runtime.block_on(async {
        let registry = Arc::new(vm::ConsoleRegistry::new());
        let rid = guest.ctid.to_string();
        let (scrollback, mut out_rx, in_tx) = registry
            .attach(&rid, guest.ctid, DEFAULT_SERIAL_BAUD)
            .await?;

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&scrollback).await.ok();
        stdout.flush().await.ok();

        let _raw_guard = RawModeGuard::enable()?;
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                result = stdin.read(&mut buf) => {
                    match result {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if buf[..n].contains(&CONSOLE_KILL_ESCAPE) {
                                let _ = in_tx.send(vm::ObserverInput::Kill).await;
                                break;
                            }
                            if in_tx.send(vm::ObserverInput::Stdin(buf[..n].to_vec())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                msg = out_rx.recv() => {
                    match msg {
                        Some(bytes) => {
                            let _ = stdout.write_all(&bytes).await;
                            let _ = stdout.flush().await;
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    })
}

/// Puts stdin into raw mode for the duration of a console session,
/// restoring the prior terminal settings on drop.
struct RawModeGuard {
    original: nix::sys::termios::Termios,
}

impl RawModeGuard {
    fn enable() -> Result<Self> {
        use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
        use std::os::fd::AsFd;

        let stdin = std::io::stdin();
        let original = tcgetattr(stdin.as_fd())
            .map_err(|e| Error::VmOperation(format!("tcgetattr failed: {e}")))?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)
            .map_err(|e| Error::VmOperation(format!("tcsetattr failed: {e}")))?;
        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{tcsetattr, SetArg};
        use std::os::fd::AsFd;

        let stdin = std::io::stdin();
        let _ = tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &self.original);
    }
}

fn run_backup_action(ctx: &Context, action: BackupAction) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    runtime.block_on(async {
        let job_store = FileJobStore::open(&ctx.backup_jobs_path).await?;
        match action {
            BackupAction::Run { job_id } => {
                let jobs = job_store.load_enabled_jobs().await?;
                let job = jobs
                    .into_iter()
                    .find(|j| j.id == job_id)
                    .ok_or_else(|| Error::Validation(format!("no enabled backup job {job_id}")))?;
                let replicator = LocalReplicator {
                    zfs: ctx.zfs.clone(),
                };
                let snapshot_name = format!("backup-manual-{job_id}");
                replicator
                    .replicate_dataset(&job.source_dataset, &job.destination_dataset, &snapshot_name)
                    .await?;
                println!("backup job {job_id} completed");
                Ok(())
            }
            BackupAction::List { json } => {
                let jobs = job_store.load_enabled_jobs().await?;
                if json {
                    let printable: Vec<_> = jobs
                        .iter()
                        .map(|j| {
                            serde_json::json!({
                                "id": j.id,
                                "enabled": j.enabled,
                                "cron": j.cron_expr,
                                "source": j.source_dataset,
                                "destination": j.destination_dataset,
                                "nextRunAt": j.next_run_at,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&printable)?);
                } else {
                    for job in jobs {
                        println!(
                            "{:<6} {:<20} {} -> {}",
                            job.id, job.cron_expr, job.source_dataset, job.destination_dataset
                        );
                    }
                }
                Ok(())
            }
        }
    })
}

fn run_replicate_action(ctx: &Context, action: ReplicateAction) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    runtime.block_on(async {
        let tls = TlsPaths {
            cert_pem: ctx.config.replication.cert_pem.clone(),
            key_pem: ctx.config.replication.key_pem.clone(),
        };
        let client_config = build_client_config(&tls)?;
        let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap())
            .map_err(|e| Error::Transport(format!("failed to bind QUIC client socket: {e}")))?;
        endpoint.set_default_client_config(client_config);
        let token = ctx.config.node.cluster_token.clone();

        match action {
            ReplicateAction::Push {
                source_dataset,
                destination_dataset,
                target,
            } => {
                let addr = resolve_peer(&target, &NoPeerDirectory)?;
                let connection = connect(&endpoint, addr, "sylve-node").await?;
                let outcome = replicate_dataset_to_node(
                    &connection,
                    &ctx.zfs,
                    &source_dataset,
                    &destination_dataset,
                    &token,
                    None,
                )
                .await?;
                println!(
                    "pushed {source_dataset} -> {target}:{destination_dataset} ({}, {})",
                    outcome.mode, outcome.target_snapshot
                );
                Ok(())
            }
            ReplicateAction::Pull {
                remote_dataset,
                destination_dataset,
                target,
            } => {
                let addr = resolve_peer(&target, &NoPeerDirectory)?;
                let connection = connect(&endpoint, addr, "sylve-node").await?;
                let outcome = pull_dataset_from_node(
                    &connection,
                    &ctx.zfs,
                    &remote_dataset,
                    &destination_dataset,
                    &token,
                )
                .await?;
                println!(
                    "pulled {target}:{remote_dataset} -> {destination_dataset} ({}, {})",
                    outcome.mode, outcome.target_snapshot
                );
                Ok(())
            }
            ReplicateAction::Status { target, dataset } => {
                let addr = resolve_peer(&target, &NoPeerDirectory)?;
                let connection = connect(&endpoint, addr, "sylve-node").await?;
                let request = Request {
                    version: PROTOCOL_VERSION,
                    action: Action::Status,
                    token,
                    dataset: Some(dataset),
                    prefix: None,
                    limit: Some(50),
                    force: false,
                    base_snapshot: None,
                    target_snapshot: None,
                    with_intermediates: false,
                };
                let response = simple_request(&connection, &request).await?;
                if !response.ok {
                    return Err(Error::Transport(
                        response.error.unwrap_or_else(|| "status request failed".into()),
                    ));
                }
                for event in response.events.unwrap_or_default() {
                    println!(
                        "{} {} {} -> {} [{}] {}",
                        event.started_at,
                        event.direction,
                        event.source_dataset,
                        event.destination_dataset,
                        event.status,
                        event.error.unwrap_or_default()
                    );
                }
                Ok(())
            }
        }
    })
}

fn run_serve(ctx: Context) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    runtime.block_on(async {
        let tls = TlsPaths {
            cert_pem: ctx.config.replication.cert_pem.clone(),
            key_pem: ctx.config.replication.key_pem.clone(),
        };
        let server_config = build_server_config(&tls)?;
        let endpoint =
            quinn::Endpoint::server(server_config, ctx.config.replication.listen_address)
                .map_err(|e| Error::Transport(format!("failed to bind QUIC listener: {e}")))?;
        println!(
            "sylved: listening on {} as node {}",
            ctx.config.replication.listen_address, ctx.config.node.node_id
        );

        let verifier: Arc<dyn TokenVerifier> = Arc::new(StaticTokenVerifier {
            token: ctx.config.node.cluster_token.clone(),
        });
        let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let zfs_for_server = ctx.zfs.clone();

        let job_store: Arc<dyn JobStore> =
            Arc::new(FileJobStore::open(&ctx.backup_jobs_path).await?);
        let replicator: Arc<dyn Replicator> = Arc::new(LocalReplicator {
            zfs: ctx.zfs.clone(),
        });
        let scheduler = Arc::new(Scheduler::with_tick_interval(
            job_store,
            replicator,
            ctx.cluster.clone(),
            ctx.zfs.clone(),
            tokio::time::Duration::from_secs(ctx.config.replication.scheduler_tick_seconds),
        ));
        tokio::spawn(scheduler.run(|| chrono::Utc::now().timestamp()));

        loop {
            let Some(incoming) = endpoint.accept().await else {
                break;
            };
            let zfs = zfs_for_server.clone();
            let verifier = verifier.clone();
            let events = events.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        if let Err(e) = serve_connection(connection, zfs, verifier, events).await {
                            eprintln!("repl: connection handler failed: {e}");
                        }
                    }
                    Err(e) => eprintln!("repl: failed to accept connection: {e}"),
                }
            });
        }
        Ok(())
    })
}

/// Standalone `JobStore`: backup jobs as a JSON array on disk,
/// matching `FileBackedStore`'s shape. A clustered deployment wires
/// the scheduler to the SQL store's job table instead.
struct FileJobStore {
    path: PathBuf,
    jobs: tokio::sync::Mutex<HashMap<u64, BackupJob>>,
}

impl FileJobStore {
    async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let jobs = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let records: Vec<StoredJob> = serde_json::from_str(&content)?;
            records
                .into_iter()
                .map(|r| (r.id, r.into_job()))
                .collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            jobs: tokio::sync::Mutex::new(jobs),
        })
    }

    async fn persist(&self, jobs: &HashMap<u64, BackupJob>) -> Result<()> {
        let mut records: Vec<StoredJob> = jobs.values().map(StoredJob::from_job).collect();
        records.sort_by_key(|r| r.id);
        let body = serde_json::to_string_pretty(&records)?;
        tokio::fs::write(&self.path, body).await?;
        Ok(())
    }
}

/// `BackupJob`'s on-disk twin; `BackupJob` itself carries no serde
/// derives since the scheduler only ever sees it in memory from the
/// SQL store.
#[derive(serde::Serialize, serde::Deserialize)]
struct StoredJob {
    id: u64,
    enabled: bool,
    cron_expr: String,
    runner_node_id: Option<String>,
    kind: String,
    source_dataset: String,
    destination_dataset: String,
    next_run_at: Option<i64>,
}

impl StoredJob {
    fn into_job(self) -> BackupJob {
        BackupJob {
            id: self.id,
            enabled: self.enabled,
            cron_expr: self.cron_expr,
            runner_node_id: self.runner_node_id,
            kind: match self.kind.as_str() {
                "jails" => JobKind::Jails,
                "vm" => JobKind::Vm,
                _ => JobKind::Dataset,
            },
            source_dataset: self.source_dataset,
            destination_dataset: self.destination_dataset,
            next_run_at: self.next_run_at,
        }
    }

    fn from_job(job: &BackupJob) -> Self {
        Self {
            id: job.id,
            enabled: job.enabled,
            cron_expr: job.cron_expr.clone(),
            runner_node_id: job.runner_node_id.clone(),
            kind: match job.kind {
                JobKind::Jails => "jails",
                JobKind::Vm => "vm",
                JobKind::Dataset => "dataset",
            }
            .to_string(),
            source_dataset: job.source_dataset.clone(),
            destination_dataset: job.destination_dataset.clone(),
            next_run_at: job.next_run_at,
        }
    }
}

#[async_trait::async_trait]
impl JobStore for FileJobStore {
    async fn load_enabled_jobs(&self) -> Result<Vec<BackupJob>> {
        Ok(self
            .jobs
            .lock()
            .await
            .values()
            .filter(|j| j.enabled)
            .cloned()
            .collect())
    }

    async fn update_next_run_at(&self, job_id: u64, next_run_at: Option<i64>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            job.next_run_at = next_run_at;
        }
        self.persist(&jobs).await
    }

    async fn record_result(
        &self,
        job_id: u64,
        status: &str,
        error: Option<String>,
        next_run_at: Option<i64>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            job.next_run_at = next_run_at;
        }
        if status != "success" {
            eprintln!("backup job {job_id} failed: {}", error.unwrap_or_default());
        }
        self.persist(&jobs).await
    }
}

/// Standalone `Replicator`: a direct local `zfs send | zfs recv` pipe.
/// `BackupJob` carries no peer address, so cross-node backup targets
/// require a cluster-aware `Replicator` wired to the consensus layer's
/// peer directory instead of this one.
struct LocalReplicator {
    zfs: Arc<ZfsGateway>,
}

#[async_trait::async_trait]
impl Replicator for LocalReplicator {
    async fn replicate_dataset(
        &self,
        source_dataset: &str,
        destination_dataset: &str,
        fresh_snapshot_name: &str,
    ) -> Result<()> {
        let zfs = self.zfs.clone();
        let source = source_dataset.to_string();
        let destination = destination_dataset.to_string();
        let snapshot = fresh_snapshot_name.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            zfs.create_snapshot(&source, &snapshot)?;
            zfs.ensure_parent(&destination)?;
            zfs.clear_resume_token(&destination)?;

            let mut send_child = zfs.spawn_send(&source, None, &snapshot, false)?;
            let mut recv_child = zfs.spawn_receive(&destination, false)?;
            let mut stdout = send_child
                .stdout
                .take()
                .ok_or_else(|| Error::Zfs("zfs send produced no stdout pipe".into()))?;
            let mut stdin = recv_child
                .stdin
                .take()
                .ok_or_else(|| Error::Zfs("zfs recv produced no stdin pipe".into()))?;
            std::io::copy(&mut stdout, &mut stdin)?;
            drop(stdin);

            let send_status = send_child.wait()?;
            let recv_status = recv_child.wait()?;
            if !send_status.success() || !recv_status.success() {
                return Err(Error::Zfs(format!(
                    "local replicate {source} -> {destination} failed"
                )));
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Zfs(format!("replicate task panicked: {e}")))?
    }
}
