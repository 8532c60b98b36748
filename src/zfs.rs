//! Thin, synchronous facade over the host's `zfs`/`zpool` binaries.
//!
//! Stateless: every call shells out and parses the result. Higher layers
//! (jail/VM engines, snapshot core, replication transport) depend on this
//! contract rather than touching `zfs` directly, so their tests can swap
//! in a fake gateway.

use crate::error::{is_missing_dataset_error, Error, Result};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

/// Send mode resolved from a (base, target, with_intermediates) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Full,
    Incremental,
    IncrementalIntermediates,
}

impl SendMode {
    pub fn resolve(base: Option<&str>, with_intermediates: bool) -> Self {
        match (base, with_intermediates) {
            (None, _) => SendMode::Full,
            (Some(_), false) => SendMode::Incremental,
            (Some(_), true) => SendMode::IncrementalIntermediates,
        }
    }
}

/// A dataset row as returned by `zfs list`.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub name: String,
    pub guid: String,
    pub kind: String,
    pub creation: i64,
    pub used: u64,
    pub refer: u64,
    pub avail: u64,
    pub mountpoint: String,
}

/// A snapshot row, ordered by `createtxg` ascending per the replication
/// transport's `snapshots` verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Bare snapshot name (after the `@`).
    pub name: String,
    pub guid: String,
    pub createtxg: u64,
}

/// Gateway over the host's dataset operations.
pub struct ZfsGateway {
    pool: String,
}

impl ZfsGateway {
    pub fn new(pool: impl Into<String>) -> Self {
        Self { pool: pool.into() }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// `<pool>/sylve/{jails|virtual-machines}/<id>` per the data model's
    /// root-dataset convention.
    pub fn root_dataset(&self, kind: GuestDatasetKind, id: u64) -> String {
        format!("{}/sylve/{}/{}", self.pool, kind.segment(), id)
    }

    pub fn mountpoint(&self, dataset: &str) -> PathBuf {
        PathBuf::from(format!("/{}", dataset))
    }

    pub fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        let output = Command::new("zfs")
            .args(["list", "-H", "-o", "name", dataset])
            .output()
            .map_err(|e| Error::Zfs(format!("failed to run zfs list: {e}")))?;
        if output.status.success() {
            return Ok(true);
        }
        let msg = String::from_utf8_lossy(&output.stderr);
        if is_missing_dataset_error(&msg) {
            Ok(false)
        } else {
            Err(Error::Zfs(msg.trim().to_string()))
        }
    }

    /// Create a dataset. If `create_parents`, equivalent to `zfs create -p`.
    pub fn create_dataset(&self, dataset: &str, create_parents: bool) -> Result<()> {
        let mut cmd = Command::new("zfs");
        cmd.arg("create");
        if create_parents {
            cmd.arg("-p");
        }
        cmd.arg(dataset);
        run_checked(cmd, "zfs create")
    }

    /// Create a ZFS volume of the given block size and size.
    pub fn create_volume(&self, dataset: &str, size_bytes: u64, blocksize: u64) -> Result<()> {
        let mut cmd = Command::new("zfs");
        cmd.args([
            "create",
            "-V",
            &size_bytes.to_string(),
            "-o",
            &format!("volblocksize={blocksize}"),
            dataset,
        ]);
        run_checked(cmd, "zfs create -V")
    }

    /// Ensure `dataset`'s parent exists, creating it (with `-p`) if absent.
    /// Used by the replication transport's `receive` verb.
    pub fn ensure_parent(&self, dataset: &str) -> Result<()> {
        let Some((parent, _)) = dataset.rsplit_once('/') else {
            return Ok(());
        };
        if !self.dataset_exists(parent)? {
            self.create_dataset(parent, true)?;
        }
        Ok(())
    }

    pub fn destroy_dataset(&self, dataset: &str, recursive: bool) -> Result<()> {
        if !self.dataset_exists(dataset)? {
            return Ok(());
        }
        let mut cmd = Command::new("zfs");
        cmd.arg("destroy");
        if recursive {
            cmd.arg("-r");
        }
        cmd.arg(dataset);
        run_checked(cmd, "zfs destroy")
    }

    pub fn get_property(&self, dataset: &str, property: &str) -> Result<String> {
        let output = Command::new("zfs")
            .args(["get", "-H", "-o", "value", property, dataset])
            .output()
            .map_err(|e| Error::Zfs(format!("failed to run zfs get: {e}")))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(Error::Zfs(format!(
                "failed to get property '{property}' for dataset '{dataset}'"
            )))
        }
    }

    pub fn set_property(&self, dataset: &str, property: &str, value: &str) -> Result<()> {
        let mut cmd = Command::new("zfs");
        cmd.args(["set", &format!("{property}={value}"), dataset]);
        run_checked(cmd, "zfs set")
    }

    /// `zfs list -H -p -o name,guid,type,creation,used,refer,avail,mountpoint
    /// -t filesystem,volume`, filtered to names with `prefix`, sorted by name.
    pub fn list_datasets(&self, prefix: &str) -> Result<Vec<DatasetInfo>> {
        let output = Command::new("zfs")
            .args([
                "list",
                "-H",
                "-p",
                "-o",
                "name,guid,type,creation,used,refer,avail,mountpoint",
                "-t",
                "filesystem,volume",
            ])
            .output()
            .map_err(|e| Error::Zfs(format!("failed to run zfs list: {e}")))?;
        if !output.status.success() {
            let msg = String::from_utf8_lossy(&output.stderr);
            if is_missing_dataset_error(&msg) {
                return Ok(Vec::new());
            }
            return Err(Error::Zfs(msg.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut rows: Vec<DatasetInfo> = stdout
            .lines()
            .filter_map(|line| {
                let f: Vec<&str> = line.split('\t').collect();
                if f.len() < 8 {
                    return None;
                }
                if !f[0].starts_with(prefix) {
                    return None;
                }
                Some(DatasetInfo {
                    name: f[0].to_string(),
                    guid: f[1].to_string(),
                    kind: f[2].to_string(),
                    creation: f[3].parse().unwrap_or(0),
                    used: f[4].parse().unwrap_or(0),
                    refer: f[5].parse().unwrap_or(0),
                    avail: f[6].parse().unwrap_or(0),
                    mountpoint: f[7].to_string(),
                })
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    /// Recursive (guest-scoped) snapshot, name already resolved by the
    /// caller (`sjs_<sanitized>_<unixMillis>` / `svs_…`).
    pub fn create_snapshot(&self, dataset: &str, snapshot_name: &str) -> Result<()> {
        let target = format!("{dataset}@{snapshot_name}");
        let mut cmd = Command::new("zfs");
        cmd.args(["snapshot", "-r", &target]);
        run_checked(cmd, "zfs snapshot")
    }

    /// Ordered by `createtxg` ascending, per the `snapshots` transport verb.
    pub fn list_snapshots(&self, dataset: &str) -> Result<Vec<SnapshotInfo>> {
        let output = Command::new("zfs")
            .args([
                "list", "-H", "-p", "-o", "name,guid,createtxg", "-t", "snapshot", "-r", "-s",
                "createtxg", dataset,
            ])
            .output()
            .map_err(|e| Error::Zfs(format!("failed to run zfs list: {e}")))?;
        if !output.status.success() {
            let msg = String::from_utf8_lossy(&output.stderr);
            if is_missing_dataset_error(&msg) {
                return Ok(Vec::new());
            }
            return Err(Error::Zfs(msg.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut out = Vec::new();
        for line in stdout.lines() {
            let f: Vec<&str> = line.split('\t').collect();
            if f.len() < 3 {
                continue;
            }
            // only snapshots of this exact dataset, not of child datasets
            let Some((ds, name)) = f[0].split_once('@') else {
                continue;
            };
            if ds != dataset {
                continue;
            }
            out.push(SnapshotInfo {
                name: name.to_string(),
                guid: f[1].to_string(),
                createtxg: f[2].parse().unwrap_or(0),
            });
        }
        Ok(out)
    }

    /// Rollback `<dataset>@<snapshot>`. `destroy_more_recent` instructs ZFS
    /// to destroy intermediate snapshots and clones (`-r`).
    pub fn rollback(&self, dataset: &str, snapshot: &str, destroy_more_recent: bool) -> Result<()> {
        let target = format!("{dataset}@{snapshot}");
        let mut cmd = Command::new("zfs");
        cmd.arg("rollback");
        if destroy_more_recent {
            cmd.arg("-r");
        }
        cmd.arg(&target);
        run_checked(cmd, "zfs rollback")
    }

    /// Destroy a snapshot, swallowing "dataset does not exist".
    pub fn destroy_snapshot(&self, dataset: &str, snapshot: &str) -> Result<()> {
        let target = format!("{dataset}@{snapshot}");
        let output = Command::new("zfs")
            .args(["destroy", &target])
            .output()
            .map_err(|e| Error::Zfs(format!("failed to run zfs destroy: {e}")))?;
        if output.status.success() {
            return Ok(());
        }
        let msg = String::from_utf8_lossy(&output.stderr);
        if is_missing_dataset_error(&msg) {
            Ok(())
        } else {
            Err(Error::Zfs(msg.trim().to_string()))
        }
    }

    /// Clear a stale `receive_resume_token` via `zfs recv -A`. Absence of a
    /// token is a soft success.
    pub fn clear_resume_token(&self, dataset: &str) -> Result<()> {
        let output = Command::new("zfs")
            .args(["recv", "-A", dataset])
            .output()
            .map_err(|e| Error::Zfs(format!("failed to run zfs recv -A: {e}")))?;
        if output.status.success() {
            return Ok(());
        }
        let msg = String::from_utf8_lossy(&output.stderr);
        if is_missing_dataset_error(&msg)
            || msg.to_lowercase().contains("does not have any resumable receive state")
        {
            Ok(())
        } else {
            Err(Error::Zfs(msg.trim().to_string()))
        }
    }

    /// Spawn `zfs send` for the resolved mode, piping its stdout. The
    /// caller (replication transport) reads the child's stdout into the
    /// QUIC stream.
    pub fn spawn_send(
        &self,
        dataset: &str,
        base: Option<&str>,
        target: &str,
        with_intermediates: bool,
    ) -> Result<Child> {
        let mut cmd = Command::new("zfs");
        cmd.arg("send");
        match (base, with_intermediates) {
            (None, _) => {}
            (Some(base), false) => {
                cmd.args(["-i", &format!("{dataset}@{base}")]);
            }
            (Some(base), true) => {
                cmd.args(["-I", &format!("{dataset}@{base}")]);
            }
        }
        cmd.arg(format!("{dataset}@{target}"));
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.spawn()
            .map_err(|e| Error::Zfs(format!("failed to spawn zfs send: {e}")))
    }

    /// Spawn `zfs recv <dataset>` with stdin piped; the caller streams the
    /// incoming QUIC bytes into the child's stdin.
    pub fn spawn_receive(&self, dataset: &str, force: bool) -> Result<Child> {
        let mut cmd = Command::new("zfs");
        cmd.arg("recv");
        if force {
            cmd.arg("-F");
        }
        cmd.arg(dataset);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.spawn()
            .map_err(|e| Error::Zfs(format!("failed to spawn zfs recv: {e}")))
    }
}

/// Which guest-type sub-tree a root dataset belongs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestDatasetKind {
    Jail,
    Vm,
}

impl GuestDatasetKind {
    fn segment(self) -> &'static str {
        match self {
            GuestDatasetKind::Jail => "jails",
            GuestDatasetKind::Vm => "virtual-machines",
        }
    }
}

fn run_checked(mut cmd: Command, label: &str) -> Result<()> {
    let output = cmd
        .output()
        .map_err(|e| Error::Zfs(format!("failed to run {label}: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        let msg = String::from_utf8_lossy(&output.stderr);
        Err(Error::Zfs(format!("{label} failed: {}", msg.trim())))
    }
}

/// Read a child's full stdout into memory. Used by short-lived, bounded
/// commands (send/recv are handled by the streaming transport instead).
pub fn read_all(mut child: Child) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout
            .read_to_end(&mut buf)
            .map_err(|e| Error::Zfs(format!("failed reading zfs output: {e}")))?;
    }
    let status = child
        .wait()
        .map_err(|e| Error::Zfs(format!("failed waiting on zfs child: {e}")))?;
    if !status.success() {
        return Err(Error::Zfs("zfs child exited with failure".into()));
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_dataset_layout() {
        let gw = ZfsGateway::new("zroot");
        assert_eq!(gw.root_dataset(GuestDatasetKind::Jail, 101), "zroot/sylve/jails/101");
        assert_eq!(
            gw.root_dataset(GuestDatasetKind::Vm, 42),
            "zroot/sylve/virtual-machines/42"
        );
    }

    #[test]
    fn mountpoint_is_absolute() {
        let gw = ZfsGateway::new("zroot");
        assert_eq!(
            gw.mountpoint("zroot/sylve/jails/101"),
            PathBuf::from("/zroot/sylve/jails/101")
        );
    }

    #[test]
    fn send_mode_resolution() {
        assert_eq!(SendMode::resolve(None, false), SendMode::Full);
        assert_eq!(SendMode::resolve(Some("a"), false), SendMode::Incremental);
        assert_eq!(
            SendMode::resolve(Some("a"), true),
            SendMode::IncrementalIntermediates
        );
    }
}
