//! Jail engine: on-disk provisioning, the jail.conf region contract,
//! `SyncNetwork`, resource limits, lifecycle, and telemetry.
//!
//! File writes in this module are always atomic (write-temp then
//! rename): a crash mid-write must never leave a half-written
//! jail.conf region or guest record on disk.

use crate::error::{is_soft_error, Error, Result};
use crate::netobj::NetworkObjectStore;
use crate::network::epair::EpairInterface;
use crate::network::sync::{build_regions, ctid_hash, GuestOsType, NetworkAttachment};
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::process::Command;

const NETWORK_MARKER_START: &str = "# --- sylve network region ---";
const NETWORK_MARKER_END: &str = "# --- end sylve network region ---";
const ALLOWED_MARKER_START: &str = "# --- sylve allowed-options region ---";
const ALLOWED_MARKER_END: &str = "# --- end sylve allowed-options region ---";
const ADDITIONAL_MARKER_START: &str = "### These are user-defined additional options ###";
const RC_CONF_HEADER: &str = "# Sylve Network Configuration";

/// Deterministic name used for `-c <hashedName>`, rctl/cpuset targets,
/// and epair naming — a single five-letter encoding of the CTID.
pub fn jail_hashed_name(ctid: u64) -> String {
    ctid_hash(ctid)
}

/// Writes `contents` to `path` atomically: write to a sibling temp
/// file, fsync, then rename over the target.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// The three exclusive regions of a `<ctid>.conf` jail config stanza,
/// plus everything else, preserved verbatim across a sync.
#[derive(Debug, Default, Clone)]
pub struct JailConfigDocument {
    pub preamble: Vec<String>,
    pub network_lines: Vec<String>,
    pub allowed_lines: Vec<String>,
    pub additional_lines: Vec<String>,
    pub trailer: Vec<String>,
}

impl JailConfigDocument {
    /// Parses an existing `<ctid>.conf`. Unknown structure (first use)
    /// yields an empty document with everything to be regenerated.
    pub fn parse(contents: &str) -> Self {
        let mut doc = JailConfigDocument::default();
        let mut section = Section::Preamble;

        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed == ADDITIONAL_MARKER_START {
                section = Section::Additional;
                continue;
            }
            if section == Section::Additional && trimmed.is_empty() {
                section = Section::Trailer;
                continue;
            }
            if is_network_line(trimmed) {
                doc.network_lines.push(line.to_string());
                continue;
            }
            if is_allowed_line(trimmed) {
                doc.allowed_lines.push(line.to_string());
                continue;
            }
            match section {
                Section::Preamble => doc.preamble.push(line.to_string()),
                Section::Additional => doc.additional_lines.push(line.to_string()),
                Section::Trailer => doc.trailer.push(line.to_string()),
            }
        }

        doc
    }

    /// Renders the full `<name> { ... }` stanza with the network region
    /// regenerated from `network_lines`, the allowed region from
    /// `allowed_lines`, and the additional region replaced wholesale.
    pub fn render(&self, jail_name: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("{jail_name} {{\n"));
        for l in &self.preamble {
            out.push_str(l.trim_start());
            out.push('\n');
        }
        out.push_str(&format!("    {NETWORK_MARKER_START}\n"));
        for l in &self.network_lines {
            out.push_str("    ");
            out.push_str(l.trim());
            out.push('\n');
        }
        out.push_str(&format!("    {NETWORK_MARKER_END}\n"));
        out.push_str(&format!("    {ALLOWED_MARKER_START}\n"));
        for l in &self.allowed_lines {
            out.push_str("    ");
            out.push_str(l.trim());
            out.push('\n');
        }
        out.push_str(&format!("    {ALLOWED_MARKER_END}\n"));
        out.push_str(&format!("    {ADDITIONAL_MARKER_START}\n"));
        for l in &self.additional_lines {
            out.push_str("    ");
            out.push_str(l.trim());
            out.push('\n');
        }
        out.push('\n');
        for l in &self.trailer {
            out.push_str(l.trim_start());
            out.push('\n');
        }
        out.push_str("}\n");
        out
    }
}

#[derive(PartialEq)]
enum Section {
    Preamble,
    Additional,
    Trailer,
}

fn is_network_line(line: &str) -> bool {
    line == "vnet;"
        || line.starts_with("vnet.interface +=")
        || line.starts_with("ip4=")
        || line.starts_with("ip6=")
}

fn is_allowed_line(line: &str) -> bool {
    line.starts_with("allow.") || line == "mount.devfs;" || line.starts_with("devfs_ruleset=")
}

/// Regenerates the allowed-options region from an explicit option set.
pub fn modify_allowed_options(
    doc: &mut JailConfigDocument,
    allow: &[&str],
    mount_devfs: bool,
    devfs_ruleset: Option<u32>,
) {
    let mut lines: Vec<String> = allow.iter().map(|a| format!("allow.{a};")).collect();
    if mount_devfs {
        lines.push("mount.devfs;".to_string());
    }
    if let Some(ruleset) = devfs_ruleset {
        lines.push(format!("devfs_ruleset={ruleset};"));
    }
    doc.allowed_lines = lines;
}

/// Bundles the inputs `SyncNetwork` needs about a single jail.
pub struct SyncNetworkInput<'a> {
    pub ctid: u64,
    pub jail_name: &'a str,
    pub os_type: GuestOsType,
    pub jails_root: &'a Path,
    pub mountpoint: &'a Path,
    pub inherit_ipv4: bool,
    pub inherit_ipv6: bool,
    pub attachments: &'a [NetworkAttachment],
}

/// Runs `SyncNetwork`: creates/destroys host epairs as needed, then
/// atomically rewrites jail.conf's network region, pre-start.sh, and
/// rc.conf. Idempotent for unchanged inputs.
pub fn sync_network(
    input: &SyncNetworkInput,
    objects: &NetworkObjectStore,
    bridge_has_member: impl Fn(&str, &str) -> bool,
) -> Result<()> {
    let hashed_name = jail_hashed_name(input.ctid);
    let conf_path = input.jails_root.join(format!("{}.conf", input.ctid));
    let scripts_dir = input.jails_root.join(input.ctid.to_string()).join("scripts");
    std::fs::create_dir_all(&scripts_dir)?;

    let existing = std::fs::read_to_string(&conf_path).unwrap_or_default();
    let mut doc = JailConfigDocument::parse(&existing);

    let regions = build_regions(
        input.ctid,
        input.jail_name,
        input.os_type,
        input.inherit_ipv4,
        input.inherit_ipv6,
        input.attachments,
        objects,
        bridge_has_member,
    )?;

    doc.network_lines = regions.jail_conf_lines;
    atomic_write(&conf_path, doc.render(&hashed_name).as_bytes())?;

    write_pre_start(&scripts_dir.join("pre-start.sh"), &regions.pre_start_lines)?;

    if !regions.rc_conf_lines.is_empty() {
        write_rc_conf(&input.mountpoint.join("etc/rc.conf"), &regions.rc_conf_lines)?;
    }

    if input.inherit_ipv4 || input.inherit_ipv6 {
        for attachment in input.attachments {
            let (host_side, _) = crate::network::sync::epair_names(input.ctid, attachment.id);
            if let Ok(epair) = EpairInterface::create_named(&host_side) {
                let _ = epair.destroy();
            }
        }
    }

    Ok(())
}

const PRE_START_MARKER_START: &str = "### Sylve: user-managed pre-start commands above, generated below ###";
const PRE_START_MARKER_END: &str = "### End Sylve-generated pre-start commands ###";

fn write_pre_start(path: &Path, generated_lines: &[String]) -> Result<()> {
    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let user_part = existing
        .split(PRE_START_MARKER_START)
        .next()
        .unwrap_or("")
        .to_string();

    let mut out = String::new();
    out.push_str("#!/bin/sh\n");
    if !user_part.trim().is_empty() {
        out.push_str(user_part.trim_end());
        out.push('\n');
    }
    out.push_str(PRE_START_MARKER_START);
    out.push('\n');
    for line in generated_lines {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(PRE_START_MARKER_END);
    out.push('\n');

    atomic_write(path, out.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn write_rc_conf(path: &Path, lines: &[String]) -> Result<()> {
    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let before = existing
        .split(RC_CONF_HEADER)
        .next()
        .unwrap_or(&existing)
        .to_string();

    let mut out = before.trim_end().to_string();
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(RC_CONF_HEADER);
    out.push('\n');
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }

    atomic_write(path, out.as_bytes())
}

/// `UpdateMemory(bytes)`: rounds up to whole megabytes and applies a
/// live rctl limit plus a post-start.sh line for subsequent starts.
pub fn update_memory(jails_root: &Path, ctid: u64, bytes: u64) -> Result<()> {
    if bytes < 1024 * 1024 {
        return Err(Error::Validation("memory must be at least 1MB".to_string()));
    }
    let hashed_name = jail_hashed_name(ctid);
    let mb = bytes.div_ceil(1024 * 1024);
    let post_start = jails_root.join(ctid.to_string()).join("scripts/post-start.sh");
    upsert_post_start_line(&post_start, "rctl -a jail:", &format!("rctl -a jail:{hashed_name}:memoryuse:deny={mb}M"))?;

    let output = Command::new("rctl")
        .args(["-a", &format!("jail:{hashed_name}:memoryuse:deny={mb}M")])
        .output()?;
    if !output.status.success() {
        let msg = String::from_utf8_lossy(&output.stderr).to_string();
        if !is_soft_error(&msg) {
            return Err(Error::JailOperation(msg));
        }
    }
    Ok(())
}

/// `UpdateCPU(cores)`: selects the `cores` least-used host logical CPUs
/// across other running jails and pins via cpuset.
pub fn update_cpu(jails_root: &Path, ctid: u64, cores: usize, other_jail_cpus: &[Vec<usize>], host_logical_cpus: usize) -> Result<()> {
    if cores > host_logical_cpus {
        return Err(Error::Validation(format!(
            "requested {cores} cores exceeds {host_logical_cpus} host logical cpus"
        )));
    }
    let hashed_name = jail_hashed_name(ctid);
    let mut usage = vec![0usize; host_logical_cpus];
    for cpus in other_jail_cpus {
        for &cpu in cpus {
            if cpu < usage.len() {
                usage[cpu] += 1;
            }
        }
    }

    let mut indices: Vec<usize> = (0..host_logical_cpus).collect();
    indices.sort_by_key(|&i| (usage[i], i));
    let mut selected: Vec<usize> = indices.into_iter().take(cores).collect();
    selected.sort_unstable();

    let list = selected
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let post_start = jails_root.join(ctid.to_string()).join("scripts/post-start.sh");
    upsert_post_start_line(&post_start, "cpuset -l", &format!("cpuset -l {list} -j {hashed_name}"))?;

    let output = Command::new("cpuset")
        .args(["-l", &list, "-j", &hashed_name])
        .output()?;
    if !output.status.success() {
        let msg = String::from_utf8_lossy(&output.stderr).to_string();
        if !is_soft_error(&msg) {
            return Err(Error::JailOperation(msg));
        }
    }
    Ok(())
}

/// Removes both resource-limit lines and resets rctl/cpuset live.
pub fn disable_resource_limits(jails_root: &Path, ctid: u64, host_logical_cpus: usize) -> Result<()> {
    let hashed_name = jail_hashed_name(ctid);
    let post_start = jails_root.join(ctid.to_string()).join("scripts/post-start.sh");
    remove_post_start_lines(&post_start, &["rctl -a jail:", "cpuset -l"])?;

    let full_range = format!("0-{}", host_logical_cpus.saturating_sub(1));
    for (program, args) in [
        ("rctl", vec!["-r".to_string(), format!("jail:{hashed_name}")]),
        ("cpuset", vec!["-l".to_string(), full_range, "-j".to_string(), hashed_name.clone()]),
    ] {
        let output = Command::new(program).args(&args).output()?;
        if !output.status.success() {
            let msg = String::from_utf8_lossy(&output.stderr).to_string();
            if !is_soft_error(&msg) {
                eprintln!("jail[{ctid}]: warning: {program} reset failed: {msg}");
            }
        }
    }
    Ok(())
}

fn upsert_post_start_line(path: &Path, prefix: &str, new_line: &str) -> Result<()> {
    let existing = std::fs::read_to_string(path).unwrap_or_else(|_| "#!/bin/sh\n".to_string());
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|l| !l.starts_with(prefix))
        .map(|l| l.to_string())
        .collect();
    lines.push(new_line.to_string());
    atomic_write(path, format!("{}\n", lines.join("\n")).as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn remove_post_start_lines(path: &Path, prefixes: &[&str]) -> Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return Ok(()),
    };
    let lines: Vec<String> = existing
        .lines()
        .filter(|l| !prefixes.iter().any(|p| l.starts_with(p)))
        .map(|l| l.to_string())
        .collect();
    atomic_write(path, format!("{}\n", lines.join("\n")).as_bytes())
}

/// `JailAction` verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailAction {
    Start,
    Stop,
    Restart,
}

/// Invokes `jail -f <conf> -c <hashedName>` (or `-r` for stop),
/// swallowing `not found` / `No such process` output on stop.
pub fn run_jail_action(jails_root: &Path, ctid: u64, action: JailAction) -> Result<()> {
    let hashed_name = jail_hashed_name(ctid);
    let conf_path = jails_root.join(format!("{ctid}.conf"));

    let flag = match action {
        JailAction::Start => "-c",
        JailAction::Stop => "-r",
        JailAction::Restart => {
            run_jail_action(jails_root, ctid, JailAction::Stop)?;
            return run_jail_action(jails_root, ctid, JailAction::Start);
        }
    };

    let output = Command::new("jail")
        .arg("-f")
        .arg(&conf_path)
        .arg(flag)
        .arg(&hashed_name)
        .output()?;

    if !output.status.success() {
        let msg = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if action == JailAction::Stop && is_soft_error(&msg) {
            return Ok(());
        }
        return Err(Error::JailOperation(msg));
    }

    Ok(())
}

/// One telemetry sample for a jail, as persisted into the ring buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JailStatsSample {
    pub cpu_pct: f64,
    pub memory_bytes: u64,
}

/// A capped ring buffer of jail telemetry samples.
pub struct JailStatsHistory {
    capacity: usize,
    samples: VecDeque<JailStatsSample>,
}

impl JailStatsHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: JailStatsSample) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn samples(&self) -> &VecDeque<JailStatsSample> {
        &self.samples
    }
}

/// Resolves the live JID via `jls` and, if active, sums per-process
/// pcpu/rss from `ps -axo jid,pcpu,rss --libxo json`, normalized by
/// the jail's allowed core count.
pub fn get_jail_stats(ctid: u64, allowed_cores: usize) -> Result<Option<JailStatsSample>> {
    let hashed_name = jail_hashed_name(ctid);
    let jls = Command::new("jls")
        .args(["-j", &hashed_name, "jid"])
        .output()?;
    if !jls.status.success() {
        return Ok(None);
    }
    let jid_str = String::from_utf8_lossy(&jls.stdout).trim().to_string();
    let jid: i32 = match jid_str.parse() {
        Ok(j) => j,
        Err(_) => return Ok(None),
    };

    let ps = Command::new("ps")
        .args(["-axo", "jid,pcpu,rss", "--libxo", "json"])
        .output()?;
    if !ps.status.success() {
        return Err(Error::JailOperation(
            String::from_utf8_lossy(&ps.stderr).to_string(),
        ));
    }

    let parsed: serde_json::Value = serde_json::from_slice(&ps.stdout)?;
    let mut cpu_total = 0.0f64;
    let mut rss_total_kib = 0u64;

    if let Some(rows) = parsed
        .get("process-information")
        .and_then(|v| v.get("process"))
        .and_then(|v| v.as_array())
    {
        for row in rows {
            let row_jid = row.get("jid").and_then(|v| v.as_i64()).unwrap_or(-1) as i32;
            if row_jid != jid {
                continue;
            }
            cpu_total += row
                .get("pcpu")
                .and_then(|v| v.as_str().and_then(|s| s.parse::<f64>().ok()).or_else(|| v.as_f64()))
                .unwrap_or(0.0);
            rss_total_kib += row
                .get("rss")
                .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                .unwrap_or(0);
        }
    }

    let normalized_cpu = if allowed_cores > 0 {
        (cpu_total / allowed_cores as f64).min(100.0)
    } else {
        cpu_total.min(100.0)
    };

    Ok(Some(JailStatsSample {
        cpu_pct: normalized_cpu,
        memory_bytes: rss_total_kib * 1024,
    }))
}

pub fn provision_root(release_archive: &Path, jail_path: &Path) -> Result<()> {
    std::fs::create_dir_all(jail_path)?;
    let output = Command::new("tar")
        .args(["-x", "--no-xattrs", "-f"])
        .arg(release_archive)
        .arg("-C")
        .arg(jail_path)
        .output()?;
    if !output.status.success() {
        return Err(Error::JailOperation(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_name_matches_ctid_hash() {
        assert_eq!(jail_hashed_name(101), ctid_hash(101));
    }

    #[test]
    fn parse_and_render_round_trips_network_region() {
        let doc = JailConfigDocument::parse("");
        let rendered = doc.render("abcde");
        assert!(rendered.contains(NETWORK_MARKER_START));
        assert!(rendered.contains(ALLOWED_MARKER_START));
        assert!(rendered.contains(ADDITIONAL_MARKER_START));
    }

    #[test]
    fn modify_allowed_options_regenerates_region() {
        let mut doc = JailConfigDocument::default();
        modify_allowed_options(&mut doc, &["raw_sockets", "sysvipc"], true, Some(4));
        assert!(doc.allowed_lines.contains(&"allow.raw_sockets;".to_string()));
        assert!(doc.allowed_lines.contains(&"mount.devfs;".to_string()));
        assert!(doc.allowed_lines.contains(&"devfs_ruleset=4;".to_string()));
    }

    #[test]
    fn preamble_and_trailer_lines_survive_parse() {
        let input = "\
host.hostname = \"web01\";
vnet;
vnet.interface += \"aaaaa_net1b\";
allow.raw_sockets;
### These are user-defined additional options ###
mount.procfs = false;

exec.start = \"/bin/sh /etc/rc\";
";
        let doc = JailConfigDocument::parse(input);
        assert!(doc.preamble.iter().any(|l| l.contains("host.hostname")));
        assert!(doc.network_lines.iter().any(|l| l.contains("vnet;")));
        assert!(doc.allowed_lines.iter().any(|l| l.contains("allow.raw_sockets")));
        assert!(doc.additional_lines.iter().any(|l| l.contains("mount.procfs")));
        assert!(doc.trailer.iter().any(|l| l.contains("exec.start")));
    }

    #[test]
    fn stats_history_evicts_oldest_past_capacity() {
        let mut history = JailStatsHistory::new(2);
        history.push(JailStatsSample { cpu_pct: 1.0, memory_bytes: 1 });
        history.push(JailStatsSample { cpu_pct: 2.0, memory_bytes: 2 });
        history.push(JailStatsSample { cpu_pct: 3.0, memory_bytes: 3 });
        assert_eq!(history.samples().len(), 2);
        assert_eq!(history.samples()[0].cpu_pct, 2.0);
    }

    #[test]
    fn update_cpu_selects_least_used_cpus() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("101/scripts")).unwrap();
        update_cpu(dir.path(), 101, 2, &[vec![0, 1]], 4).ok();
        let contents = std::fs::read_to_string(dir.path().join("101/scripts/post-start.sh")).unwrap();
        assert!(contents.contains("cpuset -l 2,3"));
    }

    #[test]
    fn update_cpu_rejects_more_cores_than_host_has() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("101/scripts")).unwrap();
        let err = update_cpu(dir.path(), 101, 5, &[], 4).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!dir.path().join("101/scripts/post-start.sh").exists());
    }

    #[test]
    fn update_memory_rejects_below_one_mib() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("101/scripts")).unwrap();
        let err = update_memory(dir.path(), 101, 0).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
