//! Lifecycle hooks for guests.
//!
//! A hook's script body is owned by the guest record; this module only
//! materializes it to disk (wrapped between markers so hand edits to
//! the engine-generated prelude around it survive) and runs it.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const MARKER_START: &str = "### Start User-Managed Hook ###";
const MARKER_END: &str = "### End User-Managed Hook ###";

/// Lifecycle phases a hook can run at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HookPhase {
    PreStart,
    Start,
    PostStart,
    PreStop,
    Stop,
    PostStop,
}

impl HookPhase {
    pub fn all() -> &'static [HookPhase] {
        &[
            HookPhase::PreStart,
            HookPhase::Start,
            HookPhase::PostStart,
            HookPhase::PreStop,
            HookPhase::Stop,
            HookPhase::PostStop,
        ]
    }

    /// File name the phase's script is materialized under.
    pub fn file_name(&self) -> &'static str {
        match self {
            HookPhase::PreStart => "preStart.sh",
            HookPhase::Start => "start.sh",
            HookPhase::PostStart => "postStart.sh",
            HookPhase::PreStop => "preStop.sh",
            HookPhase::Stop => "stop.sh",
            HookPhase::PostStop => "postStop.sh",
        }
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HookPhase::PreStart => "preStart",
            HookPhase::Start => "start",
            HookPhase::PostStart => "postStart",
            HookPhase::PreStop => "preStop",
            HookPhase::Stop => "stop",
            HookPhase::PostStop => "postStop",
        };
        write!(f, "{s}")
    }
}

/// A guest's hook definition, as carried in the DB.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Hook {
    pub phase: HookPhase,
    pub enabled: bool,
    pub script: String,
}

/// Context for variable substitution inside a hook script.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub guest_name: String,
    pub guest_path: String,
    pub guest_ip: Option<String>,
    pub jid: Option<i32>,
    pub extra: HashMap<String, String>,
}

impl HookContext {
    pub fn new(guest_name: &str, guest_path: &Path) -> Self {
        Self {
            guest_name: guest_name.to_string(),
            guest_path: guest_path.display().to_string(),
            guest_ip: None,
            jid: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_ip(mut self, ip: String) -> Self {
        self.guest_ip = Some(ip);
        self
    }

    pub fn with_jid(mut self, jid: i32) -> Self {
        self.jid = Some(jid);
        self
    }

    pub fn substitute(&self, input: &str) -> String {
        let mut result = input.to_string();
        result = result.replace("${guest_name}", &self.guest_name);
        result = result.replace("${guest_path}", &self.guest_path);
        result = result.replace("${guest_ip}", self.guest_ip.as_deref().unwrap_or(""));
        result = result.replace(
            "${jid}",
            &self.jid.map(|j| j.to_string()).unwrap_or_default(),
        );
        for (name, value) in &self.extra {
            result = result.replace(&format!("${{{name}}}"), value);
        }
        result
    }
}

#[derive(Debug)]
pub struct HookResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Writes `hook.script` into `<scripts_dir>/<phase file>.sh`, wrapped
/// between the user-managed markers. `prelude` is the engine-generated
/// content (network wiring, rctl, cpuset) that lives outside the
/// markers and is regenerated on every sync regardless of whether a
/// user hook is defined for that phase.
pub fn materialize(scripts_dir: &Path, phase: HookPhase, prelude: &str, hook: Option<&Hook>) -> Result<()> {
    let path = scripts_dir.join(phase.file_name());
    let body = match hook {
        Some(h) if h.enabled => h.script.as_str(),
        _ => "",
    };

    let mut contents = String::new();
    contents.push_str("#!/bin/sh\n");
    contents.push_str(prelude);
    if !prelude.is_empty() && !prelude.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(MARKER_START);
    contents.push('\n');
    contents.push_str(body);
    if !body.is_empty() && !body.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(MARKER_END);
    contents.push('\n');

    crate::jail::engine::atomic_write(&path, contents.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms)?;
    }

    Ok(())
}

/// Runs `<scripts_dir>/<phase file>.sh` on the host, substituting
/// `context` variables into the environment rather than the script
/// body (the body on disk is the DB projection verbatim).
pub fn run_phase(scripts_dir: &Path, phase: HookPhase, context: &HookContext, timeout_secs: u64) -> Result<HookResult> {
    let path = scripts_dir.join(phase.file_name());
    if !path.exists() {
        return Ok(HookResult {
            success: true,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        });
    }

    let timeout = Duration::from_secs(timeout_secs);
    let mut cmd = Command::new("/bin/sh");
    cmd.arg(&path)
        .env("SYLVE_GUEST_NAME", &context.guest_name)
        .env("SYLVE_GUEST_PATH", &context.guest_path)
        .env("SYLVE_GUEST_IP", context.guest_ip.as_deref().unwrap_or(""))
        .env(
            "SYLVE_JID",
            context.jid.map(|j| j.to_string()).unwrap_or_default(),
        )
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| Error::HookFailed {
        phase: phase.to_string(),
        command: path.display().to_string(),
        message: e.to_string(),
    })?;

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut stdout = String::new();
                let mut stderr = String::new();
                if let Some(mut h) = child.stdout.take() {
                    let _ = h.read_to_string(&mut stdout);
                }
                if let Some(mut h) = child.stderr.take() {
                    let _ = h.read_to_string(&mut stderr);
                }
                return Ok(HookResult {
                    success: status.success(),
                    exit_code: status.code(),
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::HookTimeout(timeout_secs));
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(Error::HookFailed {
                    phase: phase.to_string(),
                    command: path.display().to_string(),
                    message: format!("failed to wait on process: {e}"),
                });
            }
        }
    }
}

pub fn filter_by_phase(hooks: &[Hook], phase: HookPhase) -> Vec<&Hook> {
    hooks.iter().filter(|h| h.phase == phase).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_display_matches_camel_case() {
        assert_eq!(HookPhase::PreStart.to_string(), "preStart");
        assert_eq!(HookPhase::PostStop.to_string(), "postStop");
    }

    #[test]
    fn context_substitution() {
        let ctx = HookContext::new("web01", Path::new("/jails/101"))
            .with_ip("10.0.0.10".to_string())
            .with_jid(42);
        assert_eq!(ctx.substitute("name=${guest_name}"), "name=web01");
        assert_eq!(ctx.substitute("ip=${guest_ip}"), "ip=10.0.0.10");
        assert_eq!(ctx.substitute("jid=${jid}"), "jid=42");
    }

    #[test]
    fn materialize_wraps_body_in_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        let scripts_dir = dir.path().join("scripts");
        let hook = Hook {
            phase: HookPhase::PreStart,
            enabled: true,
            script: "echo hi".to_string(),
        };
        materialize(&scripts_dir, HookPhase::PreStart, "# prelude\n", Some(&hook)).unwrap();
        let contents = std::fs::read_to_string(scripts_dir.join("preStart.sh")).unwrap();
        assert!(contents.contains("# prelude"));
        assert!(contents.contains(MARKER_START));
        assert!(contents.contains("echo hi"));
        assert!(contents.contains(MARKER_END));
    }

    #[test]
    fn disabled_hook_leaves_body_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        let scripts_dir = dir.path().join("scripts");
        let hook = Hook {
            phase: HookPhase::Stop,
            enabled: false,
            script: "echo should-not-appear".to_string(),
        };
        materialize(&scripts_dir, HookPhase::Stop, "", Some(&hook)).unwrap();
        let contents = std::fs::read_to_string(scripts_dir.join("stop.sh")).unwrap();
        assert!(!contents.contains("should-not-appear"));
    }
}
