//! Delegate Library Resolver
//!
//! Locates the Teflon delegate (`libteflon.so`) by trying an ordered list
//! of strategies and stopping at the first hit:
//! - fixed mount points (container mounts and the host driver path)
//! - glob patterns over common installation prefixes
//! - the running system's store closure (diagnostics only)

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::DelegateConfig;
use crate::error::{Error, Result};

/// File name of the Mesa Teflon delegate
pub const DELEGATE_LIBRARY: &str = "libteflon.so";

/// Mount points checked by the server
pub const SERVER_MOUNT_POINTS: &[&str] = &[
    "/mesa-libs/libteflon.so",
    "/run/opengl-driver/lib/libteflon.so",
];

/// Glob patterns searched by the server
pub const SERVER_SEARCH_PATTERNS: &[&str] = &[
    "/usr/lib/*/libteflon.so",
    "/usr/local/lib/libteflon.so",
    "/nix/store/*mesa*/lib/libteflon.so",
];

/// Mount points checked by the diagnostics tool
pub const DIAGNOSTICS_MOUNT_POINTS: &[&str] = &[
    "/run/opengl-driver/lib/libteflon.so",
    "/run/opengl-driver-32/lib/libteflon.so",
];

/// Store patterns searched by the diagnostics tool, newest Mesa first
pub const DIAGNOSTICS_SEARCH_PATTERNS: &[&str] = &[
    "/nix/store/*mesa-25.3*/lib/libteflon.so",
    "/nix/store/*mesa-25*/lib/libteflon.so",
    "/nix/store/*mesa*/lib/libteflon.so",
    "/nix/store/*graphics-drivers*/lib/libteflon.so",
];

/// Query of the active system closure for graphics driver packages
#[derive(Debug, Clone)]
pub struct SystemClosure {
    /// Profile whose closure is listed
    pub profile: PathBuf,
    /// Program and leading arguments; the resolved profile is appended
    pub command: Vec<String>,
    /// Case-insensitive substrings selecting candidate store paths
    pub keywords: Vec<String>,
    /// Location of the library inside a candidate
    pub sub_path: PathBuf,
    pub timeout: Duration,
}

impl Default for SystemClosure {
    fn default() -> Self {
        Self {
            profile: PathBuf::from("/run/current-system/sw"),
            command: vec!["nix-store".to_string(), "-qR".to_string()],
            keywords: vec!["mesa".to_string(), "graphics-drivers".to_string()],
            sub_path: PathBuf::from("lib").join(DELEGATE_LIBRARY),
            timeout: Duration::from_secs(5),
        }
    }
}

/// One way of looking for the library
#[derive(Debug, Clone)]
pub enum ResolveStrategy {
    MountPoints(Vec<PathBuf>),
    Glob(Vec<String>),
    SystemClosure(SystemClosure),
}

impl ResolveStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ResolveStrategy::MountPoints(_) => "mount point",
            ResolveStrategy::Glob(_) => "glob search",
            ResolveStrategy::SystemClosure(_) => "system closure",
        }
    }

    fn find(&self, tried: &mut Vec<String>) -> Option<PathBuf> {
        match self {
            ResolveStrategy::MountPoints(paths) => find_mount_point(paths, tried),
            ResolveStrategy::Glob(patterns) => find_by_glob(patterns, tried),
            ResolveStrategy::SystemClosure(closure) => find_in_closure(closure, tried),
        }
    }
}

/// Ordered, first-match-wins library search
#[derive(Debug, Clone)]
pub struct LibraryResolver {
    strategies: Vec<ResolveStrategy>,
}

impl LibraryResolver {
    pub fn new(strategies: Vec<ResolveStrategy>) -> Self {
        Self { strategies }
    }

    /// Strategies used by the inference server
    pub fn server_default() -> Self {
        Self::new(vec![
            ResolveStrategy::MountPoints(SERVER_MOUNT_POINTS.iter().map(PathBuf::from).collect()),
            ResolveStrategy::Glob(SERVER_SEARCH_PATTERNS.iter().map(|s| s.to_string()).collect()),
        ])
    }

    /// Strategies used by the diagnostics tool, including closure introspection
    pub fn diagnostics_default() -> Self {
        Self::new(vec![
            ResolveStrategy::MountPoints(DIAGNOSTICS_MOUNT_POINTS.iter().map(PathBuf::from).collect()),
            ResolveStrategy::SystemClosure(SystemClosure::default()),
            ResolveStrategy::Glob(DIAGNOSTICS_SEARCH_PATTERNS.iter().map(|s| s.to_string()).collect()),
        ])
    }

    /// Build from configuration; a pinned library replaces the search
    pub fn from_config(config: &DelegateConfig) -> Self {
        if let Some(library) = &config.library {
            return Self::new(vec![ResolveStrategy::MountPoints(vec![library.clone()])]);
        }
        Self::new(vec![
            ResolveStrategy::MountPoints(config.mount_points.clone()),
            ResolveStrategy::Glob(config.search_patterns.clone()),
        ])
    }

    pub fn strategies(&self) -> &[ResolveStrategy] {
        &self.strategies
    }

    /// Find the delegate library
    pub fn resolve(&self) -> Result<PathBuf> {
        let mut tried = Vec::new();

        for strategy in &self.strategies {
            if let Some(path) = strategy.find(&mut tried) {
                info!("Found Teflon library via {}: {}", strategy.name(), path.display());
                return Ok(path);
            }
            debug!("No Teflon library via {}", strategy.name());
        }

        Err(Error::LibraryNotFound { tried })
    }
}

fn find_mount_point(paths: &[PathBuf], tried: &mut Vec<String>) -> Option<PathBuf> {
    for path in paths {
        tried.push(path.display().to_string());

        if !path.exists() {
            debug!("Not present: {}", path.display());
            continue;
        }

        let is_link = fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            match fs::canonicalize(path) {
                Ok(real) => info!("Found Teflon library: {} -> {}", path.display(), real.display()),
                Err(e) => debug!("Could not resolve link {}: {}", path.display(), e),
            }
        }

        // The link itself is returned, not its target
        return Some(path.clone());
    }
    None
}

fn find_by_glob(patterns: &[String], tried: &mut Vec<String>) -> Option<PathBuf> {
    for pattern in patterns {
        tried.push(pattern.clone());

        let entries = match glob::glob(pattern) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Invalid search pattern {}: {}", pattern, e);
                continue;
            }
        };

        let mut matches: Vec<PathBuf> = entries
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    debug!("Skipping unreadable entry for {}: {}", pattern, e);
                    None
                }
            })
            .collect();

        if matches.is_empty() {
            debug!("No match for pattern {}", pattern);
            continue;
        }

        // Reverse lexical order: higher version/hash strings sort first
        matches.sort_by(|a, b| b.cmp(a));
        info!("Found Teflon via pattern {}: {} candidate(s)", pattern, matches.len());
        return matches.into_iter().next();
    }
    None
}

fn find_in_closure(closure: &SystemClosure, tried: &mut Vec<String>) -> Option<PathBuf> {
    tried.push(format!("system closure of {}", closure.profile.display()));

    let profile = match fs::canonicalize(&closure.profile) {
        Ok(p) => p,
        Err(e) => {
            debug!("Could not resolve system profile {}: {}", closure.profile.display(), e);
            return None;
        }
    };

    let listing = match run_with_timeout(&closure.command, &profile, closure.timeout) {
        Ok(out) => out,
        Err(e) => {
            debug!("Could not query system closure: {}", e);
            return None;
        }
    };

    let keywords: Vec<String> = closure.keywords.iter().map(|k| k.to_lowercase()).collect();
    for line in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let lower = line.to_lowercase();
        if !keywords.iter().any(|k| lower.contains(k)) {
            continue;
        }
        let candidate = Path::new(line).join(&closure.sub_path);
        if candidate.exists() {
            info!("Found Teflon in system closure: {}", line);
            return Some(candidate);
        }
    }
    None
}

/// Owns a spawned child; kills and reaps it when dropped
struct Reaper(Child);

impl Drop for Reaper {
    fn drop(&mut self) {
        if !matches!(self.0.try_wait(), Ok(Some(_))) {
            let _ = self.0.kill();
        }
        let _ = self.0.wait();
    }
}

/// Run `command profile` and capture stdout, killing it after `timeout`
fn run_with_timeout(command: &[String], profile: &Path, timeout: Duration) -> anyhow::Result<String> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty closure command"))?;

    let mut child = Reaper(
        Command::new(program)
            .args(args)
            .arg(profile)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?,
    );

    // Drain stdout on a thread so a large closure cannot fill the pipe.
    // The thread ends once every holder of the pipe has exited.
    let mut stdout = child
        .0
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("stdout not captured"))?;
    let reader = std::thread::spawn(move || {
        let mut out = String::new();
        stdout.read_to_string(&mut out).map(|_| out)
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.0.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            anyhow::bail!("{} timed out after {:?}", program, timeout);
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    let out = reader
        .join()
        .map_err(|_| anyhow::anyhow!("stdout reader panicked"))??;

    if !status.success() {
        anyhow::bail!("{} exited with {}", program, status);
    }
    Ok(out)
}
