use crate::pypi::{self, PypiOracle};
use crate::remote;
use crate::repo::{RecipeIndex, RecipeInfo, ScriptIndex, ScriptKind};
use crate::resolve;
use anyhow::{Context, Result, bail};
use md5::{Digest, Md5};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// Per-worker output palette, indexed by slot modulo its length.
const COLOURS: [&str; 6] = [
    "\x1b[39m", // normal
    "\x1b[91m", // red
    "\x1b[94m", // blue
    "\x1b[93m", // yellow
    "\x1b[95m", // magenta
    "\x1b[96m", // cyan
];
const COLOUR_RESET: &str = "\x1b[0m";

const COMPOSITE_SCRIPT: &str = "sboforge-build.sh";
pub const PENDING_FILE: &str = "pending.txt";
pub const BUILT_FILE: &str = "built.txt";

static CANCELLATION_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn request_cancellation() {
    CANCELLATION_REQUESTED.store(true, AtomicOrdering::SeqCst);
    log_progress("phase=schedule status=cancel-requested");
}

pub fn reset_cancellation() {
    CANCELLATION_REQUESTED.store(false, AtomicOrdering::SeqCst);
}

fn cancellation_requested() -> bool {
    CANCELLATION_REQUESTED.load(AtomicOrdering::SeqCst)
}

pub fn log_progress(message: impl AsRef<str>) {
    println!("progress {}", message.as_ref());
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dotdir: PathBuf,
    pub artifact_dir: PathBuf,
    pub num_threads: usize,
    pub donothing: bool,
    pub onlydownload: bool,
    pub pipinstall: bool,
    pub getinparallel: bool,
    pub nocolour: bool,
}

/// Exclusive lock over a shared external resource. A passthrough lock keeps
/// the acquire/release shape of its callers but never contends; acquisitions
/// are counted either way so tests can observe contention patterns.
pub struct ResourceLock {
    mutex: Mutex<()>,
    passthrough: bool,
    acquisitions: AtomicUsize,
}

pub struct ResourceGuard<'a> {
    _guard: Option<MutexGuard<'a, ()>>,
}

impl ResourceLock {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            passthrough: false,
            acquisitions: AtomicUsize::new(0),
        }
    }

    pub fn noncontending() -> Self {
        Self {
            mutex: Mutex::new(()),
            passthrough: true,
            acquisitions: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) -> ResourceGuard<'_> {
        let guard = if self.passthrough {
            None
        } else {
            match self.mutex.lock() {
                Ok(guard) => Some(guard),
                Err(poisoned) => Some(poisoned.into_inner()),
            }
        };
        self.acquisitions.fetch_add(1, AtomicOrdering::SeqCst);
        ResourceGuard { _guard: guard }
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(AtomicOrdering::SeqCst)
    }
}

/// The two process-wide resource locks: the installer database and the
/// shared download bandwidth. The download lock stops contending when
/// parallel downloads are enabled.
pub struct BuildLocks {
    pub installer: ResourceLock,
    pub download: ResourceLock,
}

impl BuildLocks {
    pub fn new(parallel_downloads: bool) -> Self {
        Self {
            installer: ResourceLock::new(),
            download: if parallel_downloads {
                ResourceLock::noncontending()
            } else {
                ResourceLock::new()
            },
        }
    }
}

pub enum ConsoleMessage {
    Line {
        text: Vec<u8>,
        package: String,
        slot: usize,
    },
    Shutdown,
}

enum DoneSignal {
    Success(String),
    Failure(String),
}

/// Single consumer of the console channel. Each line is written in one call
/// so concurrent workers never interleave inside a line; no cross-worker
/// ordering is promised.
fn console_loop<W: Write>(
    messages: Receiver<ConsoleMessage>,
    config: &EngineConfig,
    mut writer: W,
) -> W {
    loop {
        let Ok(message) = messages.recv() else {
            break;
        };
        let ConsoleMessage::Line { text, package, slot } = message else {
            break;
        };
        let prefix = if config.num_threads <= 1 {
            format!("{package}: ")
        } else {
            format!("[{slot}]:{package}: ")
        };
        let (colour, reset) = if config.nocolour {
            ("", "")
        } else {
            (COLOURS[slot % COLOURS.len()], COLOUR_RESET)
        };
        let mut line = Vec::with_capacity(colour.len() + prefix.len() + text.len() + reset.len());
        line.extend_from_slice(colour.as_bytes());
        line.extend_from_slice(prefix.as_bytes());
        line.extend_from_slice(&text);
        line.extend_from_slice(reset.as_bytes());
        let _ = writer.write_all(&line);
        let _ = writer.flush();
    }
    writer
}

/// Write the pending/built name sets for external observers. Best effort:
/// failures are logged and the run continues.
fn publish_status(dotdir: &Path, pending: &[String], built: &BTreeSet<String>) {
    let mut pending_lines = String::new();
    for name in pending {
        pending_lines.push_str(name);
        pending_lines.push('\n');
    }
    let mut built_lines = String::new();
    for name in built {
        built_lines.push_str(name);
        built_lines.push('\n');
    }
    for (file, payload) in [(PENDING_FILE, pending_lines), (BUILT_FILE, built_lines)] {
        let path = dotdir.join(file);
        if let Err(err) = fs::write(&path, payload) {
            log_progress(format!(
                "phase=status-sink status=write-failed path={} detail={err}",
                path.display()
            ));
        }
    }
}

/// MD5 digest of a file, streamed in 1 MiB blocks; `None` when absent.
fn md5_file(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let file =
        fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Md5::new();
    let mut block = vec![0u8; 0x100000];
    loop {
        let read = reader
            .read(&mut block)
            .with_context(|| format!("reading {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&block[..read]);
    }
    Ok(Some(hex::encode(hasher.finalize())))
}

#[derive(Debug, PartialEq, Eq)]
struct DownloadEntry {
    url: String,
    filename: String,
    checksum: String,
}

/// Source archives a recipe needs: the x86_64 fields when present, the
/// generic fields otherwise. Filenames are the last path segment of the url.
fn source_files(info: &RecipeInfo) -> Vec<DownloadEntry> {
    let (urls, checksums) = if info.list("DOWNLOAD_x86_64").is_empty() {
        (info.list("DOWNLOAD"), info.list("MD5SUM"))
    } else {
        (info.list("DOWNLOAD_x86_64"), info.list("MD5SUM_x86_64"))
    };
    urls.iter()
        .zip(checksums.iter())
        .map(|(url, checksum)| DownloadEntry {
            url: url.clone(),
            filename: url_filename(url),
            checksum: checksum.clone(),
        })
        .collect()
}

fn url_filename(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

/// The freshly-built package archive for `package`, located by its
/// `<name>-<version>-` prefix. Zero or multiple candidates both fail; there
/// is no tie-break rule.
fn locate_built_artifact(artifact_dir: &Path, package: &str, version: &str) -> Result<PathBuf> {
    let prefix = format!("{package}-{version}-");
    let mut matches = Vec::new();
    for entry in fs::read_dir(artifact_dir)
        .with_context(|| format!("reading artifact directory {}", artifact_dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("reading artifact directory {}", artifact_dir.display()))?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            matches.push(entry.path());
        }
    }
    if matches.len() == 1 {
        Ok(matches.remove(0))
    } else {
        bail!(
            "expected exactly one built artifact matching {prefix}* in {}, found {}",
            artifact_dir.display(),
            matches.len()
        )
    }
}

/// Executes shell commands for one job, streaming their tagged output onto
/// the console channel. In dry-run mode commands are echoed instead of run.
struct Runner<'a> {
    working_dir: PathBuf,
    console: &'a Sender<ConsoleMessage>,
    package: String,
    slot: usize,
    donothing: bool,
}

impl Runner<'_> {
    fn emit_line(&self, text: Vec<u8>) {
        let _ = self.console.send(ConsoleMessage::Line {
            text,
            package: self.package.clone(),
            slot: self.slot,
        });
    }

    /// Progress note: echoed through the shell in dry-run mode, pushed
    /// straight onto the console channel otherwise.
    fn note(&self, message: &str) -> Result<()> {
        if self.donothing {
            self.run(&format!("echo \"{message}\""))?;
        } else {
            self.emit_line(format!("{message}\n").into_bytes());
        }
        Ok(())
    }

    fn exec(&self, command: &str) -> Result<ExitStatus> {
        if self.donothing {
            self.run(&format!("echo \"{}\"", command.replace('"', "\\\"")))
        } else {
            self.run(command)
        }
    }

    fn run(&self, command: &str) -> Result<ExitStatus> {
        let wrapped = remote::wrap(command);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&wrapped)
            .current_dir(&self.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning '{wrapped}' for {}", self.package))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        thread::scope(|scope| {
            if let Some(stdout) = stdout {
                scope.spawn(|| stream_output(stdout, self.console, &self.package, self.slot));
            }
            if let Some(stderr) = stderr {
                scope.spawn(|| stream_output(stderr, self.console, &self.package, self.slot));
            }
        });
        child
            .wait()
            .with_context(|| format!("waiting for '{wrapped}' for {}", self.package))
    }
}

fn stream_output<R: Read>(stream: R, console: &Sender<ConsoleMessage>, package: &str, slot: usize) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let _ = console.send(ConsoleMessage::Line {
                    text: line,
                    package: package.to_string(),
                    slot,
                });
            }
        }
    }
}

struct WorkerContext<'a> {
    index: &'a RecipeIndex,
    oracle: &'a PypiOracle,
    scripts: &'a ScriptIndex,
    locks: &'a BuildLocks,
    config: &'a EngineConfig,
    console: Sender<ConsoleMessage>,
    done: Sender<DoneSignal>,
    jobs: Arc<Mutex<Receiver<Option<String>>>>,
}

/// One worker slot: takes jobs until a sentinel arrives, framing each job so
/// its outcome reaches the scheduler exactly once.
fn worker_loop(ctx: WorkerContext<'_>, slot: usize) {
    let bot_root = ctx.config.dotdir.join("bots").join(format!("{slot:02}"));
    if bot_root.exists() {
        let _ = fs::remove_dir_all(&bot_root);
    }
    if let Err(err) = fs::create_dir_all(&bot_root) {
        log_progress(format!(
            "phase=worker status=unusable slot={slot} detail={err}"
        ));
        return;
    }

    let mut jobseq = 0usize;
    loop {
        let job = {
            let Ok(receiver) = ctx.jobs.lock() else {
                return;
            };
            receiver.recv()
        };
        let Ok(Some(package)) = job else {
            return;
        };
        jobseq += 1;
        let working = bot_root.join(format!("{jobseq}_{package}"));
        let runner = Runner {
            working_dir: working.clone(),
            console: &ctx.console,
            package: package.clone(),
            slot,
            donothing: ctx.config.donothing,
        };
        match build_one(&ctx, &runner, &package, &working) {
            Ok(()) => {
                let _ = ctx.done.send(DoneSignal::Success(package));
            }
            Err(err) => {
                runner.emit_line(format!("build of {package} failed: {err:#}\n").into_bytes());
                let _ = ctx.done.send(DoneSignal::Failure(package));
            }
        }
    }
}

/// The per-job pipeline: index-install short-circuit, materialise, fetch,
/// composite script assembly, build, artifact location, install.
fn build_one(
    ctx: &WorkerContext<'_>,
    runner: &Runner<'_>,
    package: &str,
    working: &Path,
) -> Result<()> {
    let config = ctx.config;

    if !config.donothing && working.exists() {
        fs::remove_dir_all(working)
            .with_context(|| format!("clearing working directory {}", working.display()))?;
    }
    fs::create_dir_all(working)
        .with_context(|| format!("creating working directory {}", working.display()))?;

    if config.pipinstall
        && ctx.index.is_language_package(package)?
        && let Some(pypi) = ctx.oracle.pypi_name(package)
    {
        let _installer = ctx.locks.installer.acquire();
        runner.exec(&format!("{} install {}", pypi::pip_version(package), pypi))?;
        return Ok(());
    }

    let recipe_dir = ctx.index.lookup(package)?;
    if !config.donothing {
        remote::send(recipe_dir, working)?;
    }

    let info = ctx.index.info(package)?;
    let category = ctx.index.category_of(package)?;
    let download_dir = config.dotdir.join("downloads").join(&category).join(package);
    fs::create_dir_all(&download_dir)
        .with_context(|| format!("creating download directory {}", download_dir.display()))?;
    for entry in source_files(&info) {
        let location = download_dir.join(&entry.filename);
        if md5_file(&location)?.as_deref() != Some(entry.checksum.as_str()) {
            let _download = ctx.locks.download.acquire();
            runner.exec(&format!(
                "wget --no-check-certificate -O {} {}",
                location.display(),
                entry.url
            ))?;
            if !config.donothing {
                let fetched = md5_file(&location)?;
                if fetched.as_deref() != Some(entry.checksum.as_str()) {
                    bail!(
                        "checksum mismatch for {} after download: expected {} got {}",
                        entry.filename,
                        entry.checksum,
                        fetched.unwrap_or_else(|| "nothing".to_string())
                    );
                }
            }
        }
        runner.exec(&format!(
            "cp {} {}",
            location.display(),
            working.join(&entry.filename).display()
        ))?;
    }

    if config.onlydownload {
        return Ok(());
    }

    let mut script = Vec::from(&b"#!/bin/sh\n"[..]);
    if let Some(before) = ctx.scripts.get(ScriptKind::Before, package) {
        runner.note(&format!("including *before* script for {package}"))?;
        append_script(&mut script, before)?;
    }
    // The requires closure deliberately ignores installed-ness so hook
    // scripts fire even for dependencies the build list skipped.
    for dep in resolve::resolve(ctx.index, ctx.oracle, &[package.to_string()], false)? {
        if dep == package {
            continue;
        }
        if let Some(requires) = ctx.scripts.get(ScriptKind::Requires, &dep) {
            runner.note(&format!("including *requires* script for {dep}"))?;
            append_script(&mut script, requires)?;
        }
    }
    runner.note(&format!("running build script {package}.SlackBuild"))?;
    if !config.donothing {
        append_script(&mut script, &working.join(format!("{package}.SlackBuild")))?;
    }
    if let Some(after) = ctx.scripts.get(ScriptKind::After, package) {
        runner.note(&format!("including *after* script for {package}"))?;
        append_script(&mut script, after)?;
    }

    if !config.donothing {
        let script_path = working.join(COMPOSITE_SCRIPT);
        fs::write(&script_path, &script)
            .with_context(|| format!("writing composite script {}", script_path.display()))?;
        make_executable(&script_path)?;
        let status = runner.exec(&format!("./{COMPOSITE_SCRIPT}"))?;
        if !status.success() {
            bail!("build script for {package} exited with {status}");
        }
    }

    let Some(version) = info.version() else {
        bail!("info file for {package} has no VERSION");
    };
    let _installer = ctx.locks.installer.acquire();
    let artifact = if config.donothing {
        config.artifact_dir.join(format!("{package}-{version}-...tgz"))
    } else {
        locate_built_artifact(&config.artifact_dir, package, version)?
    };
    runner.exec(&format!("installpkg {}", artifact.display()))?;
    Ok(())
}

fn append_script(buffer: &mut Vec<u8>, path: &Path) -> Result<()> {
    let bytes =
        fs::read(path).with_context(|| format!("reading script {}", path.display()))?;
    buffer.extend_from_slice(&bytes);
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("marking {} executable", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Build every package in `resolved` across the configured worker pool,
/// honouring dependency order wave by wave.
pub fn run_build(
    index: &RecipeIndex,
    oracle: &PypiOracle,
    scripts: &ScriptIndex,
    resolved: &[String],
    config: &EngineConfig,
) -> Result<()> {
    let locks = BuildLocks::new(config.getinparallel);
    run_build_inner(index, oracle, scripts, resolved, config, &locks, std::io::stdout())
        .map(|_| ())
}

fn run_build_inner<W: Write + Send>(
    index: &RecipeIndex,
    oracle: &PypiOracle,
    scripts: &ScriptIndex,
    resolved: &[String],
    config: &EngineConfig,
    locks: &BuildLocks,
    writer: W,
) -> Result<W> {
    let num_threads = config.num_threads.max(1);
    log_progress(format!(
        "phase=schedule status=starting packages={} workers={}",
        resolved.len(),
        num_threads
    ));

    // Direct dependencies restricted to the scheduled set: the only edges
    // that gate wave formation.
    let scheduled: HashSet<&str> = resolved.iter().map(String::as_str).collect();
    let mut deps_in_run: HashMap<String, Vec<String>> = HashMap::new();
    for package in resolved {
        let deps = resolve::buildable_deps(index, package)?
            .into_iter()
            .filter(|dep| scheduled.contains(dep.as_str()))
            .collect();
        deps_in_run.insert(package.clone(), deps);
    }

    let (jobs_tx, jobs_rx) = channel::<Option<String>>();
    let jobs_rx = Arc::new(Mutex::new(jobs_rx));
    let (done_tx, done_rx) = channel::<DoneSignal>();
    let (console_tx, console_rx) = channel::<ConsoleMessage>();

    let mut aborting = false;
    let writer = thread::scope(|scope| -> Result<W> {
        let mux = scope.spawn(|| console_loop(console_rx, config, writer));
        let mut workers = Vec::new();
        for slot in 0..num_threads {
            let ctx = WorkerContext {
                index,
                oracle,
                scripts,
                locks,
                config,
                console: console_tx.clone(),
                done: done_tx.clone(),
                jobs: Arc::clone(&jobs_rx),
            };
            workers.push(scope.spawn(move || worker_loop(ctx, slot)));
        }
        // Completion signals only come from workers from here on.
        drop(done_tx);

        let mut pending: Vec<String> = resolved.to_vec();
        let mut built: BTreeSet<String> = BTreeSet::new();
        let mut in_flight = 0usize;

        while !pending.is_empty() {
            if cancellation_requested() {
                log_progress(format!(
                    "phase=schedule status=cancelled pending={}",
                    pending.len()
                ));
                aborting = true;
                break;
            }
            let (ready, rest): (Vec<String>, Vec<String>) =
                pending.iter().cloned().partition(|package| {
                    deps_in_run
                        .get(package)
                        .map(|deps| deps.iter().all(|dep| built.contains(dep)))
                        .unwrap_or(true)
                });
            if ready.is_empty() && in_flight == 0 {
                // Nothing runnable and nothing running: malformed input.
                log_progress(format!(
                    "phase=schedule status=stalled pending={}",
                    rest.join(",")
                ));
                aborting = true;
                break;
            }
            if !ready.is_empty() {
                log_progress(format!(
                    "phase=schedule status=wave dispatched={} waiting={} built={}",
                    ready.join(","),
                    rest.len(),
                    built.len()
                ));
            }
            for package in &ready {
                if jobs_tx.send(Some(package.clone())).is_err() {
                    aborting = true;
                    break;
                }
            }
            if aborting {
                break;
            }
            in_flight += ready.len();
            publish_status(&config.dotdir, &pending, &built);
            pending = rest;

            match done_rx.recv() {
                Ok(DoneSignal::Success(package)) => {
                    in_flight = in_flight.saturating_sub(1);
                    built.insert(package);
                }
                Ok(DoneSignal::Failure(package)) => {
                    in_flight = in_flight.saturating_sub(1);
                    log_progress(format!("phase=schedule status=failed package={package}"));
                    aborting = true;
                    break;
                }
                Err(_) => {
                    aborting = true;
                    break;
                }
            }
        }

        // Sentinels queue behind any jobs already dispatched; workers finish
        // those first, then exit.
        for _ in 0..num_threads {
            let _ = jobs_tx.send(None);
        }
        for worker in workers {
            let _ = worker.join();
        }
        for signal in done_rx.try_iter() {
            match signal {
                DoneSignal::Success(package) => {
                    built.insert(package);
                }
                DoneSignal::Failure(package) => {
                    log_progress(format!("phase=schedule status=failed package={package}"));
                    aborting = true;
                }
            }
        }
        publish_status(&config.dotdir, &[], &built);

        let _ = console_tx.send(ConsoleMessage::Shutdown);
        match mux.join() {
            Ok(writer) => Ok(writer),
            Err(_) => bail!("console multiplexer thread panicked"),
        }
    })?;

    if aborting {
        if cancellation_requested() {
            bail!("build cancelled");
        }
        bail!("build aborted after failure");
    }
    log_progress(format!(
        "phase=schedule status=completed built={}",
        resolved.len()
    ));
    Ok(writer)
}
