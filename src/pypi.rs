use crate::engine::log_progress;
use crate::remote;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

const INSTALLED_PACKAGES_DIR: &str = "/var/lib/pkgtools/packages";
const PYPI_SIMPLE_URL: &str = "https://pypi.org/simple/";
pub const UNIVERSE_CACHE_FILE: &str = "pypi-index.json";

/// Recipe names whose index name does not follow the prefix conventions.
/// A `None` entry means the recipe must never be installed from the index,
/// which is not the same as "not a language package".
const RECIPE_TO_PYPI_SPECIALS: &[(&str, Option<&str>)] = &[
    ("python-cheetah", Some("Cheetah")),
    ("python-django-legacy", Some("Django")),
    ("python-xrandr", None),
    ("python-importlib_metadata", Some("importlib-metadata")),
    ("python-uri-templates", Some("uri-template")),
    ("python-pmw", Some("Pmw")),
    ("python-django", Some("Django")),
    ("python-distutils-extra", None),
    ("python-elib.intl", Some("elib")),
    ("python-configargparse", Some("ConfigArgParse")),
    ("python-slip", Some("SLIP")),
    ("python-setuptools-doc", None),
    ("python-keybinder", None),
    ("python-twisted", Some("Twisted")),
    ("python3-setuptools_autover", None),
    ("python3-jupyter-ipykernel", Some("ipykernel")),
    ("python3-django", Some("Django")),
    ("python3-babel", Some("Babel")),
    ("python3-prompt_toolkit", Some("prompt-toolkit")),
    ("python3-cycler", Some("Cycler")),
    ("python3-dvdvideo", None),
    ("websocket-client", Some("websocket_client")),
];

enum UniverseSource {
    /// Snapshot of the ambient index, cached on disk between runs.
    Cached(PathBuf),
    /// Injected universe for deterministic tests.
    Fixed,
}

/// Answers whether a recipe is already satisfied on the target system,
/// either as a native package or through the language package manager.
pub struct PypiOracle {
    native: BTreeSet<String>,
    pip2: BTreeSet<String>,
    pip3: BTreeSet<String>,
    novirtual: bool,
    source: UniverseSource,
    universe: OnceLock<BTreeSet<String>>,
}

impl PypiOracle {
    /// Snapshot the environment: native package stems, pip-managed names for
    /// both ecosystem versions, and a lazily-fetched index universe cached
    /// under the dotdir.
    pub fn detect(dotdir: &Path, novirtual: bool, nopip2: bool, nopip3: bool) -> Self {
        let native = list_native_packages();
        let pip2 = if nopip2 { BTreeSet::new() } else { list_pip_packages("") };
        let pip3 = if nopip3 { BTreeSet::new() } else { list_pip_packages("3") };
        log_progress(format!(
            "phase=oracle status=ready native={} pip2={} pip3={} novirtual={}",
            native.len(),
            pip2.len(),
            pip3.len(),
            novirtual
        ));
        Self {
            native,
            pip2,
            pip3,
            novirtual,
            source: UniverseSource::Cached(dotdir.join(UNIVERSE_CACHE_FILE)),
            universe: OnceLock::new(),
        }
    }

    pub fn with_universe(
        native: BTreeSet<String>,
        pip2: BTreeSet<String>,
        pip3: BTreeSet<String>,
        novirtual: bool,
        universe: BTreeSet<String>,
    ) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(universe);
        Self {
            native,
            pip2,
            pip3,
            novirtual,
            source: UniverseSource::Fixed,
            universe: cell,
        }
    }

    /// True when building `name` would be redundant on this system.
    pub fn is_satisfied(&self, name: &str) -> bool {
        if self.native.contains(name) {
            return true;
        }
        if self.novirtual {
            return false;
        }
        let Some(pypi) = self.pypi_name(name) else {
            return false;
        };
        if name.starts_with("python3-") && self.pip3.contains(&pypi) {
            return true;
        }
        if name.starts_with("python-") && self.pip2.contains(&pypi) {
            return true;
        }
        false
    }

    /// Map a recipe name to the distribution name the ambient index knows it
    /// by, or `None` when no index installation should be attempted.
    pub fn pypi_name(&self, name: &str) -> Option<String> {
        let universe = self.universe();
        let stripped = name
            .strip_prefix("python3-")
            .or_else(|| name.strip_prefix("python-"));
        if let Some(rest) = stripped
            && universe.contains(rest)
        {
            return Some(rest.to_string());
        }
        if universe.contains(name) {
            return Some(name.to_string());
        }
        if let Some(rest) = name.strip_prefix("python3-") {
            let alternate = format!("python-{rest}");
            if universe.contains(&alternate) {
                return Some(alternate);
            }
        }
        for (recipe, pypi) in RECIPE_TO_PYPI_SPECIALS {
            if *recipe == name {
                return pypi.map(str::to_string);
            }
        }
        None
    }

    fn universe(&self) -> &BTreeSet<String> {
        self.universe.get_or_init(|| match &self.source {
            UniverseSource::Cached(cache_path) => load_universe(cache_path),
            UniverseSource::Fixed => BTreeSet::new(),
        })
    }
}

/// pip binary matching a recipe's ecosystem version.
pub fn pip_version(name: &str) -> &'static str {
    if name.starts_with("python3-") { "pip3" } else { "pip" }
}

/// `<stem>-<version>-<arch>-<build>` directory entry to package stem.
fn native_stem(entry: &str) -> Option<String> {
    let fields = entry.rsplitn(4, '-').collect::<Vec<_>>();
    if fields.len() == 4 {
        Some(fields[3].to_string())
    } else {
        None
    }
}

/// Enumerate native-installed package stems. Runs through the remote shim so
/// a remote target host is inspected rather than the local machine. Best
/// effort: an unreadable listing yields an empty set.
fn list_native_packages() -> BTreeSet<String> {
    let command = remote::wrap(&format!("ls -1 {INSTALLED_PACKAGES_DIR}"));
    let output = Command::new("sh").arg("-c").arg(&command).output();
    let mut stems = BTreeSet::new();
    match output {
        Ok(output) => {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                if let Some(stem) = native_stem(line.trim()) {
                    stems.insert(stem);
                }
            }
        }
        Err(err) => {
            log_progress(format!(
                "phase=oracle status=native-listing-failed detail={err}"
            ));
        }
    }
    stems
}

#[derive(Debug, Deserialize)]
struct PipListEntry {
    name: String,
}

/// Distribution names known to `pip<version>`. Best effort: a missing pip or
/// unparseable output yields an empty set.
fn list_pip_packages(version: &str) -> BTreeSet<String> {
    let command = remote::wrap(&format!("pip{version} list --format json"));
    let output = Command::new("sh").arg("-c").arg(&command).output();
    match output {
        Ok(output) => parse_pip_list(&output.stdout),
        Err(err) => {
            log_progress(format!(
                "phase=oracle status=pip-listing-failed version={version} detail={err}"
            ));
            BTreeSet::new()
        }
    }
}

fn parse_pip_list(raw: &[u8]) -> BTreeSet<String> {
    let entries: Vec<PipListEntry> = match serde_json::from_slice(raw) {
        Ok(entries) => entries,
        Err(_) => return BTreeSet::new(),
    };
    entries
        .into_iter()
        .map(|entry| {
            // Some environments print names with a stray leading dash.
            entry
                .name
                .strip_prefix('-')
                .map(str::to_string)
                .unwrap_or(entry.name)
        })
        .collect()
}

/// Load the cached index universe, fetching and persisting it on a miss.
/// Best effort throughout: failure to fetch leaves the universe empty for
/// this run and the operator owns cache invalidation.
fn load_universe(cache_path: &Path) -> BTreeSet<String> {
    if cache_path.exists() {
        match read_universe_cache(cache_path) {
            Ok(universe) => return universe,
            Err(err) => {
                log_progress(format!(
                    "phase=oracle status=universe-cache-unreadable path={} detail={err:#}",
                    cache_path.display()
                ));
            }
        }
    }
    log_progress("phase=oracle status=universe-fetch source=pypi".to_string());
    match fetch_universe() {
        Ok(universe) => {
            if let Err(err) = write_universe_cache(cache_path, &universe) {
                log_progress(format!(
                    "phase=oracle status=universe-cache-write-failed path={} detail={err:#}",
                    cache_path.display()
                ));
            }
            universe
        }
        Err(err) => {
            log_progress(format!(
                "phase=oracle status=universe-fetch-failed detail={err:#}"
            ));
            BTreeSet::new()
        }
    }
}

fn read_universe_cache(path: &Path) -> Result<BTreeSet<String>> {
    let raw = fs::read(path)
        .with_context(|| format!("reading universe cache {}", path.display()))?;
    let names: Vec<String> = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing universe cache {}", path.display()))?;
    Ok(names.into_iter().collect())
}

fn write_universe_cache(path: &Path, universe: &BTreeSet<String>) -> Result<()> {
    let names = universe.iter().cloned().collect::<Vec<_>>();
    let payload =
        serde_json::to_vec(&names).context("serializing universe cache")?;
    fs::write(path, payload)
        .with_context(|| format!("writing universe cache {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SimpleIndex {
    projects: Vec<SimpleProject>,
}

#[derive(Debug, Deserialize)]
struct SimpleProject {
    name: String,
}

fn fetch_universe() -> Result<BTreeSet<String>> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("sboforge/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building index client")?;
    let index: SimpleIndex = client
        .get(PYPI_SIMPLE_URL)
        .header(reqwest::header::ACCEPT, "application/vnd.pypi.simple.v1+json")
        .send()
        .context("querying package index")?
        .error_for_status()
        .context("package index response")?
        .json()
        .context("decoding package index response")?;
    Ok(index.projects.into_iter().map(|project| project.name).collect())
}
