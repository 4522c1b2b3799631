use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Keys whose values are space-separated lists; everything else is scalar.
const LIST_KEYS: [&str; 5] = [
    "REQUIRES",
    "DOWNLOAD",
    "DOWNLOAD_x86_64",
    "MD5SUM",
    "MD5SUM_x86_64",
];

const EMPTY_LIST: &[String] = &[];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoValue {
    Scalar(String),
    List(Vec<String>),
}

/// Parsed contents of one `<name>.info` file.
#[derive(Debug, Default)]
pub struct RecipeInfo {
    values: HashMap<String, InfoValue>,
}

impl RecipeInfo {
    pub fn scalar(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(InfoValue::Scalar(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn list(&self, key: &str) -> &[String] {
        match self.values.get(key) {
            Some(InfoValue::List(values)) => values.as_slice(),
            _ => EMPTY_LIST,
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.scalar("VERSION")
    }
}

/// Parse the line-oriented `KEY=VALUE` format used by recipe metadata.
/// Lines ending in a backslash continue on the next line; values may be
/// double-quoted; the keys in `LIST_KEYS` split on whitespace.
pub fn parse_info(text: &str, origin: &Path) -> Result<RecipeInfo> {
    let mut values = HashMap::new();
    let mut pending = String::new();
    for (line_no, raw) in text.lines().enumerate() {
        if let Some(stem) = raw.strip_suffix('\\') {
            pending.push_str(stem);
            continue;
        }
        pending.push_str(raw);
        let line = std::mem::take(&mut pending);
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            bail!(
                "malformed info file {}: line {} has no '='",
                origin.display(),
                line_no + 1
            );
        };
        let key = key.trim().to_string();
        let value = value.trim().trim_matches('"');
        if LIST_KEYS.contains(&key.as_str()) {
            let items = value
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>();
            values.insert(key, InfoValue::List(items));
        } else {
            values.insert(key, InfoValue::Scalar(value.to_string()));
        }
    }
    if !pending.trim().is_empty() {
        bail!(
            "malformed info file {}: dangling continuation at end of file",
            origin.display()
        );
    }
    Ok(RecipeInfo { values })
}

/// Maps package names to recipe directories under a
/// `<root>/<category>/<package>` tree and answers metadata queries with
/// per-path memoisation.
pub struct RecipeIndex {
    package_dirs: HashMap<String, PathBuf>,
    info_cache: Mutex<HashMap<PathBuf, Arc<RecipeInfo>>>,
}

impl RecipeIndex {
    pub fn scan(root: &Path) -> Result<Self> {
        let mut categories = Vec::new();
        for entry in
            fs::read_dir(root).with_context(|| format!("reading recipe root {}", root.display()))?
        {
            let entry =
                entry.with_context(|| format!("reading recipe root {}", root.display()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() && !name.starts_with('.') {
                categories.push(entry.path());
            }
        }

        let scanned = categories
            .par_iter()
            .map(|category| scan_category(category))
            .collect::<Result<Vec<_>>>()?;

        let mut package_dirs = HashMap::new();
        for packages in scanned {
            for (name, path) in packages {
                package_dirs.insert(name, path);
            }
        }
        Ok(Self {
            package_dirs,
            info_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.package_dirs.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Result<&Path> {
        match self.package_dirs.get(name) {
            Some(path) => Ok(path.as_path()),
            None => bail!("unknown package '{name}'"),
        }
    }

    pub fn len(&self) -> usize {
        self.package_dirs.len()
    }

    /// Category directory name a recipe lives under.
    pub fn category_of(&self, name: &str) -> Result<String> {
        let dir = self.lookup(name)?;
        let category = dir
            .parent()
            .and_then(|parent| parent.file_name())
            .map(|os| os.to_string_lossy().to_string());
        match category {
            Some(category) => Ok(category),
            None => bail!("recipe directory {} has no category", dir.display()),
        }
    }

    /// True when the recipe belongs to the language-package ecosystem: it
    /// lives in the `python` category, its name carries a `python(3)-`
    /// prefix, or its build script runs a `setup.py install` step.
    pub fn is_language_package(&self, name: &str) -> Result<bool> {
        let dir = self.lookup(name)?;
        if self.category_of(name)? == "python" {
            return Ok(true);
        }
        if name.starts_with("python-") || name.starts_with("python3-") {
            return Ok(true);
        }
        let script = dir.join(format!("{name}.SlackBuild"));
        let bytes = fs::read(&script)
            .with_context(|| format!("reading build script {}", script.display()))?;
        Ok(contains_subslice(&bytes, b"python setup.py install ")
            || contains_subslice(&bytes, b"python3 setup.py install "))
    }

    /// Parsed `.info` metadata for a recipe, memoised by recipe path.
    pub fn info(&self, name: &str) -> Result<Arc<RecipeInfo>> {
        let dir = self.lookup(name)?;
        let info_path = dir.join(format!("{name}.info"));
        if let Ok(cache) = self.info_cache.lock()
            && let Some(parsed) = cache.get(&info_path)
        {
            return Ok(Arc::clone(parsed));
        }
        let text = fs::read_to_string(&info_path)
            .with_context(|| format!("reading info file {}", info_path.display()))?;
        let parsed = Arc::new(parse_info(&text, &info_path)?);
        if let Ok(mut cache) = self.info_cache.lock() {
            cache.insert(info_path, Arc::clone(&parsed));
        }
        Ok(parsed)
    }
}

fn scan_category(category: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut packages = Vec::new();
    for entry in fs::read_dir(category)
        .with_context(|| format!("reading category {}", category.display()))?
    {
        let entry = entry.with_context(|| format!("reading category {}", category.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.path().is_dir() && !name.starts_with('.') {
            packages.push((name, entry.path()));
        }
    }
    Ok(packages)
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Before,
    After,
    Requires,
}

impl ScriptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptKind::Before => "before",
            ScriptKind::After => "after",
            ScriptKind::Requires => "requires",
        }
    }
}

/// User-supplied hook scripts, laid out as
/// `<root>/<category>/<package>/<kind>.sh`. A kind suppressed at
/// construction time contributes no entries at all.
pub struct ScriptIndex {
    before: HashMap<String, PathBuf>,
    after: HashMap<String, PathBuf>,
    requires: HashMap<String, PathBuf>,
}

impl ScriptIndex {
    pub fn scan(
        root: &Path,
        suppress_before: bool,
        suppress_after: bool,
        suppress_requires: bool,
    ) -> Result<Self> {
        let mut index = Self {
            before: HashMap::new(),
            after: HashMap::new(),
            requires: HashMap::new(),
        };
        if !root.is_dir() {
            return Ok(index);
        }
        for entry in fs::read_dir(root)
            .with_context(|| format!("reading scripts root {}", root.display()))?
        {
            let entry =
                entry.with_context(|| format!("reading scripts root {}", root.display()))?;
            let category_name = entry.file_name().to_string_lossy().to_string();
            if !entry.path().is_dir() || category_name.starts_with('.') {
                continue;
            }
            for package in fs::read_dir(entry.path())
                .with_context(|| format!("reading scripts category {}", entry.path().display()))?
            {
                let package = package.with_context(|| {
                    format!("reading scripts category {}", entry.path().display())
                })?;
                if !package.path().is_dir() {
                    continue;
                }
                let name = package.file_name().to_string_lossy().to_string();
                for (kind, suppressed) in [
                    (ScriptKind::Before, suppress_before),
                    (ScriptKind::After, suppress_after),
                    (ScriptKind::Requires, suppress_requires),
                ] {
                    if suppressed {
                        continue;
                    }
                    let location = package.path().join(format!("{}.sh", kind.as_str()));
                    if location.exists() {
                        index.map_mut(kind).insert(name.clone(), location);
                    }
                }
            }
        }
        Ok(index)
    }

    pub fn get(&self, kind: ScriptKind, package: &str) -> Option<&Path> {
        self.map(kind).get(package).map(PathBuf::as_path)
    }

    fn map(&self, kind: ScriptKind) -> &HashMap<String, PathBuf> {
        match kind {
            ScriptKind::Before => &self.before,
            ScriptKind::After => &self.after,
            ScriptKind::Requires => &self.requires,
        }
    }

    fn map_mut(&mut self, kind: ScriptKind) -> &mut HashMap<String, PathBuf> {
        match kind {
            ScriptKind::Before => &mut self.before,
            ScriptKind::After => &mut self.after,
            ScriptKind::Requires => &mut self.requires,
        }
    }
}
