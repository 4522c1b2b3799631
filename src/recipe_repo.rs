use anyhow::{Context, Result};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{AutotagOption, FetchOptions, Oid, Repository};
use std::fs;
use std::path::{Path, PathBuf};

const RECIPES_REMOTE: &str = "https://github.com/Ponce/slackbuilds.git";

#[derive(Debug, Clone)]
pub struct RecipeRepoOutcome {
    pub recipe_root: PathBuf,
    pub cloned: bool,
    pub fetched: bool,
    pub head: Option<String>,
}

/// Make sure a recipe tree exists at `recipe_root`: clone the upstream
/// mirror when the path is missing, optionally fast-forward to the remote
/// default branch. A plain directory that is not a git checkout is accepted
/// as-is unless a sync was requested.
pub fn ensure_recipe_repository(recipe_root: &Path, sync: bool) -> Result<RecipeRepoOutcome> {
    let mut cloned = false;
    if !recipe_root.exists() {
        if let Some(parent) = recipe_root.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("creating recipe parent directory {}", parent.display())
            })?;
        }
        RepoBuilder::new()
            .clone(RECIPES_REMOTE, recipe_root)
            .with_context(|| {
                format!("cloning {} into {}", RECIPES_REMOTE, recipe_root.display())
            })?;
        cloned = true;
    }

    let repo = match Repository::open(recipe_root) {
        Ok(repo) => repo,
        Err(err) => {
            if !sync {
                return Ok(RecipeRepoOutcome {
                    recipe_root: recipe_root.to_path_buf(),
                    cloned,
                    fetched: false,
                    head: None,
                });
            }
            return Err(err).with_context(|| {
                format!("opening recipes git repository at {}", recipe_root.display())
            });
        }
    };

    let mut fetched = false;
    if sync {
        fetch_origin(&repo)?;
        fetched = true;
        let branch = default_origin_branch_name(&repo)?;
        checkout_origin_branch(&repo, &branch)?;
    }

    Ok(RecipeRepoOutcome {
        recipe_root: recipe_root.to_path_buf(),
        cloned,
        fetched,
        head: head_summary(&repo).ok(),
    })
}

fn fetch_origin(repo: &Repository) -> Result<()> {
    let mut remote = repo
        .find_remote("origin")
        .context("finding origin remote in recipes repository")?;
    let mut fetch_options = FetchOptions::new();
    fetch_options.download_tags(AutotagOption::All);
    remote
        .fetch(
            &["refs/heads/*:refs/remotes/origin/*"],
            Some(&mut fetch_options),
            None,
        )
        .context("fetching origin refs for recipes repository")
}

fn default_origin_branch_name(repo: &Repository) -> Result<String> {
    if let Ok(origin_head) = repo.find_reference("refs/remotes/origin/HEAD")
        && let Some(symbolic) = origin_head.symbolic_target()
        && let Some(branch) = symbolic.strip_prefix("refs/remotes/origin/")
    {
        return Ok(branch.to_string());
    }
    for candidate in ["master", "main"] {
        if repo
            .find_reference(&format!("refs/remotes/origin/{candidate}"))
            .is_ok()
        {
            return Ok(candidate.to_string());
        }
    }
    if let Ok(head) = repo.head()
        && let Some(name) = head.shorthand()
    {
        return Ok(name.to_string());
    }
    anyhow::bail!("unable to determine default branch for recipes repository");
}

fn checkout_origin_branch(repo: &Repository, name: &str) -> Result<()> {
    let remote_ref = repo
        .find_reference(&format!("refs/remotes/origin/{name}"))
        .with_context(|| format!("finding remote branch origin/{name}"))?;
    let commit = remote_ref
        .peel_to_commit()
        .with_context(|| format!("peeling remote branch origin/{name}"))?;

    let local_ref_name = format!("refs/heads/{name}");
    if let Ok(mut local_ref) = repo.find_reference(&local_ref_name) {
        local_ref
            .set_target(commit.id(), "sboforge recipes sync")
            .with_context(|| format!("updating local branch {name}"))?;
    } else {
        repo.branch(name, &commit, false)
            .with_context(|| format!("creating local branch {name}"))?;
    }

    repo.set_head(&local_ref_name)
        .with_context(|| format!("setting HEAD to local branch {name}"))?;
    let mut checkout = CheckoutBuilder::new();
    checkout.safe();
    repo.checkout_head(Some(&mut checkout))
        .with_context(|| format!("checking out local branch {name}"))?;
    Ok(())
}

fn head_summary(repo: &Repository) -> Result<String> {
    let head = repo.head().context("reading repository HEAD")?;
    let commit = head
        .peel_to_commit()
        .context("resolving repository HEAD commit")?;
    let mode = if head.is_branch() {
        format!("branch:{}", head.shorthand().unwrap_or("unknown"))
    } else {
        "detached".to_string()
    };
    Ok(format!("{mode}@{}", short_oid(commit.id())))
}

fn short_oid(oid: Oid) -> String {
    oid.to_string().chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn plain_directory_is_accepted_without_sync() {
        let tmp = TempDir::new().expect("create temp dir");
        let root = tmp.path().join("slackbuilds");
        fs::create_dir_all(root.join("system/htop")).expect("create tree");

        let outcome = ensure_recipe_repository(&root, false).expect("plain tree accepted");
        assert_eq!(outcome.recipe_root, root);
        assert!(!outcome.cloned);
        assert!(!outcome.fetched);
        assert!(outcome.head.is_none());
    }

    #[test]
    fn sync_on_a_plain_directory_fails() {
        let tmp = TempDir::new().expect("create temp dir");
        let root = tmp.path().join("slackbuilds");
        fs::create_dir_all(&root).expect("create tree");

        assert!(ensure_recipe_repository(&root, true).is_err());
    }
}
