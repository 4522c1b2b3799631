use crate::pypi::PypiOracle;
use crate::repo::RecipeIndex;
use anyhow::{Result, bail};
use std::collections::HashSet;

/// Placeholder names that may appear in REQUIRES but never name a recipe.
const DEP_SENTINELS: [&str; 2] = ["%README%", ""];

/// Direct dependencies of a recipe that are themselves recipes, sentinel
/// entries dropped, in lexicographic order.
pub fn buildable_deps(index: &RecipeIndex, name: &str) -> Result<Vec<String>> {
    let info = index.info(name)?;
    let mut deps = info
        .list("REQUIRES")
        .iter()
        .filter(|dep| !DEP_SENTINELS.contains(&dep.as_str()))
        .filter(|dep| index.contains(dep))
        .cloned()
        .collect::<Vec<_>>();
    deps.sort();
    deps.dedup();
    Ok(deps)
}

/// Compute the ordered build list for `targets`: a depth-first post-order
/// walk of the dependency graph, so every dependency precedes its dependents.
/// Sibling order is lexicographic, which keeps the list identical across
/// runs. With `skip_satisfied`, packages the oracle reports installed are
/// omitted (their unsatisfied dependencies still appear).
pub fn resolve(
    index: &RecipeIndex,
    oracle: &PypiOracle,
    targets: &[String],
    skip_satisfied: bool,
) -> Result<Vec<String>> {
    let mut resolved = Vec::new();
    let mut seen = HashSet::new();
    for target in targets {
        visit(index, oracle, target, skip_satisfied, &mut resolved, &mut seen)?;
    }
    Ok(resolved)
}

fn visit(
    index: &RecipeIndex,
    oracle: &PypiOracle,
    name: &str,
    skip_satisfied: bool,
    resolved: &mut Vec<String>,
    seen: &mut HashSet<String>,
) -> Result<()> {
    if seen.contains(name) {
        return Ok(());
    }
    if !index.contains(name) {
        bail!("unknown package '{name}'");
    }
    for dep in buildable_deps(index, name)? {
        if skip_satisfied && oracle.is_satisfied(&dep) {
            continue;
        }
        visit(index, oracle, &dep, skip_satisfied, resolved, seen)?;
    }
    if skip_satisfied && oracle.is_satisfied(name) {
        return Ok(());
    }
    seen.insert(name.to_string());
    resolved.push(name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_recipe(root: &Path, name: &str, requires: &str) {
        let dir = root.join("testing").join(name);
        fs::create_dir_all(&dir).expect("create recipe dir");
        fs::write(
            dir.join(format!("{name}.info")),
            format!("VERSION=\"1.0\"\nREQUIRES=\"{requires}\"\n"),
        )
        .expect("write info");
        fs::write(dir.join(format!("{name}.SlackBuild")), "exit 0\n").expect("write script");
    }

    fn oracle_with_installed(installed: &[&str]) -> PypiOracle {
        PypiOracle::with_universe(
            installed.iter().map(|name| name.to_string()).collect(),
            BTreeSet::new(),
            BTreeSet::new(),
            false,
            BTreeSet::new(),
        )
    }

    fn targets(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn single_chain_orders_dependency_first() {
        let tmp = TempDir::new().expect("create temp dir");
        write_recipe(tmp.path(), "A", "B");
        write_recipe(tmp.path(), "B", "");
        let index = RecipeIndex::scan(tmp.path()).expect("scan");
        let oracle = oracle_with_installed(&[]);

        let order = resolve(&index, &oracle, &targets(&["A"]), true).expect("resolve");
        assert_eq!(order, ["B", "A"]);
    }

    #[test]
    fn diamond_resolves_in_lexicographic_post_order() {
        let tmp = TempDir::new().expect("create temp dir");
        write_recipe(tmp.path(), "A", "C B");
        write_recipe(tmp.path(), "B", "D");
        write_recipe(tmp.path(), "C", "D");
        write_recipe(tmp.path(), "D", "");
        let index = RecipeIndex::scan(tmp.path()).expect("scan");
        let oracle = oracle_with_installed(&[]);

        let order = resolve(&index, &oracle, &targets(&["A"]), true).expect("resolve");
        assert_eq!(order, ["D", "B", "C", "A"]);
    }

    #[test]
    fn satisfied_packages_are_omitted_entirely() {
        let tmp = TempDir::new().expect("create temp dir");
        write_recipe(tmp.path(), "A", "B C");
        write_recipe(tmp.path(), "B", "D");
        write_recipe(tmp.path(), "C", "D");
        write_recipe(tmp.path(), "D", "");
        let index = RecipeIndex::scan(tmp.path()).expect("scan");
        let oracle = oracle_with_installed(&["C"]);

        let order = resolve(&index, &oracle, &targets(&["A"]), true).expect("resolve");
        assert_eq!(order, ["D", "B", "A"]);
    }

    #[test]
    fn satisfied_target_still_contributes_unsatisfied_deps() {
        let tmp = TempDir::new().expect("create temp dir");
        write_recipe(tmp.path(), "A", "B");
        write_recipe(tmp.path(), "B", "");
        let index = RecipeIndex::scan(tmp.path()).expect("scan");
        let oracle = oracle_with_installed(&["A"]);

        let order = resolve(&index, &oracle, &targets(&["A"]), true).expect("resolve");
        assert_eq!(order, ["B"]);
    }

    #[test]
    fn skip_satisfied_false_keeps_installed_nodes() {
        let tmp = TempDir::new().expect("create temp dir");
        write_recipe(tmp.path(), "A", "B");
        write_recipe(tmp.path(), "B", "");
        let index = RecipeIndex::scan(tmp.path()).expect("scan");
        let oracle = oracle_with_installed(&["B"]);

        let order = resolve(&index, &oracle, &targets(&["A"]), false).expect("resolve");
        assert_eq!(order, ["B", "A"]);
    }

    #[test]
    fn sentinels_and_non_recipe_edges_are_dropped() {
        let tmp = TempDir::new().expect("create temp dir");
        write_recipe(tmp.path(), "A", "%README% glibc B");
        write_recipe(tmp.path(), "B", "");
        let index = RecipeIndex::scan(tmp.path()).expect("scan");
        let oracle = oracle_with_installed(&[]);

        let order = resolve(&index, &oracle, &targets(&["A"]), true).expect("resolve");
        assert_eq!(order, ["B", "A"]);
    }

    #[test]
    fn unknown_target_fails() {
        let tmp = TempDir::new().expect("create temp dir");
        write_recipe(tmp.path(), "A", "");
        let index = RecipeIndex::scan(tmp.path()).expect("scan");
        let oracle = oracle_with_installed(&[]);

        let err =
            resolve(&index, &oracle, &targets(&["ghost"]), true).expect_err("unknown target");
        assert!(err.to_string().contains("unknown package 'ghost'"));
    }

    #[test]
    fn overlapping_targets_produce_no_duplicates() {
        let tmp = TempDir::new().expect("create temp dir");
        write_recipe(tmp.path(), "A", "C");
        write_recipe(tmp.path(), "B", "C");
        write_recipe(tmp.path(), "C", "");
        let index = RecipeIndex::scan(tmp.path()).expect("scan");
        let oracle = oracle_with_installed(&[]);

        let order = resolve(&index, &oracle, &targets(&["A", "B"]), true).expect("resolve");
        assert_eq!(order, ["C", "A", "B"]);
    }

    #[test]
    fn every_edge_in_the_output_points_backwards() {
        let tmp = TempDir::new().expect("create temp dir");
        write_recipe(tmp.path(), "A", "C B");
        write_recipe(tmp.path(), "B", "D E");
        write_recipe(tmp.path(), "C", "D");
        write_recipe(tmp.path(), "D", "E");
        write_recipe(tmp.path(), "E", "");
        let index = RecipeIndex::scan(tmp.path()).expect("scan");
        let oracle = oracle_with_installed(&[]);

        let order = resolve(&index, &oracle, &targets(&["A"]), true).expect("resolve");
        let position = |name: &str| order.iter().position(|p| p == name).expect("in output");
        for package in &order {
            for dep in buildable_deps(&index, package).expect("deps") {
                assert!(
                    position(&dep) < position(package),
                    "{dep} must precede {package} in {order:?}"
                );
            }
        }
        // Identical inputs resolve identically.
        let again = resolve(&index, &oracle, &targets(&["A"]), true).expect("resolve again");
        assert_eq!(order, again);
    }
}
