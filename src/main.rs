mod cli;
mod engine;
mod pypi;
mod recipe_repo;
mod remote;
mod repo;
mod resolve;
mod session_lock;

use clap::Parser;
use std::fs;
use std::path::Path;
use std::process::ExitCode;

fn ensure_workspace_paths(dotdir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dotdir)?;
    fs::create_dir_all(dotdir.join("downloads"))?;
    fs::create_dir_all(dotdir.join("bots"))?;
    fs::create_dir_all(dotdir.join("scripts"))?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    match cli.command {
        cli::Command::Build(args) => run_build_command(args),
        cli::Command::Recipes(args) => run_recipes_command(args),
    }
}

fn run_build_command(args: cli::BuildArgs) -> ExitCode {
    let dotdir = args.effective_dotdir();
    if let Err(err) = ensure_workspace_paths(&dotdir) {
        eprintln!("failed to prepare workspace directories: {err}");
        return ExitCode::FAILURE;
    }
    remote::set_remote_host(args.remote_host.clone());
    engine::reset_cancellation();
    if let Err(err) = ctrlc::set_handler(engine::request_cancellation) {
        engine::log_progress(format!(
            "phase=setup status=no-interrupt-handler detail={err}"
        ));
    }

    let targets = match args.effective_targets() {
        Ok(targets) if !targets.is_empty() => targets,
        Ok(_) => {
            eprintln!("no target packages named");
            return ExitCode::FAILURE;
        }
        Err(err) => {
            eprintln!("failed to read target packages: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let _session = match session_lock::SessionGuard::acquire(&dotdir, &targets) {
        Ok(guard) => {
            engine::log_progress(format!(
                "phase=workspace-lock status=acquired dotdir={} targets={}",
                dotdir.display(),
                targets.join(",")
            ));
            guard
        }
        Err(err) => {
            eprintln!("failed to acquire workspace session lock: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let recipe_root = args.effective_slackbuilds();
    let recipes = match recipe_repo::ensure_recipe_repository(&recipe_root, false) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("failed to prepare recipe repository: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    engine::log_progress(format!(
        "phase=recipes status=ready root={} cloned={} head={}",
        recipes.recipe_root.display(),
        recipes.cloned,
        recipes.head.as_deref().unwrap_or("unknown")
    ));

    let index = match repo::RecipeIndex::scan(&recipes.recipe_root) {
        Ok(index) => index,
        Err(err) => {
            eprintln!("failed to scan recipe repository: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    engine::log_progress(format!(
        "phase=recipe-index status=ready packages={}",
        index.len()
    ));

    let oracle = pypi::PypiOracle::detect(
        &dotdir,
        args.novirtual,
        args.nopip2 || args.novirtual,
        args.nopip3 || args.novirtual,
    );
    let scripts = match repo::ScriptIndex::scan(
        &dotdir.join("scripts"),
        args.before,
        args.after,
        args.requires,
    ) {
        Ok(scripts) => scripts,
        Err(err) => {
            eprintln!("failed to scan hook scripts: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let resolved = match resolve::resolve(&index, &oracle, &targets, true) {
        Ok(resolved) => resolved,
        Err(err) => {
            eprintln!("failed to resolve build list: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    engine::log_progress(format!(
        "phase=resolve status=completed targets={} order={}",
        targets.len(),
        resolved.join("->")
    ));

    if args.queue {
        for package in &resolved {
            println!("{package}");
        }
        return ExitCode::SUCCESS;
    }

    let config = engine::EngineConfig {
        dotdir,
        artifact_dir: args.artifact_dir.clone(),
        num_threads: args.numthreads,
        donothing: args.donothing,
        onlydownload: args.onlydownload,
        pipinstall: args.pipinstall,
        getinparallel: args.getinparallel,
        nocolour: args.nocolour,
    };
    match engine::run_build(&index, &oracle, &scripts, &resolved, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("build failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_recipes_command(args: cli::RecipesArgs) -> ExitCode {
    let dotdir = args.effective_dotdir();
    if let Err(err) = fs::create_dir_all(&dotdir) {
        eprintln!(
            "failed to prepare workspace directory {}: {err}",
            dotdir.display()
        );
        return ExitCode::FAILURE;
    }
    match recipe_repo::ensure_recipe_repository(&args.effective_slackbuilds(), args.sync) {
        Ok(state) => {
            println!(
                "recipes root={} cloned={} fetched={} head={}",
                state.recipe_root.display(),
                state.cloned,
                state.fetched,
                state.head.as_deref().unwrap_or("unknown")
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("recipes command failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}
