use eng_core::Config;

/// Environment and connectivity checks, grounded on `at-cli`'s `doctor`
/// subcommand but scoped to what this workspace actually depends on: a
/// `git` binary on PATH, a writable data directory, and a configured agent
/// binary.
pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let mut failures = 0usize;

    match which_git() {
        Some(path) => println!("[ok]   git found at {path}"),
        None => {
            println!("[fail] git not found on PATH");
            failures += 1;
        }
    }

    let data_dir = expand_home(&cfg.store.project_db_dir);
    match std::fs::create_dir_all(&data_dir) {
        Ok(()) => println!("[ok]   data directory writable: {}", data_dir.display()),
        Err(e) => {
            println!("[fail] data directory not writable: {} ({e})", data_dir.display());
            failures += 1;
        }
    }

    println!("[ok]   agent binary configured: {}", cfg.process.agent_binary);

    let hosting_configured = cfg.hosting.token_env.is_some() && cfg.hosting.owner_env.is_some() && cfg.hosting.repo_env.is_some();
    if hosting_configured {
        println!("[ok]   hosting configured");
    } else {
        println!("[warn] hosting not configured; PR and merge stages will fail");
    }

    if failures > 0 {
        anyhow::bail!("{failures} check(s) failed");
    }
    Ok(())
}

fn which_git() -> Option<String> {
    let path_var = std::env::var("PATH").ok()?;
    std::env::split_paths(&path_var).map(|dir| dir.join("git")).find(|p| p.is_file()).map(|p| p.display().to_string())
}

fn expand_home(raw: &str) -> std::path::PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(raw)
}
