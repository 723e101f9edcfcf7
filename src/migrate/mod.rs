//! Source migration: convert another assistant's home directory (config +
//! workspace files) into a PicoClaw installation. Offline file transform
//! only; the running gateway is never involved.

pub mod openclaw;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Workspace files carried over verbatim.
const MIGRATEABLE_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "HEARTBEAT.md"];
/// Workspace directories carried over recursively.
const MIGRATEABLE_DIRS: &[&str] = &["memory", "skills"];

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub dry_run: bool,
    pub force: bool,
    /// Refresh implies workspace-only: re-copy files, skip the config.
    pub refresh: bool,
    pub source: String,
    pub source_home: Option<PathBuf>,
    pub target_home: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Copy,
    Skip,
    Backup,
    ConvertConfig,
    CreateDir,
}

#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionType,
    pub source: PathBuf,
    pub target: PathBuf,
    pub description: String,
}

#[derive(Debug, Default)]
pub struct MigrationResult {
    pub files_copied: usize,
    pub files_skipped: usize,
    pub backups_created: usize,
    pub dirs_created: usize,
    pub config_migrated: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Run a migration end to end. Prints the plan; `dry_run` stops there.
pub fn run(opts: &Options) -> Result<MigrationResult> {
    if !opts.source.is_empty() && opts.source != "openclaw" {
        anyhow::bail!("unknown migration source '{}' (supported: openclaw)", opts.source);
    }

    let source_home = resolve_source_home(opts.source_home.as_deref());
    let target_home = resolve_target_home(opts.target_home.as_deref());

    if !source_home.exists() {
        anyhow::bail!("source installation not found at {}", source_home.display());
    }

    let (actions, mut warnings) = plan(opts, &source_home, &target_home)?;

    println!("Migrating from openclaw to PicoClaw");
    println!("  Source: {}", source_home.display());
    println!("  Target: {}", target_home.display());
    println!();
    print_plan(&actions, &warnings);

    if opts.dry_run {
        let mut result = MigrationResult::default();
        result.warnings = warnings;
        return Ok(result);
    }

    let mut result = execute(&actions, &source_home);
    result.warnings.append(&mut warnings);
    print_summary(&result);
    Ok(result)
}

fn resolve_source_home(override_path: Option<&Path>) -> PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }
    if let Ok(env_home) = std::env::var("OPENCLAW_HOME") {
        if !env_home.is_empty() {
            return PathBuf::from(env_home);
        }
    }
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".openclaw"))
        .unwrap_or_else(|| PathBuf::from(".openclaw"))
}

fn resolve_target_home(override_path: Option<&Path>) -> PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }
    if let Ok(env_home) = std::env::var("PICOCLAW_HOME") {
        if !env_home.is_empty() {
            return PathBuf::from(env_home);
        }
    }
    crate::util::picoclaw_home()
}

/// Build the action list: one config conversion plus workspace copies.
fn plan(
    opts: &Options,
    source_home: &Path,
    target_home: &Path,
) -> Result<(Vec<Action>, Vec<String>)> {
    let mut actions = Vec::new();
    let mut warnings = Vec::new();
    let force = opts.force || opts.refresh;

    if !opts.refresh {
        match openclaw::load_from_dir(source_home) {
            Ok((_, config_path)) => actions.push(Action {
                kind: ActionType::ConvertConfig,
                source: config_path,
                target: target_home.join("config.json"),
                description: "convert openclaw config to PicoClaw format".into(),
            }),
            Err(e) => warnings.push(format!("Config migration skipped: {e}")),
        }
    }

    let src_workspace = source_home.join("workspace");
    let dst_workspace = target_home.join("workspace");
    if src_workspace.exists() {
        for filename in MIGRATEABLE_FILES {
            let action = plan_file_copy(
                src_workspace.join(filename),
                dst_workspace.join(filename),
                force,
            );
            if action.kind != ActionType::Skip || !action.description.is_empty() {
                actions.push(action);
            }
        }
        for dirname in MIGRATEABLE_DIRS {
            let src_dir = src_workspace.join(dirname);
            if src_dir.exists() {
                plan_dir_copy(&src_dir, &dst_workspace.join(dirname), force, &mut actions)?;
            }
        }
    } else {
        warnings.push("Source workspace directory not found, skipping workspace migration".into());
    }

    Ok((actions, warnings))
}

fn plan_file_copy(src: PathBuf, dst: PathBuf, force: bool) -> Action {
    if !src.exists() {
        return Action {
            kind: ActionType::Skip,
            source: src,
            target: dst,
            description: "source file not found".into(),
        };
    }
    if dst.exists() && !force {
        return Action {
            kind: ActionType::Backup,
            source: src,
            target: dst,
            description: "destination exists, will backup and overwrite".into(),
        };
    }
    Action {
        kind: ActionType::Copy,
        source: src,
        target: dst,
        description: "copy file".into(),
    }
}

fn plan_dir_copy(
    src_dir: &Path,
    dst_dir: &Path,
    force: bool,
    actions: &mut Vec<Action>,
) -> Result<()> {
    actions.push(Action {
        kind: ActionType::CreateDir,
        source: src_dir.to_path_buf(),
        target: dst_dir.to_path_buf(),
        description: "create directory".into(),
    });

    for entry in std::fs::read_dir(src_dir)
        .with_context(|| format!("failed to read {}", src_dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let dst = dst_dir.join(entry.file_name());
        if path.is_dir() {
            plan_dir_copy(&path, &dst, force, actions)?;
        } else {
            actions.push(plan_file_copy(path, dst, force));
        }
    }
    Ok(())
}

fn execute(actions: &[Action], source_home: &Path) -> MigrationResult {
    let mut result = MigrationResult::default();

    for action in actions {
        match action.kind {
            ActionType::ConvertConfig => match convert_config(&action.source, &action.target) {
                Ok(warnings) => {
                    result.config_migrated = true;
                    result.warnings.extend(warnings);
                    println!("  ✓ Converted config: {}", action.target.display());
                }
                Err(e) => {
                    result.errors.push(format!("config migration: {e:#}"));
                    println!("  ✗ Config migration failed: {e:#}");
                }
            },
            ActionType::CreateDir => {
                if let Err(e) = std::fs::create_dir_all(&action.target) {
                    result.errors.push(e.to_string());
                } else {
                    result.dirs_created += 1;
                }
            }
            ActionType::Backup => {
                let bak = PathBuf::from(format!("{}.bak", action.target.display()));
                if let Err(e) = std::fs::copy(&action.target, &bak) {
                    result
                        .errors
                        .push(format!("backup {}: {e}", action.target.display()));
                    println!("  ✗ Backup failed: {}", action.target.display());
                    continue;
                }
                result.backups_created += 1;
                copy_action_file(action, source_home, &mut result);
            }
            ActionType::Copy => copy_action_file(action, source_home, &mut result),
            ActionType::Skip => result.files_skipped += 1,
        }
    }

    result
}

fn copy_action_file(action: &Action, source_home: &Path, result: &mut MigrationResult) {
    if let Some(parent) = action.target.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            result.errors.push(e.to_string());
            return;
        }
    }
    match std::fs::copy(&action.source, &action.target) {
        Ok(_) => {
            result.files_copied += 1;
            let rel = action
                .source
                .strip_prefix(source_home)
                .unwrap_or(&action.source);
            println!("  ✓ Copied {}", rel.display());
        }
        Err(e) => {
            result
                .errors
                .push(format!("copy {}: {e}", action.source.display()));
            println!("  ✗ Copy failed: {}", action.source.display());
        }
    }
}

fn convert_config(src: &Path, dst: &Path) -> Result<Vec<String>> {
    let dir = src
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent"))?;
    let (source_cfg, _) = openclaw::load_from_dir(dir)?;
    let (cfg, warnings) = openclaw::convert(&source_cfg, dir);
    for warning in &warnings {
        println!("  Warning: {warning}");
    }
    crate::config::save_config(dst, &cfg)?;
    Ok(warnings)
}

fn print_plan(actions: &[Action], warnings: &[String]) {
    println!("Planned actions:");
    let mut copies = 0;
    let mut skips = 0;
    let mut backups = 0;
    let mut configs = 0;

    for action in actions {
        match action.kind {
            ActionType::ConvertConfig => {
                println!(
                    "  [config]  {} -> {}",
                    action.source.display(),
                    action.target.display()
                );
                configs += 1;
            }
            ActionType::Copy => {
                println!(
                    "  [copy]    {}",
                    action.source.file_name().unwrap_or_default().to_string_lossy()
                );
                copies += 1;
            }
            ActionType::Backup => {
                println!(
                    "  [backup]  {} (exists, will backup and overwrite)",
                    action.target.file_name().unwrap_or_default().to_string_lossy()
                );
                backups += 1;
                copies += 1;
            }
            ActionType::Skip => skips += 1,
            ActionType::CreateDir => {
                println!("  [mkdir]   {}", action.target.display());
            }
        }
    }

    if !warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }

    println!();
    println!(
        "{copies} files to copy, {configs} configs to convert, {backups} backups needed, {skips} skipped"
    );
}

fn print_summary(result: &MigrationResult) {
    println!();
    let mut parts = Vec::new();
    if result.files_copied > 0 {
        parts.push(format!("{} files copied", result.files_copied));
    }
    if result.config_migrated {
        parts.push("1 config converted".into());
    }
    if result.backups_created > 0 {
        parts.push(format!("{} backups created", result.backups_created));
    }
    if result.files_skipped > 0 {
        parts.push(format!("{} files skipped", result.files_skipped));
    }

    if parts.is_empty() {
        println!("Migration complete! No actions taken.");
    } else {
        println!("Migration complete! {}.", parts.join(", "));
    }

    if !result.errors.is_empty() {
        println!();
        println!("{} errors occurred:", result.errors.len());
        for error in &result.errors {
            println!("  - {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_source(tmp: &TempDir) -> PathBuf {
        let source = tmp.path().join(".openclaw");
        std::fs::create_dir_all(source.join("workspace/memory")).unwrap();
        std::fs::write(
            source.join("openclaw.json"),
            serde_json::json!({
                "agents": {"defaults": {"model": "openai/gpt-5.2"}},
                "channels": {"telegram": {"botToken": "tok", "allowFrom": ["1"]}},
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(source.join("workspace/AGENTS.md"), "# agents").unwrap();
        std::fs::write(source.join("workspace/memory/notes.md"), "notes").unwrap();
        source
    }

    #[test]
    fn full_migration_converts_config_and_copies_workspace() {
        let tmp = TempDir::new().unwrap();
        let source = seed_source(&tmp);
        let target = tmp.path().join(".picoclaw");

        let opts = Options {
            source_home: Some(source),
            target_home: Some(target.clone()),
            force: true,
            ..Options::default()
        };
        let result = run(&opts).unwrap();

        assert!(result.config_migrated);
        assert_eq!(result.files_copied, 2);
        assert!(result.errors.is_empty());

        let cfg = crate::config::load_config(&target.join("config.json")).unwrap();
        assert!(cfg.channels.telegram.enabled);
        assert_eq!(cfg.channels.telegram.token, "tok");
        assert_eq!(cfg.agents.defaults.model_name, "gpt-5.2");
        assert!(target.join("workspace/AGENTS.md").exists());
        assert!(target.join("workspace/memory/notes.md").exists());
    }

    #[test]
    fn dry_run_touches_nothing() {
        let tmp = TempDir::new().unwrap();
        let source = seed_source(&tmp);
        let target = tmp.path().join(".picoclaw");

        let opts = Options {
            dry_run: true,
            source_home: Some(source),
            target_home: Some(target.clone()),
            ..Options::default()
        };
        let result = run(&opts).unwrap();
        assert!(!result.config_migrated);
        assert!(!target.exists());
    }

    #[test]
    fn refresh_skips_config_but_recopies_workspace() {
        let tmp = TempDir::new().unwrap();
        let source = seed_source(&tmp);
        let target = tmp.path().join(".picoclaw");

        let opts = Options {
            refresh: true,
            source_home: Some(source),
            target_home: Some(target.clone()),
            ..Options::default()
        };
        let result = run(&opts).unwrap();
        assert!(!result.config_migrated);
        assert!(result.files_copied > 0);
        assert!(!target.join("config.json").exists());
    }

    #[test]
    fn existing_destination_is_backed_up_without_force() {
        let tmp = TempDir::new().unwrap();
        let source = seed_source(&tmp);
        let target = tmp.path().join(".picoclaw");
        std::fs::create_dir_all(target.join("workspace")).unwrap();
        std::fs::write(target.join("workspace/AGENTS.md"), "old content").unwrap();

        let opts = Options {
            source_home: Some(source),
            target_home: Some(target.clone()),
            ..Options::default()
        };
        let result = run(&opts).unwrap();
        assert_eq!(result.backups_created, 1);
        assert_eq!(
            std::fs::read_to_string(target.join("workspace/AGENTS.md")).unwrap(),
            "# agents"
        );
    }

    #[test]
    fn missing_source_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let opts = Options {
            source_home: Some(tmp.path().join("nope")),
            target_home: Some(tmp.path().join(".picoclaw")),
            ..Options::default()
        };
        assert!(run(&opts).is_err());
    }

    #[test]
    fn unknown_source_is_rejected() {
        let opts = Options {
            source: "closedclaw".into(),
            ..Options::default()
        };
        assert!(run(&opts).is_err());
    }
}
