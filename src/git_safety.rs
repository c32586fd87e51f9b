//! Transactional safety via a version-control sidecar.
//!
//! Before the agent runs: record HEAD, stash pre-existing user changes under
//! a unique tag, and branch off the primary branch. On rollback: restore
//! only the files the agent touched, then re-apply the stash. On success:
//! commit the agent's files, then re-apply the stash.
//!
//! Repository inspection, branching and commits go through git2; stash and
//! scoped checkout shell out to the `git` binary, which is the reliable
//! interface for those operations.

use anyhow::{Context, Result};
use git2::{Repository, Signature, StatusOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::process::Command;

/// What the sidecar recorded at agent start. Outlives the agent state only
/// long enough to re-apply the stash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitState {
    pub enabled: bool,
    pub initial_branch: String,
    pub target_branch: String,
    pub initial_commit: String,
    pub stash_tag: Option<String>,
}

fn run_git(repo_root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(repo_root)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .with_context(|| format!("failed to run git {}", args.join(" ")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(anyhow::anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

fn has_uncommitted_changes(repo: &Repository) -> Result<bool> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true);
    opts.recurse_untracked_dirs(true);
    opts.include_ignored(false);
    opts.exclude_submodules(true);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(!statuses.is_empty())
}

/// Record the starting state and make the working tree safe to mutate.
///
/// Outside a git repository the sidecar is disabled: the agent still runs,
/// but without rollback.
pub fn setup(repo_root: &Path) -> GitState {
    let repo = match Repository::open(repo_root) {
        Ok(repo) => repo,
        Err(_) => {
            tracing::warn!("not a git repository; transactional safety disabled");
            return GitState::default();
        }
    };

    let (initial_branch, initial_commit) = match repo.head() {
        Ok(head) => (
            head.shorthand().unwrap_or("HEAD").to_string(),
            head.target().map(|oid| oid.to_string()).unwrap_or_default(),
        ),
        Err(_) => {
            tracing::warn!("repository has no HEAD; transactional safety disabled");
            return GitState::default();
        }
    };

    let mut state = GitState {
        enabled: true,
        initial_branch: initial_branch.clone(),
        target_branch: initial_branch.clone(),
        initial_commit,
        stash_tag: None,
    };

    // Pre-existing user changes get stashed under a unique tag so rollback
    // can find exactly this stash later.
    match has_uncommitted_changes(&repo) {
        Ok(true) => {
            let tag = format!(
                "operon-stash-{}",
                &uuid::Uuid::new_v4().to_string()[..6]
            );
            match run_git(
                repo_root,
                &["stash", "push", "--include-untracked", "-m", &tag],
            ) {
                Ok(_) => {
                    tracing::info!("stashed user changes as {}", tag);
                    state.stash_tag = Some(tag);
                }
                Err(err) => tracing::warn!("stash failed, continuing without: {}", err),
            }
        }
        Ok(false) => {}
        Err(err) => tracing::warn!("status check failed: {}", err),
    }

    // Protect the primary branch by moving onto a dedicated agent branch.
    if initial_branch == "main" || initial_branch == "master" {
        let target = format!("operon/task-{}", &uuid::Uuid::new_v4().to_string()[..6]);
        match create_and_checkout_branch(&repo, &target) {
            Ok(()) => {
                tracing::info!("protected '{}'; switched to {}", initial_branch, target);
                state.target_branch = target;
            }
            Err(err) => tracing::warn!("agent branch creation failed: {}", err),
        }
    }

    state
}

fn create_and_checkout_branch(repo: &Repository, name: &str) -> Result<()> {
    let head = repo.head()?;
    let commit = head.peel_to_commit()?;
    repo.branch(name, &commit, false)
        .with_context(|| format!("failed to create branch '{}'", name))?;

    let (object, reference) = repo.revparse_ext(name)?;
    repo.checkout_tree(&object, None)?;
    match reference {
        Some(r) => repo.set_head(r.name().unwrap_or("HEAD"))?,
        None => repo.set_head_detached(object.id())?,
    }
    Ok(())
}

fn find_stash_ref(repo_root: &Path, tag: &str) -> Option<String> {
    let listing = run_git(repo_root, &["stash", "list"]).ok()?;
    for line in listing.lines() {
        if line.contains(tag) {
            // "stash@{0}: On main: operon-stash-ab12cd"
            return line.split(':').next().map(|s| s.trim().to_string());
        }
    }
    None
}

/// What a stash snapshot holds: tracked modifications plus stashed
/// untracked files (the stash's third parent, when one exists).
struct StashContents {
    tracked: Vec<String>,
    untracked: Vec<String>,
}

fn stash_contents(repo_root: &Path, stash_ref: &str) -> Result<StashContents> {
    let tracked = run_git(
        repo_root,
        &["diff", "--name-only", &format!("{}^1", stash_ref), stash_ref],
    )?
    .lines()
    .map(|l| l.trim().to_string())
    .filter(|l| !l.is_empty())
    .collect();

    let untracked = run_git(
        repo_root,
        &["ls-tree", "-r", "--name-only", &format!("{}^3", stash_ref)],
    )
    .map(|out| {
        out.lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    })
    .unwrap_or_default();

    Ok(StashContents { tracked, untracked })
}

/// Re-apply the recorded stash, merging only into files outside `exclude`.
///
/// A stash that touches an excluded file is left in place and surfaced as
/// an error: the caller just restored or committed those paths, and merging
/// user changes over them would corrupt the transaction.
fn reapply_stash(repo_root: &Path, state: &GitState, exclude: &[String]) -> Result<()> {
    let Some(tag) = &state.stash_tag else {
        return Ok(());
    };
    let Some(stash_ref) = find_stash_ref(repo_root, tag) else {
        return Err(anyhow::anyhow!(
            "rollback_partial: stash '{}' not found; user changes remain stashed",
            tag
        ));
    };

    let contents = stash_contents(repo_root, &stash_ref).map_err(|err| {
        anyhow::anyhow!("rollback_partial: cannot inspect stash '{}': {}", tag, err)
    })?;

    let overlap: Vec<&str> = contents
        .tracked
        .iter()
        .chain(contents.untracked.iter())
        .map(String::as_str)
        .filter(|f| exclude.iter().any(|e| e.as_str() == *f))
        .collect();
    if !overlap.is_empty() {
        return Err(anyhow::anyhow!(
            "rollback_partial: stash '{}' touches file(s) the agent also modified: {}; \
             kept in the stash for manual recovery",
            tag,
            overlap.join(", ")
        ));
    }

    for file in &contents.tracked {
        run_git(repo_root, &["checkout", &stash_ref, "--", file]).map_err(|err| {
            anyhow::anyhow!("rollback_partial: could not restore {}: {}", file, err)
        })?;
    }
    let untracked_ref = format!("{}^3", stash_ref);
    for file in &contents.untracked {
        run_git(repo_root, &["checkout", &untracked_ref, "--", file]).map_err(|err| {
            anyhow::anyhow!("rollback_partial: could not restore {}: {}", file, err)
        })?;
    }

    // checkout stages what it restores; put the index back.
    if !contents.tracked.is_empty() || !contents.untracked.is_empty() {
        let mut args: Vec<&str> = vec!["reset", "--"];
        args.extend(contents.tracked.iter().map(String::as_str));
        args.extend(contents.untracked.iter().map(String::as_str));
        let _ = run_git(repo_root, &args);
    }

    run_git(repo_root, &["stash", "drop", &stash_ref]).map_err(|err| {
        anyhow::anyhow!("rollback_partial: could not drop stash '{}': {}", tag, err)
    })?;
    Ok(())
}

/// Restore only the files the agent modified, then bring back the stash.
///
/// Files outside `files_modified` are never touched. Files the agent created
/// (absent at the recorded HEAD) are removed.
pub fn rollback(repo_root: &Path, state: &GitState, files_modified: &[String]) -> Result<()> {
    if !state.enabled {
        return Ok(());
    }

    for file in files_modified {
        let restored = run_git(
            repo_root,
            &["checkout", &state.initial_commit, "--", file],
        );
        if restored.is_err() {
            // Not in the recorded commit: the agent created it.
            let path = repo_root.join(file);
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("rollback_partial: cannot remove {}", file))?;
            }
        }
    }

    reapply_stash(repo_root, state, files_modified)?;
    tracing::info!(
        "rollback complete: {} file(s) restored to {}",
        files_modified.len(),
        &state.initial_commit[..8.min(state.initial_commit.len())]
    );
    Ok(())
}

/// Commit the agent's files with the run message, then bring back the stash.
pub fn commit_success(
    repo_root: &Path,
    state: &GitState,
    files_modified: &[String],
    message: &str,
) -> Result<()> {
    if !state.enabled || files_modified.is_empty() {
        return Ok(());
    }

    let repo = Repository::open(repo_root)?;
    let mut index = repo.index()?;
    for file in files_modified {
        if repo_root.join(file).exists() {
            index.add_path(Path::new(file))?;
        } else {
            index.remove_path(Path::new(file))?;
        }
    }
    index.write()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let parent = repo.head()?.peel_to_commit()?;

    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| "operon".to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| "operon@local".to_string());
    let sig = Signature::now(&name, &email)?;

    let safe_msg = message.replace('"', "'");
    repo.commit(
        Some("HEAD"),
        &sig,
        &sig,
        &format!("[operon] {}", safe_msg),
        &tree,
        &[&parent],
    )?;
    tracing::info!("committed {} file(s)", files_modified.len());

    reapply_stash(repo_root, state, files_modified)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        run_git(tmp.path(), &["init", "-b", "main"]).unwrap();
        run_git(tmp.path(), &["config", "user.name", "Test"]).unwrap();
        run_git(tmp.path(), &["config", "user.email", "test@example.com"]).unwrap();
        fs::write(tmp.path().join("kept.py"), "kept = True\n").unwrap();
        fs::write(tmp.path().join("edited.py"), "version = 1\n").unwrap();
        run_git(tmp.path(), &["add", "."]).unwrap();
        run_git(tmp.path(), &["commit", "-m", "initial"]).unwrap();
        tmp
    }

    #[test]
    fn test_setup_records_head_and_branches_off_main() {
        let tmp = init_repo();
        let state = setup(tmp.path());
        assert!(state.enabled);
        assert_eq!(state.initial_branch, "main");
        assert!(state.target_branch.starts_with("operon/task-"));
        assert!(!state.initial_commit.is_empty());

        let branch = run_git(tmp.path(), &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap();
        assert_eq!(branch, state.target_branch);
    }

    #[test]
    fn test_setup_outside_git_is_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let state = setup(tmp.path());
        assert!(!state.enabled);
        // Rollback on a disabled sidecar is a no-op, not an error.
        rollback(tmp.path(), &state, &["anything.py".to_string()]).unwrap();
    }

    #[test]
    fn test_rollback_restores_only_agent_files_and_user_stash() {
        let tmp = init_repo();

        // User has pending work the agent will NOT touch: a tracked edit
        // and an untracked file.
        fs::write(tmp.path().join("kept.py"), "kept = 'user edit'\n").unwrap();
        fs::write(tmp.path().join("notes.txt"), "user scratchpad\n").unwrap();

        let state = setup(tmp.path());
        assert!(state.stash_tag.is_some());
        assert!(!tmp.path().join("notes.txt").exists());

        // Agent modifies one file and creates another.
        fs::write(tmp.path().join("edited.py"), "version = 2\n").unwrap();
        fs::write(tmp.path().join("created.py"), "new = True\n").unwrap();

        rollback(
            tmp.path(),
            &state,
            &["edited.py".to_string(), "created.py".to_string()],
        )
        .unwrap();

        // Agent edits are gone.
        assert_eq!(
            fs::read_to_string(tmp.path().join("edited.py")).unwrap(),
            "version = 1\n"
        );
        assert!(!tmp.path().join("created.py").exists());
        // User's pre-run edits survived, tracked and untracked alike.
        assert_eq!(
            fs::read_to_string(tmp.path().join("kept.py")).unwrap(),
            "kept = 'user edit'\n"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("notes.txt")).unwrap(),
            "user scratchpad\n"
        );
        // The stash was consumed on success.
        let stashes = run_git(tmp.path(), &["stash", "list"]).unwrap();
        assert!(stashes.is_empty(), "stash should be dropped: {}", stashes);
    }

    #[test]
    fn test_rollback_surfaces_stash_overlap_with_agent_files() {
        let tmp = init_repo();

        // User has pending work on the SAME file the agent will modify.
        fs::write(tmp.path().join("edited.py"), "version = 'user wip'\n").unwrap();

        let state = setup(tmp.path());
        assert!(state.stash_tag.is_some());

        fs::write(tmp.path().join("edited.py"), "version = 2\n").unwrap();

        let err = rollback(tmp.path(), &state, &["edited.py".to_string()])
            .expect_err("overlap must be surfaced, not merged");
        let message = err.to_string();
        assert!(message.contains("rollback_partial"), "got: {}", message);
        assert!(message.contains("edited.py"), "got: {}", message);

        // The agent's edit was still rolled back to HEAD.
        assert_eq!(
            fs::read_to_string(tmp.path().join("edited.py")).unwrap(),
            "version = 1\n"
        );
        // The user's work is kept in the stash, not silently discarded.
        let stashes = run_git(tmp.path(), &["stash", "list"]).unwrap();
        assert!(
            stashes.contains(state.stash_tag.as_deref().unwrap()),
            "stash must survive: {}",
            stashes
        );
    }

    #[test]
    fn test_commit_success_commits_agent_files() {
        let tmp = init_repo();
        let state = setup(tmp.path());

        fs::write(tmp.path().join("edited.py"), "version = 2\n").unwrap();
        commit_success(
            tmp.path(),
            &state,
            &["edited.py".to_string()],
            "bump version",
        )
        .unwrap();

        let log = run_git(tmp.path(), &["log", "-1", "--pretty=%s"]).unwrap();
        assert_eq!(log, "[operon] bump version");
        let status = run_git(tmp.path(), &["status", "--porcelain"]).unwrap();
        assert!(status.is_empty(), "working tree should be clean: {}", status);
    }
}
