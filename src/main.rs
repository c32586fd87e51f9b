//! Operon — repository-aware code intelligence with guarded edits.
//!
//! The CLI layer: argument parsing, graph loading, oracle wiring and the
//! console approval driver. Everything interesting lives in the library
//! modules; this file maps subcommands onto them and onto stable exit codes.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use operon::agent::phase::{render_last_diff, Orchestrator};
use operon::agent::state::Phase;
use operon::edit::approval::{ApprovalGate, Decision, PendingApproval};
use operon::exit_codes;
use operon::explain;
use operon::index::graph::SymbolGraph;
use operon::oracle::{HttpOracle, Oracle};

#[derive(Parser, Debug)]
#[command(
    name = "operon",
    about = "Repository-aware semantic code intelligence",
    long_about = "Operon builds a persistent cross-file symbol graph of a repository \
                  and drives guarded, surgical code edits under mandatory approval \
                  with atomic rollback.",
    version
)]
struct Args {
    /// Path to the repository (defaults to the enclosing repo of the cwd)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build or refresh the symbol graph and print stats
    Index {
        /// Re-extract every file instead of only changed ones
        #[arg(long)]
        full: bool,
    },
    /// Explain a symbol, a file:line location, or a whole file
    Explain {
        /// Symbol name, `file:line`, or file path
        target: String,
        /// Show the execution flow of a function
        #[arg(long)]
        flow: bool,
        /// Explain an entire file
        #[arg(long)]
        file: bool,
        /// Skip oracle calls
        #[arg(long)]
        no_llm: bool,
    },
    /// Show all usage sites of a symbol
    Usages { symbol: String },
    /// Rename a symbol across the repository (dry-run by default)
    Rename {
        old_name: String,
        new_name: String,
        /// Write the changes to disk
        #[arg(long)]
        apply: bool,
    },
    /// Generate the docs/ tree
    Docs {
        /// Skip oracle summaries
        #[arg(long)]
        no_llm: bool,
    },
    /// Per-symbol summaries for one file
    Summarize {
        file: String,
        /// Skip oracle calls
        #[arg(long)]
        no_llm: bool,
    },
    /// Change a function signature and update call sites (dry-run by default)
    Signature {
        func: String,
        /// New parameter list, comma-separated: "a, b=None, c"
        params: String,
        /// Write the changes to disk
        #[arg(long)]
        apply: bool,
    },
    /// Run the agent against a goal
    Run {
        goal: String,
        /// Auto-approve every edit (headless mode)
        #[arg(long)]
        yes: bool,
    },
}

fn main() {
    operon::logging::init();
    let args = Args::parse();

    let repo_root = match &args.repo {
        Some(path) => path.clone(),
        None => find_repo_root(),
    };

    let code = match dispatch(&args.command, &repo_root) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            exit_codes::INTERNAL
        }
    };
    std::process::exit(code);
}

/// Walk up from the cwd to the first directory holding `.git` or `.operon`.
fn find_repo_root() -> PathBuf {
    let mut dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    for _ in 0..8 {
        if dir.join(".git").exists() || dir.join(".operon").exists() {
            return dir;
        }
        if !dir.pop() {
            break;
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Load the graph, building it on first use.
fn load_graph(repo_root: &Path) -> Result<SymbolGraph> {
    let graph = SymbolGraph::load(repo_root);
    if graph.files.is_empty() {
        eprintln!("Building symbol graph (first run)...");
        return SymbolGraph::build(repo_root, true);
    }
    Ok(graph)
}

/// The oracle, when one is configured for this repository.
fn configured_oracle(repo_root: &Path, no_llm: bool) -> Option<HttpOracle> {
    if no_llm || !operon::config::LlmConfig::path(repo_root).exists() {
        return None;
    }
    Some(HttpOracle::new(repo_root))
}

fn dispatch(command: &Command, repo_root: &Path) -> Result<i32> {
    match command {
        Command::Index { full } => {
            let graph = SymbolGraph::build(repo_root, !full)?;
            let stats = graph.stats();
            println!(
                "Indexed {} files, {} symbols, {} cross-referenced names.",
                stats.file_count, stats.symbol_count, stats.cross_ref_count
            );
            Ok(exit_codes::OK)
        }

        Command::Explain {
            target,
            flow,
            file,
            no_llm,
        } => {
            let graph = load_graph(repo_root)?;
            let oracle = configured_oracle(repo_root, *no_llm);
            let oracle_ref = oracle.as_ref().map(|o| o as &dyn Oracle);

            if *flow {
                return Ok(explain::explain_flow(repo_root, target, &graph, oracle_ref));
            }
            if *file {
                return Ok(explain::explain_file(repo_root, target, &graph, oracle_ref));
            }
            // `file:line` form.
            if let Some((path, line)) = target.rsplit_once(':') {
                if let Ok(line) = line.parse::<usize>() {
                    return Ok(explain::explain_at_line(
                        repo_root, path, line, &graph, oracle_ref,
                    ));
                }
            }
            Ok(explain::explain_symbol(repo_root, target, &graph, oracle_ref))
        }

        Command::Usages { symbol } => {
            let graph = load_graph(repo_root)?;
            Ok(explain::cmd_usages(repo_root, symbol, &graph))
        }

        Command::Rename {
            old_name,
            new_name,
            apply,
        } => Ok(explain::cmd_rename(repo_root, old_name, new_name, *apply)),

        Command::Docs { no_llm } => {
            let graph = load_graph(repo_root)?;
            let oracle = configured_oracle(repo_root, *no_llm);
            let oracle_ref = oracle.as_ref().map(|o| o as &dyn Oracle);
            let docs_dir = operon::docs::generate_repo_docs(repo_root, &graph, oracle_ref)?;
            println!("Documentation written to: {}", docs_dir.display());
            Ok(exit_codes::OK)
        }

        Command::Summarize { file, no_llm } => {
            let graph = load_graph(repo_root)?;
            let oracle = configured_oracle(repo_root, *no_llm);
            let oracle_ref = oracle.as_ref().map(|o| o as &dyn Oracle);
            Ok(explain::cmd_summarize(repo_root, file, &graph, oracle_ref))
        }

        Command::Signature {
            func,
            params,
            apply,
        } => Ok(explain::cmd_signature(repo_root, func, params, *apply)),

        Command::Run { goal, yes } => run_agent(repo_root, goal, *yes),
    }
}

fn run_agent(repo_root: &Path, goal: &str, auto_approve: bool) -> Result<i32> {
    let oracle = HttpOracle::new(repo_root);
    let cancel = AtomicBool::new(false);

    let (gate, consumer) = if auto_approve {
        (ApprovalGate::headless(true), None)
    } else {
        let (gate, rx) = ApprovalGate::interactive();
        (gate, Some(rx))
    };

    // Console approval driver: drains pending requests on its own thread so
    // the orchestrator can block on the gate.
    let driver = consumer.map(|rx| {
        std::thread::spawn(move || {
            for pending in rx.iter() {
                let _ = answer_on_console(&pending);
            }
        })
    });

    let (state, outcome) = {
        let orchestrator = Orchestrator::new(&oracle, &gate, &cancel);
        orchestrator.run(goal, repo_root)?
    };

    drop(gate);
    if let Some(handle) = driver {
        let _ = handle.join();
    }

    println!();
    match outcome.phase {
        Phase::Done => {
            println!("DONE: {}", outcome.reason);
            println!("Modified: {:?}", state.files_modified);
            if let Some(report) = render_last_diff(repo_root) {
                println!("\n{}", report);
            }
            Ok(exit_codes::OK)
        }
        _ if outcome.reason.starts_with("cancelled") => {
            println!("CANCELLED");
            Ok(exit_codes::CANCELLED)
        }
        _ => {
            println!("FAILED: {}", outcome.reason);
            Ok(exit_codes::APPLY_FAILED)
        }
    }
}

fn answer_on_console(pending: &PendingApproval) -> Result<()> {
    let request = &pending.request;
    println!("\n--- approval required: {} on {} ---", request.action, request.file);
    if !request.summary.is_empty() {
        println!("{}", request.summary);
    }
    println!("SEARCH:\n{}", request.search);
    println!("REPLACE:\n{}", request.replace);
    print!("apply this edit? [y/N] ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let decision = if line.trim().eq_ignore_ascii_case("y") {
        Decision::Approved
    } else {
        Decision::Rejected
    };
    let _ = pending.respond.send(decision);
    Ok(())
}
