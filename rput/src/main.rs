use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rput",
    version,
    about = "Push changed files from a source tree to its mirror",
    long_about = "`rput` synchronizes changed files in one direction - nothing is ever deleted
from the destination and the source always wins.

Jobs are described in a JSON config file (see `rput template`). Change
detection uses the job's baseline record store when one is configured,
otherwise the destination is cross-statted live.

EXAMPLE:
    # show what would be transferred, then do it
    rput pending
    rput sync --yes --summary

    # sync only the job labeled \"deploy\" from a custom config
    rput sync -c deploy.json:deploy"
)]
struct Args {
    #[command(subcommand)]
    action: Action,

    /// Config file with an optional job label, e.g. "rput.json:deploy"
    ///
    /// Without a label every job in the file runs; with one only the
    /// matching jobs run.
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        default_value = "rput.json",
        value_name = "CONFIG[:LABEL]"
    )]
    config: String,

    /// Reverse direction: pull changed files from the destination back into
    /// the source
    #[arg(long, global = true)]
    pull: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    /// Print summary at the end
    #[arg(long, global = true)]
    summary: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Action {
    /// List every walked entry together with its verdict
    List,
    /// List only the entries that would be transferred
    Pending,
    /// Transfer the pending entries
    Sync {
        /// Automatic yes to the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Record the current state of every source entry as already synced
    InitBaseline,
    /// Delete the baseline record store
    ClearBaseline,
    /// Write a starter config file and exit
    Template,
}

/// Splits `CONFIG[:LABEL]` into the file path and the optional label.
fn split_config_arg(arg: &str) -> (&str, Option<&str>) {
    match arg.rsplit_once(':') {
        Some((path, label)) if !path.is_empty() => (path, Some(label)),
        _ => (arg, None),
    }
}

fn verdict_tag(verdict: &common::SyncVerdict) -> &'static str {
    if !verdict.needs_transfer {
        "IGN"
    } else if verdict.destination_exists {
        "OVR"
    } else {
        "NEW"
    }
}

fn print_plan(plan: &common::Plan, pending_only: bool) {
    for item in &plan.items {
        if pending_only && !item.verdict.needs_transfer {
            continue;
        }
        println!(
            "[{} {}] {}",
            verdict_tag(&item.verdict),
            item.entry.kind.label(),
            item.entry.rel_path
        );
    }
    for (rel_path, error) in &plan.failed {
        println!("[ERR    ] {rel_path}: {error:#}");
    }
}

/// Interactive Y/n prompt, empty input counts as yes.
fn confirm(question: &str) -> Result<bool> {
    use std::io::Write;
    print!("{question} (Y/n): ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let answer = input.trim();
    Ok(answer.is_empty() || answer.eq_ignore_ascii_case("y"))
}

fn required_baseline(job: &common::Job) -> Result<&std::path::Path> {
    job.baseline
        .as_deref()
        .ok_or_else(|| anyhow!("job {:?} has no baseline store configured", job.label))
}

#[instrument(skip(args))]
async fn run_job(args: &Args, job: &common::Job) -> Result<common::Summary, common::execute::Error> {
    let wrap = |error: anyhow::Error| common::execute::Error::new(error, Default::default());
    let mode = if args.pull {
        common::SyncMode::Pull
    } else {
        common::SyncMode::Push
    };
    let (src_root, dst_root) = if args.pull {
        (&job.destination, &job.source)
    } else {
        (&job.source, &job.destination)
    };
    tracing::info!("[{}] {} {:?} -> {:?}", job.label, mode, src_root, dst_root);
    let src = common::LocalFs::new(src_root);
    let dst = common::LocalFs::new(dst_root);

    if let Action::ClearBaseline = args.action {
        let path = required_baseline(job).map_err(wrap)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => println!("removed baseline store {path:?}"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                println!("baseline store {path:?} does not exist");
            }
            Err(error) => {
                return Err(wrap(
                    anyhow::Error::from(error)
                        .context(format!("cannot remove baseline store {path:?}")),
                ));
            }
        }
        return Ok(Default::default());
    }

    let entries = match &job.select {
        Some(patterns) => {
            common::walk_select(&src, &common::PatternList::new(patterns.clone()), job.follow_links)
                .await
        }
        None => {
            common::walk(&src, &common::IgnoreSet::new(job.ignore.clone()), job.follow_links).await
        }
    }
    .map_err(wrap)?;
    tracing::debug!("walked {} entries", entries.len());

    if let Action::InitBaseline = args.action {
        let path = required_baseline(job).map_err(wrap)?;
        let mut store = common::baseline::Baseline::open(path).await.map_err(wrap)?;
        let mut recorded = 0;
        for entry in &entries {
            if matches!(entry.kind, common::EntryKind::File | common::EntryKind::Directory) {
                store.update(&entry.rel_path, entry.mtime);
                recorded += 1;
            }
        }
        store.close().await.map_err(wrap)?;
        println!("recorded {recorded} entries into {path:?}");
        return Ok(Default::default());
    }

    let mut detector = match &job.baseline {
        Some(path) => common::ChangeDetector::Baseline(
            common::baseline::Baseline::open(path).await.map_err(wrap)?,
        ),
        None => common::ChangeDetector::CrossStat,
    };
    let sync_plan = common::plan(entries, &detector, &dst).await;

    let yes = match args.action {
        Action::List => {
            print_plan(&sync_plan, false);
            return Ok(Default::default());
        }
        Action::Pending => {
            print_plan(&sync_plan, true);
            return Ok(Default::default());
        }
        Action::Sync { yes } => yes,
        _ => unreachable!(),
    };

    if sync_plan.pending().next().is_none() && sync_plan.failed.is_empty() {
        println!("[{}] nothing to do", job.label);
        detector.close().await.map_err(wrap)?;
        return Ok(Default::default());
    }
    if !yes {
        print_plan(&sync_plan, true);
        let question = format!(
            "The above entries will be {}",
            match mode {
                common::SyncMode::Push => "pushed",
                common::SyncMode::Pull => "pulled",
            }
        );
        if !confirm(&question).map_err(wrap)? {
            println!("[{}] aborted", job.label);
            detector.close().await.map_err(wrap)?;
            return Ok(Default::default());
        }
    }

    let cancel = common::CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping after the current entry");
                cancel.cancel();
            }
        });
    }
    let settings = common::SyncSettings {
        mode,
        chunk_size: job.chunk_size,
    };
    let result = common::execute(&sync_plan, &src, &dst, &mut detector, &settings, &cancel).await;
    // flush successful updates even when some entries failed
    if let Err(error) = detector.close().await {
        let summary = match result {
            Ok(summary) => summary,
            Err(sync_error) => sync_error.summary,
        };
        return Err(common::execute::Error::new(
            error.context("cannot flush the baseline store"),
            summary,
        ));
    }
    result
}

#[instrument]
async fn async_main(args: Args) -> Result<common::Summary> {
    let (config_path, label) = split_config_arg(&args.config);
    let config_path = std::path::Path::new(config_path);

    if let Action::Template = args.action {
        if tokio::fs::try_exists(config_path).await? {
            return Err(anyhow!("{config_path:?} already exists, not overwriting"));
        }
        tokio::fs::write(config_path, common::config::TEMPLATE)
            .await
            .with_context(|| format!("cannot write {config_path:?}"))?;
        println!("wrote template config to {config_path:?}");
        return Ok(Default::default());
    }

    let jobs = common::load_jobs(config_path)?;
    let selected: Vec<_> = jobs
        .iter()
        .filter(|job| label.is_none_or(|l| job.label == l))
        .collect();
    if selected.is_empty() {
        match label {
            Some(label) => return Err(anyhow!("no job labeled {label:?} in {config_path:?}")),
            None => return Err(anyhow!("no jobs in {config_path:?}")),
        }
    }

    let mut success = true;
    let mut total = common::Summary::default();
    for job in selected {
        match run_job(&args, job).await {
            Ok(summary) => total = total + summary,
            Err(error) => {
                tracing::error!("{:#}", &error);
                total = total + error.summary;
                success = false;
            }
        }
    }
    if !success {
        if args.summary {
            return Err(anyhow!("rput encountered errors\n\n{}", &total));
        }
        return Err(anyhow!("rput encountered errors"));
    }
    Ok(total)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    if common::run(&output, func).is_none() {
        std::process::exit(1);
    }
    Ok(())
}
