use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use ptsched::config::{UserConfig, config_path};
use ptsched::scheduler::{self, DEFAULT_WORKERS, UpdateError};
use ptsched::workspace::{self, FsScheduleRepository, GitVersionControl, InitError};
use ptsched::{NormalizedSchedule, OutputFormat, ParseFailure, generate, render_document, syntax};

/// Exit status when `init` finds an existing `.ptscheddir`.
const EXIT_ALREADY_INITIALIZED: u8 = 17;
const STDIN_NAME: &str = "<stdin>";

#[derive(Debug, Parser)]
#[command(
    name = "ptsched",
    about = "ptsched schedules your class work from plain-text term plans",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse a schedule file and print the result.
    Parse(ParseArgs),

    /// Regenerate the markdown output of every schedule under a directory.
    Schedule(ScheduleArgs),

    /// Write a blank schedule for the current school week.
    Generate(GenerateArgs),

    /// Initialize a schedule directory.
    Init(InitArgs),

    /// Print the schedule file closest to today in the default directory.
    Find(FindArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// The file to read (default is stdin).
    filename: Option<PathBuf>,
    /// The file to write to (default is stdout).
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Parse and validate, but do not output anything.
    #[arg(short, long)]
    dry_run: bool,
    #[command(flatten)]
    view: ParseView,
}

#[derive(Debug, Args)]
#[group(multiple = false)]
struct ParseView {
    /// Print the syntax tree.
    #[arg(short, long)]
    ast: bool,
    /// List the classes in the file.
    #[arg(short = 'c', long)]
    list_courses: bool,
    /// List the days in the file as YYYY-MM-DD.
    #[arg(short = 'y', long)]
    list_days: bool,
    /// Print the schedule as JSON.
    #[arg(short, long)]
    json: bool,
    /// Print the schedule as markdown.
    #[arg(short, long)]
    markdown: bool,
    /// Print the schedule in the normal format (the default).
    #[arg(short, long)]
    normal: bool,
}

#[derive(Debug, Args)]
struct ScheduleArgs {
    /// Directory to scan (default is the current directory).
    #[arg(long)]
    root: Option<PathBuf>,
    /// Do not commit changed outputs to git.
    #[arg(long)]
    no_vcs: bool,
    /// Do not print per-file status.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// Write the template here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// A class to generate days for; repeat for more classes.
    #[arg(short = 'c', long = "class")]
    classes: Vec<String>,
}

#[derive(Debug, Args)]
struct InitArgs {
    /// Record the current directory as the default directory instead.
    #[arg(short, long)]
    set_default: bool,
}

#[derive(Debug, Args)]
struct FindArgs {
    /// Print the default directory instead of a file.
    #[arg(short, long)]
    directory: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Schedule(args) => handle_schedule(args),
        Commands::Generate(args) => handle_generate(args),
        Commands::Init(args) => handle_init(args),
        Commands::Find(args) => handle_find(args),
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/* ---------------------------------- parse ---------------------------------- */

fn handle_parse(args: ParseArgs) -> Result<ExitCode> {
    let ParseArgs {
        filename,
        output,
        dry_run,
        view,
    } = args;

    let (text, name) = match &filename {
        Some(path) => (
            fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?,
            path.display().to_string(),
        ),
        None => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("reading stdin")?;
            (text, STDIN_NAME.to_string())
        }
    };

    let schedule = match ptsched::parse_source(&text, &name) {
        Ok(schedule) => schedule,
        Err(failure) => {
            report_failure(&failure);
            return Ok(ExitCode::FAILURE);
        }
    };
    tracing::debug!("parsed {} day(s) from {}", schedule.days.len(), name);
    if dry_run {
        return Ok(ExitCode::SUCCESS);
    }

    let rendered = render_view(&view, &schedule, &text)?;
    write_output(output.as_deref(), &rendered)?;
    Ok(ExitCode::SUCCESS)
}

fn render_view(view: &ParseView, schedule: &NormalizedSchedule, text: &str) -> Result<String> {
    let mut out = if view.ast {
        let tree = syntax::parse(text).context("re-parsing validated source")?;
        format!("{:#?}", tree)
    } else if view.list_courses {
        schedule.class_names().join("\n")
    } else if view.list_days {
        schedule
            .days
            .iter()
            .map(|day| day.date.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    } else if view.json {
        serde_json::to_string_pretty(schedule)?
    } else if view.markdown {
        return Ok(render_document(schedule, OutputFormat::Markdown));
    } else {
        return Ok(render_document(schedule, OutputFormat::Default));
    };
    out.push('\n');
    Ok(out)
}

fn report_failure(failure: &ParseFailure) {
    for diagnostic in failure.diagnostics() {
        eprintln!("{diagnostic}");
    }
}

fn write_output(path: Option<&Path>, text: &str) -> Result<()> {
    match path {
        Some(path) => fs::write(path, text).with_context(|| format!("writing {:?}", path)),
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(text.as_bytes()).context("writing stdout")?;
            stdout.flush().context("flushing stdout")
        }
    }
}

/* --------------------------------- schedule --------------------------------- */

fn handle_schedule(args: ScheduleArgs) -> Result<ExitCode> {
    let ScheduleArgs {
        root,
        no_vcs,
        quiet,
    } = args;
    let root = match root {
        Some(root) => root,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let repo = FsScheduleRepository::open(&root)?;
    let outcomes = scheduler::update_all(&repo, DEFAULT_WORKERS)?;

    let mut failed = 0usize;
    for outcome in &outcomes {
        match &outcome.result {
            Ok((output, status)) => {
                if !quiet {
                    println!("{}: {}", output.display(), status);
                }
            }
            Err(UpdateError::Invalid(failure)) => {
                failed += 1;
                report_failure(failure);
            }
            Err(UpdateError::Io(err)) => {
                failed += 1;
                eprintln!("{}: {:#}", outcome.source.display(), err);
            }
        }
    }

    if !no_vcs {
        let vcs = GitVersionControl {
            repo_dir: repo.root().to_path_buf(),
        };
        if scheduler::commit_changes(&vcs, &outcomes, Local::now().naive_local())? {
            tracing::info!("committed schedule changes");
        } else {
            tracing::debug!("nothing to commit");
        }
    }

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/* --------------------------------- generate --------------------------------- */

fn handle_generate(args: GenerateArgs) -> Result<ExitCode> {
    let (start, end) = generate::week_range(Local::now().date_naive());
    let text = generate::template(start, end, &args.classes);
    write_output(args.output.as_deref(), &text)?;
    Ok(ExitCode::SUCCESS)
}

/* ----------------------------------- init ----------------------------------- */

fn handle_init(args: InitArgs) -> Result<ExitCode> {
    let cwd = std::env::current_dir().context("resolving current directory")?;
    if args.set_default {
        let path = config_path()?;
        set_default_directory(&path, &cwd)?;
        return Ok(ExitCode::SUCCESS);
    }

    match workspace::init_directory(&cwd) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(InitError::AlreadyInitialized(_)) => {
            eprintln!("A ptsched directory already exists in this folder.");
            Ok(ExitCode::from(EXIT_ALREADY_INITIALIZED))
        }
        Err(InitError::Other(err)) => Err(err),
    }
}

fn set_default_directory(config_file: &Path, dir: &Path) -> Result<()> {
    let mut config = UserConfig::load(config_file)?;
    config.default_directory = Some(dir.to_path_buf());
    config.save(config_file)
}

/* ----------------------------------- find ----------------------------------- */

fn handle_find(args: FindArgs) -> Result<ExitCode> {
    let config = UserConfig::load(&config_path()?)?;
    let Some(dir) = config.default_directory else {
        println!(
            "No ptsched configuration has been set. Run\n\n\tptsched init --set-default\n\nin your directory of choice."
        );
        return Ok(ExitCode::FAILURE);
    };

    if args.directory {
        println!("{}", dir.display());
        return Ok(ExitCode::SUCCESS);
    }

    match workspace::nearest_schedule(&dir, Local::now().date_naive())? {
        Some(path) => {
            println!("{}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("no schedule files found in {}", dir.display());
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    const WEEK: &str = "1 January 2024 - 2 January 2024\n\n# Math\n\n- Mon 1\nRead ch.1\n- Tue 2\n";

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_views_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["ptsched", "parse", "-j", "-m", "a.ptsched"]).is_err());
        let cli = Cli::try_parse_from(["ptsched", "parse", "-y", "-o", "out.txt", "a.ptsched"])
            .expect("parse args");
        match cli.command {
            Commands::Parse(args) => {
                assert!(args.view.list_days);
                assert_eq!(args.output, Some(PathBuf::from("out.txt")));
                assert_eq!(args.filename, Some(PathBuf::from("a.ptsched")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn generate_collects_repeated_classes() {
        let cli = Cli::try_parse_from(["ptsched", "generate", "-c", "Math", "--class", "Art"])
            .expect("parse args");
        match cli.command {
            Commands::Generate(args) => assert_eq!(args.classes, ["Math", "Art"]),
            other => panic!("unexpected command {:?}", other),
        }
    }

    fn view(build: impl FnOnce(&mut ParseView)) -> ParseView {
        let mut view = ParseView {
            ast: false,
            list_courses: false,
            list_days: false,
            json: false,
            markdown: false,
            normal: false,
        };
        build(&mut view);
        view
    }

    #[test]
    fn views_render_expected_shapes() {
        let schedule = ptsched::parse_source(WEEK, "week").expect("valid");

        let days = render_view(&view(|v| v.list_days = true), &schedule, WEEK).expect("days");
        assert_eq!(days, "2024-01-01\n2024-01-02\n");

        let courses =
            render_view(&view(|v| v.list_courses = true), &schedule, WEEK).expect("courses");
        assert_eq!(courses, "Math\n");

        let normal = render_view(&view(|_| {}), &schedule, WEEK).expect("normal");
        assert!(normal.starts_with("2024-01-01:\n\nMath:\nRead ch.1\n"));

        let json = render_view(&view(|v| v.json = true), &schedule, WEEK).expect("json");
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(value["start_date"], "2024-01-01");
        assert_eq!(value["days"][0]["classes"][0]["tasks"][0], "Read ch.1");

        let ast = render_view(&view(|v| v.ast = true), &schedule, WEEK).expect("ast");
        assert!(ast.contains("ClassNode"));
    }

    #[test]
    fn set_default_keeps_other_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config_file = tmp.path().join("config.json");
        fs::write(&config_file, r#"{"calendar":"School"}"#).expect("write");

        set_default_directory(&config_file, tmp.path()).expect("set default");

        let config = UserConfig::load(&config_file).expect("load");
        assert_eq!(config.default_directory.as_deref(), Some(tmp.path()));
        assert_eq!(config.extra["calendar"], "School");
    }

    #[test]
    fn write_output_targets_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("template.ptsched");
        write_output(Some(&path), "1 January 2024 - 5 January 2024\n").expect("write");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "1 January 2024 - 5 January 2024\n"
        );
    }
}
