mod catalog;
mod config;
mod error;
mod executor;
mod i18n;
mod storage;
mod store_manager;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::io::{self, Write};
use std::sync::Arc;

use catalog::{TemplateCatalog, TemplateDraft};
use config::Config;
use executor::{CommandExecutor, ExecutionRequest, Launcher};
use i18n::I18n;
use storage::{CommandTemplate, ExecutionRecord, ExecutionStatus};
use store_manager::ExecutionStore;

#[derive(Parser)]
#[command(name = "cmdhub")]
#[command(version, about = "Save shell commands, run them in the background, and inspect their results")]
struct Cli {
    /// Name recorded as the initiator of runs [default: $USER]
    #[arg(long = "as", global = true)]
    initiator: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an ad-hoc command
    Run {
        /// Working directory [default: current directory]
        #[arg(short = 'C', long = "workdir")]
        workdir: Option<String>,
        /// Return right after starting instead of waiting for the result
        #[arg(long)]
        detach: bool,
        /// Command to execute (wrap commands with pipes in quotes)
        #[arg(required = true)]
        command: String,
    },
    /// Run a saved command
    Exec {
        /// Saved command id
        id: String,
        /// Return right after starting instead of waiting for the result
        #[arg(long)]
        detach: bool,
    },
    /// Show one execution
    Show { id: String },
    /// List executions, most recent first
    List {
        /// Maximum number of executions to show [default: display.recent_limit]
        #[arg(long)]
        limit: Option<usize>,
        /// Show every execution
        #[arg(long, conflicts_with = "limit")]
        all: bool,
    },
    /// Delete one execution
    Delete { id: String },
    /// Delete all executions
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Manage saved commands
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
    /// Run a recorded execution in this process (started by `run` and `exec`)
    #[command(hide = true)]
    Worker { id: String },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Save a new command
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Working directory [default: current directory]
        #[arg(short = 'C', long = "workdir")]
        workdir: Option<String>,
        /// Tag, may be repeated
        #[arg(long = "tag")]
        tags: Vec<String>,
        command: String,
    },
    /// List saved commands
    List,
    /// Show a saved command
    Show { id: String },
    /// Change a saved command; omitted fields keep their value
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(short = 'C', long = "workdir")]
        workdir: Option<String>,
        /// Replace all tags, may be repeated
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Remove all tags
        #[arg(long, conflicts_with = "tags")]
        clear_tags: bool,
        #[arg(long)]
        command: Option<String>,
    },
    /// Delete a saved command
    Remove { id: String },
}

struct App {
    config: Config,
    i18n: I18n,
    executor: CommandExecutor,
    catalog: TemplateCatalog,
    initiator: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = Config::new()?;
    let i18n = I18n::new(&config.get_effective_language());

    let store = ExecutionStore::open_file(config.executions_path())
        .context("failed to load execution history")?;
    let catalog =
        TemplateCatalog::open_file(config.commands_path()).context("failed to load saved commands")?;
    // Runs go to a separate worker process so they outlive this one
    let launcher = Launcher::Worker {
        program: std::env::current_exe().context("failed to locate the cmdhub executable")?,
        args: vec!["worker".to_string()],
        log: Some(config.worker_log_path()),
    };
    let executor = CommandExecutor::new(Arc::new(store), config.execution.shell.clone())
        .with_launcher(launcher);

    let app = App {
        initiator: cli.initiator.or_else(|| std::env::var("USER").ok()),
        config,
        i18n,
        executor,
        catalog,
    };

    match cli.command {
        Commands::Run {
            workdir,
            detach,
            command,
        } => {
            let workdir = match workdir {
                Some(dir) => dir,
                None => current_dir()?,
            };
            app.submit(ExecutionRequest::ad_hoc(workdir, command), detach)?;
        }
        Commands::Exec { id, detach } => {
            let template = app.catalog.get(&id)?;
            app.submit(ExecutionRequest::from_template(&template), detach)?;
        }
        Commands::Show { id } => match app.executor.get(&id) {
            Some(record) => print_record(&record, &app.i18n),
            None => anyhow::bail!(app.i18n.t_format("execution_not_found", &[&id])),
        },
        Commands::List { limit, all } => app.list(limit, all),
        Commands::Delete { id } => {
            if !app.executor.delete(&id)? {
                anyhow::bail!(app.i18n.t_format("execution_not_found", &[&id]));
            }
            println!("{}", app.i18n.t_format("execution_deleted", &[&id]).green());
        }
        Commands::Clear { yes } => {
            let count = app.executor.list_all().len();
            println!(
                "{}",
                app.i18n
                    .t_format("confirm_clear_title", &[&count.to_string()])
                    .red()
                    .bold()
            );
            if !yes && !confirm_delete(&app.i18n)? {
                println!("{}", app.i18n.t("confirm_aborted").yellow());
                return Ok(());
            }
            app.executor.clear_all()?;
            println!("{}", app.i18n.t("cleared_all").green());
        }
        Commands::Template { action } => app.template(action)?,
        Commands::Worker { id } => {
            app.executor.run_to_completion(&id)?;
        }
    }

    Ok(())
}

impl App {
    fn submit(&self, request: ExecutionRequest, detach: bool) -> Result<()> {
        let request = request.initiated_by(self.initiator.clone());
        let record = self.executor.submit(request)?;
        println!(
            "{}",
            self.i18n.t_format("execution_started", &[&record.id]).green().bold()
        );

        if detach {
            println!("{}", self.i18n.t_format("execution_detached", &[&record.id]).dimmed());
            return Ok(());
        }

        println!("{}", self.i18n.t("execution_waiting").dimmed());
        let Some(done) = self
            .executor
            .wait_for_terminal(&record.id, self.config.poll_interval())
        else {
            anyhow::bail!(self.i18n.t_format("execution_vanished", &[&record.id]));
        };
        print_record(&done, &self.i18n);

        match done.exit_code {
            Some(0) | None => Ok(()),
            Some(code) => std::process::exit(code.clamp(1, 255)),
        }
    }

    fn list(&self, limit: Option<usize>, all: bool) {
        let limit = if all {
            None
        } else {
            Some(limit.unwrap_or(self.config.display.recent_limit))
        };
        let (records, total) = self.executor.list_page(limit);

        if records.is_empty() {
            println!("{}", self.i18n.t("no_records"));
            return;
        }
        for record in &records {
            println!("{}", summary_line(record));
        }
        if records.len() < total {
            println!(
                "{}",
                self.i18n
                    .t_format("showing_recent", &[&records.len().to_string(), &total.to_string()])
                    .dimmed()
            );
        }
    }

    fn template(&self, action: TemplateAction) -> Result<()> {
        match action {
            TemplateAction::Add {
                name,
                description,
                workdir,
                tags,
                command,
            } => {
                let working_dir = match workdir {
                    Some(dir) => dir,
                    None => current_dir()?,
                };
                let template = self.catalog.create(TemplateDraft {
                    name,
                    description,
                    working_dir,
                    command,
                    tags,
                })?;
                println!(
                    "{}",
                    self.i18n.t_format("template_created", &[&template.id]).green()
                );
            }
            TemplateAction::List => {
                let templates = self.catalog.list();
                if templates.is_empty() {
                    println!("{}", self.i18n.t("no_templates"));
                }
                for template in templates {
                    println!(
                        "{}  {}  {}",
                        template.id.yellow(),
                        template.name.bold(),
                        template.command.dimmed()
                    );
                }
            }
            TemplateAction::Show { id } => print_template(&self.catalog.get(&id)?, &self.i18n),
            TemplateAction::Update {
                id,
                name,
                description,
                workdir,
                tags,
                clear_tags,
                command,
            } => {
                let existing = self.catalog.get(&id)?;
                let tags = if clear_tags {
                    Vec::new()
                } else if tags.is_empty() {
                    existing.tags
                } else {
                    tags
                };
                let draft = TemplateDraft {
                    name: name.unwrap_or(existing.name),
                    description: description.unwrap_or(existing.description),
                    working_dir: workdir.unwrap_or(existing.working_dir),
                    command: command.unwrap_or(existing.command),
                    tags,
                };
                self.catalog.update(&id, draft)?;
                println!("{}", self.i18n.t_format("template_updated", &[&id]).green());
            }
            TemplateAction::Remove { id } => {
                self.catalog.remove(&id)?;
                println!("{}", self.i18n.t_format("template_removed", &[&id]).green());
            }
        }
        Ok(())
    }
}

fn current_dir() -> Result<String> {
    let dir = std::env::current_dir().context("failed to resolve current directory")?;
    Ok(dir.to_string_lossy().to_string())
}

fn colored_status(status: ExecutionStatus) -> ColoredString {
    match status {
        ExecutionStatus::Running => status.as_str().yellow(),
        ExecutionStatus::Success => status.as_str().green(),
        ExecutionStatus::Failed => status.as_str().red(),
    }
}

fn local_time(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn summary_line(record: &ExecutionRecord) -> String {
    let label = record.name.as_deref().unwrap_or(&record.command);
    format!(
        "{}  {:<7}  {:>4}  {}  {:>10}  {}",
        record.id.get(..8).unwrap_or(&record.id).yellow(),
        colored_status(record.status),
        record
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string()),
        local_time(&record.started_at),
        record.duration.as_deref().unwrap_or("-"),
        label
    )
}

fn print_record(record: &ExecutionRecord, i18n: &I18n) {
    let field = |key: &str, value: &str| println!("{:<12} {}", i18n.t(key).cyan(), value);

    field("label_id", &record.id);
    println!("{:<12} {}", i18n.t("label_status").cyan(), colored_status(record.status));
    if let Some(name) = &record.name {
        field("label_name", name);
    }
    field("label_command", &record.command);
    field("label_workdir", &record.working_dir);
    if let Some(who) = &record.executed_by {
        field("label_executed_by", who);
    }
    field("label_started", &local_time(&record.started_at));
    if let Some(ended_at) = &record.ended_at {
        field("label_ended", &local_time(ended_at));
    }
    if let Some(duration) = &record.duration {
        field("label_duration", duration);
    }
    if let Some(code) = record.exit_code {
        field("label_exit_code", &code.to_string());
    }

    if record.status.is_terminal() {
        println!("{}", i18n.t("label_output").cyan().bold());
        if record.output.is_empty() {
            println!("{}", i18n.t("no_output").dimmed());
        } else {
            println!("{}", record.output.trim_end_matches('\n'));
        }
    }
}

fn print_template(template: &CommandTemplate, i18n: &I18n) {
    let field = |key: &str, value: &str| println!("{:<12} {}", i18n.t(key).cyan(), value);

    field("label_id", &template.id);
    field("label_name", &template.name);
    if !template.description.is_empty() {
        field("label_description", &template.description);
    }
    field("label_command", &template.command);
    field("label_workdir", &template.working_dir);
    if !template.tags.is_empty() {
        field("label_tags", &template.tags.join(", "));
    }
    field("label_created", &local_time(&template.created_at));
    field("label_updated", &local_time(&template.updated_at));
}

fn confirm_delete(i18n: &I18n) -> Result<bool> {
    print!("{}", i18n.t("confirm_delete_prompt").yellow());
    io::stdout().flush().ok();
    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return Ok(false);
    }
    Ok(input.trim().eq_ignore_ascii_case("yes"))
}
