//! Inspect and dry-run turnstile middleware configurations.
//!
//! # Examples
//!
//! ```sh
//! # Print the JSON Schema of a pipeline file
//! turnstile schema
//!
//! # Schema of a single middleware type
//! turnstile schema --type tool_call_limit
//!
//! # Validate a pipeline file
//! turnstile validate pipeline.json
//!
//! # Estimate the token count of a transcript
//! turnstile estimate transcript.json
//!
//! # Clear old tool results until the transcript fits in 8000 tokens
//! turnstile edit transcript.json --max-tokens 8000 --exclude-tool read_file
//! ```
//!
//! Transcripts are either a JSON array of messages or a serialized
//! conversation state.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tracing::debug;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use turnstile::Message;
use turnstile::config::{MiddlewareConfig, PipelineConfig};
use turnstile::context::{ContextEditingConfig, ContextEditor, estimate_tokens};
use turnstile::state::{ConversationState, unanswered_tool_calls};

/// Inspect and dry-run turnstile middleware configurations.
#[derive(Parser)]
#[command(name = "turnstile", version)]
struct Cli {
    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the JSON Schema of a pipeline file, or of one middleware type
    Schema {
        /// Middleware type (context_editing, tool_call_limit, model_fallback, long_term_memory)
        #[arg(long = "type")]
        type_name: Option<String>,
    },

    /// Validate a pipeline file and list its middlewares
    Validate {
        /// Path to the pipeline JSON file
        file: PathBuf,
    },

    /// Estimate the token count of a transcript
    Estimate {
        /// Path to the transcript JSON file
        transcript: PathBuf,
    },

    /// Clear old tool results from a transcript and print the result
    Edit {
        /// Path to the transcript JSON file
        transcript: PathBuf,

        /// Token threshold
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Take the editing settings from the first context_editing entry of
        /// this pipeline file
        #[arg(long, conflicts_with = "max_tokens")]
        config: Option<PathBuf>,

        /// Never clear results of this tool (repeatable)
        #[arg(long = "exclude-tool")]
        exclude_tools: Vec<String>,

        /// Number of most recent tool-calling turns to keep
        #[arg(long)]
        keep_recent_turns: Option<usize>,

        /// Also keep recent turns whose results fit in this many tokens
        #[arg(long)]
        keep_recent_tokens: Option<usize>,

        /// Edit once the transcript holds at least this many messages
        #[arg(long)]
        trigger_messages: Option<usize>,

        /// Replacement text for cleared results
        #[arg(long)]
        placeholder: Option<String>,

        /// Also clear the arguments of cleared calls
        #[arg(long)]
        clear_tool_inputs: bool,
    },
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(level);
    tracing_subscriber::registry().with(layer).init();
}

fn read_transcript(path: &Path) -> Result<ConversationState, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read '{}': {e}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| format!("failed to parse '{}': {e}", path.display()))?;
    if value.is_array() {
        let messages: Vec<Message> = serde_json::from_value(value)
            .map_err(|e| format!("invalid messages in '{}': {e}", path.display()))?;
        let thread_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(ConversationState::new(thread_id, messages))
    } else {
        serde_json::from_value(value)
            .map_err(|e| format!("invalid conversation state in '{}': {e}", path.display()))
    }
}

fn schema(type_name: Option<&str>) -> Result<(), String> {
    let schema = match type_name {
        None => PipelineConfig::schema(),
        Some(name) => MiddlewareConfig::schema_for_type(name).ok_or_else(|| {
            format!(
                "unknown middleware type '{name}' (expected one of: {})",
                MiddlewareConfig::TYPES.join(", ")
            )
        })?,
    };
    let text = serde_json::to_string_pretty(&schema).map_err(|e| e.to_string())?;
    println!("{text}");
    Ok(())
}

fn validate(file: &Path) -> Result<(), String> {
    let config = PipelineConfig::from_file(file).map_err(|e| e.to_string())?;
    println!(
        "{}: {} middleware(s)",
        file.display(),
        config.middlewares.len()
    );
    for (idx, middleware) in config.middlewares.iter().enumerate() {
        let status = if middleware.is_enabled() { "" } else { " (disabled)" };
        println!("  {idx}. {}{status}", middleware.type_name());
    }
    Ok(())
}

fn estimate(transcript: &Path) -> Result<(), String> {
    let state = read_transcript(transcript)?;
    println!("messages: {}", state.messages.len());
    println!("estimated tokens: {}", estimate_tokens(&state.messages));
    let orphans = state.orphaned_results();
    if !orphans.is_empty() {
        println!("orphaned tool results at: {orphans:?}");
    }
    let unanswered = unanswered_tool_calls(&state.messages);
    if !unanswered.is_empty() {
        println!("unanswered tool calls: {}", unanswered.join(", "));
    }
    Ok(())
}

fn editing_config(command: &Command) -> Result<ContextEditingConfig, String> {
    let Command::Edit {
        max_tokens,
        config,
        exclude_tools,
        keep_recent_turns,
        keep_recent_tokens,
        trigger_messages,
        placeholder,
        clear_tool_inputs,
        ..
    } = command
    else {
        return Err("not an edit command".into());
    };

    let mut editing = match (config, max_tokens) {
        (Some(path), _) => PipelineConfig::from_file(path)
            .map_err(|e| e.to_string())?
            .middlewares
            .into_iter()
            .find_map(|m| match m {
                MiddlewareConfig::ContextEditing(c) => Some(c),
                _ => None,
            })
            .ok_or_else(|| format!("no context_editing entry in '{}'", path.display()))?,
        (None, Some(max)) => ContextEditingConfig::new(*max),
        (None, None) => return Err("either --max-tokens or --config is required".into()),
    };
    for tool in exclude_tools {
        editing = editing.exclude_tool(tool.clone());
    }
    if let Some(turns) = keep_recent_turns {
        editing = editing.with_keep_recent_turns(*turns);
    }
    if let Some(tokens) = keep_recent_tokens {
        editing = editing.with_keep_recent_tokens(*tokens);
    }
    if let Some(messages) = trigger_messages {
        editing = editing.with_trigger_messages(*messages);
    }
    if let Some(placeholder) = placeholder {
        editing = editing.with_placeholder(placeholder.clone());
    }
    if *clear_tool_inputs {
        editing = editing.with_clear_tool_inputs(true);
    }
    editing.validate().map_err(|e| e.to_string())?;
    Ok(editing)
}

fn edit(command: &Command) -> Result<(), String> {
    let Command::Edit { transcript, .. } = command else {
        return Err("not an edit command".into());
    };
    let editing = editing_config(command)?;
    let state = read_transcript(transcript)?;
    debug!("editing {} messages", state.messages.len());

    let outcome = ContextEditor::new(editing).edit(&state);
    eprintln!(
        "tokens: {} -> {} (cleared {} turn(s), removed {} orphan(s){})",
        outcome.tokens_before,
        outcome.tokens_after,
        outcome.cleared_pairs,
        outcome.removed_orphans,
        if outcome.over_budget {
            ", still over budget"
        } else {
            ""
        }
    );
    let text =
        serde_json::to_string_pretty(&outcome.state.messages).map_err(|e| e.to_string())?;
    println!("{text}");
    Ok(())
}

fn run(cli: &Cli) -> Result<(), String> {
    match &cli.command {
        Command::Schema { type_name } => schema(type_name.as_deref()),
        Command::Validate { file } => validate(file),
        Command::Estimate { transcript } => estimate(transcript),
        command @ Command::Edit { .. } => edit(command),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
