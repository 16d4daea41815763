use std::fs;
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use parley_contracts::chat::{parse_command, ChatCommand, CHAT_HELP_COMMANDS};
use parley_contracts::conversation::{ConversationStore, Message, Role};
use parley_contracts::error::ChatError;
use parley_contracts::export::{export_file_name, render_markdown};
use parley_contracts::persistence::load_store;
use parley_contracts::preferences::Theme;
use parley_contracts::storage::FileKeyValueStore;
use parley_contracts::turn::{CancelToken, TurnOutcome};
use parley_engine::config::{default_data_dir, STORAGE_FILE_NAME};
use parley_engine::{ChatEngine, EngineConfig, EnvSource, ModelRequests, TitleResult, TurnProgress};

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Terminal chat client for Gemini models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Ask(AskArgs),
    List(ListArgs),
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct EngineArgs {
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "gemini")]
    provider: String,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    vision_model: Option<String>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    image: Option<PathBuf>,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct ListArgs {
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    #[arg(long)]
    conversation: Option<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

const TITLE_WAIT: Duration = Duration::from_secs(3);

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("parley error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => run_chat(args),
        Command::Ask(args) => run_ask(args),
        Command::List(args) => run_list(args),
        Command::Export(args) => run_export(args),
    }
}

fn resolve_data_dir(data_dir: Option<PathBuf>) -> PathBuf {
    data_dir.unwrap_or_else(|| default_data_dir(&EnvSource::process()))
}

fn open_engine(args: &EngineArgs) -> Result<(ChatEngine, EngineConfig)> {
    let mut config = EngineConfig::load(Some(resolve_data_dir(args.data_dir.clone())));
    config.provider = args.provider.trim().to_ascii_lowercase();
    if let Some(events) = args.events.clone() {
        config.events_path = events;
    }
    let requests = ModelRequests {
        text: args.text_model.clone(),
        image: args.image_model.clone(),
        vision: args.vision_model.clone(),
    };
    let engine = ChatEngine::open(&config, &requests)?;
    Ok((engine, config))
}

/// ANSI role colours for the active theme.
#[derive(Debug, Clone, Copy)]
struct Palette {
    user: &'static str,
    model: &'static str,
    error: &'static str,
    dim: &'static str,
}

const RESET: &str = "\x1b[0m";

impl Palette {
    fn for_theme(theme: Theme) -> Self {
        match theme {
            Theme::Dark => Self {
                user: "\x1b[1;36m",
                model: "\x1b[1;32m",
                error: "\x1b[1;31m",
                dim: "\x1b[2m",
            },
            Theme::Light => Self {
                user: "\x1b[1;34m",
                model: "\x1b[1;35m",
                error: "\x1b[31m",
                dim: "\x1b[90m",
            },
        }
    }

    fn label(&self, role: Role) -> String {
        let color = match role {
            Role::User => self.user,
            Role::Model => self.model,
            Role::Error => self.error,
        };
        format!("{color}{}:{RESET}", role.label())
    }

    fn note(&self, text: &str) -> String {
        format!("{}{text}{RESET}", self.dim)
    }
}

/// Forwards stdin lines to the chat loop. A line typed while a reply
/// streams cancels that reply instead of being forwarded.
fn spawn_stdin_reader(tx: Sender<String>, active_turn: Arc<Mutex<Option<CancelToken>>>) {
    thread::spawn(move || {
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
            let token = active_turn.lock().ok().and_then(|slot| slot.clone());
            if let Some(token) = token {
                token.cancel();
                continue;
            }
            let text = line.trim_end_matches(['\n', '\r']).to_string();
            if tx.send(text).is_err() {
                break;
            }
        }
    });
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let (mut engine, config) = open_engine(&args.engine)?;
    let active_turn = Arc::new(Mutex::new(None::<CancelToken>));
    let (tx, rx): (Sender<String>, Receiver<String>) = mpsc::channel();
    spawn_stdin_reader(tx, Arc::clone(&active_turn));

    println!(
        "Parley chat ({}, {}). Type /help for commands; press Enter to stop a reply.",
        engine.service_name(),
        engine.models().text.name
    );
    print_active(&engine);

    loop {
        let palette = Palette::for_theme(engine.state().preferences.theme);
        report_titles(&palette, engine.poll_titles()?);
        print!("> ");
        io::stdout().flush()?;

        let Ok(line) = rx.recv() else {
            break;
        };
        report_titles(&palette, engine.poll_titles()?);

        match parse_command(&line) {
            ChatCommand::Noop => {}
            ChatCommand::Help => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
                println!("Anything else is sent to the model.");
            }
            ChatCommand::NewChat => {
                let id = engine.new_conversation()?;
                println!("{}", palette.note(&format!("Started conversation {id}")));
            }
            ChatCommand::ListChats => {
                print_conversation_list(&engine.state().store);
            }
            ChatCommand::SwitchChat(id) => {
                if id.is_empty() {
                    println!("/switch requires a conversation id (see /list)");
                    continue;
                }
                match engine.switch(&id) {
                    Ok(()) => print_active(&engine),
                    Err(err) => report_error(&palette, err)?,
                }
            }
            ChatCommand::DeleteChat(id) => match engine.delete(id.as_deref()) {
                Ok(removed) => {
                    println!(
                        "{}",
                        palette.note(&format!("Deleted \"{}\" ({})", removed.title, removed.id))
                    );
                    print_active(&engine);
                }
                Err(err) => report_error(&palette, err)?,
            },
            ChatCommand::Attach(path) => {
                if path.is_empty() {
                    println!("/attach requires an image path");
                    continue;
                }
                match engine.stage_attachment(Path::new(&path)) {
                    Ok(()) => println!(
                        "{}",
                        palette.note(&format!("Attached {path}; it goes with your next message."))
                    ),
                    Err(err) => report_error(&palette, err)?,
                }
            }
            ChatCommand::Detach => {
                if engine.clear_attachment() {
                    println!("{}", palette.note("Attachment removed."));
                } else {
                    println!("{}", palette.note("No attachment staged."));
                }
            }
            ChatCommand::Summarize => {
                let outcome = engine.summarize_active()?;
                if outcome.failed {
                    println!("{} {}", palette.label(Role::Error), outcome.text);
                } else {
                    println!("{}\n{}", palette.note("Summary"), outcome.text);
                }
            }
            ChatCommand::Export(path) => {
                let (file_name, markdown) = engine.export_markdown(None)?;
                let out = path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(file_name));
                write_text(&out, &markdown)?;
                println!("{}", palette.note(&format!("Exported to {}", out.display())));
            }
            ChatCommand::Copy => match engine.last_model_text() {
                Some(text) => match copy_to_clipboard(&text) {
                    Ok(()) => println!("{}", palette.note("Copied the last reply.")),
                    Err(err) => println!("{} clipboard: {err:#}", palette.label(Role::Error)),
                },
                None => println!("{}", palette.note("Nothing to copy yet.")),
            },
            ChatCommand::Voice(setting) => {
                let enabled = setting.unwrap_or(!engine.state().preferences.voice_enabled);
                engine.set_voice(enabled)?;
                let state = if enabled { "on" } else { "off" };
                println!("{}", palette.note(&format!("Voice replies {state}.")));
                if enabled && !engine.can_speak() {
                    println!(
                        "{}",
                        palette.note("Set PARLEY_TTS_COMMAND (e.g. `say` or `espeak`) to hear replies.")
                    );
                }
            }
            ChatCommand::Theme(theme) => {
                let theme = theme.unwrap_or(engine.state().preferences.theme.toggled());
                engine.set_theme(theme)?;
                println!("{}", Palette::for_theme(theme).note(&format!("Theme set to {}.", theme.as_str())));
            }
            ChatCommand::Listen => {
                println!("{}", palette.note("Listening..."));
                match engine.listen() {
                    Ok(transcript) => {
                        println!("{} {transcript}", palette.label(Role::User));
                        run_turn(&mut engine, &config, &transcript, &active_turn, &palette)?;
                    }
                    Err(err) => report_error(&palette, err)?,
                }
            }
            ChatCommand::Unknown { command, .. } => {
                println!("Unknown command: /{command}. Type /help for commands.");
            }
            ChatCommand::PlainText(_) | ChatCommand::ImageGeneration(_) => {
                run_turn(&mut engine, &config, &line, &active_turn, &palette)?;
            }
        }
    }

    println!();
    let palette = Palette::for_theme(engine.state().preferences.theme);
    report_titles(&palette, engine.wait_for_titles(TITLE_WAIT)?);
    engine.finish()?;
    Ok(0)
}

fn run_turn(
    engine: &mut ChatEngine,
    config: &EngineConfig,
    text: &str,
    active_turn: &Arc<Mutex<Option<CancelToken>>>,
    palette: &Palette,
) -> Result<Option<TurnOutcome>> {
    let mut streamed = false;
    let result = engine.submit(text, |progress| match progress {
        TurnProgress::Started {
            streaming, cancel, ..
        } => {
            streamed = *streaming;
            if *streaming {
                if let Ok(mut slot) = active_turn.lock() {
                    *slot = Some(cancel.clone());
                }
                print!("{} ", palette.label(Role::Model));
            } else {
                print!("{}", palette.note("Working..."));
            }
            let _ = io::stdout().flush();
        }
        TurnProgress::Chunk { delta, .. } => {
            print!("{delta}");
            let _ = io::stdout().flush();
        }
        TurnProgress::Finished(_) => {
            if let Ok(mut slot) = active_turn.lock() {
                *slot = None;
            }
        }
    });
    if let Ok(mut slot) = active_turn.lock() {
        *slot = None;
    }
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            report_error(palette, err)?;
            return Ok(None);
        }
    };
    println!();

    match &outcome {
        TurnOutcome::Completed { message } => {
            if !streamed {
                print_message(palette, message);
            }
            if let Some(path) = save_message_image(config, message)? {
                println!("{}", palette.note(&format!("Image saved to {}", path.display())));
            }
        }
        TurnOutcome::Cancelled { .. } => {
            println!("{}", palette.note("[stopped by user]"));
        }
        TurnOutcome::Failed { error, .. } => {
            println!("{} {error}", palette.label(Role::Error));
        }
    }
    Ok(Some(outcome))
}

fn run_ask(args: AskArgs) -> Result<i32> {
    let (mut engine, config) = open_engine(&args.engine)?;
    engine.new_conversation()?;
    if let Some(image) = args.image.as_deref() {
        engine.stage_attachment(image)?;
    }
    let palette = Palette::for_theme(engine.state().preferences.theme);
    let active_turn = Arc::new(Mutex::new(None::<CancelToken>));
    let outcome = run_turn(&mut engine, &config, &args.prompt, &active_turn, &palette)?;
    engine.wait_for_titles(TITLE_WAIT)?;
    engine.finish()?;
    match outcome {
        Some(TurnOutcome::Completed { .. }) => Ok(0),
        _ => Ok(1),
    }
}

fn run_list(args: ListArgs) -> Result<i32> {
    let store = load_saved_store(&resolve_data_dir(args.data_dir))?;
    print_conversation_list(&store);
    Ok(0)
}

fn run_export(args: ExportArgs) -> Result<i32> {
    let store = load_saved_store(&resolve_data_dir(args.data_dir))?;
    let conversation = match args.conversation.as_deref() {
        Some(id) => store
            .get(id)
            .ok_or_else(|| ChatError::UnknownConversation(id.to_string()))?,
        None => store.active(),
    };
    let out = if args.out.is_dir() {
        args.out.join(export_file_name(conversation))
    } else {
        args.out.clone()
    };
    write_text(&out, &render_markdown(conversation, Utc::now()))?;
    println!("Exported to {}", out.display());
    Ok(0)
}

fn load_saved_store(data_dir: &Path) -> Result<ConversationStore> {
    let storage_path = data_dir.join(STORAGE_FILE_NAME);
    if !storage_path.exists() {
        bail!(
            "no saved conversations in {} (start one with `parley chat`)",
            data_dir.display()
        );
    }
    let mut storage = FileKeyValueStore::new(storage_path);
    Ok(load_store(&mut storage))
}

fn print_active(engine: &ChatEngine) {
    let conversation = engine.state().store.active();
    let palette = Palette::for_theme(engine.state().preferences.theme);
    println!(
        "{}",
        palette.note(&format!(
            "Conversation \"{}\" ({})",
            conversation.title, conversation.id
        ))
    );
    for message in &conversation.messages {
        print_message(&palette, message);
    }
}

fn print_message(palette: &Palette, message: &Message) {
    let mut line = format!("{} {}", palette.label(message.role), message.content);
    if message.image.is_some() {
        line.push_str(&palette.note(" [image]"));
    }
    println!("{line}");
}

fn print_conversation_list(store: &ConversationStore) {
    for conversation in store.list_recent_first() {
        let marker = if conversation.id == store.active_id() {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {}  {}  ({} messages)",
            conversation.id,
            conversation.title,
            conversation.messages.len()
        );
    }
}

fn report_titles(palette: &Palette, results: Vec<TitleResult>) {
    for result in results.into_iter().filter(|result| !result.fell_back()) {
        println!("{}", palette.note(&format!("Titled \"{}\"", result.title)));
    }
}

/// Prints state and validation errors and keeps the loop alive; anything
/// else is returned.
fn report_error(palette: &Palette, err: anyhow::Error) -> Result<()> {
    match err.downcast_ref::<ChatError>() {
        Some(chat_err) => {
            println!("{} {chat_err}", palette.label(Role::Error));
            Ok(())
        }
        None => {
            if err.chain().any(|cause| cause.downcast_ref::<io::Error>().is_some()) {
                println!("{} {err:#}", palette.label(Role::Error));
                return Ok(());
            }
            Err(err)
        }
    }
}

fn save_message_image(config: &EngineConfig, message: &Message) -> Result<Option<PathBuf>> {
    let Some(image) = message.image.as_ref() else {
        return Ok(None);
    };
    let dir = config.data_dir.join("images");
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}.{}", message.id, image.extension()));
    fs::write(&path, image.decode()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(Some(path))
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

fn copy_to_clipboard(text: &str) -> Result<()> {
    let mut clipboard = arboard::Clipboard::new().context("clipboard unavailable")?;
    clipboard
        .set_text(text.to_string())
        .context("clipboard write failed")
}
