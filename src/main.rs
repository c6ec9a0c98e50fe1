use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use llama_session::inference::embedding::embed_text;
use llama_session::inference::{
    EngineError, GenerationStream, ModelHandle, StopReason, StreamToken,
};
use llama_session::session::{self, new_session_id, SessionRegistry};
use llama_session::storage::settings::{
    load_settings, load_settings_from, save_settings, save_settings_to, EngineSettings,
};

/// Interactive chat over a local GGUF model
#[derive(Parser, Debug)]
#[command(name = "llama-session")]
struct Args {
    /// Path to the GGUF model (overrides the settings file)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Context window size in tokens
    #[arg(long)]
    ctx_size: Option<u32>,

    /// Layers to offload to the GPU
    #[arg(long)]
    gpu_layers: Option<u32>,

    /// Sampling seed
    #[arg(long)]
    seed: Option<u64>,

    /// Text encoding of the model vocabulary
    #[arg(long)]
    encoding: Option<String>,

    /// Sampling temperature (0 = greedy)
    #[arg(short, long)]
    temperature: Option<f32>,

    /// Maximum tokens per reply (negative = until the context is full)
    #[arg(long, allow_hyphen_values = true)]
    max_tokens: Option<i32>,

    /// Stop string, may be repeated
    #[arg(long = "antiprompt")]
    antiprompts: Vec<String>,

    /// System prompt for the conversation
    #[arg(long)]
    system: Option<String>,

    /// Image attached to the first message
    #[arg(long)]
    image: Option<PathBuf>,

    /// Print the embedding of this text as JSON and exit
    #[arg(long)]
    embed: Option<String>,

    /// Settings file (defaults to the platform data directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save_settings: bool,
}

impl Args {
    fn apply(&self, settings: &mut EngineSettings) {
        if let Some(model) = &self.model {
            settings.model.path = model.clone();
        }
        if let Some(ctx_size) = self.ctx_size {
            settings.model.context_size = ctx_size;
        }
        if let Some(gpu_layers) = self.gpu_layers {
            settings.model.gpu_layers = gpu_layers;
        }
        if let Some(encoding) = &self.encoding {
            settings.model.encoding = encoding.clone();
        }
        if let Some(seed) = self.seed {
            settings.inference.seed = Some(seed);
        }
        if let Some(temperature) = self.temperature {
            settings.inference.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            settings.inference.max_tokens = max_tokens;
        }
        if !self.antiprompts.is_empty() {
            settings.session.antiprompts = self.antiprompts.clone();
        }
        if let Some(system) = &self.system {
            settings.session.system_prompt = Some(system.clone());
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("llama_session=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    args.apply(&mut settings);
    settings.validate();

    if args.save_settings {
        match &args.settings {
            Some(path) => save_settings_to(&settings, path)?,
            None => save_settings(&settings)?,
        }
    }

    if settings.model.path.as_os_str().is_empty() {
        return Err(
            "no model given, pass --model or set model.path in the settings file".into(),
        );
    }

    let params = settings.model.clone();
    let handle = tokio::task::spawn_blocking(move || ModelHandle::load(&params)).await??;
    let handle = Arc::new(handle);
    tracing::info!("Loaded {}", handle.info().path);

    if let Some(text) = args.embed.clone() {
        let handle = Arc::clone(&handle);
        let embedding =
            tokio::task::spawn_blocking(move || embed_text(&handle, &text, true)).await??;
        println!("{}", serde_json::to_string(&embedding)?);
        return Ok(());
    }

    let mut image = match &args.image {
        Some(path) => Some(tokio::fs::read(path).await?),
        None => None,
    };

    let registry = session::install(SessionRegistry::new(handle, settings.session.clone()));
    let session_id = new_session_id();

    println!(
        "Chatting with {}. /reset clears the conversation, /save and /load <dir> \
         keep it on disk, /quit or Ctrl-C exits.",
        settings.model.path.display()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = match next_input(&mut lines, interrupted()).await? {
            Input::Line(line) => line,
            Input::Interrupted => {
                println!();
                break;
            }
            Input::Closed => break,
        };

        let text = match parse_command(&line) {
            Command::Empty => continue,
            Command::Quit => break,
            Command::Reset => {
                if let Some(state) = registry.get(&session_id) {
                    if let Err(e) = state.reset() {
                        eprintln!("error: {e}");
                        continue;
                    }
                }
                println!("(conversation cleared)");
                continue;
            }
            Command::Save(dir) => {
                let result = blocking(&registry, &session_id, move |r, id| {
                    r.save_session(id, &dir)
                })
                .await?;
                match result {
                    Ok(tokens) => println!("(saved, {tokens} cached tokens)"),
                    Err(e) => eprintln!("error: {e}"),
                }
                continue;
            }
            Command::Load(dir) => {
                let result = blocking(&registry, &session_id, move |r, id| {
                    r.load_session(id, &dir)
                })
                .await?;
                match result {
                    Ok(tokens) => println!("(restored, {tokens} cached tokens)"),
                    Err(e) => eprintln!("error: {e}"),
                }
                continue;
            }
            Command::Chat(text) => text.to_string(),
        };

        let params = settings.inference.clone();
        let pending = image.take();
        let (result, pending) = blocking(&registry, &session_id, move |r, id| {
            let result = r.chat(id, &text, params, pending.as_deref());
            (result, pending)
        })
        .await?;
        match result {
            Ok(stream) => print_reply(&registry, &session_id, stream).await?,
            Err(e) => {
                image = pending;
                eprintln!("error: {e}");
            }
        }
    }

    tokio::task::spawn_blocking(session::teardown).await?;
    Ok(())
}

/// Runs a registry call that may wait on native work off the async runtime
async fn blocking<T: Send + 'static>(
    registry: &Arc<SessionRegistry>,
    session_id: &str,
    job: impl FnOnce(&SessionRegistry, &str) -> T + Send + 'static,
) -> Result<T, tokio::task::JoinError> {
    let registry = Arc::clone(registry);
    let session_id = session_id.to_string();
    tokio::task::spawn_blocking(move || job(&registry, &session_id)).await
}

#[derive(Debug, PartialEq)]
enum Command<'a> {
    Empty,
    Quit,
    Reset,
    Save(PathBuf),
    Load(PathBuf),
    Chat(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    let (name, arg) = match line.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (line, ""),
    };
    match (name, arg) {
        ("", _) => Command::Empty,
        ("/quit", "") => Command::Quit,
        ("/reset", "") => Command::Reset,
        ("/save", dir) if !dir.is_empty() => Command::Save(Path::new(dir).to_path_buf()),
        ("/load", dir) if !dir.is_empty() => Command::Load(Path::new(dir).to_path_buf()),
        _ => Command::Chat(line),
    }
}

/// What the prompt produced
#[derive(Debug, PartialEq)]
enum Input {
    Line(String),
    Interrupted,
    Closed,
}

/// Waits for the next line unless `interrupt` fires first
async fn next_input<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    interrupt: impl Future<Output = ()>,
) -> std::io::Result<Input> {
    tokio::select! {
        line = lines.next_line() => Ok(match line? {
            Some(line) => Input::Line(line),
            None => Input::Closed,
        }),
        _ = interrupt => Ok(Input::Interrupted),
    }
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Prints a reply as it streams. Ctrl-C cancels the turn.
async fn print_reply(
    registry: &Arc<SessionRegistry>,
    session_id: &str,
    mut stream: GenerationStream,
) -> std::io::Result<()> {
    let mut spinner = Some(Spinner::start());
    let mut stdout = std::io::stdout();

    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c() => {
                // the stream reports the cancellation
                let registry = Arc::clone(registry);
                let id = session_id.to_string();
                tokio::task::spawn_blocking(move || registry.cancel(&id));
                continue;
            }
        };
        let Some(event) = event else {
            break;
        };
        if let Some(spinner) = spinner.take() {
            spinner.stop().await;
        }

        match event {
            StreamToken::Token(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamToken::Done(summary) => {
                writeln!(stdout)?;
                if summary.reason == StopReason::Cancelled {
                    println!("(cancelled)");
                }
                tracing::debug!(
                    "{} tokens in {} ms, {} reused, stopped by {:?}",
                    summary.generated_tokens,
                    summary.elapsed_ms,
                    summary.reused_tokens,
                    summary.reason
                );
            }
            StreamToken::Error(EngineError::ContextFailure(reason)) => {
                writeln!(stdout)?;
                eprintln!("error: {reason}");
                if let Some(state) = registry.get(session_id) {
                    let keep = state.history().len() / 2;
                    state.truncate_history(keep);
                    eprintln!("(dropped older messages, try again)");
                }
            }
            StreamToken::Error(e) => {
                writeln!(stdout)?;
                eprintln!("error: {e}");
            }
        }
    }

    if let Some(spinner) = spinner.take() {
        spinner.stop().await;
    }
    Ok(())
}

/// Console spinner shown until the first event arrives
struct Spinner {
    done: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Spinner {
    fn start() -> Self {
        const FRAMES: [char; 4] = ['|', '/', '-', '\\'];
        let done = CancellationToken::new();
        let token = done.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(100));
            for frame in FRAMES.iter().cycle() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        print!("{frame}\u{8}");
                        let _ = std::io::stdout().flush();
                    }
                }
            }
            print!(" \u{8}");
            let _ = std::io::stdout().flush();
        });
        Self { done, task }
    }

    async fn stop(self) {
        self.done.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("   "), Command::Empty);
        assert_eq!(parse_command("/quit"), Command::Quit);
        assert_eq!(parse_command(" /reset "), Command::Reset);
        assert_eq!(
            parse_command("/save  snaps/a"),
            Command::Save(PathBuf::from("snaps/a"))
        );
        assert_eq!(parse_command("/load b"), Command::Load(PathBuf::from("b")));
        assert_eq!(parse_command("/save"), Command::Chat("/save"));
        assert_eq!(parse_command("/quit now"), Command::Chat("/quit now"));
        assert_eq!(parse_command(" hello there "), Command::Chat("hello there"));
    }

    #[tokio::test]
    async fn test_interrupt_at_prompt() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut lines = BufReader::new(reader).lines();
        let input = next_input(&mut lines, async {}).await.unwrap();
        assert_eq!(input, Input::Interrupted);
    }

    #[tokio::test]
    async fn test_lines_then_closed() {
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"hello\n").await.unwrap();
        drop(writer);

        let mut lines = BufReader::new(reader).lines();
        let first = next_input(&mut lines, std::future::pending()).await.unwrap();
        assert_eq!(first, Input::Line("hello".into()));
        let second = next_input(&mut lines, std::future::pending()).await.unwrap();
        assert_eq!(second, Input::Closed);
    }
}
