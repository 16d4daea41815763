use std::io::ErrorKind;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use parley_contracts::speech::SpeechInputError;

/// Speaks plain text aloud. Called once per finished reply.
pub trait SpeechSynthesizer: Send {
    fn speak(&self, text: &str) -> Result<()>;
}

/// Records one utterance and returns its final transcript.
pub trait SpeechRecognizer: Send {
    fn listen(&self) -> Result<String, SpeechInputError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShellCommand {
    program: String,
    args: Vec<String>,
}

impl ShellCommand {
    fn parse(raw: &str) -> Result<Self> {
        let mut parts = shell_words::split(raw)
            .with_context(|| format!("invalid speech command: {raw}"))?
            .into_iter()
            .filter(|part| !part.is_empty());
        let Some(program) = parts.next() else {
            bail!("speech command is empty");
        };
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

/// Runs a configured command with the text as its final argument, e.g.
/// `say` or `espeak`.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    command: ShellCommand,
}

impl CommandSynthesizer {
    pub fn new(raw: &str) -> Result<Self> {
        Ok(Self {
            command: ShellCommand::parse(raw)?,
        })
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn speak(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let status = self
            .command
            .command()
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("failed to run {}", self.command.program))?;
        if !status.success() {
            bail!("{} exited with {status}", self.command.program);
        }
        Ok(())
    }
}

/// Runs a configured command that records speech and prints the transcript
/// on stdout.
#[derive(Debug, Clone)]
pub struct CommandRecognizer {
    command: ShellCommand,
}

impl CommandRecognizer {
    pub fn new(raw: &str) -> Result<Self> {
        Ok(Self {
            command: ShellCommand::parse(raw)?,
        })
    }
}

impl SpeechRecognizer for CommandRecognizer {
    fn listen(&self) -> Result<String, SpeechInputError> {
        let output = match self.command.command().stdin(Stdio::null()).output() {
            Ok(output) => output,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SpeechInputError::Unavailable(format!(
                    "{} not found",
                    self.command.program
                )));
            }
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                return Err(SpeechInputError::PermissionDenied);
            }
            Err(err) => return Err(SpeechInputError::Failed(err.to_string())),
        };
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            if stderr.to_ascii_lowercase().contains("permission") {
                return Err(SpeechInputError::PermissionDenied);
            }
            let detail = if stderr.is_empty() {
                format!("{} exited with {}", self.command.program, output.status)
            } else {
                stderr
            };
            return Err(SpeechInputError::Failed(detail));
        }
        let transcript = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if transcript.is_empty() {
            return Err(SpeechInputError::NoSpeech);
        }
        Ok(transcript)
    }
}
