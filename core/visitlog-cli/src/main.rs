//! visitlog: command-line client for visit sessions.
//!
//! Every subcommand is one request to visitlogd. Results are printed as JSON
//! on stdout, except `compose`, which prints the transcript text as-is.
//!
//! ## Subcommands
//!
//! - `start`, `view`, `finish`, `end`, `resend`: session lifecycle
//! - `note`, `notes`, `compose`: note log and transcript
//! - `history`, `active`, `categories`, `client`, `health`: lookups and setup

mod daemon_client;
mod logging;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use visitlog_protocol::Method;

use daemon_client::ClientError;

#[derive(Parser)]
#[command(name = "visitlog")]
#[command(about = "Visit session notes for home-visit practitioners")]
#[command(version)]
struct Cli {
    /// Practitioner token (defaults to $VISITLOG_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the daemon is up
    Health,

    /// Manage client profiles
    Client {
        #[command(subcommand)]
        command: ClientCommands,
    },

    /// Start a visit, resuming today's open session if there is one
    Start {
        #[arg(value_name = "CLIENT_ID")]
        client_id: String,
    },

    /// Show a session with its notes
    View {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Add, edit, or remove notes
    Note {
        #[command(subcommand)]
        command: NoteCommands,
    },

    /// List a session's notes in order
    Notes {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Print the default transcript for a session
    Compose {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Close a session and hand the transcript off for sending
    Finish {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,

        /// Final text to send (defaults to the composed transcript)
        #[arg(long)]
        text: Option<String>,
    },

    /// Close a session without sending anything
    End {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Send the transcript for a closed session again
    Resend {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,

        #[arg(long)]
        text: Option<String>,
    },

    /// Past sessions for a client, newest first
    History {
        #[arg(value_name = "CLIENT_ID")]
        client_id: String,
    },

    /// Sessions that are open and still resumable
    Active,

    /// Quick-add categories and their phrases
    Categories,
}

#[derive(Subcommand)]
enum ClientCommands {
    /// Register or update a client
    Add {
        #[arg(value_name = "CLIENT_ID")]
        client_id: String,

        #[arg(value_name = "NAME")]
        name: String,

        /// Phone number transcripts are sent to
        #[arg(long)]
        phone: Option<String>,
    },
}

#[derive(Subcommand)]
enum NoteCommands {
    /// Append a free-text note
    Add {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,

        #[arg(value_name = "TEXT", num_args = 1.., required = true)]
        text: Vec<String>,
    },

    /// Append a phrase from a category
    Quick {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,

        #[arg(value_name = "CATEGORY")]
        category_id: String,

        #[arg(value_name = "INDEX")]
        phrase_index: usize,
    },

    /// Replace a note's text
    Edit {
        #[arg(value_name = "NOTE_ID")]
        note_id: String,

        #[arg(value_name = "TEXT", num_args = 1.., required = true)]
        text: Vec<String>,
    },

    /// Delete a note
    Rm {
        #[arg(value_name = "NOTE_ID")]
        note_id: String,
    },
}

enum Output {
    Json(Value),
    Text(String),
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();
    let token = daemon_client::token(cli.token);

    match run(cli.command, token) {
        Ok(Output::Json(value)) => match serde_json::to_string_pretty(&value) {
            Ok(rendered) => println!("{}", rendered),
            Err(err) => {
                eprintln!("error: failed to render response: {}", err);
                std::process::exit(1);
            }
        },
        Ok(Output::Text(text)) => println!("{}", text),
        Err(err) => {
            tracing::error!(error = %err, "visitlog command failed");
            eprintln!("error: {}", err);
            if let ClientError::Daemon {
                retryable: true, ..
            } = err
            {
                eprintln!("(temporary failure; safe to retry)");
            }
            std::process::exit(1);
        }
    }
}

fn run(command: Commands, token: Option<String>) -> Result<Output, ClientError> {
    let call = |method: Method, params: Option<Value>| {
        daemon_client::call(method, params, token.clone()).map(Output::Json)
    };

    match command {
        Commands::Health => call(Method::GetHealth, None),
        Commands::Client {
            command:
                ClientCommands::Add {
                    client_id,
                    name,
                    phone,
                },
        } => call(
            Method::RegisterClient,
            Some(json!({ "client_id": client_id, "name": name, "phone": phone })),
        ),
        Commands::Start { client_id } => {
            call(Method::StartVisit, Some(json!({ "client_id": client_id })))
        }
        Commands::View { session_id } => {
            call(Method::ViewSession, Some(json!({ "session_id": session_id })))
        }
        Commands::Note { command } => match command {
            NoteCommands::Add { session_id, text } => call(
                Method::AppendNote,
                Some(json!({ "session_id": session_id, "content": text.join(" ") })),
            ),
            NoteCommands::Quick {
                session_id,
                category_id,
                phrase_index,
            } => call(
                Method::QuickAdd,
                Some(json!({
                    "session_id": session_id,
                    "category_id": category_id,
                    "phrase_index": phrase_index,
                })),
            ),
            NoteCommands::Edit { note_id, text } => call(
                Method::EditNote,
                Some(json!({ "note_id": note_id, "content": text.join(" ") })),
            ),
            NoteCommands::Rm { note_id } => {
                call(Method::DeleteNote, Some(json!({ "note_id": note_id })))
            }
        },
        Commands::Notes { session_id } => {
            call(Method::ListNotes, Some(json!({ "session_id": session_id })))
        }
        Commands::Compose { session_id } => {
            compose(&session_id, token.clone()).map(Output::Text)
        }
        Commands::Finish { session_id, text } => {
            let text = match text {
                Some(text) => text,
                None => compose(&session_id, token.clone())?,
            };
            call(
                Method::FinishSession,
                Some(json!({ "session_id": session_id, "text": text })),
            )
        }
        Commands::End { session_id } => {
            call(Method::EndSession, Some(json!({ "session_id": session_id })))
        }
        Commands::Resend { session_id, text } => {
            let text = match text {
                Some(text) => text,
                None => compose(&session_id, token.clone())?,
            };
            call(
                Method::ResendTranscript,
                Some(json!({ "session_id": session_id, "text": text })),
            )
        }
        Commands::History { client_id } => {
            call(Method::ClientHistory, Some(json!({ "client_id": client_id })))
        }
        Commands::Active => call(Method::ActiveSessions, None),
        Commands::Categories => call(Method::ListCategories, None),
    }
}

fn compose(session_id: &str, token: Option<String>) -> Result<String, ClientError> {
    let data = daemon_client::call(
        Method::ComposeTranscript,
        Some(json!({ "session_id": session_id })),
        token,
    )?;
    data.get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::InvalidResponse("transcript text missing".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn note_add_joins_words() {
        let cli = Cli::try_parse_from(["visitlog", "note", "add", "s-1", "Good", "latch"])
            .expect("parse");
        match cli.command {
            Commands::Note {
                command: NoteCommands::Add { session_id, text },
            } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(text.join(" "), "Good latch");
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn token_flag_is_global() {
        let cli = Cli::try_parse_from(["visitlog", "active", "--token", "secret"]).expect("parse");
        assert_eq!(cli.token.as_deref(), Some("secret"));
    }
}
