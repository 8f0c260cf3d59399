//! Line-oriented terminal front end.
//!
//! Reads one line at a time, hands chat messages to the [`ChatSession`] and
//! prints the reply as batches arrive. The only place the loop waits during a
//! reply is `ChatSession::next_event`, raced against Ctrl-C for cancellation.

use crate::chat::ChatSession;
use crate::commands::{self, Command, HELP};
use crate::models::{Conversation, ModelInfo, Role};
use crate::pump::PumpEvent;
use anyhow::{Context, Result};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

const TITLE_WIDTH: usize = 48;

pub async fn run_repl(mut session: ChatSession, mut models: Vec<ModelInfo>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut listing: Vec<Conversation> = Vec::new();

    if let Some(model) = session.state().manager.current_model() {
        println!("Chatting with {} at {}. Type /help for commands.", model, session.state().config.host);
    }

    loop {
        report_save_failure(&mut session);
        print_prompt(&session);
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match commands::parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("! {e}");
                continue;
            }
        };

        match command {
            Command::Quit => break,
            Command::Help => println!("{HELP}"),
            Command::Chat(text) => match session.submit(&text).await {
                Ok(()) => stream_reply(&mut session).await,
                Err(e) => println!("! {e:#}"),
            },
            Command::New => {
                let model = session.state().manager.current_model().unwrap_or_default();
                let conversation = session.new_conversation(&model);
                println!("Started a new conversation with {}.", conversation.model);
            }
            Command::List => match session.list_conversations() {
                Ok(conversations) => {
                    listing = conversations;
                    print_listing(&listing);
                }
                Err(e) => println!("! Could not list conversations: {e:#}"),
            },
            Command::Load(target) => {
                let id = match commands::resolve_target(&target, &listing) {
                    Ok(id) => id,
                    Err(e) => {
                        println!("! {e}");
                        continue;
                    }
                };
                match session.open_conversation(&id) {
                    Ok(conversation) => print_transcript(&conversation),
                    Err(e) => println!("! {e:#}. Started a new conversation instead."),
                }
            }
            Command::Delete(target) => {
                let id = match commands::resolve_target(&target, &listing) {
                    Ok(id) => id,
                    Err(e) => {
                        println!("! {e}");
                        continue;
                    }
                };
                let title = listing
                    .iter()
                    .find(|c| c.id == id)
                    .map(|c| c.title.clone())
                    .or_else(|| session.current().filter(|c| c.id == id).map(|c| c.title))
                    .unwrap_or_default();
                print!("Delete {} \"{}\"? [y/N] ", short_id(&id), truncate(&title, TITLE_WIDTH));
                let _ = std::io::stdout().flush();

                let answer = tokio::select! {
                    line = lines.next_line() => line.context("Failed to read input")?,
                    _ = tokio::signal::ctrl_c() => None,
                };
                if !answer.as_deref().is_some_and(is_confirmation) {
                    println!("Kept {}.", short_id(&id));
                    continue;
                }
                match session.delete_conversation(&id) {
                    Ok(()) => {
                        listing.retain(|c| c.id != id);
                        println!("Deleted {}.", short_id(&id));
                    }
                    Err(e) => println!("! {e:#}"),
                }
            }
            Command::Models => match session.list_models().await {
                Ok(fetched) => {
                    models = fetched;
                    print_models(&models);
                }
                Err(e) => println!("! Could not list models: {e:#}"),
            },
            Command::Model(name) => {
                if !models.is_empty() && !models.iter().any(|m| m.name == name) {
                    println!("! Unknown model {name} (see /models)");
                    continue;
                }
                session.new_conversation(&name);
                println!("Started a new conversation with {name}.");
            }
            Command::System(text) => match session.set_system_message(&text) {
                Ok(()) if text.trim().is_empty() => println!("System message cleared."),
                Ok(()) => println!("System message saved."),
                Err(e) => println!("! Could not save system message: {e:#}"),
            },
        }
    }

    session.shutdown();
    report_save_failure(&mut session);
    Ok(())
}

fn report_save_failure(session: &mut ChatSession) {
    if session.take_save_failure() {
        println!("! Conversation could not be saved");
    }
}

fn is_confirmation(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

// Prints batches as they arrive until the turn ends; Ctrl-C stops the reply.
async fn stream_reply(session: &mut ChatSession) {
    let mut stdout = std::io::stdout();
    loop {
        let event = tokio::select! {
            event = session.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                session.cancel();
                continue;
            }
        };
        match event {
            Some(PumpEvent::Batch(text)) => {
                print!("{text}");
                let _ = stdout.flush();
            }
            Some(PumpEvent::Finished) | None => {
                println!();
                break;
            }
        }
    }
}

fn print_prompt(session: &ChatSession) {
    let model = session.state().manager.current_model().unwrap_or_default();
    print!("[{model}] > ");
    let _ = std::io::stdout().flush();
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn truncate(text: &str, width: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= width {
        return line.to_string();
    }
    let mut out: String = line.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

pub fn format_listing_line(index: usize, conversation: &Conversation) -> String {
    format!(
        "{:>3}. {}  {:<width$}  {} · {} messages · {}",
        index,
        short_id(&conversation.id),
        truncate(&conversation.title, TITLE_WIDTH),
        conversation.model,
        conversation.messages.len(),
        conversation.updated_at.format("%Y-%m-%d %H:%M"),
        width = TITLE_WIDTH,
    )
}

fn print_listing(listing: &[Conversation]) {
    if listing.is_empty() {
        println!("No saved conversations.");
        return;
    }
    for (i, conversation) in listing.iter().enumerate() {
        println!("{}", format_listing_line(i + 1, conversation));
    }
}

pub fn format_model_line(model: &ModelInfo) -> String {
    let details = [
        model.details.family.as_str(),
        model.details.parameter_size.as_str(),
        model.details.quantization_level.as_str(),
    ]
    .into_iter()
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(", ");
    format!("{:<32} {:>8.1} GB  {}", model.name, model.size as f64 / 1e9, details)
}

fn print_models(models: &[ModelInfo]) {
    if models.is_empty() {
        println!("No models installed on the server.");
    }
    for model in models {
        println!("{}", format_model_line(model));
    }
}

fn print_transcript(conversation: &Conversation) {
    println!("-- {} ({}) --", truncate(&conversation.title, TITLE_WIDTH), conversation.model);
    for message in &conversation.messages {
        let label = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        println!("{label}: {}", message.content);
    }
}
