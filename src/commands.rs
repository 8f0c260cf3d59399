// Slash commands understood by the terminal front end

use crate::models::Conversation;
use anyhow::{anyhow, bail, Result};

pub const HELP: &str = "\
Commands:
  /new               start a new conversation on the current model
  /list              list saved conversations, most recent first
  /load <n|id>       open a conversation by list number or id
  /delete <n|id>     delete a conversation by list number or id (asks first)
  /models            list models installed on the server
  /model <name>      start a new conversation on another model
  /system [text]     set the system message (empty clears it)
  /help              show this help
  /quit              save and exit
Anything else is sent as a message. Start a line with // to send a literal '/'.
Press Ctrl-C while a reply is streaming to stop it.";

// Which conversation a /load or /delete refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// 1-based position in the last `/list` output.
    Index(usize),
    Id(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    New,
    List,
    Load(Target),
    Delete(Target),
    Models,
    Model(String),
    System(String),
    Help,
    Quit,
}

fn parse_target(arg: &str, usage: &str) -> Result<Target> {
    if arg.is_empty() {
        bail!("Usage: {}", usage);
    }
    match arg.parse::<usize>() {
        Ok(0) => bail!("List numbers start at 1"),
        Ok(n) => Ok(Target::Index(n)),
        Err(_) => Ok(Target::Id(arg.to_string())),
    }
}

pub fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    if let Some(literal) = line.strip_prefix("//") {
        return Ok(Command::Chat(format!("/{literal}")));
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Chat(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "new" => Command::New,
        "list" | "history" => Command::List,
        "load" | "open" => Command::Load(parse_target(arg, "/load <n|id>")?),
        "delete" | "rm" => Command::Delete(parse_target(arg, "/delete <n|id>")?),
        "models" => Command::Models,
        "model" if arg.is_empty() => bail!("Usage: /model <name>"),
        "model" => Command::Model(arg.to_string()),
        "system" => Command::System(arg.to_string()),
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => bail!("Unknown command /{} (try /help)", other),
    };
    Ok(command)
}

/// Maps a target onto a conversation id using the last listing.
pub fn resolve_target(target: &Target, listing: &[Conversation]) -> Result<String> {
    match target {
        Target::Id(id) => Ok(id.clone()),
        Target::Index(n) => listing
            .get(n - 1)
            .map(|c| c.id.clone())
            .ok_or_else(|| anyhow!("No conversation #{} in the last /list", n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_chat_message() {
        assert_eq!(parse_command("  hello there ").unwrap(), Command::Chat("hello there".into()));
        assert_eq!(parse_command("//etc/hosts?").unwrap(), Command::Chat("/etc/hosts?".into()));
    }

    #[test]
    fn commands_and_aliases() {
        assert_eq!(parse_command("/new").unwrap(), Command::New);
        assert_eq!(parse_command("/history").unwrap(), Command::List);
        assert_eq!(parse_command("/q").unwrap(), Command::Quit);
        assert_eq!(parse_command("/model  llama3:8b ").unwrap(), Command::Model("llama3:8b".into()));
        assert_eq!(parse_command("/system").unwrap(), Command::System(String::new()));
        assert_eq!(
            parse_command("/system Answer in haiku.").unwrap(),
            Command::System("Answer in haiku.".into())
        );
    }

    #[test]
    fn targets_are_numbers_or_ids() {
        assert_eq!(parse_command("/load 2").unwrap(), Command::Load(Target::Index(2)));
        assert_eq!(
            parse_command("/delete 5f0c-uuid").unwrap(),
            Command::Delete(Target::Id("5f0c-uuid".into()))
        );
        assert!(parse_command("/load").is_err());
        assert!(parse_command("/load 0").is_err());
        assert!(parse_command("/model").is_err());
        assert!(parse_command("/frobnicate").is_err());
    }

    #[test]
    fn resolve_uses_one_based_positions() {
        let listing = vec![Conversation::new("a"), Conversation::new("b")];
        assert_eq!(resolve_target(&Target::Index(2), &listing).unwrap(), listing[1].id);
        assert_eq!(resolve_target(&Target::Id("x".into()), &[]).unwrap(), "x");
        assert!(resolve_target(&Target::Index(3), &listing).is_err());
    }
}
