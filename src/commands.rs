/// Console commands accepted by `tandem-sw run` and their lookup logic
use color_eyre::{eyre::eyre, Result};

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub usage: &'static str,
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "get",
    aliases: &["g", "fetch"],
    usage: "get <url|path>",
    description: "Issue a GET request through the worker",
  },
  Command {
    name: "navigate",
    aliases: &["n", "nav", "open"],
    usage: "navigate <url|path>",
    description: "Issue a full-page navigation",
  },
  Command {
    name: "request",
    aliases: &["r", "req"],
    usage: "request <METHOD> <url|path>",
    description: "Issue a request with any method",
  },
  Command {
    name: "push",
    aliases: &["p"],
    usage: "push [json]",
    description: "Deliver a push message",
  },
  Command {
    name: "sync",
    aliases: &["s"],
    usage: "sync [tag]",
    description: "Fire a background sync",
  },
  Command {
    name: "click",
    aliases: &["c"],
    usage: "click [tag]",
    description: "Click a notification",
  },
  Command {
    name: "update",
    aliases: &["u"],
    usage: "update",
    description: "Check for a new version now",
  },
  Command {
    name: "partitions",
    aliases: &["ls", "caches"],
    usage: "partitions",
    description: "List partitions and entries",
  },
  Command {
    name: "help",
    aliases: &["h", "?"],
    usage: "help",
    description: "Show commands",
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    usage: "quit",
    description: "Exit",
  },
];

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
  Request {
    method: String,
    target: String,
    navigate: bool,
  },
  Push(Option<String>),
  Sync(Option<String>),
  Click(Option<String>),
  Update,
  Partitions,
  Help,
  Quit,
}

/// Parse one console line. A bare URL or path is shorthand for `get`.
pub fn parse(line: &str) -> Result<Action> {
  let line = line.trim();
  let (head, rest) = match line.split_once(char::is_whitespace) {
    Some((head, rest)) => (head, rest.trim()),
    None => (line, ""),
  };

  if head.starts_with('/') || head.contains("://") {
    return Ok(Action::Request {
      method: "GET".to_string(),
      target: head.to_string(),
      navigate: false,
    });
  }

  let command = resolve(head).ok_or_else(|| {
    let hint = get_suggestions(head)
      .first()
      .map(|c| format!(" (did you mean '{}'?)", c.name))
      .unwrap_or_default();
    eyre!("Unknown command '{}'{}", head, hint)
  })?;

  let arg = (!rest.is_empty()).then(|| rest.to_string());
  let require_arg = || arg.clone().ok_or_else(|| eyre!("Usage: {}", command.usage));

  match command.name {
    "get" => Ok(Action::Request {
      method: "GET".to_string(),
      target: require_arg()?,
      navigate: false,
    }),
    "navigate" => Ok(Action::Request {
      method: "GET".to_string(),
      target: require_arg()?,
      navigate: true,
    }),
    "request" => {
      let args = require_arg()?;
      let (method, target) = args
        .split_once(char::is_whitespace)
        .ok_or_else(|| eyre!("Usage: {}", command.usage))?;
      Ok(Action::Request {
        method: method.to_uppercase(),
        target: target.trim().to_string(),
        navigate: false,
      })
    }
    "push" => Ok(Action::Push(arg)),
    "sync" => Ok(Action::Sync(arg)),
    "click" => Ok(Action::Click(arg)),
    "update" => Ok(Action::Update),
    "partitions" => Ok(Action::Partitions),
    "help" => Ok(Action::Help),
    _ => Ok(Action::Quit),
  }
}

/// Exact name or alias match.
fn resolve(input: &str) -> Option<&'static Command> {
  let input_lower = input.to_lowercase();
  COMMANDS
    .iter()
    .find(|c| c.name == input_lower || c.aliases.contains(&input_lower.as_str()))
}

/// Get suggestions for a given input
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&Command, u32)> = Vec::new();

  for cmd in COMMANDS {
    // Exact match on name
    if cmd.name == input_lower {
      matches.push((cmd, 0)); // Highest priority
      continue;
    }

    // Exact match on alias
    if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
      continue;
    }

    // Prefix match on name
    if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
      continue;
    }

    // Prefix match on alias
    if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
      continue;
    }

    // Fuzzy match (contains)
    if cmd.name.contains(&input_lower) {
      matches.push((cmd, 4));
    }
  }

  // Sort by priority
  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

/// Help text, one command per line.
pub fn help() -> String {
  COMMANDS
    .iter()
    .map(|c| format!("  {:<28} {}", c.usage, c.description))
    .collect::<Vec<_>>()
    .join("\n")
}
