//! Slash directives typed at the room prompt
//!
//! Any input starting with `/` is a directive; everything else is a message
//! for the dispatcher.

use thiserror::Error;

/// A recognized session directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `/trust [@agent] [minutes]`; no agent means the session default
    Trust {
        agent: Option<String>,
        minutes: Option<u64>,
    },
    /// `/untrust [@agent]`
    Untrust { agent: Option<String> },
    Approve,
    Deny,
    Review,
    /// `/agent <name>` switches the session default agent
    Agent(String),
    /// `/batch on|off`
    Batch(bool),
    Agents,
    Status,
    /// `/export` writes the room transcript as Markdown
    Export,
    Help,
    Exit,
}

/// Classification of one line of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Directive(Directive),
    Message(String),
    /// Blank line
    Ignore,
}

impl Input {
    pub fn is_directive(&self) -> bool {
        matches!(self, Input::Directive(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("unknown directive '/{0}' (try /help)")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

pub const HELP: &str = "\
/trust [@agent] [minutes]  trust an agent for a while (default agent if omitted)
/untrust [@agent]          revoke a trust grant
/batch on|off              queue confirmations instead of asking one by one
/approve                   run every queued operation
/deny                      discard every queued operation
/review                    decide queued operations one at a time
/agent <name>              switch the default agent
/agents                    list agents
/status                    show room, mode and pending operations
/export                    write the transcript to a Markdown file
/exit                      leave the room (pending operations are denied)";

/// Classify a line of input
pub fn parse_input(line: &str) -> Result<Input, DirectiveError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Input::Ignore);
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Ok(Input::Message(line.to_string()));
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default().to_lowercase();
    let args: Vec<&str> = parts.collect();

    let directive = match name.as_str() {
        "trust" => parse_trust(&args)?,
        "untrust" => match args.as_slice() {
            [] => Directive::Untrust { agent: None },
            [agent] => Directive::Untrust {
                agent: Some(agent_arg(agent)),
            },
            _ => return Err(DirectiveError::Usage("/untrust [@agent]")),
        },
        "approve" => Directive::Approve,
        "deny" => Directive::Deny,
        "review" => Directive::Review,
        "agent" => match args.as_slice() {
            [agent] => Directive::Agent(agent_arg(agent)),
            _ => return Err(DirectiveError::Usage("/agent <name>")),
        },
        "batch" => match args.as_slice() {
            [flag] if flag.eq_ignore_ascii_case("on") => Directive::Batch(true),
            [flag] if flag.eq_ignore_ascii_case("off") => Directive::Batch(false),
            _ => return Err(DirectiveError::Usage("/batch on|off")),
        },
        "agents" => Directive::Agents,
        "status" => Directive::Status,
        "export" => Directive::Export,
        "help" | "?" => Directive::Help,
        "exit" | "quit" | "q" | "leave" => Directive::Exit,
        other => return Err(DirectiveError::Unknown(other.to_string())),
    };
    Ok(Input::Directive(directive))
}

/// Longest grant `/trust` accepts: one year
pub const MAX_TRUST_MINUTES: u64 = 525_600;

fn parse_trust(args: &[&str]) -> Result<Directive, DirectiveError> {
    const USAGE: &str = "/trust [@agent] [minutes], minutes between 1 and 525600";
    let mut agent = None;
    let mut minutes = None;
    for arg in args {
        if let Ok(n) = arg.parse::<u64>() {
            if minutes.is_some() || n == 0 || n > MAX_TRUST_MINUTES {
                return Err(DirectiveError::Usage(USAGE));
            }
            minutes = Some(n);
        } else if agent.is_none() && minutes.is_none() {
            agent = Some(agent_arg(arg));
        } else {
            return Err(DirectiveError::Usage(USAGE));
        }
    }
    Ok(Directive::Trust { agent, minutes })
}

fn agent_arg(arg: &str) -> String {
    arg.trim_start_matches('@').to_string()
}
